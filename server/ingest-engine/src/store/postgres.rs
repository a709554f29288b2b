//! Postgres aggregation store (shared by intake and worker processes).

use async_trait::async_trait;
use sqlx_core::query::query;
use sqlx_core::query_scalar::query_scalar;
use sqlx_core::row::Row;
use sqlx_postgres::{PgConnection, PgPool, PgPoolOptions, PgRow, Postgres};
use tracing::{debug, info, warn};

use super::{AggregationStore, LatestFields};
use crate::config::Config;
use crate::error::StoreError;
use crate::types::{Fingerprint, Issue, IssueStatus, NormalizedEvent, RawPayload, RecordOutcome};

const SCHEMA: &[&str] = &[
  r#"CREATE TABLE IF NOT EXISTS "group" (
    id BIGSERIAL PRIMARY KEY,
    project_id TEXT NOT NULL,
    checksum TEXT NOT NULL,
    seen BIGINT NOT NULL DEFAULT 1,
    first_seen TIMESTAMPTZ NOT NULL,
    last_seen TIMESTAMPTZ NOT NULL,
    status BIGINT NOT NULL DEFAULT 0,
    logger TEXT NOT NULL DEFAULT '',
    level TEXT NOT NULL DEFAULT '',
    message TEXT NOT NULL DEFAULT '',
    server_name TEXT NOT NULL DEFAULT '',
    url TEXT NOT NULL DEFAULT '',
    site TEXT NOT NULL DEFAULT '',
    platform TEXT NOT NULL DEFAULT '',
    UNIQUE (project_id, checksum)
  )"#,
  r#"CREATE TABLE IF NOT EXISTS event (
    id BIGSERIAL PRIMARY KEY,
    group_id BIGINT NOT NULL REFERENCES "group" (id),
    data_id TEXT NOT NULL,
    message TEXT NOT NULL DEFAULT '',
    checksum TEXT NOT NULL
  )"#,
  "CREATE INDEX IF NOT EXISTS idx_event_group ON event (group_id)",
  r#"CREATE TABLE IF NOT EXISTS data (
    id TEXT PRIMARY KEY,
    data BYTEA NOT NULL,
    timestamp TIMESTAMPTZ NOT NULL,
    protocol TEXT NOT NULL
  )"#,
  r#"CREATE TABLE IF NOT EXISTS ingest_queue (
    id BIGSERIAL PRIMARY KEY,
    payload TEXT NOT NULL,
    enqueued_at TIMESTAMPTZ NOT NULL DEFAULT now()
  )"#,
];

const INSERT_GROUP: &str = r#"
  INSERT INTO "group" (project_id, checksum, seen, first_seen, last_seen, status,
                       logger, level, message, server_name, url, site, platform)
  VALUES ($1, $2, 1, $3, $3, 0, $4, $5, $6, $7, $8, $9, $10)
  ON CONFLICT (project_id, checksum) DO NOTHING
  RETURNING id
"#;

const LOCK_GROUP: &str =
  r#"SELECT id, status FROM "group" WHERE project_id = $1 AND checksum = $2 FOR UPDATE"#;

const UPDATE_GROUP: &str = r#"
  UPDATE "group" SET
    seen = seen + 1, last_seen = $1, status = 0,
    logger = $2, level = $3, message = $4, server_name = $5, url = $6, site = $7, platform = $8
  WHERE id = $9
"#;

const INSERT_EVENT: &str =
  "INSERT INTO event (group_id, data_id, message, checksum) VALUES ($1, $2, $3, $4)";

const INSERT_DATA: &str = r#"
  INSERT INTO data (id, data, timestamp, protocol) VALUES ($1, $2, $3, $4)
  ON CONFLICT (id) DO NOTHING
"#;

const ISSUE_COLUMNS: &str = r#"id, project_id, checksum, seen, first_seen, last_seen, status,
  logger, level, message, server_name, url, site, platform"#;

/// Attempts at the insert-or-lock step before giving up.
const UPSERT_ATTEMPTS: usize = 3;

#[derive(Clone)]
pub struct PgStore {
  pool: PgPool,
}

impl PgStore {
  pub async fn connect(url: &str, config: &Config) -> Result<Self, StoreError> {
    let pool = PgPoolOptions::new()
      .max_connections(config.max_connections)
      .connect(url)
      .await?;
    let store = Self { pool };
    store.migrate().await?;
    info!("postgres store connected");
    Ok(store)
  }

  async fn migrate(&self) -> Result<(), StoreError> {
    for statement in SCHEMA {
      query::<Postgres>(statement).execute(&self.pool).await?;
    }
    Ok(())
  }

  pub fn pool(&self) -> &PgPool {
    &self.pool
  }
}

/// Insert the issue or lock the existing row. The lock is held until the
/// surrounding transaction ends, so every concurrent occurrence of the key
/// increments `seen` exactly once.
async fn upsert_group(
  conn: &mut PgConnection,
  project_id: &str,
  fingerprint: &Fingerprint,
  event: &NormalizedEvent,
) -> Result<RecordOutcome, StoreError> {
  let latest = LatestFields::from(event);

  for attempt in 1..=UPSERT_ATTEMPTS {
    let inserted = query_scalar::<Postgres, i64>(INSERT_GROUP)
      .bind(project_id)
      .bind(fingerprint.as_str())
      .bind(event.timestamp)
      .bind(latest.logger)
      .bind(latest.level)
      .bind(latest.message)
      .bind(latest.server_name)
      .bind(latest.url)
      .bind(latest.site)
      .bind(latest.platform)
      .fetch_optional(&mut *conn)
      .await?;

    if let Some(issue_id) = inserted {
      return Ok(RecordOutcome {
        issue_id,
        is_new: true,
        is_regression: false,
      });
    }

    let Some(row) = query::<Postgres>(LOCK_GROUP)
      .bind(project_id)
      .bind(fingerprint.as_str())
      .fetch_optional(&mut *conn)
      .await?
    else {
      // Conflicting row vanished between the two statements.
      warn!(attempt, project_id, "issue row disappeared during upsert, retrying");
      continue;
    };

    let issue_id: i64 = row.try_get("id")?;
    let status = IssueStatus::from_code(row.try_get("status")?);

    query::<Postgres>(UPDATE_GROUP)
      .bind(event.timestamp)
      .bind(latest.logger)
      .bind(latest.level)
      .bind(latest.message)
      .bind(latest.server_name)
      .bind(latest.url)
      .bind(latest.site)
      .bind(latest.platform)
      .bind(issue_id)
      .execute(&mut *conn)
      .await?;

    return Ok(RecordOutcome {
      issue_id,
      is_new: false,
      is_regression: status == IssueStatus::Resolved,
    });
  }

  Err(StoreError::Database(format!(
    "upsert of issue {project_id}/{fingerprint} did not settle after {UPSERT_ATTEMPTS} attempts"
  )))
}

fn issue_from_row(row: &PgRow) -> Result<Issue, StoreError> {
  Ok(Issue {
    id: row.try_get("id")?,
    project_id: row.try_get("project_id")?,
    fingerprint: row.try_get("checksum")?,
    seen_count: row.try_get("seen")?,
    first_seen: row.try_get("first_seen")?,
    last_seen: row.try_get("last_seen")?,
    status: IssueStatus::from_code(row.try_get("status")?),
    logger: row.try_get("logger")?,
    level: row.try_get("level")?,
    message: row.try_get("message")?,
    server_name: row.try_get("server_name")?,
    url: row.try_get("url")?,
    site: row.try_get("site")?,
    platform: row.try_get("platform")?,
  })
}

#[async_trait]
impl AggregationStore for PgStore {
  async fn record(
    &self,
    project_id: &str,
    fingerprint: &Fingerprint,
    event: &NormalizedEvent,
    raw: &RawPayload,
  ) -> Result<RecordOutcome, StoreError> {
    let mut tx = self.pool.begin().await?;

    let outcome = upsert_group(&mut *tx, project_id, fingerprint, event).await?;

    let data_id = raw.content_hash();
    query::<Postgres>(INSERT_EVENT)
      .bind(outcome.issue_id)
      .bind(data_id.as_str())
      .bind(event.message.as_str())
      .bind(fingerprint.as_str())
      .execute(&mut *tx)
      .await?;

    query::<Postgres>(INSERT_DATA)
      .bind(data_id.as_str())
      .bind(raw.body.as_slice())
      .bind(event.timestamp)
      .bind(raw.protocol.as_str())
      .execute(&mut *tx)
      .await?;

    tx.commit().await?;

    debug!(
      issue_id = outcome.issue_id,
      is_new = outcome.is_new,
      is_regression = outcome.is_regression,
      "occurrence recorded"
    );
    Ok(outcome)
  }

  async fn set_status(&self, issue_id: i64, status: IssueStatus) -> Result<(), StoreError> {
    let result = query::<Postgres>(r#"UPDATE "group" SET status = $1 WHERE id = $2"#)
      .bind(status.code())
      .bind(issue_id)
      .execute(&self.pool)
      .await?;
    if result.rows_affected() == 0 {
      return Err(StoreError::not_found("issue", issue_id));
    }
    Ok(())
  }

  async fn issue(&self, issue_id: i64) -> Result<Option<Issue>, StoreError> {
    let sql = format!(r#"SELECT {ISSUE_COLUMNS} FROM "group" WHERE id = $1"#);
    let row = query::<Postgres>(&sql)
      .bind(issue_id)
      .fetch_optional(&self.pool)
      .await?;
    row.as_ref().map(issue_from_row).transpose()
  }

  async fn find_issue(
    &self,
    project_id: &str,
    fingerprint: &Fingerprint,
  ) -> Result<Option<Issue>, StoreError> {
    let sql = format!(r#"SELECT {ISSUE_COLUMNS} FROM "group" WHERE project_id = $1 AND checksum = $2"#);
    let row = query::<Postgres>(&sql)
      .bind(project_id)
      .bind(fingerprint.as_str())
      .fetch_optional(&self.pool)
      .await?;
    row.as_ref().map(issue_from_row).transpose()
  }

  async fn count_issues(&self, project_id: &str) -> Result<i64, StoreError> {
    let count = query_scalar::<Postgres, i64>(r#"SELECT COUNT(*) FROM "group" WHERE project_id = $1"#)
      .bind(project_id)
      .fetch_one(&self.pool)
      .await?;
    Ok(count)
  }

  async fn count_events(&self, issue_id: i64) -> Result<i64, StoreError> {
    let count = query_scalar::<Postgres, i64>("SELECT COUNT(*) FROM event WHERE group_id = $1")
      .bind(issue_id)
      .fetch_one(&self.pool)
      .await?;
    Ok(count)
  }

  async fn count_data(&self) -> Result<i64, StoreError> {
    let count = query_scalar::<Postgres, i64>("SELECT COUNT(*) FROM data")
      .fetch_one(&self.pool)
      .await?;
    Ok(count)
  }
}
