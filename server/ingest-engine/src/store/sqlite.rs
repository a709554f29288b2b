//! SQLite aggregation store (single node, tests).

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use sqlx_core::query::query;
use sqlx_core::query_scalar::query_scalar;
use sqlx_core::row::Row;
use sqlx_sqlite::{
  Sqlite, SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{AggregationStore, LatestFields};
use crate::config::Config;
use crate::error::StoreError;
use crate::types::{Fingerprint, Issue, IssueStatus, NormalizedEvent, RawPayload, RecordOutcome};

const SCHEMA: &[&str] = &[
  r#"CREATE TABLE IF NOT EXISTS "group" (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    project_id TEXT NOT NULL,
    checksum TEXT NOT NULL,
    seen INTEGER NOT NULL DEFAULT 1,
    first_seen TEXT NOT NULL,
    last_seen TEXT NOT NULL,
    status INTEGER NOT NULL DEFAULT 0,
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
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    group_id INTEGER NOT NULL REFERENCES "group" (id),
    data_id TEXT NOT NULL,
    message TEXT NOT NULL DEFAULT '',
    checksum TEXT NOT NULL
  )"#,
  "CREATE INDEX IF NOT EXISTS idx_event_group ON event (group_id)",
  r#"CREATE TABLE IF NOT EXISTS data (
    id TEXT PRIMARY KEY,
    data BLOB NOT NULL,
    timestamp TEXT NOT NULL,
    protocol TEXT NOT NULL
  )"#,
  r#"CREATE TABLE IF NOT EXISTS ingest_queue (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    payload TEXT NOT NULL,
    enqueued_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
  )"#,
];

const INSERT_GROUP: &str = r#"
  INSERT INTO "group" (project_id, checksum, seen, first_seen, last_seen, status,
                       logger, level, message, server_name, url, site, platform)
  VALUES (?1, ?2, 1, ?3, ?3, 0, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
  ON CONFLICT (project_id, checksum) DO NOTHING
  RETURNING id
"#;

const SELECT_GROUP_STATUS: &str =
  r#"SELECT id, status FROM "group" WHERE project_id = ?1 AND checksum = ?2"#;

const UPDATE_GROUP: &str = r#"
  UPDATE "group" SET
    seen = seen + 1, last_seen = ?1, status = 0,
    logger = ?2, level = ?3, message = ?4, server_name = ?5, url = ?6, site = ?7, platform = ?8
  WHERE id = ?9
"#;

const INSERT_EVENT: &str =
  "INSERT INTO event (group_id, data_id, message, checksum) VALUES (?1, ?2, ?3, ?4)";

const INSERT_DATA: &str = r#"
  INSERT INTO data (id, data, timestamp, protocol) VALUES (?1, ?2, ?3, ?4)
  ON CONFLICT (id) DO NOTHING
"#;

const ISSUE_COLUMNS: &str = r#"id, project_id, checksum, seen, first_seen, last_seen, status,
  logger, level, message, server_name, url, site, platform"#;

/// SQLite allows a single writer; writes are serialized in-process so pool
/// connections never contend on the database lock.
#[derive(Clone)]
pub struct SqliteStore {
  pool: SqlitePool,
  write_lock: Arc<Mutex<()>>,
}

impl SqliteStore {
  /// Connect with a `sqlite:` url. `sqlite::memory:` yields a private in-memory database.
  pub async fn connect(url: &str, config: &Config) -> Result<Self, StoreError> {
    if url.contains(":memory:") {
      return Self::in_memory().await;
    }
    let options = SqliteConnectOptions::from_str(url)?;
    Self::open_with(options, config).await
  }

  pub async fn open(path: &Path, config: &Config) -> Result<Self, StoreError> {
    Self::open_with(SqliteConnectOptions::new().filename(path), config).await
  }

  /// In-memory database on a single pinned connection.
  pub async fn in_memory() -> Result<Self, StoreError> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
    let pool = SqlitePoolOptions::new()
      .max_connections(1)
      .min_connections(1)
      .idle_timeout(None)
      .max_lifetime(None)
      .connect_with(options)
      .await?;
    let store = Self::from_pool(pool);
    store.migrate().await?;
    debug!("in-memory sqlite store opened");
    Ok(store)
  }

  async fn open_with(options: SqliteConnectOptions, config: &Config) -> Result<Self, StoreError> {
    let options = options
      .create_if_missing(true)
      .journal_mode(SqliteJournalMode::Wal)
      .busy_timeout(config.sqlite_busy_timeout);
    let pool = SqlitePoolOptions::new()
      .max_connections(config.max_connections)
      .connect_with(options)
      .await?;
    let store = Self::from_pool(pool);
    store.migrate().await?;
    info!("sqlite store opened");
    Ok(store)
  }

  fn from_pool(pool: SqlitePool) -> Self {
    Self {
      pool,
      write_lock: Arc::new(Mutex::new(())),
    }
  }

  async fn migrate(&self) -> Result<(), StoreError> {
    for statement in SCHEMA {
      query::<Sqlite>(statement).execute(&self.pool).await?;
    }
    Ok(())
  }

  pub fn pool(&self) -> &SqlitePool {
    &self.pool
  }

  pub(crate) fn write_lock(&self) -> Arc<Mutex<()>> {
    self.write_lock.clone()
  }
}

fn issue_from_row(row: &SqliteRow) -> Result<Issue, StoreError> {
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
impl AggregationStore for SqliteStore {
  async fn record(
    &self,
    project_id: &str,
    fingerprint: &Fingerprint,
    event: &NormalizedEvent,
    raw: &RawPayload,
  ) -> Result<RecordOutcome, StoreError> {
    let latest = LatestFields::from(event);
    let _guard = self.write_lock.lock().await;
    let mut tx = self.pool.begin().await?;

    // Insert first: the unique (project_id, checksum) constraint decides who creates the issue.
    let inserted = query_scalar::<Sqlite, i64>(INSERT_GROUP)
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
      .fetch_optional(&mut *tx)
      .await?;

    let outcome = match inserted {
      Some(issue_id) => RecordOutcome {
        issue_id,
        is_new: true,
        is_regression: false,
      },
      None => {
        let row = query::<Sqlite>(SELECT_GROUP_STATUS)
          .bind(project_id)
          .bind(fingerprint.as_str())
          .fetch_one(&mut *tx)
          .await?;
        let issue_id: i64 = row.try_get("id")?;
        let status = IssueStatus::from_code(row.try_get("status")?);

        query::<Sqlite>(UPDATE_GROUP)
          .bind(event.timestamp)
          .bind(latest.logger)
          .bind(latest.level)
          .bind(latest.message)
          .bind(latest.server_name)
          .bind(latest.url)
          .bind(latest.site)
          .bind(latest.platform)
          .bind(issue_id)
          .execute(&mut *tx)
          .await?;

        RecordOutcome {
          issue_id,
          is_new: false,
          is_regression: status == IssueStatus::Resolved,
        }
      }
    };

    let data_id = raw.content_hash();
    query::<Sqlite>(INSERT_EVENT)
      .bind(outcome.issue_id)
      .bind(data_id.as_str())
      .bind(event.message.as_str())
      .bind(fingerprint.as_str())
      .execute(&mut *tx)
      .await?;

    let data = query::<Sqlite>(INSERT_DATA)
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
      data_stored = data.rows_affected() == 1,
      "occurrence recorded"
    );
    Ok(outcome)
  }

  async fn set_status(&self, issue_id: i64, status: IssueStatus) -> Result<(), StoreError> {
    let _guard = self.write_lock.lock().await;
    let result = query::<Sqlite>(r#"UPDATE "group" SET status = ?1 WHERE id = ?2"#)
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
    let sql = format!(r#"SELECT {ISSUE_COLUMNS} FROM "group" WHERE id = ?1"#);
    let row = query::<Sqlite>(&sql)
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
    let sql = format!(r#"SELECT {ISSUE_COLUMNS} FROM "group" WHERE project_id = ?1 AND checksum = ?2"#);
    let row = query::<Sqlite>(&sql)
      .bind(project_id)
      .bind(fingerprint.as_str())
      .fetch_optional(&self.pool)
      .await?;
    row.as_ref().map(issue_from_row).transpose()
  }

  async fn count_issues(&self, project_id: &str) -> Result<i64, StoreError> {
    let count = query_scalar::<Sqlite, i64>(r#"SELECT COUNT(*) FROM "group" WHERE project_id = ?1"#)
      .bind(project_id)
      .fetch_one(&self.pool)
      .await?;
    Ok(count)
  }

  async fn count_events(&self, issue_id: i64) -> Result<i64, StoreError> {
    let count = query_scalar::<Sqlite, i64>("SELECT COUNT(*) FROM event WHERE group_id = ?1")
      .bind(issue_id)
      .fetch_one(&self.pool)
      .await?;
    Ok(count)
  }

  async fn count_data(&self) -> Result<i64, StoreError> {
    let count = query_scalar::<Sqlite, i64>("SELECT COUNT(*) FROM data")
      .fetch_one(&self.pool)
      .await?;
    Ok(count)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::types::Protocol;
  use chrono::{TimeZone, Utc};
  use std::collections::BTreeMap;

  fn make_event(message: &str, ts_secs: i64) -> NormalizedEvent {
    NormalizedEvent {
      protocol: Protocol::Legacy,
      project: "1".into(),
      server_name: "web-1".into(),
      site: "shop".into(),
      logger: "php".into(),
      level: "error".into(),
      platform: "php".into(),
      message: message.into(),
      environment: String::new(),
      timestamp: Utc.timestamp_opt(ts_secs, 0).unwrap(),
      request: None,
      exception: None,
      stack_frames: vec![],
      user: BTreeMap::new(),
      context: BTreeMap::new(),
    }
  }

  fn fp(s: &str) -> Fingerprint {
    Fingerprint(s.into())
  }

  #[tokio::test]
  async fn first_occurrence_creates_issue() {
    let store = SqliteStore::in_memory().await.unwrap();
    let raw = RawPayload::new("AAAA", Protocol::Legacy);
    let out = store
      .record("1", &fp("abc"), &make_event("boom", 1_700_000_000), &raw)
      .await
      .unwrap();
    assert!(out.is_new);
    assert!(!out.is_regression);

    let issue = store.issue(out.issue_id).await.unwrap().unwrap();
    assert_eq!(issue.seen_count, 1);
    assert_eq!(issue.status, IssueStatus::Open);
    assert_eq!(issue.first_seen, issue.last_seen);
    assert_eq!(issue.message, "boom");
  }

  #[tokio::test]
  async fn repeat_occurrence_updates_latest_fields() {
    let store = SqliteStore::in_memory().await.unwrap();
    let first = store
      .record("1", &fp("abc"), &make_event("first", 100), &RawPayload::new("AA", Protocol::Legacy))
      .await
      .unwrap();
    let second = store
      .record("1", &fp("abc"), &make_event("second", 200), &RawPayload::new("BB", Protocol::Legacy))
      .await
      .unwrap();
    assert_eq!(first.issue_id, second.issue_id);
    assert!(!second.is_new);

    let issue = store.issue(first.issue_id).await.unwrap().unwrap();
    assert_eq!(issue.seen_count, 2);
    assert_eq!(issue.message, "second");
    assert_eq!(issue.first_seen.timestamp(), 100);
    assert_eq!(issue.last_seen.timestamp(), 200);
    assert_eq!(store.count_events(first.issue_id).await.unwrap(), 2);
  }

  #[tokio::test]
  async fn same_fingerprint_in_other_project_is_separate() {
    let store = SqliteStore::in_memory().await.unwrap();
    let raw = RawPayload::new("AA", Protocol::Legacy);
    let a = store.record("1", &fp("abc"), &make_event("x", 1), &raw).await.unwrap();
    let b = store.record("2", &fp("abc"), &make_event("x", 1), &raw).await.unwrap();
    assert_ne!(a.issue_id, b.issue_id);
    assert!(b.is_new);
  }

  #[tokio::test]
  async fn resolved_issue_reopens_as_regression() {
    let store = SqliteStore::in_memory().await.unwrap();
    let raw = RawPayload::new("AA", Protocol::Legacy);
    let first = store.record("1", &fp("abc"), &make_event("x", 1), &raw).await.unwrap();
    store.set_status(first.issue_id, IssueStatus::Resolved).await.unwrap();

    let again = store.record("1", &fp("abc"), &make_event("x", 2), &raw).await.unwrap();
    assert!(again.is_regression);
    let issue = store.issue(first.issue_id).await.unwrap().unwrap();
    assert_eq!(issue.status, IssueStatus::Open);

    let third = store.record("1", &fp("abc"), &make_event("x", 3), &raw).await.unwrap();
    assert!(!third.is_regression);
  }

  #[tokio::test]
  async fn identical_payload_is_stored_once() {
    let store = SqliteStore::in_memory().await.unwrap();
    let raw = RawPayload::new("SAME", Protocol::Legacy);
    let mut issue_id = 0;
    for i in 0..3 {
      issue_id = store.record("1", &fp("abc"), &make_event("x", i), &raw).await.unwrap().issue_id;
    }
    assert_eq!(store.count_data().await.unwrap(), 1);
    assert_eq!(store.count_events(issue_id).await.unwrap(), 3);
  }

  #[tokio::test]
  async fn set_status_on_unknown_issue_is_not_found() {
    let store = SqliteStore::in_memory().await.unwrap();
    let err = store.set_status(404, IssueStatus::Resolved).await.unwrap_err();
    assert!(matches!(err, StoreError::NotFound { entity: "issue", .. }));
  }

  #[tokio::test]
  async fn find_issue_by_key() {
    let store = SqliteStore::in_memory().await.unwrap();
    let raw = RawPayload::new("AA", Protocol::Legacy);
    let out = store.record("7", &fp("k1"), &make_event("x", 1), &raw).await.unwrap();
    let found = store.find_issue("7", &fp("k1")).await.unwrap().unwrap();
    assert_eq!(found.id, out.issue_id);
    assert!(store.find_issue("7", &fp("k2")).await.unwrap().is_none());
  }
}
