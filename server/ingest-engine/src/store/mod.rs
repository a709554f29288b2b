//! Aggregation store: the only owner of issue, event and data persistence.

mod postgres;
mod sqlite;

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::Config;
use crate::error::StoreError;
use crate::queue::{PgQueue, QueueBuffer, SqliteQueue};
use crate::types::{Fingerprint, Issue, IssueStatus, NormalizedEvent, RawPayload, RecordOutcome};

pub use postgres::PgStore;
pub use sqlite::SqliteStore;

#[async_trait]
pub trait AggregationStore: Send + Sync {
  /// Upsert the issue for `(project_id, fingerprint)`, append one event row and
  /// write the payload's data row unless its content hash is already stored.
  ///
  /// All three writes commit together. Concurrent calls for the same key never
  /// create two issues.
  async fn record(
    &self,
    project_id: &str,
    fingerprint: &Fingerprint,
    event: &NormalizedEvent,
    raw: &RawPayload,
  ) -> Result<RecordOutcome, StoreError>;

  /// Acknowledge / reopen an issue.
  async fn set_status(&self, issue_id: i64, status: IssueStatus) -> Result<(), StoreError>;

  async fn issue(&self, issue_id: i64) -> Result<Option<Issue>, StoreError>;

  async fn find_issue(
    &self,
    project_id: &str,
    fingerprint: &Fingerprint,
  ) -> Result<Option<Issue>, StoreError>;

  async fn count_issues(&self, project_id: &str) -> Result<i64, StoreError>;

  async fn count_events(&self, issue_id: i64) -> Result<i64, StoreError>;

  async fn count_data(&self) -> Result<i64, StoreError>;
}

/// Latest-event columns denormalized onto the issue row.
pub(crate) struct LatestFields<'a> {
  pub logger: &'a str,
  pub level: &'a str,
  pub message: &'a str,
  pub server_name: &'a str,
  pub url: &'a str,
  pub site: &'a str,
  pub platform: &'a str,
}

impl<'a> From<&'a NormalizedEvent> for LatestFields<'a> {
  fn from(event: &'a NormalizedEvent) -> Self {
    Self {
      logger: &event.logger,
      level: &event.level,
      message: &event.message,
      server_name: &event.server_name,
      url: event.request_url().unwrap_or_default(),
      site: &event.site,
      platform: &event.platform,
    }
  }
}

/// Store plus the table-backed queue living in the same database.
pub struct Storage {
  pub store: Arc<dyn AggregationStore>,
  pub queue: Arc<dyn QueueBuffer>,
}

/// Open storage for a `postgres://` or `sqlite:` url, creating the schema if needed.
pub async fn connect(url: &str, config: &Config) -> Result<Storage, StoreError> {
  if url.starts_with("postgres://") || url.starts_with("postgresql://") {
    let store = PgStore::connect(url, config).await?;
    let queue = PgQueue::new(store.pool().clone(), config);
    Ok(Storage {
      store: Arc::new(store),
      queue: Arc::new(queue),
    })
  } else if url.starts_with("sqlite:") {
    let store = SqliteStore::connect(url, config).await?;
    let queue = SqliteQueue::new(&store, config);
    Ok(Storage {
      store: Arc::new(store),
      queue: Arc::new(queue),
    })
  } else {
    Err(StoreError::UnsupportedUrl(url.to_string()))
  }
}
