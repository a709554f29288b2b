//! Queue buffer between intake and the async worker.
//!
//! Messages are delivered in FIFO order per queue and each message is handed
//! to exactly one consumer. Delivery is at-most-once: a message is removed
//! when it is dequeued, not when it is processed.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx_core::query::query;
use sqlx_core::query_scalar::query_scalar;
use sqlx_postgres::{PgPool, Postgres};
use sqlx_sqlite::{Sqlite, SqlitePool};
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tracing::trace;

use crate::config::Config;
use crate::error::QueueError;
use crate::store::SqliteStore;
use crate::types::QueueMessage;

#[async_trait]
pub trait QueueBuffer: Send + Sync {
  async fn enqueue(&self, message: QueueMessage) -> Result<(), QueueError>;

  /// Wait up to `wait` for the oldest message. `Ok(None)` means the wait expired.
  async fn dequeue(&self, wait: Duration) -> Result<Option<QueueMessage>, QueueError>;
}

// ---------------------------------------------------------------------------
// In-process queue
// ---------------------------------------------------------------------------

/// Unbounded in-process queue for single-process deployments and tests.
pub struct MemoryQueue {
  tx: mpsc::UnboundedSender<QueueMessage>,
  rx: Mutex<mpsc::UnboundedReceiver<QueueMessage>>,
  len: AtomicUsize,
}

impl MemoryQueue {
  pub fn new() -> Self {
    let (tx, rx) = mpsc::unbounded_channel();
    Self {
      tx,
      rx: Mutex::new(rx),
      len: AtomicUsize::new(0),
    }
  }

  pub fn len(&self) -> usize {
    self.len.load(Ordering::Relaxed)
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

impl Default for MemoryQueue {
  fn default() -> Self {
    Self::new()
  }
}

#[async_trait]
impl QueueBuffer for MemoryQueue {
  async fn enqueue(&self, message: QueueMessage) -> Result<(), QueueError> {
    // Counted before the send so a concurrent dequeue never sees it negative.
    self.len.fetch_add(1, Ordering::Relaxed);
    if self.tx.send(message).is_err() {
      self.len.fetch_sub(1, Ordering::Relaxed);
      return Err(QueueError::Closed);
    }
    Ok(())
  }

  async fn dequeue(&self, wait: Duration) -> Result<Option<QueueMessage>, QueueError> {
    let mut rx = self.rx.lock().await;
    match tokio::time::timeout(wait, rx.recv()).await {
      Ok(Some(message)) => {
        self.len.fetch_sub(1, Ordering::Relaxed);
        Ok(Some(message))
      }
      Ok(None) => Err(QueueError::Closed),
      Err(_) => Ok(None),
    }
  }
}

// ---------------------------------------------------------------------------
// Table-backed queues
// ---------------------------------------------------------------------------

/// Sleep until the next poll, or report that the deadline has passed.
async fn wait_for_poll(deadline: Instant, interval: Duration) -> bool {
  let now = Instant::now();
  if now >= deadline {
    return false;
  }
  tokio::time::sleep(interval.min(deadline - now)).await;
  true
}

fn decode_row(payload: &str) -> Result<QueueMessage, QueueError> {
  Ok(serde_json::from_str(payload)?)
}

/// `ingest_queue` table in the SQLite store's database.
pub struct SqliteQueue {
  pool: SqlitePool,
  write_lock: Arc<Mutex<()>>,
  poll_interval: Duration,
}

impl SqliteQueue {
  pub fn new(store: &SqliteStore, config: &Config) -> Self {
    Self {
      pool: store.pool().clone(),
      write_lock: store.write_lock(),
      poll_interval: config.queue_poll_interval,
    }
  }

  async fn pop(&self) -> Result<Option<QueueMessage>, QueueError> {
    let _guard = self.write_lock.lock().await;
    let payload = query_scalar::<Sqlite, String>(
      "DELETE FROM ingest_queue
       WHERE id = (SELECT id FROM ingest_queue ORDER BY id LIMIT 1)
       RETURNING payload",
    )
    .fetch_optional(&self.pool)
    .await?;
    payload.as_deref().map(decode_row).transpose()
  }
}

#[async_trait]
impl QueueBuffer for SqliteQueue {
  async fn enqueue(&self, message: QueueMessage) -> Result<(), QueueError> {
    let payload = serde_json::to_string(&message)?;
    let _guard = self.write_lock.lock().await;
    query::<Sqlite>("INSERT INTO ingest_queue (payload) VALUES (?1)")
      .bind(payload)
      .execute(&self.pool)
      .await?;
    trace!(protocol = %message.protocol, "payload enqueued");
    Ok(())
  }

  async fn dequeue(&self, wait: Duration) -> Result<Option<QueueMessage>, QueueError> {
    let deadline = Instant::now() + wait;
    loop {
      if let Some(message) = self.pop().await? {
        return Ok(Some(message));
      }
      if !wait_for_poll(deadline, self.poll_interval).await {
        return Ok(None);
      }
    }
  }
}

/// `ingest_queue` table in Postgres. `SKIP LOCKED` lets any number of workers
/// pop concurrently without handing the same row to two of them.
pub struct PgQueue {
  pool: PgPool,
  poll_interval: Duration,
}

impl PgQueue {
  pub fn new(pool: PgPool, config: &Config) -> Self {
    Self {
      pool,
      poll_interval: config.queue_poll_interval,
    }
  }

  async fn pop(&self) -> Result<Option<QueueMessage>, QueueError> {
    let payload = query_scalar::<Postgres, String>(
      "DELETE FROM ingest_queue
       WHERE id = (
         SELECT id FROM ingest_queue ORDER BY id
         FOR UPDATE SKIP LOCKED LIMIT 1
       )
       RETURNING payload",
    )
    .fetch_optional(&self.pool)
    .await?;
    payload.as_deref().map(decode_row).transpose()
  }
}

#[async_trait]
impl QueueBuffer for PgQueue {
  async fn enqueue(&self, message: QueueMessage) -> Result<(), QueueError> {
    let payload = serde_json::to_string(&message)?;
    query::<Postgres>("INSERT INTO ingest_queue (payload) VALUES ($1)")
      .bind(payload)
      .execute(&self.pool)
      .await?;
    trace!(protocol = %message.protocol, "payload enqueued");
    Ok(())
  }

  async fn dequeue(&self, wait: Duration) -> Result<Option<QueueMessage>, QueueError> {
    let deadline = Instant::now() + wait;
    loop {
      if let Some(message) = self.pop().await? {
        return Ok(Some(message));
      }
      if !wait_for_poll(deadline, self.poll_interval).await {
        return Ok(None);
      }
    }
  }
}
