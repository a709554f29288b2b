//! Engine configuration with sane defaults.

use std::time::Duration;

/// Tunables for storage and the async worker.
#[derive(Debug, Clone)]
pub struct Config {
  /// Bounded wait of one worker dequeue; also the shutdown observation latency.
  pub dequeue_wait: Duration,
  /// Polling interval of table-backed queues while waiting for a message.
  pub queue_poll_interval: Duration,
  /// SQLite busy handler timeout.
  pub sqlite_busy_timeout: Duration,
  /// Database pool size.
  pub max_connections: u32,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      dequeue_wait: Duration::from_secs(1),
      queue_poll_interval: Duration::from_millis(100),
      sqlite_busy_timeout: Duration::from_secs(5),
      max_connections: 8,
    }
  }
}
