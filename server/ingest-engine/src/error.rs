//! Structured error types for the ingestion pipeline.

use std::fmt;

use thiserror::Error;

/// Codec stage that rejected a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DecodeStage {
  Base64,
  Decompress,
  Parse,
}

impl DecodeStage {
  pub fn as_str(self) -> &'static str {
    match self {
      Self::Base64 => "base64",
      Self::Decompress => "decompress",
      Self::Parse => "parse",
    }
  }
}

impl fmt::Display for DecodeStage {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// A payload could not be decoded. Permanent: retrying the same bytes fails the same way.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("decode ({stage}): {reason}")]
pub struct DecodeError {
  pub stage: DecodeStage,
  pub reason: String,
}

impl DecodeError {
  pub fn new(stage: DecodeStage, reason: impl Into<String>) -> Self {
    Self {
      stage,
      reason: reason.into(),
    }
  }
}

/// Persistence failure in the aggregation store.
#[derive(Debug, Error)]
pub enum StoreError {
  #[error("database: {0}")]
  Database(String),

  #[error("{entity} not found: {id}")]
  NotFound { entity: &'static str, id: String },

  #[error("unsupported database url: {0}")]
  UnsupportedUrl(String),

  #[error("serialization: {0}")]
  Serialization(String),
}

impl StoreError {
  pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
    Self::NotFound {
      entity,
      id: id.to_string(),
    }
  }
}

impl From<sqlx_core::error::Error> for StoreError {
  fn from(e: sqlx_core::error::Error) -> Self {
    Self::Database(e.to_string())
  }
}

/// Queue buffer failure (enqueue on the intake side, dequeue on the worker side).
#[derive(Debug, Error)]
pub enum QueueError {
  #[error("queue closed")]
  Closed,

  #[error("queue backend: {0}")]
  Backend(String),

  #[error("queue message: {0}")]
  Message(#[from] serde_json::Error),
}

impl From<sqlx_core::error::Error> for QueueError {
  fn from(e: sqlx_core::error::Error) -> Self {
    Self::Backend(e.to_string())
  }
}

/// Failure of one `Dispatcher::process` call.
#[derive(Debug, Error)]
pub enum IngestError {
  #[error(transparent)]
  Decode(#[from] DecodeError),

  #[error("store: {0}")]
  Store(#[from] StoreError),
}

impl IngestError {
  /// Decode failures are deterministic; everything else may succeed later.
  pub fn is_permanent(&self) -> bool {
    matches!(self, Self::Decode(_))
  }
}

/// Fatal worker termination.
#[derive(Debug, Error)]
pub enum WorkerError {
  #[error("worker queue: {0}")]
  Queue(#[from] QueueError),

  #[error("worker store: {0}")]
  Store(#[from] StoreError),
}
