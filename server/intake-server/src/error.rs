//! Intake failures and their HTTP mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use ingest_engine::types::ErrorOutput;
use ingest_engine::{DecodeError, IngestError, QueueError, StoreError};
use thiserror::Error;
use tracing::{error, warn};

#[derive(Debug, Error)]
pub enum IntakeError {
  #[error(transparent)]
  Decode(#[from] DecodeError),

  #[error("store: {0}")]
  Store(#[from] StoreError),

  #[error("enqueue: {0}")]
  Enqueue(#[from] QueueError),
}

impl From<IngestError> for IntakeError {
  fn from(e: IngestError) -> Self {
    match e {
      IngestError::Decode(e) => Self::Decode(e),
      IngestError::Store(e) => Self::Store(e),
    }
  }
}

impl IntakeError {
  pub fn status(&self) -> StatusCode {
    match self {
      Self::Decode(_) => StatusCode::BAD_REQUEST,
      Self::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
      Self::Enqueue(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
  }
}

impl IntoResponse for IntakeError {
  fn into_response(self) -> Response {
    let status = self.status();
    let body = match &self {
      Self::Decode(e) => {
        warn!(stage = %e.stage, reason = %e.reason, "rejected undecodable payload");
        ErrorOutput::new(e.reason.clone()).with_stage(e.stage.as_str())
      }
      other => {
        error!(error = %other, "intake failed");
        ErrorOutput::new(other.to_string())
      }
    };
    (status, Json(body)).into_response()
  }
}
