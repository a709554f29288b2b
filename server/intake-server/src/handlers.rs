//! HTTP handlers for the store and envelope endpoints.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use ingest_engine::{Protocol, RawPayload};
use tracing::debug;

use crate::error::IntakeError;
use crate::state::{AppState, Intake};
use crate::types::{QueuedResponse, SentryAuth, StoredResponse};

const AUTH_HEADER: &str = "x-sentry-auth";

pub async fn health() -> &'static str {
  "ok"
}

/// `POST /api/store`
pub async fn store(
  State(state): State<Arc<AppState>>,
  headers: HeaderMap,
  body: Bytes,
) -> Result<Response, IntakeError> {
  let raw = store_payload(&headers, body, None);
  accept(&state, raw).await
}

/// `POST /api/:project_id/store`
pub async fn project_store(
  State(state): State<Arc<AppState>>,
  Path(project_id): Path<String>,
  headers: HeaderMap,
  body: Bytes,
) -> Result<Response, IntakeError> {
  let raw = store_payload(&headers, body, Some(project_id));
  accept(&state, raw).await
}

/// `POST /api/:project_id/envelope`. The body is the raw gzip envelope.
pub async fn envelope(
  State(state): State<Arc<AppState>>,
  Path(project_id): Path<String>,
  body: Bytes,
) -> Result<Response, IntakeError> {
  let raw = RawPayload::new(STANDARD.encode(&body), Protocol::Modern).with_project(project_id);
  accept(&state, raw).await
}

/// Legacy clients post base64 text; modern clients hitting the store route post raw bytes.
fn store_payload(headers: &HeaderMap, body: Bytes, project_id: Option<String>) -> RawPayload {
  let auth = headers
    .get(AUTH_HEADER)
    .and_then(|v| v.to_str().ok())
    .map(SentryAuth::parse)
    .unwrap_or_default();
  let protocol = auth.protocol();

  let body = match protocol {
    Protocol::Legacy => body.to_vec(),
    Protocol::Modern => STANDARD.encode(&body).into_bytes(),
  };
  let raw = RawPayload::new(body, protocol);
  match project_id {
    Some(p) => raw.with_project(p),
    None => raw,
  }
}

async fn accept(state: &AppState, raw: RawPayload) -> Result<Response, IntakeError> {
  match &state.intake {
    Intake::Direct(dispatcher) => {
      let outcome = dispatcher.process(&raw).await?;
      state.notifier.dispatch(&outcome);
      Ok((StatusCode::OK, Json(StoredResponse { id: outcome.issue_id })).into_response())
    }
    Intake::Queued(queue) => {
      debug!(protocol = %raw.protocol, bytes = raw.body.len(), "enqueueing payload");
      queue.enqueue(raw.into()).await?;
      Ok((StatusCode::ACCEPTED, Json(QueuedResponse { queued: true })).into_response())
    }
  }
}
