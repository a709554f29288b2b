//! Router tests for the intake endpoints.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use flate2::write::GzEncoder;
use flate2::Compression;
use ingest_engine::codec;
use async_trait::async_trait;
use ingest_engine::{
  AggregationStore, Dispatcher, MemoryQueue, NotifierSet, Protocol, QueueBuffer, QueueError,
  QueueMessage, SqliteStore,
};
use intake_server::{router, AppState};
use tower::ServiceExt;

async fn direct_app() -> (Router, Arc<SqliteStore>) {
  let store = Arc::new(SqliteStore::in_memory().await.unwrap());
  let state = AppState::direct(Dispatcher::new(store.clone()), NotifierSet::new());
  (router(Arc::new(state)), store)
}

fn legacy_body(json: &str) -> Vec<u8> {
  codec::encode(Protocol::Legacy, json.as_bytes()).unwrap()
}

fn envelope_bytes(json: &str) -> Vec<u8> {
  let mut gz = GzEncoder::new(Vec::new(), Compression::default());
  write!(gz, "{{}}\n{{\"type\":\"event\"}}\n{json}").unwrap();
  gz.finish().unwrap()
}

fn post(uri: &str, body: Vec<u8>) -> Request<Body> {
  Request::builder()
    .method("POST")
    .uri(uri)
    .body(Body::from(body))
    .unwrap()
}

async fn json_body(resp: axum::response::Response) -> serde_json::Value {
  let bytes = axum::body::to_bytes(resp.into_body(), 64 * 1024).await.unwrap();
  serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn health_endpoint_returns_ok() {
  let (app, _) = direct_app().await;
  let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
  let resp = app.oneshot(req).await.unwrap();
  assert_eq!(resp.status(), StatusCode::OK);
  let body = axum::body::to_bytes(resp.into_body(), 1024).await.unwrap();
  assert_eq!(&body[..], b"ok");
}

#[tokio::test]
async fn legacy_store_returns_issue_id() {
  let (app, store) = direct_app().await;
  let body = legacy_body(r#"{"message":"NullPointerException","level":"error"}"#);

  let resp = app.clone().oneshot(post("/api/3/store", body.clone())).await.unwrap();
  assert_eq!(resp.status(), StatusCode::OK);
  let first = json_body(resp).await;

  let resp = app.oneshot(post("/api/3/store", body)).await.unwrap();
  let second = json_body(resp).await;
  assert_eq!(first["id"], second["id"]);

  let id = first["id"].as_i64().unwrap();
  assert_eq!(store.issue(id).await.unwrap().unwrap().seen_count, 2);
  assert_eq!(store.count_issues("3").await.unwrap(), 1);
}

#[tokio::test]
async fn auth_header_version_7_selects_modern() {
  let (app, store) = direct_app().await;
  let req = Request::builder()
    .method("POST")
    .uri("/api/8/store")
    .header("X-Sentry-Auth", "Sentry sentry_version=7, sentry_key=k")
    .body(Body::from(envelope_bytes(
      r#"{"exception":{"values":[{"type":"KeyError","value":"'sku'"}]}}"#,
    )))
    .unwrap();

  let resp = app.oneshot(req).await.unwrap();
  assert_eq!(resp.status(), StatusCode::OK);
  let id = json_body(resp).await["id"].as_i64().unwrap();
  let issue = store.issue(id).await.unwrap().unwrap();
  assert_eq!(issue.message, "'sku'");
  assert_eq!(issue.level, "KeyError");
}

#[tokio::test]
async fn envelope_route_accepts_raw_gzip() {
  let (app, store) = direct_app().await;
  let body = envelope_bytes(r#"{"platform":"python","exception":{"values":[{"type":"ZeroDivisionError","value":"division by zero"}]}}"#);

  let resp = app.oneshot(post("/api/12/envelope", body)).await.unwrap();
  assert_eq!(resp.status(), StatusCode::OK);
  assert_eq!(store.count_issues("12").await.unwrap(), 1);
  assert_eq!(store.count_data().await.unwrap(), 1);
}

#[tokio::test]
async fn undecodable_payload_is_bad_request() {
  let (app, store) = direct_app().await;
  let resp = app.oneshot(post("/api/store", b"%%% not base64".to_vec())).await.unwrap();
  assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

  let body = json_body(resp).await;
  assert_eq!(body["error"], true);
  assert_eq!(body["stage"], "base64");
  assert_eq!(store.count_data().await.unwrap(), 0);
}

#[tokio::test]
async fn queued_intake_answers_accepted() {
  let queue = Arc::new(MemoryQueue::new());
  let app = router(Arc::new(AppState::queued(queue.clone())));

  let resp = app
    .oneshot(post("/api/4/store", legacy_body(r#"{"message":"later"}"#)))
    .await
    .unwrap();
  assert_eq!(resp.status(), StatusCode::ACCEPTED);
  assert_eq!(json_body(resp).await["queued"], true);

  let msg = queue.dequeue(Duration::from_millis(10)).await.unwrap().unwrap();
  assert_eq!(msg.project_id, "4");
  assert_eq!(msg.protocol, Protocol::Legacy);
}

#[tokio::test]
async fn queued_intake_does_not_validate_payloads() {
  let queue = Arc::new(MemoryQueue::new());
  let app = router(Arc::new(AppState::queued(queue.clone())));
  let resp = app.oneshot(post("/api/store", b"garbage".to_vec())).await.unwrap();
  assert_eq!(resp.status(), StatusCode::ACCEPTED);
  assert_eq!(queue.len(), 1);
}

/// Queue whose backend is down.
struct UnavailableQueue;

#[async_trait]
impl QueueBuffer for UnavailableQueue {
  async fn enqueue(&self, _: QueueMessage) -> Result<(), QueueError> {
    Err(QueueError::Backend("connection reset".into()))
  }

  async fn dequeue(&self, _: Duration) -> Result<Option<QueueMessage>, QueueError> {
    Ok(None)
  }
}

#[tokio::test]
async fn enqueue_failure_is_service_unavailable() {
  let app = router(Arc::new(AppState::queued(Arc::new(UnavailableQueue))));
  let resp = app
    .oneshot(post("/api/4/store", legacy_body(r#"{"message":"later"}"#)))
    .await
    .unwrap();
  assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

  let body = json_body(resp).await;
  assert_eq!(body["error"], true);
  assert!(body["message"].as_str().unwrap().contains("connection reset"));
}
