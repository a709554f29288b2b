//! Route table.

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::handlers;
use crate::state::AppState;

pub fn router(state: Arc<AppState>) -> Router {
  Router::new()
    .route("/health", get(handlers::health))
    .route("/api/store", post(handlers::store))
    .route("/api/store/", post(handlers::store))
    .route("/api/:project_id/store", post(handlers::project_store))
    .route("/api/:project_id/store/", post(handlers::project_store))
    .route("/api/:project_id/envelope", post(handlers::envelope))
    .route("/api/:project_id/envelope/", post(handlers::envelope))
    .layer(TraceLayer::new_for_http())
    .with_state(state)
}
