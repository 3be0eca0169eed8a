//! Web API router construction.

use axum::{
    Router,
    routing::{get, post},
};
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::state::AppState;
use crate::web::{records, status};

/// Upper bound on handler time; reads are in-memory, so this only guards stalls.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Creates the web server router
pub fn create_router(app_state: AppState) -> Router {
    let api_router = Router::new()
        .route("/health", get(status::health))
        .route("/status", get(status::status))
        .route("/records", get(records::list_records))
        .route("/stats", get(records::stats))
        .route("/refresh", post(records::trigger_refresh))
        .with_state(app_state);

    Router::new().nest("/api", api_router).layer((
        TraceLayer::new_for_http(),
        CorsLayer::permissive(),
        TimeoutLayer::new(REQUEST_TIMEOUT),
    ))
}
