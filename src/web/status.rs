//! Health and status handlers.

use axum::extract::State;
use axum::response::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use tracing::trace;

use crate::refresh::RefreshCycle;
use crate::state::{AppState, ServiceStatus};

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInfo {
    status: ServiceStatus,
    updated_secs_ago: u64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheInfo {
    initialized: bool,
    generation: Option<u64>,
    generated_at: Option<DateTime<Utc>>,
    records: usize,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    status: ServiceStatus,
    version: String,
    commit: String,
    services: BTreeMap<String, ServiceInfo>,
    cache: CacheInfo,
    refresh_in_progress: bool,
    refresh_interval_secs: u64,
    last_cycle: Option<RefreshCycle>,
}

/// Health check endpoint
pub(super) async fn health() -> Json<Value> {
    trace!("health check requested");
    Json(json!({
        "status": "healthy",
        "timestamp": Utc::now().to_rfc3339()
    }))
}

/// Status endpoint showing service, cache, and refresh state
pub(super) async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    let services: BTreeMap<String, ServiceInfo> = state
        .service_statuses
        .all()
        .into_iter()
        .map(|(name, status, updated_secs_ago)| {
            (
                name,
                ServiceInfo {
                    status,
                    updated_secs_ago,
                },
            )
        })
        .collect();

    let snapshot = state.scheduler.cache().current().ok();
    let cache = CacheInfo {
        initialized: snapshot.is_some(),
        generation: snapshot.as_ref().map(|s| s.generation()),
        generated_at: snapshot.as_ref().map(|s| s.generated_at()),
        records: snapshot.as_ref().map_or(0, |s| s.len()),
    };

    let overall_status = if services
        .values()
        .any(|s| matches!(s.status, ServiceStatus::Error))
    {
        ServiceStatus::Error
    } else if !cache.initialized {
        ServiceStatus::Starting
    } else {
        ServiceStatus::Active
    };

    Json(StatusResponse {
        status: overall_status,
        version: env!("CARGO_PKG_VERSION").to_string(),
        commit: env!("GIT_COMMIT_HASH").to_string(),
        services,
        cache,
        refresh_in_progress: state.scheduler.is_refreshing(),
        refresh_interval_secs: state.scheduler.interval().as_secs(),
        last_cycle: state.scheduler.last_cycle(),
    })
}
