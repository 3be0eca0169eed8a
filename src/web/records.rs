//! Market record query, stats, and refresh trigger handlers.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::Json;
use serde::Serialize;
use tracing::{info, instrument};

use crate::query::{FlowStats, RecordPage, RecordQuery};
use crate::refresh::{CycleTrigger, TriggerOutcome};
use crate::state::AppState;
use crate::web::error::ApiError;

/// `GET /api/records`
#[instrument(skip_all)]
pub(super) async fn list_records(
    State(state): State<AppState>,
    Query(params): Query<RecordQuery>,
) -> Result<Json<RecordPage>, ApiError> {
    Ok(Json(state.queries.query(&params)?))
}

/// `GET /api/stats`
pub(super) async fn stats(State(state): State<AppState>) -> Result<Json<FlowStats>, ApiError> {
    Ok(Json(state.queries.stats()?))
}

/// Response for `POST /api/refresh`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshTriggerResponse {
    pub started: bool,
    pub message: String,
}

/// `POST /api/refresh`: start a refresh cycle unless one is running or the
/// service is shutting down.
#[instrument(skip_all)]
pub(super) async fn trigger_refresh(
    State(state): State<AppState>,
) -> (StatusCode, Json<RefreshTriggerResponse>) {
    match state.scheduler.trigger_refresh(CycleTrigger::Manual) {
        TriggerOutcome::Started => {
            info!("Manual refresh triggered");
            (
                StatusCode::ACCEPTED,
                Json(RefreshTriggerResponse {
                    started: true,
                    message: "Refresh started".to_owned(),
                }),
            )
        }
        TriggerOutcome::AlreadyInProgress => (
            StatusCode::OK,
            Json(RefreshTriggerResponse {
                started: false,
                message: "Refresh already in progress".to_owned(),
            }),
        ),
        TriggerOutcome::ShuttingDown => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(RefreshTriggerResponse {
                started: false,
                message: "Service is shutting down".to_owned(),
            }),
        ),
    }
}
