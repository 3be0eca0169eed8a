//! JSON error responses for the API.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::Serialize;
use tracing::warn;

use crate::query::QueryError;

/// Machine-readable error codes returned in the `code` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApiErrorCode {
    /// No snapshot has been published yet.
    NotInitialized,
    InvalidFilter,
    InternalError,
}

impl ApiErrorCode {
    pub fn status(self) -> StatusCode {
        match self {
            Self::NotInitialized => StatusCode::SERVICE_UNAVAILABLE,
            Self::InvalidFilter => StatusCode::BAD_REQUEST,
            Self::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ApiError {
    pub code: ApiErrorCode,
    pub message: String,
}

impl ApiError {
    pub fn new(code: ApiErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::new(ApiErrorCode::InternalError, message)
    }
}

impl From<QueryError> for ApiError {
    fn from(err: QueryError) -> Self {
        match err {
            QueryError::CacheUninitialized(_) => Self::new(
                ApiErrorCode::NotInitialized,
                "Market data is still loading, retry shortly",
            ),
            QueryError::InvalidFilter { .. } => {
                Self::new(ApiErrorCode::InvalidFilter, err.to_string())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.code.status();
        if status.is_server_error() && status != StatusCode::SERVICE_UNAVAILABLE {
            warn!(code = ?self.code, message = %self.message, "API request failed");
        }
        (status, Json(self)).into_response()
    }
}
