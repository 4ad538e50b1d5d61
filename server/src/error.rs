//! Unified error handling for the control API.

use crate::db::StoreError;
use axum::{
    extract::rejection::{JsonRejection, QueryRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

/// Application error type.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Engine error: {0}")]
    Engine(#[from] lifeline_engine::Error),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(&'static str),
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        AppError::BadRequest(rejection.body_text())
    }
}

impl From<QueryRejection> for AppError {
    fn from(rejection: QueryRejection) -> Self {
        AppError::BadRequest(rejection.body_text())
    }
}

/// Error response body.
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

/// Status for an engine error surfaced to a caller.
fn engine_status(e: &lifeline_engine::Error) -> StatusCode {
    use lifeline_engine::Error;

    match e {
        _ if e.is_validation() => StatusCode::BAD_REQUEST,
        Error::OperationNotFound(_) | Error::ConflictNotFound(_) => StatusCode::NOT_FOUND,
        Error::QueueFull(_)
        | Error::DuplicateOperation(_)
        | Error::NotCancellable { .. }
        | Error::AlreadyResolved(_)
        | Error::IllegalTransition { .. }
        | Error::AttemptsRegression { .. } => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn engine_parts(e: &lifeline_engine::Error) -> (StatusCode, String, Option<String>) {
    let status = engine_status(e);
    if status.is_server_error() {
        tracing::error!("Engine error: {:?}", e);
    } else {
        tracing::warn!("Engine error: {:?}", e);
    }
    (status, e.to_string(), None)
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message, details) = match &self {
            AppError::Engine(e) | AppError::Store(StoreError::Engine(e)) => engine_parts(e),
            AppError::Store(e) => {
                tracing::error!("Storage error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Storage error".to_string(),
                    None,
                )
            }
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone(), None),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone(), None),
            AppError::Unauthorized(reason) => (
                StatusCode::UNAUTHORIZED,
                "Unauthorized".to_string(),
                Some(reason.to_string()),
            ),
        };

        let body = Json(ErrorResponse {
            error: error_message,
            details,
        });

        (status, body).into_response()
    }
}

/// Result type alias for handlers.
pub type Result<T> = std::result::Result<T, AppError>;
