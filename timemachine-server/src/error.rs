use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use timemachine_core::{ErrorKind, TimeMachineError};

#[derive(thiserror::Error, Debug)]
pub enum AppError {
    #[error("{0}")]
    BadRequest(String),

    #[error(transparent)]
    Engine(#[from] TimeMachineError),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<tokio::task::JoinError> for AppError {
    fn from(e: tokio::task::JoinError) -> Self {
        AppError::Internal(anyhow::anyhow!(e))
    }
}

fn engine_response(e: &TimeMachineError) -> (StatusCode, serde_json::Value) {
    let msg = e.to_string();
    match e.kind() {
        ErrorKind::NotFound => (StatusCode::NOT_FOUND, json!({ "error": msg, "code": "NOT_FOUND" })),
        ErrorKind::PermissionDenied => (
            StatusCode::FORBIDDEN,
            json!({ "error": msg, "code": "PERMISSION_DENIED" }),
        ),
        ErrorKind::CreateFailed => {
            let meta = match e {
                TimeMachineError::CreateFailed { path, parent, .. } => json!({
                    "path": path.display().to_string(),
                    "parent": parent.display().to_string(),
                }),
                _ => serde_json::Value::Null,
            };
            tracing::error!(error = %e, "Backup directory creation failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({ "error": msg, "code": "CREATE_FAILED", "meta": meta }),
            )
        }
        ErrorKind::InvalidInput => (StatusCode::BAD_REQUEST, json!({ "error": msg, "code": "INVALID_INPUT" })),
        ErrorKind::BackendUninitialized => (
            StatusCode::CONFLICT,
            json!({ "error": msg, "code": "UNINITIALIZED" }),
        ),
        ErrorKind::Internal => {
            tracing::error!("Internal error: {e:#}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({ "error": msg, "code": "INTERNAL" }),
            )
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            AppError::BadRequest(m) => (
                StatusCode::BAD_REQUEST,
                json!({ "error": m, "code": "INVALID_INPUT" }),
            ),
            AppError::Engine(e) => engine_response(e),
            AppError::Internal(e) => {
                tracing::error!("Internal error: {e:#}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({ "error": "Internal server error", "code": "INTERNAL" }),
                )
            }
        };
        (status, Json(body)).into_response()
    }
}
