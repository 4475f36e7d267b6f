use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use mandi_core::CoreError;
use serde_json::json;

#[derive(Debug)]
pub enum AppError {
    Validation(String),
    NotFound(String),
    Conflict(String),
    Gateway(String),
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            AppError::Validation(msg) => (StatusCode::UNPROCESSABLE_ENTITY, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            AppError::Gateway(msg) => {
                tracing::warn!("Payment gateway error: {}", msg);
                (StatusCode::BAD_GATEWAY, msg)
            }
            AppError::Internal(msg) => {
                tracing::error!("Internal Server Error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error".to_string())
            }
        };

        let body = Json(json!({
            "error": error_message,
        }));

        (status, body).into_response()
    }
}

impl From<CoreError> for AppError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Validation(e) => AppError::Validation(e.to_string()),
            e @ CoreError::NotFound { .. } => AppError::NotFound(e.to_string()),
            e @ CoreError::Conflict { .. } => AppError::Conflict(e.to_string()),
            CoreError::External(msg) => AppError::Gateway(msg),
            e @ (CoreError::FatalInvariant(_) | CoreError::Storage(_)) => AppError::Internal(e.to_string()),
        }
    }
}
