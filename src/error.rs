use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

use crate::exchange::WriteError;

/// Application-wide error types with appropriate HTTP status codes.
///
/// Handlers behind the deadline wrapper normally answer through the
/// response writer; an `AppError` returned from a handler is only sent when
/// the writer was never touched.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Internal server error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Response write failed: {0}")]
    Write(#[from] WriteError),
}

/// Error response body for API endpoints.
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        // Log the full error server-side, expose only sanitized messages
        tracing::error!(error = %self, "Request failed");

        let (status, error_type, message) = match &self {
            AppError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                "An internal error occurred. Please contact support if the issue persists.",
            ),
            AppError::ConfigError(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "config_error",
                "Service configuration error. Please contact support.",
            ),
            AppError::Write(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "response_error",
                "The response could not be written.",
            ),
        };

        let body = ErrorResponse {
            error: error_type.to_string(),
            message: message.to_string(),
        };

        (status, axum::Json(body)).into_response()
    }
}

/// Convenience type alias for Results with AppError.
pub type AppResult<T> = Result<T, AppError>;
