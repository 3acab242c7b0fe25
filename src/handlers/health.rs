//! Health endpoint.
//!
//! `GET /health` runs behind the same deadline wrapper as every other
//! route; it never touches the response writer, so its JSON response is
//! forwarded as-is.

use axum::Json;
use axum::extract::State;
use chrono::Utc;
use tracing::instrument;

use crate::models::HealthResponse;
use crate::state::AppState;

/// Health check endpoint.
///
/// # Response Body
///
/// ```json
/// {
///   "status": "healthy",
///   "version": "0.1.0",
///   "uptime_seconds": 42,
///   "timestamp": "2024-01-15T10:30:00Z",
///   "request_timeout_ms": 3000
/// }
/// ```
#[instrument(skip(state))]
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.uptime_seconds(),
        timestamp: Utc::now(),
        request_timeout_ms: u64::try_from(state.config.request_timeout.as_millis())
            .unwrap_or(u64::MAX),
    })
}
