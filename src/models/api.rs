use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Query string accepted by the slow-query endpoints.
///
/// `d` is a human-readable duration such as `1s`, `250ms` or `1m30s`.
/// It stays a raw string so a missing or malformed value can be reported
/// with the parser's own message.
#[derive(Debug, Default, Deserialize)]
pub struct DurationQuery {
    pub d: Option<String>,
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Service health status
    pub status: String,
    /// Service version
    pub version: String,
    /// Seconds since the application state was created
    pub uptime_seconds: u64,
    /// Current timestamp
    pub timestamp: DateTime<Utc>,
    /// Deadline applied to every request
    pub request_timeout_ms: u64,
}
