//! Simulated slow work.
//!
//! Stands in for a database query or downstream call whose duration the
//! caller chooses. Cancellation is the caller's job: race the returned
//! future against a context's done-signal and drop it to abandon the work.

use std::time::Duration;

use tokio::time::Instant;
use tracing::trace;

/// Complete after `duration`, returning the instant the work finished.
pub async fn simulate_work(duration: Duration) -> Instant {
    trace!(?duration, "Work started");
    tokio::time::sleep(duration).await;
    Instant::now()
}

/// Parse the `d` query parameter.
///
/// Accepts any `humantime` duration (`1s`, `500ms`, `2m 5s`). The error is
/// the text sent back to the caller with a 400 status.
pub fn parse_work_duration(raw: Option<&str>) -> Result<Duration, String> {
    humantime::parse_duration(raw.unwrap_or_default().trim()).map_err(|e| {
        format!("Bad request: please specify duration with e.g. '?d=1s' ({e})")
    })
}
