//! Prometheus metrics for request deadlines and connection aborts.
//!
//! Metrics are exposed via a dedicated HTTP listener (default port 9090).
//! Recording functions are no-ops until [`init_metrics`] installs the
//! exporter, so tests and metric-less deployments pay nothing.
//!
//! # Available Metrics
//!
//! ## Counters
//! - `deadline_requests_total` - Finished requests (label: `outcome` =
//!   `completed` | `timed_out` | `abandoned`)
//! - `deadline_hijack_unsupported_total` - Timeouts answered with 500 because
//!   the connection could not be taken over
//! - `deadline_connections_aborted_total` - Connections severed after a timeout
//!
//! ## Histograms
//! - `deadline_request_duration_seconds` - Time from arrival to settlement
//!   (label: `outcome`)
//!
//! ## Gauges
//! - `deadline_requests_in_flight` - Requests currently inside the wrapper
//! - `deadline_connections_open` - Open client connections

use std::net::SocketAddr;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::{error, info};

/// Metric names as constants for consistency.
pub mod names {
    pub const REQUESTS_TOTAL: &str = "deadline_requests_total";
    pub const HIJACK_UNSUPPORTED_TOTAL: &str = "deadline_hijack_unsupported_total";
    pub const CONNECTIONS_ABORTED_TOTAL: &str = "deadline_connections_aborted_total";
    pub const REQUEST_DURATION_SECONDS: &str = "deadline_request_duration_seconds";
    pub const REQUESTS_IN_FLIGHT: &str = "deadline_requests_in_flight";
    pub const CONNECTIONS_OPEN: &str = "deadline_connections_open";
}

/// How a request left the deadline wrapper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Handler finished before the deadline.
    Completed,
    /// Watcher answered after the deadline.
    TimedOut,
    /// Handler finished after the watcher had already answered.
    Abandoned,
}

impl Outcome {
    pub const fn as_str(self) -> &'static str {
        match self {
            Outcome::Completed => "completed",
            Outcome::TimedOut => "timed_out",
            Outcome::Abandoned => "abandoned",
        }
    }
}

/// Install the Prometheus exporter and describe all metrics.
pub fn init_metrics(metrics_addr: SocketAddr) -> Result<(), String> {
    PrometheusBuilder::new()
        .with_http_listener(metrics_addr)
        .install()
        .map_err(|e| format!("Failed to install Prometheus exporter: {e}"))?;

    describe_counter!(names::REQUESTS_TOTAL, "Requests that left the deadline wrapper");
    describe_counter!(
        names::HIJACK_UNSUPPORTED_TOTAL,
        "Timeouts on connections that could not be taken over"
    );
    describe_counter!(
        names::CONNECTIONS_ABORTED_TOTAL,
        "Connections severed after a request deadline"
    );
    describe_histogram!(
        names::REQUEST_DURATION_SECONDS,
        "Time from request arrival to settlement in seconds"
    );
    describe_gauge!(
        names::REQUESTS_IN_FLIGHT,
        "Requests currently inside the deadline wrapper"
    );
    describe_gauge!(names::CONNECTIONS_OPEN, "Open client connections");

    info!(addr = %metrics_addr, "Prometheus metrics endpoint started");
    Ok(())
}

/// Try to initialize metrics, logging any errors but not failing.
pub fn try_init_metrics(metrics_addr: SocketAddr) {
    if let Err(e) = init_metrics(metrics_addr) {
        error!(error = %e, "Failed to initialize metrics, continuing without metrics");
    }
}

pub fn record_request_started() {
    gauge!(names::REQUESTS_IN_FLIGHT).increment(1.0);
}

/// Record how a request settled and how long it took.
pub fn record_request_settled(outcome: Outcome, duration_secs: f64) {
    gauge!(names::REQUESTS_IN_FLIGHT).decrement(1.0);
    counter!(names::REQUESTS_TOTAL, "outcome" => outcome.as_str()).increment(1);
    histogram!(names::REQUEST_DURATION_SECONDS, "outcome" => outcome.as_str())
        .record(duration_secs);
}

/// Late handler completion after the watcher already answered.
pub fn record_request_abandoned() {
    counter!(names::REQUESTS_TOTAL, "outcome" => Outcome::Abandoned.as_str()).increment(1);
}

pub fn record_hijack_unsupported() {
    counter!(names::HIJACK_UNSUPPORTED_TOTAL).increment(1);
}

pub fn record_connection_aborted() {
    counter!(names::CONNECTIONS_ABORTED_TOTAL).increment(1);
}

pub fn record_connection_opened() {
    gauge!(names::CONNECTIONS_OPEN).increment(1.0);
}

pub fn record_connection_closed() {
    gauge!(names::CONNECTIONS_OPEN).decrement(1.0);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_labels() {
        assert_eq!(Outcome::Completed.as_str(), "completed");
        assert_eq!(Outcome::TimedOut.as_str(), "timed_out");
        assert_eq!(Outcome::Abandoned.as_str(), "abandoned");
    }

    #[test]
    fn test_recording_without_exporter_is_noop() {
        record_request_started();
        record_request_settled(Outcome::Completed, 0.01);
        record_hijack_unsupported();
        record_connection_aborted();
        record_connection_opened();
        record_connection_closed();
    }
}
