//! Application routing configuration with middleware stack.
//!
//! # Middleware Stack (outermost first)
//!
//! ```text
//! Request
//!    │
//!    ▼
//! ┌──────────────────┐
//! │   Request ID     │ ← Adds X-Request-Id header
//! └────────┬─────────┘
//!          │
//!          ▼
//! ┌──────────────────┐
//! │     Tracing      │ ← HTTP request/response logging
//! └────────┬─────────┘
//!          │
//!          ▼
//! ┌──────────────────┐
//! │     Deadline     │ ← Enriched context, REQUEST_TIMEOUT_MS, watcher
//! └────────┬─────────┘
//!          │
//!          ▼
//!      Handler
//! ```
//!
//! # Routes
//!
//! - `/?d=<duration>` - Slow-query simulation raced against the deadline
//! - `/cancel?d=<duration>` - Detached work cancelled through an explicit trigger
//! - `/health` - Health check

use axum::Router;
use axum::routing::get;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::handlers;
use crate::middleware::{DeadlineLayer, RequestIdLayer};
use crate::state::AppState;

/// Build the application router with all routes and middleware configured.
pub fn build_router(state: AppState) -> Router {
    let config = &state.config;

    info!(
        timeout_ms = config.request_timeout.as_millis() as u64,
        watcher = config.watcher_enabled,
        interim_flush = config.interim_flush,
        "Request deadline configured"
    );

    Router::new()
        .route("/", get(handlers::slow_query))
        .route("/cancel", get(handlers::cancel_demo))
        .route("/health", get(handlers::health_check))
        // Applied bottom to top: the deadline layer sits closest to handlers
        .layer(DeadlineLayer::from_config(config))
        .layer(TraceLayer::new_for_http())
        .layer(RequestIdLayer::new())
        .with_state(state)
}
