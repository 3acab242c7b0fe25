//! HTTP middleware establishing the per-request deadline.
//!
//! - **Request ID**: propagates or generates `X-Request-Id`
//! - **Enrichment**: binds the client address (and request ID) into the
//!   request context
//! - **Deadline**: derives the deadline-bound context, runs the handler in
//!   its own task and, optionally, the hijack-and-abort watcher
//!
//! # Architecture
//!
//! ```text
//! Request → Request ID → Trace → Deadline ─┬─ enrich → with_timeout → Handler
//!               ↓                          └─ Watcher → 504 + close connection
//!         X-Request-Id header
//! ```

pub mod deadline;
pub mod ip;
pub mod request_id;
pub mod watcher;

pub use deadline::{DEFAULT_REQUEST_TIMEOUT, DeadlineLayer, DeadlineService};
pub use ip::{FORWARDED_FOR_HEADER, UNKNOWN_IP, enrich_request, resolve_client_addr};
pub use request_id::{REQUEST_ID_HEADER, RequestIdLayer};
pub use watcher::watch_deadline;
