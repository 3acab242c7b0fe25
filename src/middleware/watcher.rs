//! Hijack-and-abort watcher.
//!
//! One watcher runs per request while the handler works. It waits on the
//! request context's done-signal and then either stands down (the handler
//! already completed) or answers the request itself and severs the
//! connection so the client stops waiting on a handler that may never
//! return.
//!
//! ```text
//!   Armed ──done──► seize_for_deadline ─┬─ Retired      (handler won)
//!                                        ├─ TimedOut     504, close connection
//!                                        ├─ Unsupported  500, no takeover
//!                                        └─ HijackFailed connection already gone
//! ```

use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::context::{CancelHandle, Context};
use crate::exchange::{ResponseWriter, Seizure};
use crate::metrics::{self, Outcome};

/// Wait for `ctx` to finish, then settle the request if the handler has not.
///
/// `cancel` is the handle of the deadline scope; it is invoked last on every
/// path so the deadline timer never outlives the watcher.
pub async fn watch_deadline(
    ctx: Context,
    cancel: CancelHandle,
    writer: ResponseWriter,
    started: Instant,
) {
    ctx.done().await;

    match writer.seize_for_deadline() {
        Seizure::Retired => {
            debug!("Handler completed first, watcher retired");
        }
        Seizure::TimedOut(connection) => {
            warn!(
                cause = ?ctx.err(),
                client_ip = ctx.client_ip().unwrap_or_default(),
                request_id = ctx.request_id().unwrap_or_default(),
                status_origin = ?writer.status_origin(),
                "Gateway timeout, closing connection"
            );
            metrics::record_request_settled(Outcome::TimedOut, started.elapsed().as_secs_f64());
            if let Err(e) = connection.close() {
                // The connection is being discarded regardless
                debug!(error = %e, "Failed to close hijacked connection");
            }
        }
        Seizure::Unsupported => {
            error!(
                cause = ?ctx.err(),
                request_id = ctx.request_id().unwrap_or_default(),
                status_origin = ?writer.status_origin(),
                "Deadline passed but the connection cannot be taken over"
            );
            metrics::record_hijack_unsupported();
            metrics::record_request_settled(Outcome::TimedOut, started.elapsed().as_secs_f64());
        }
        Seizure::HijackFailed(e) => {
            debug!(error = %e, cause = ?ctx.err(), "Timeout response sealed but connection not taken");
            metrics::record_request_settled(Outcome::TimedOut, started.elapsed().as_secs_f64());
        }
    }

    cancel.cancel();
}
