//! Accept loop serving the router one connection per task.
//!
//! `axum::serve` hides the connection from the request pipeline. This loop
//! drives each connection with `hyper_util`'s auto (HTTP/1 + HTTP/2)
//! builder itself and attaches a [`ConnectionHandle`] plus
//! `ConnectInfo<SocketAddr>` to every request, which is what makes
//! connection takeover possible for the deadline watcher.
//!
//! ```text
//!  accept ─► ConnectionHandle ─► hyper conn ─► Router (DeadlineLayer ...)
//!                 │                   ▲
//!                 └─ abort ───────────┘ graceful_shutdown, then drop after grace
//! ```
//!
//! Connection tasks are tracked with a `TaskTracker`; on shutdown the loop
//! stops accepting, asks every connection to finish its in-flight request,
//! and waits up to the configured grace period.

mod connection;

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use axum::Router;
use axum::extract::ConnectInfo;
use axum::http::{Request, Version};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower::ServiceExt;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::config::Config;
use crate::metrics;

pub use connection::{ConnectionContext, ConnectionHandle, HijackError, HijackedConnection};

/// Back-off after a failed `accept` (e.g. file descriptor exhaustion).
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Timing knobs for connection teardown.
#[derive(Debug, Clone, Copy)]
pub struct ServeOptions {
    /// How long an aborted connection may take to drain its sealed response.
    pub abort_grace: Duration,
    /// How long shutdown waits for open connections.
    pub shutdown_grace: Duration,
}

impl From<&Config> for ServeOptions {
    fn from(config: &Config) -> Self {
        Self {
            abort_grace: config.abort_grace,
            shutdown_grace: config.shutdown_grace,
        }
    }
}

impl Default for ServeOptions {
    fn default() -> Self {
        Self {
            abort_grace: Duration::from_secs(1),
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

/// Serve `app` on `listener` until `shutdown` resolves.
///
/// # Errors
///
/// Only fails if the listener's local address cannot be read; accept
/// errors are logged and retried.
pub async fn serve<F>(
    listener: TcpListener,
    app: Router,
    options: ServeOptions,
    shutdown: F,
) -> io::Result<()>
where
    F: Future<Output = ()> + Send,
{
    let local = listener.local_addr()?;
    let tracker = TaskTracker::new();
    let stop = CancellationToken::new();
    tokio::pin!(shutdown);

    info!(addr = %local, "Accepting connections");

    loop {
        let (stream, remote) = tokio::select! {
            biased;

            _ = &mut shutdown => break,
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "Failed to accept connection");
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    continue;
                }
            },
        };

        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, %remote, "Failed to set TCP_NODELAY");
        }

        let span = info_span!("connection", %remote);
        tracker.spawn(
            serve_connection(stream, remote, app.clone(), options, stop.clone()).instrument(span),
        );
    }

    info!(open = tracker.len(), "Stopped accepting, draining connections");
    stop.cancel();
    tracker.close();

    if tokio::time::timeout(options.shutdown_grace, tracker.wait())
        .await
        .is_err()
    {
        warn!(
            open = tracker.len(),
            grace = ?options.shutdown_grace,
            "Shutdown grace elapsed with connections still open"
        );
    }

    Ok(())
}

async fn serve_connection(
    stream: TcpStream,
    remote: SocketAddr,
    app: Router,
    options: ServeOptions,
    stop: CancellationToken,
) {
    let handle = ConnectionHandle::new(remote);
    metrics::record_connection_opened();

    let service = {
        let handle = handle.clone();
        service_fn(move |mut request: Request<Incoming>| {
            attach_connection(&mut request, remote, &handle);
            app.clone().oneshot(request)
        })
    };

    let builder = auto::Builder::new(TokioExecutor::new());
    let connection = builder.serve_connection(TokioIo::new(stream), service);
    tokio::pin!(connection);

    tokio::select! {
        result = connection.as_mut() => {
            if let Err(e) = result {
                debug!(error = %e, "Connection ended with error");
            }
        }
        _ = handle.aborted() => {
            connection.as_mut().graceful_shutdown();
            match tokio::time::timeout(options.abort_grace, connection.as_mut()).await {
                Ok(_) => debug!("Hijacked connection drained and closed"),
                Err(_) => warn!(grace = ?options.abort_grace, "Hijacked connection did not drain, dropping socket"),
            }
            metrics::record_connection_aborted();
        }
        _ = stop.cancelled() => {
            connection.as_mut().graceful_shutdown();
            if let Err(e) = connection.as_mut().await {
                debug!(error = %e, "Connection ended with error during shutdown");
            }
        }
    }

    handle.mark_closed();
    metrics::record_connection_closed();
    debug!("Connection closed");
}

/// Insert the per-connection extensions into a request.
///
/// Every request gets the peer address and the connection context. Only
/// HTTP/1 requests get the [`ConnectionHandle`]: an HTTP/2 connection
/// multiplexes streams with their own deadlines, so severing it for one
/// late stream would kill the others. HTTP/2 timeouts take the
/// hijack-unsupported path instead.
fn attach_connection<B>(request: &mut Request<B>, remote: SocketAddr, handle: &ConnectionHandle) {
    let http1 = matches!(
        request.version(),
        Version::HTTP_09 | Version::HTTP_10 | Version::HTTP_11
    );
    let extensions = request.extensions_mut();
    extensions.insert(ConnectInfo(remote));
    extensions.insert(ConnectionContext(handle.context().clone()));
    if http1 {
        extensions.insert(handle.clone());
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn request(version: Version) -> Request<()> {
        Request::builder().version(version).body(()).unwrap()
    }

    #[test]
    fn test_http1_request_gets_connection_handle() {
        let remote: SocketAddr = "127.0.0.1:5555".parse().unwrap();
        let handle = ConnectionHandle::new(remote);
        let mut req = request(Version::HTTP_11);

        attach_connection(&mut req, remote, &handle);

        assert!(req.extensions().get::<ConnectionHandle>().is_some());
        assert!(req.extensions().get::<ConnectionContext>().is_some());
        assert_eq!(
            req.extensions().get::<ConnectInfo<SocketAddr>>().unwrap().0,
            remote
        );
    }

    #[test]
    fn test_http2_stream_cannot_take_over_connection() {
        let remote: SocketAddr = "127.0.0.1:5555".parse().unwrap();
        let handle = ConnectionHandle::new(remote);
        let mut req = request(Version::HTTP_2);

        attach_connection(&mut req, remote, &handle);

        assert!(req.extensions().get::<ConnectionHandle>().is_none());

        // Disconnects still reach the stream through the connection context
        let ConnectionContext(ctx) = req.extensions().get::<ConnectionContext>().cloned().unwrap();
        handle.mark_closed();
        assert!(ctx.is_done());
    }
}
