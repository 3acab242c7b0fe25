//! Per-request deadline wrapper.
//!
//! [`DeadlineLayer`] establishes the request deadline at the edge of the
//! router and hands the downstream service everything it needs to honour
//! it:
//!
//! ```text
//!  request ─► enrich (client ip, request id) ─► with_timeout ─┬─► handler task
//!                                                             │     └ mark_completed, finish, release
//!                                                             └─► watcher task (optional)
//!                                                                   └ seize on done, abort connection
//! ```
//!
//! The downstream service finds the deadline-bound [`Context`] and the
//! shared [`ResponseWriter`] in the request extensions (or via their
//! extractors). Whichever of handler and watcher settles the request's
//! [`CompletionFlag`] first owns the response; the other never writes.
//!
//! The handler runs in its own task so the watcher can answer the client
//! while a stuck handler is still running.
//!
//! [`Context`]: crate::context::Context

use std::convert::Infallible;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use futures_util::FutureExt;
use tokio::time::Instant;
use tower::{Layer, Service};
use tracing::{Instrument, Span, debug, error, info, warn};

use super::ip::enrich_request;
use super::watcher::watch_deadline;
use crate::config::Config;
use crate::context::ContextError;
use crate::exchange::{CompletionFlag, ResponseWriter};
use crate::metrics::{self, Outcome};
use crate::server::ConnectionHandle;

/// Deadline applied when none is configured.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(3);

/// Layer applying a fixed deadline to every request.
#[derive(Debug, Clone, Copy)]
pub struct DeadlineLayer {
    timeout: Duration,
    watcher: bool,
}

impl DeadlineLayer {
    /// Deadline of `timeout` with the hijack-and-abort watcher enabled.
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            watcher: true,
        }
    }

    /// Enable or disable the watcher. Without it, handlers are expected to
    /// observe the done-signal and answer the timeout themselves.
    pub fn with_watcher(mut self, enabled: bool) -> Self {
        self.watcher = enabled;
        self
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.request_timeout).with_watcher(config.watcher_enabled)
    }
}

impl Default for DeadlineLayer {
    fn default() -> Self {
        Self::new(DEFAULT_REQUEST_TIMEOUT)
    }
}

impl<S> Layer<S> for DeadlineLayer {
    type Service = DeadlineService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        DeadlineService {
            inner,
            timeout: self.timeout,
            watcher: self.watcher,
        }
    }
}

/// Deadline service wrapper.
#[derive(Clone)]
pub struct DeadlineService<S> {
    inner: S,
    timeout: Duration,
    watcher: bool,
}

impl<S> Service<Request<Body>> for DeadlineService<S>
where
    S: Service<Request<Body>, Response = Response, Error = Infallible> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = Response;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut TaskContext<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<Body>) -> Self::Future {
        // Take the service that was polled ready, leave a fresh clone behind
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let timeout = self.timeout;
        let watcher_enabled = self.watcher;

        Box::pin(async move {
            let started = Instant::now();
            let (ctx, cancel) = enrich_request(&req).with_timeout(timeout);
            let completion = CompletionFlag::new();
            let connection = req.extensions().get::<ConnectionHandle>().cloned();
            let (writer, pending) = ResponseWriter::new(completion.clone(), connection);

            info!(
                method = %req.method(),
                uri = %req.uri(),
                request_id = ctx.request_id().unwrap_or_default(),
                client_ip = ctx.client_ip().unwrap_or_default(),
                hijack = writer.supports_hijack(),
                "Request received"
            );

            req.extensions_mut().insert(ctx.clone());
            req.extensions_mut().insert(writer.clone());
            metrics::record_request_started();

            if watcher_enabled {
                tokio::spawn(
                    watch_deadline(ctx.clone(), cancel.clone(), writer.clone(), started)
                        .instrument(Span::current()),
                );
            }

            let release = cancel.guard();
            let handler = async move {
                let response = match AssertUnwindSafe(inner.call(req)).catch_unwind().await {
                    Ok(Ok(response)) => response,
                    Ok(Err(never)) => match never {},
                    Err(_) => {
                        error!("Handler panicked");
                        StatusCode::INTERNAL_SERVER_ERROR.into_response()
                    }
                };

                // Once the scope is done an armed watcher owns the outcome,
                // even if the handler returned in the meantime.
                if watcher_enabled && ctx.is_done() {
                    debug!(cause = ?ctx.err(), "Handler returned after the deadline, deferring to watcher");
                    drop(release);
                    return;
                }

                // Settle before releasing the deadline scope, otherwise the
                // watcher would wake on the release and expire the request.
                if completion.mark_completed() {
                    let outcome = match ctx.err() {
                        Some(ContextError::DeadlineExceeded) => Outcome::TimedOut,
                        _ => Outcome::Completed,
                    };
                    writer.finish(response);
                    let elapsed = started.elapsed();
                    info!(elapsed_ms = elapsed.as_millis() as u64, "Request complete");
                    metrics::record_request_settled(outcome, elapsed.as_secs_f64());
                } else {
                    warn!(
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Handler finished after the timeout response was sent"
                    );
                    metrics::record_request_abandoned();
                }

                drop(release);
            };
            tokio::spawn(handler.instrument(Span::current()));

            Ok(pending.recv().await.unwrap_or_else(|| {
                error!("Request produced no response");
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }))
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    use axum::Router;
    use axum::body::to_bytes;
    use axum::extract::ConnectInfo;
    use axum::routing::get;
    use tower::ServiceExt;

    use crate::context::Context;
    use crate::exchange::{ADVISORY_MESSAGE, HIJACK_UNSUPPORTED_MESSAGE};

    async fn body_text(response: Response) -> String {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn request(uri: &str) -> Request<Body> {
        let remote: SocketAddr = "127.0.0.1:5555".parse().unwrap();
        let mut req = Request::builder().uri(uri).body(Body::empty()).unwrap();
        req.extensions_mut().insert(ConnectInfo(remote));
        req
    }

    /// Ignores the done-signal, so only the watcher can answer in time.
    async fn stuck(writer: ResponseWriter) {
        tokio::time::sleep(Duration::from_secs(10)).await;
        let _ = writer.write("finished");
    }

    #[tokio::test]
    async fn test_plain_handler_response_forwarded() {
        let app = Router::new()
            .route("/", get(|| async { (StatusCode::CREATED, "made") }))
            .layer(DeadlineLayer::new(Duration::from_secs(1)));

        let response = app.oneshot(request("/")).await.unwrap();

        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(body_text(response).await, "made");
    }

    #[tokio::test]
    async fn test_handler_sees_enriched_deadline_context() {
        let app = Router::new()
            .route(
                "/",
                get(|ctx: Context, writer: ResponseWriter| async move {
                    assert!(ctx.deadline().is_some());
                    writer
                        .write(ctx.client_ip().unwrap_or_default().to_string())
                        .unwrap();
                }),
            )
            .layer(DeadlineLayer::new(Duration::from_secs(1)));

        let response = app.oneshot(request("/")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "127.0.0.1:5555");
    }

    #[tokio::test]
    async fn test_request_id_header_bound_into_context() {
        let app = Router::new()
            .route(
                "/",
                get(|ctx: Context, writer: ResponseWriter| async move {
                    assert!(!writer.supports_hijack());
                    writer.write(ctx.request_id().unwrap_or_default().to_string()).unwrap();
                }),
            )
            .layer(DeadlineLayer::new(Duration::from_secs(1)));

        let mut req = request("/");
        req.headers_mut()
            .insert("x-request-id", "corr-7".parse().unwrap());
        let response = app.oneshot(req).await.unwrap();

        assert_eq!(body_text(response).await, "corr-7");
    }

    #[tokio::test(start_paused = true)]
    async fn test_watcher_answers_when_handler_overruns() {
        let app = Router::new()
            .route("/", get(stuck))
            .layer(DeadlineLayer::new(Duration::from_millis(200)));

        let response = app.oneshot(request("/")).await.unwrap();

        // No connection handle under oneshot, so takeover is unsupported
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body_text(response).await, HIJACK_UNSUPPORTED_MESSAGE);
    }

    #[tokio::test(start_paused = true)]
    async fn test_watcher_answers_504_with_connection() {
        let remote: SocketAddr = "127.0.0.1:5555".parse().unwrap();
        let connection = ConnectionHandle::new(remote);
        let app = Router::new()
            .route("/", get(stuck))
            .layer(DeadlineLayer::new(Duration::from_millis(200)));

        let mut req = request("/");
        req.extensions_mut().insert(connection.clone());
        let response = app.oneshot(req).await.unwrap();

        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(body_text(response).await, ADVISORY_MESSAGE);
        tokio::time::timeout(Duration::from_secs(1), connection.aborted())
            .await
            .expect("connection should be aborted");
    }

    #[tokio::test(start_paused = true)]
    async fn test_without_watcher_handler_owns_timeout() {
        let app = Router::new()
            .route(
                "/",
                get(|ctx: Context, writer: ResponseWriter| async move {
                    ctx.done().await;
                    writer.write_header(StatusCode::GATEWAY_TIMEOUT).unwrap();
                    writer.write(ADVISORY_MESSAGE).unwrap();
                }),
            )
            .layer(DeadlineLayer::new(Duration::from_millis(200)).with_watcher(false));

        let response = app.oneshot(request("/")).await.unwrap();

        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(body_text(response).await, ADVISORY_MESSAGE);
    }

    #[tokio::test]
    async fn test_handler_panic_becomes_500() {
        let app = Router::new()
            .route(
                "/",
                get(|| async {
                    panic!("boom") as ()
                }),
            )
            .layer(DeadlineLayer::new(Duration::from_secs(1)));

        let response = app.oneshot(request("/")).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_unknown_route_passes_through() {
        let app = Router::new()
            .route("/", get(|| async { "root" }))
            .layer(DeadlineLayer::default());

        let response = app.oneshot(request("/missing")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
