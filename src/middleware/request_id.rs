//! Request ID middleware for log correlation.
//!
//! # Features
//!
//! - Generates UUIDv4 request IDs for incoming requests without one
//! - Propagates existing `X-Request-Id` headers
//! - Adds `X-Request-Id` to all responses, including watcher-written timeouts
//! - Logged with every "Request received" event through the request context
//!
//! The ID is written back into the request headers, where the enrichment
//! step binds it into the request context.
//!
//! ```bash
//! curl -H "X-Request-Id: my-correlation-id" "http://localhost:8085/?d=1s"
//! ```

use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::header::HeaderValue;
use axum::http::{Request, Response};
use tower::{Layer, Service};
use tracing::debug;
use uuid::Uuid;

/// Header name for request ID.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Request ID layer for Tower middleware stack.
#[derive(Clone, Default)]
pub struct RequestIdLayer;

impl RequestIdLayer {
    pub fn new() -> Self {
        Self
    }
}

impl<S> Layer<S> for RequestIdLayer {
    type Service = RequestIdService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RequestIdService { inner }
    }
}

/// Request ID service wrapper.
#[derive(Clone)]
pub struct RequestIdService<S> {
    inner: S,
}

impl<S> Service<Request<Body>> for RequestIdService<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response<Body>;
    type Error = S::Error;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<Body>) -> Self::Future {
        let header = request_id_header(&req);
        req.headers_mut().insert(REQUEST_ID_HEADER, header.clone());

        if let Ok(id) = header.to_str() {
            debug!(request_id = %id, "Processing request");
        }

        let mut inner = self.inner.clone();

        Box::pin(async move {
            let mut response = inner.call(req).await?;
            response.headers_mut().insert(REQUEST_ID_HEADER, header);
            Ok(response)
        })
    }
}

/// Reuse a valid incoming ID, otherwise mint a UUIDv4.
fn request_id_header<B>(req: &Request<B>) -> HeaderValue {
    if let Some(value) = req.headers().get(REQUEST_ID_HEADER)
        && value.to_str().is_ok_and(|id| !id.is_empty())
    {
        return value.clone();
    }

    // A hyphenated UUID is always a valid header value
    HeaderValue::from_str(&Uuid::new_v4().to_string())
        .unwrap_or_else(|_| HeaderValue::from_static("unknown"))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::convert::Infallible;
    use tower::ServiceExt;

    #[test]
    fn test_existing_request_id_kept() {
        let req = Request::builder()
            .header("x-request-id", "existing-id-123")
            .body(Body::empty())
            .unwrap();

        assert_eq!(request_id_header(&req), "existing-id-123");
    }

    #[test]
    fn test_generate_new_request_id() {
        let req = Request::builder().body(Body::empty()).unwrap();

        let id = request_id_header(&req);
        assert!(Uuid::parse_str(id.to_str().unwrap()).is_ok());
    }

    #[test]
    fn test_empty_request_id_replaced() {
        let req = Request::builder()
            .header("x-request-id", "")
            .body(Body::empty())
            .unwrap();

        let id = request_id_header(&req);
        assert!(Uuid::parse_str(id.to_str().unwrap()).is_ok());
    }

    #[tokio::test]
    async fn test_id_visible_to_inner_and_echoed() {
        let inner = tower::service_fn(|req: Request<Body>| async move {
            let seen = req.headers().get(REQUEST_ID_HEADER).cloned().unwrap();
            assert_eq!(seen, "abc");
            Ok::<_, Infallible>(Response::new(Body::empty()))
        });
        let service = RequestIdLayer::new().layer(inner);

        let req = Request::builder()
            .header(REQUEST_ID_HEADER, "abc")
            .body(Body::empty())
            .unwrap();
        let response = service.oneshot(req).await.unwrap();

        assert_eq!(response.headers().get(REQUEST_ID_HEADER).unwrap(), "abc");
    }
}
