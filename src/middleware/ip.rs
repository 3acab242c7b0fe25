//! Client address resolution and request-context enrichment.
//!
//! The first step of the deadline pipeline derives a request context from
//! the connection's context and binds the caller's address to it, so every
//! later stage can read it back without looking at headers again.
//!
//! # Address Priority
//!
//! 1. `X-Forwarded-For`: first entry of the comma-separated list, trimmed,
//!    if non-empty
//! 2. The transport remote address (`ConnectInfo<SocketAddr>`), rendered as
//!    `ip:port`
//! 3. [`UNKNOWN_IP`]
//!
//! # Security Warning: IP Spoofing Risk
//!
//! **`X-Forwarded-For` is client-controlled.** The resolved address is only
//! trustworthy when the service sits behind a reverse proxy that overwrites
//! the header:
//!
//! ```nginx
//! proxy_set_header X-Forwarded-For $remote_addr;
//! ```
//!
//! The address is used for greetings and log correlation here, never for
//! access decisions.

use std::borrow::Cow;
use std::net::SocketAddr;

use axum::extract::ConnectInfo;
use axum::http::Request;
use tracing::debug;

use super::request_id::REQUEST_ID_HEADER;
use crate::context::{Context, ContextValue};
use crate::server::ConnectionContext;

/// Header consulted before the transport address.
pub const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";

/// Fallback value when no client address can be determined.
pub const UNKNOWN_IP: &str = "unknown";

/// Where a resolved client address came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AddrSource<'a> {
    ForwardedFor(&'a str),
    Remote(SocketAddr),
    NotFound,
}

#[inline]
fn locate_client_addr<B>(req: &Request<B>) -> AddrSource<'_> {
    // Format: "client, proxy1, proxy2" - we want the first (client) entry
    if let Some(forwarded) = req.headers().get(FORWARDED_FOR_HEADER)
        && let Ok(value) = forwarded.to_str()
        && let Some(first) = value.split(',').next().map(str::trim)
        && !first.is_empty()
    {
        return AddrSource::ForwardedFor(first);
    }

    if let Some(ConnectInfo(remote)) = req.extensions().get::<ConnectInfo<SocketAddr>>() {
        return AddrSource::Remote(*remote);
    }

    AddrSource::NotFound
}

/// Resolve the caller's address for a request.
///
/// Returns `Cow::Borrowed` only for the [`UNKNOWN_IP`] fallback.
pub fn resolve_client_addr<B>(req: &Request<B>) -> Cow<'static, str> {
    match locate_client_addr(req) {
        AddrSource::ForwardedFor(addr) => {
            debug!(client_ip = %addr, "Client address taken from X-Forwarded-For");
            Cow::Owned(addr.to_string())
        }
        AddrSource::Remote(remote) => Cow::Owned(remote.to_string()),
        AddrSource::NotFound => {
            debug!("No forwarded header and no transport address on request");
            Cow::Borrowed(UNKNOWN_IP)
        }
    }
}

/// Derive the enriched context for a request.
///
/// The base is the connection's context when the request arrived through
/// [`crate::server::serve`] (so a client disconnect cancels it), else the
/// background context. The result binds the client address and, when the
/// request carries one, the request ID.
pub fn enrich_request<B>(req: &Request<B>) -> Context {
    let base = req
        .extensions()
        .get::<ConnectionContext>()
        .map_or_else(Context::background, |ConnectionContext(ctx)| ctx.clone());

    let mut ctx = base.with_value(ContextValue::ClientIp(
        resolve_client_addr(req).into_owned(),
    ));

    if let Some(id) = req
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|id| !id.is_empty())
    {
        ctx = ctx.with_value(ContextValue::RequestId(id.to_string()));
    }

    ctx
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::server::ConnectionHandle;
    use axum::body::Body;

    fn remote() -> SocketAddr {
        "127.0.0.1:5555".parse().unwrap()
    }

    fn request(forwarded: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder();
        if let Some(value) = forwarded {
            builder = builder.header(FORWARDED_FOR_HEADER, value);
        }
        let mut req = builder.body(Body::empty()).unwrap();
        req.extensions_mut().insert(ConnectInfo(remote()));
        req
    }

    #[test]
    fn test_forwarded_for_overrides_remote() {
        let ctx = enrich_request(&request(Some("9.9.9.9")));
        assert_eq!(ctx.client_ip(), Some("9.9.9.9"));
    }

    #[test]
    fn test_remote_used_without_header() {
        let ctx = enrich_request(&request(None));
        assert_eq!(ctx.client_ip(), Some("127.0.0.1:5555"));
    }

    #[test]
    fn test_forwarded_for_first_entry_trimmed() {
        let req = request(Some("  203.0.113.50 , 70.41.3.18, 150.172.238.178"));
        assert_eq!(resolve_client_addr(&req), "203.0.113.50");
    }

    #[test]
    fn test_blank_forwarded_for_falls_back_to_remote() {
        assert_eq!(resolve_client_addr(&request(Some(""))), "127.0.0.1:5555");
        assert_eq!(resolve_client_addr(&request(Some("   "))), "127.0.0.1:5555");
        assert_eq!(resolve_client_addr(&request(Some(", 10.0.0.1"))), "127.0.0.1:5555");
    }

    #[test]
    fn test_forwarded_for_ipv6() {
        let req = request(Some("2001:db8::1, 10.0.0.1"));
        assert_eq!(resolve_client_addr(&req), "2001:db8::1");
    }

    #[test]
    fn test_unknown_without_any_source() {
        let req = Request::builder().body(Body::empty()).unwrap();

        let addr = resolve_client_addr(&req);
        assert_eq!(addr, UNKNOWN_IP);
        assert!(matches!(addr, Cow::Borrowed(_)));
    }

    #[test]
    fn test_request_id_bound_when_present() {
        let mut req = request(None);
        req.headers_mut()
            .insert(REQUEST_ID_HEADER, "corr-42".parse().unwrap());

        let ctx = enrich_request(&req);
        assert_eq!(ctx.request_id(), Some("corr-42"));
        assert_eq!(ctx.client_ip(), Some("127.0.0.1:5555"));
    }

    #[tokio::test]
    async fn test_context_derived_from_connection() {
        let handle = ConnectionHandle::new(remote());
        let mut req = request(None);
        req.extensions_mut()
            .insert(ConnectionContext(handle.context().clone()));

        let ctx = enrich_request(&req);
        assert!(!ctx.is_done());

        handle.mark_closed();
        assert!(ctx.is_done());
    }
}
