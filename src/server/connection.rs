//! Per-connection handle used for takeover ("hijack") and abort.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use crate::context::{CancelHandle, Context};

/// Failure to take over or close a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HijackError {
    #[error("webserver doesn't support hijacking")]
    Unsupported,

    #[error("connection already hijacked")]
    AlreadyHijacked,

    #[error("connection from {0} already closed")]
    AlreadyClosed(SocketAddr),
}

/// Context that lives exactly as long as the connection a request arrived
/// on. Attached to every request, HTTP/2 streams included.
#[derive(Debug, Clone)]
pub struct ConnectionContext(pub Context);

/// Attached by the accept loop to HTTP/1 requests, where one connection
/// carries one request at a time and can be taken over.
///
/// Owns the connection-scoped [`Context`], which is cancelled once the
/// connection ends, so request contexts derived from it observe client
/// disconnects.
#[derive(Clone)]
pub struct ConnectionHandle {
    inner: Arc<Inner>,
}

struct Inner {
    remote: SocketAddr,
    context: Context,
    release: CancelHandle,
    /// Fired by [`HijackedConnection::close`]; the connection task severs the socket.
    abort: CancellationToken,
    /// Fired by the connection task when it exits.
    closed: CancellationToken,
    hijacked: AtomicBool,
}

impl ConnectionHandle {
    pub fn new(remote: SocketAddr) -> Self {
        let (context, release) = Context::background().with_cancel();
        Self {
            inner: Arc::new(Inner {
                remote,
                context,
                release,
                abort: CancellationToken::new(),
                closed: CancellationToken::new(),
                hijacked: AtomicBool::new(false),
            }),
        }
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.inner.remote
    }

    /// Context that lives exactly as long as the connection.
    pub fn context(&self) -> &Context {
        &self.inner.context
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    /// Take exclusive ownership of the connection. Succeeds once.
    pub fn hijack(&self) -> Result<HijackedConnection, HijackError> {
        if self.is_closed() {
            return Err(HijackError::AlreadyClosed(self.inner.remote));
        }
        if self.inner.hijacked.swap(true, Ordering::AcqRel) {
            return Err(HijackError::AlreadyHijacked);
        }
        Ok(HijackedConnection {
            handle: self.clone(),
        })
    }

    /// Resolves when a hijacker asked for the connection to be closed.
    pub(crate) fn aborted(&self) -> WaitForCancellationFuture<'_> {
        self.inner.abort.cancelled()
    }

    /// Called by the connection task on exit.
    pub(crate) fn mark_closed(&self) {
        self.inner.closed.cancel();
        self.inner.release.cancel();
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("remote", &self.inner.remote)
            .field("closed", &self.is_closed())
            .field("hijacked", &self.inner.hijacked.load(Ordering::Acquire))
            .finish()
    }
}

/// Raw ownership of a connection, taken away from the response pipeline.
#[derive(Debug)]
pub struct HijackedConnection {
    handle: ConnectionHandle,
}

impl HijackedConnection {
    pub fn remote_addr(&self) -> SocketAddr {
        self.handle.remote_addr()
    }

    /// Sever the connection. Whatever response is already sealed is
    /// drained within the server's abort grace, then the socket is dropped.
    pub fn close(self) -> Result<(), HijackError> {
        if self.handle.is_closed() {
            return Err(HijackError::AlreadyClosed(self.handle.remote_addr()));
        }
        self.handle.inner.abort.cancel();
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:5555".parse().unwrap()
    }

    #[tokio::test]
    async fn test_hijack_succeeds_once() {
        let handle = ConnectionHandle::new(addr());
        let hijacked = handle.hijack().unwrap();
        assert_eq!(hijacked.remote_addr(), addr());
        assert_eq!(handle.hijack().unwrap_err(), HijackError::AlreadyHijacked);
    }

    #[tokio::test]
    async fn test_close_fires_abort() {
        let handle = ConnectionHandle::new(addr());
        handle.hijack().unwrap().close().unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(1), handle.aborted())
            .await
            .expect("abort should fire");
    }

    #[tokio::test]
    async fn test_close_after_connection_ended_fails() {
        let handle = ConnectionHandle::new(addr());
        let hijacked = handle.hijack().unwrap();
        handle.mark_closed();

        assert_eq!(
            hijacked.close().unwrap_err(),
            HijackError::AlreadyClosed(addr())
        );
    }

    #[tokio::test]
    async fn test_hijack_after_close_fails() {
        let handle = ConnectionHandle::new(addr());
        handle.mark_closed();
        assert!(matches!(
            handle.hijack(),
            Err(HijackError::AlreadyClosed(_))
        ));
    }

    #[tokio::test]
    async fn test_connection_context_ends_with_connection() {
        let handle = ConnectionHandle::new(addr());
        let request_ctx = handle.context().clone();
        assert!(!request_ctx.is_done());

        handle.mark_closed();
        assert!(request_ctx.is_done());
    }
}
