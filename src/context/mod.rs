//! Hierarchical, request-scoped cancellation contexts.
//!
//! A [`Context`] carries an optional deadline, an explicit cancel trigger,
//! a single typed value binding, and a one-shot done-signal. Contexts form
//! a tree: every derivation returns a child that holds its parent, and a
//! child's done-signal fires when
//!
//! - its own deadline elapses,
//! - its own [`CancelHandle`] is invoked, or
//! - any ancestor's done-signal fires,
//!
//! whichever happens first. Firing never resets.
//!
//! # Architecture
//!
//! ```text
//!   background ──► connection (cancel) ──► client-ip (value) ──► deadline (3s)
//!        │                 │                      │                    │
//!     token T0  ──child──► T1  ───── shared ────► T1  ────child──────► T2
//! ```
//!
//! Value scopes share their parent's [`CancellationToken`]; cancel and
//! deadline scopes own a child token, so propagation from parent to child
//! is handled by `tokio_util`'s token tree.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use request_deadline::context::{Context, ContextValue};
//!
//! # async fn demo() {
//! let base = Context::background().with_value(ContextValue::ClientIp("10.0.0.1".into()));
//! let (ctx, cancel) = base.with_timeout(Duration::from_secs(3));
//! let _release = cancel.guard();
//!
//! tokio::select! {
//!     _ = tokio::time::sleep(Duration::from_secs(1)) => {}
//!     _ = ctx.done() => return,
//! }
//! assert_eq!(ctx.client_ip(), Some("10.0.0.1"));
//! # }
//! ```

mod cancel;

use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture, WaitForCancellationFutureOwned};
use tracing::trace;

pub use cancel::{CancelGuard, CancelHandle};

/// Why a context's done-signal fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ContextError {
    /// The cancel trigger of this context (or an ancestor) was invoked.
    #[error("context canceled")]
    Canceled,

    /// The deadline of this context (or an ancestor) elapsed.
    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

/// Well-known keys for request-scoped values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContextKey {
    /// Resolved client address (`X-Forwarded-For` or transport peer).
    ClientIp,
    /// Correlation ID from `X-Request-Id`.
    RequestId,
}

impl ContextKey {
    /// Stable name used in logs.
    pub const fn as_str(self) -> &'static str {
        match self {
            ContextKey::ClientIp => "client-ip",
            ContextKey::RequestId => "request-id",
        }
    }
}

impl fmt::Display for ContextKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed value bound to a context. The variant determines the key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContextValue {
    ClientIp(String),
    RequestId(String),
}

impl ContextValue {
    /// The key this value is stored under.
    pub const fn key(&self) -> ContextKey {
        match self {
            ContextValue::ClientIp(_) => ContextKey::ClientIp,
            ContextValue::RequestId(_) => ContextKey::RequestId,
        }
    }

    /// Borrow the value as a string slice.
    pub fn as_str(&self) -> &str {
        match self {
            ContextValue::ClientIp(v) | ContextValue::RequestId(v) => v,
        }
    }
}

/// One node of the context tree.
struct Scope {
    parent: Option<Context>,
    /// Fires when this scope is done. Shared with the parent for value scopes.
    token: CancellationToken,
    /// Set only on scopes that own a deadline tighter than their parent's.
    deadline: Option<Instant>,
    binding: Option<ContextValue>,
    /// First cause recorded by this scope's own trigger or timer.
    cause: OnceLock<ContextError>,
}

impl Scope {
    /// Record `cause` and fire the token. No-op once the token has fired,
    /// so a scope already cancelled through its parent keeps the parent's cause.
    fn finish(&self, cause: ContextError) {
        if self.token.is_cancelled() {
            return;
        }
        let _ = self.cause.set(cause);
        self.token.cancel();
    }
}

/// Request-scoped cancellation context.
///
/// Cheap to clone; clones observe the same done-signal.
#[derive(Clone)]
pub struct Context {
    scope: Arc<Scope>,
}

impl Context {
    /// The root context: never fires, has no deadline and no values.
    pub fn background() -> Self {
        Self {
            scope: Arc::new(Scope {
                parent: None,
                token: CancellationToken::new(),
                deadline: None,
                binding: None,
                cause: OnceLock::new(),
            }),
        }
    }

    /// Derive a child that additionally binds `value`.
    ///
    /// The child shares this context's done-signal and deadline. A binding
    /// for a key already present further up shadows it for the child and its
    /// descendants only.
    pub fn with_value(&self, value: ContextValue) -> Context {
        Context {
            scope: Arc::new(Scope {
                parent: Some(self.clone()),
                token: self.scope.token.clone(),
                deadline: None,
                binding: Some(value),
                cause: OnceLock::new(),
            }),
        }
    }

    /// Derive a child with its own cancel trigger.
    pub fn with_cancel(&self) -> (Context, CancelHandle) {
        let scope = Arc::new(Scope {
            parent: Some(self.clone()),
            token: self.scope.token.child_token(),
            deadline: None,
            binding: None,
            cause: OnceLock::new(),
        });
        (
            Context {
                scope: Arc::clone(&scope),
            },
            CancelHandle::new(scope),
        )
    }

    /// Derive a child whose done-signal fires at `min(parent, deadline)` or
    /// when the returned handle is invoked.
    ///
    /// The handle must be invoked (directly or through [`CancelHandle::guard`])
    /// once the scope is no longer needed, so the deadline timer is released
    /// immediately instead of at expiry.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn with_deadline(&self, deadline: Instant) -> (Context, CancelHandle) {
        if self.deadline().is_some_and(|current| current <= deadline) {
            // The parent fires first anyway; no timer of our own.
            return self.with_cancel();
        }

        let scope = Arc::new(Scope {
            parent: Some(self.clone()),
            token: self.scope.token.child_token(),
            deadline: Some(deadline),
            binding: None,
            cause: OnceLock::new(),
        });

        if deadline <= Instant::now() {
            scope.finish(ContextError::DeadlineExceeded);
        } else if !scope.token.is_cancelled() {
            let timer = Arc::clone(&scope);
            tokio::spawn(async move {
                tokio::select! {
                    biased;

                    _ = timer.token.cancelled() => {
                        trace!("Deadline timer released");
                    }
                    _ = tokio::time::sleep_until(deadline) => {
                        trace!("Deadline elapsed");
                        timer.finish(ContextError::DeadlineExceeded);
                    }
                }
            });
        }

        (
            Context {
                scope: Arc::clone(&scope),
            },
            CancelHandle::new(scope),
        )
    }

    /// Shorthand for `with_deadline(Instant::now() + timeout)`.
    pub fn with_timeout(&self, timeout: Duration) -> (Context, CancelHandle) {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Future that resolves once the done-signal has fired.
    pub fn done(&self) -> WaitForCancellationFuture<'_> {
        self.scope.token.cancelled()
    }

    /// Owned variant of [`Context::done`] for spawned tasks.
    pub fn done_owned(&self) -> WaitForCancellationFutureOwned {
        self.scope.token.clone().cancelled_owned()
    }

    /// Whether the done-signal has fired.
    pub fn is_done(&self) -> bool {
        self.scope.token.is_cancelled()
    }

    /// Why the context is done, or `None` while it is still live.
    pub fn err(&self) -> Option<ContextError> {
        if !self.is_done() {
            return None;
        }
        let mut scope: &Scope = &self.scope;
        loop {
            if let Some(cause) = scope.cause.get() {
                return Some(*cause);
            }
            match &scope.parent {
                Some(parent) => scope = &parent.scope,
                None => return Some(ContextError::Canceled),
            }
        }
    }

    /// Effective deadline: the tightest one on the path to the root.
    pub fn deadline(&self) -> Option<Instant> {
        let mut scope: &Scope = &self.scope;
        loop {
            if let Some(deadline) = scope.deadline {
                return Some(deadline);
            }
            match &scope.parent {
                Some(parent) => scope = &parent.scope,
                None => return None,
            }
        }
    }

    /// Time left until the deadline, saturating at zero.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline()
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Nearest binding for `key`, climbing towards the root.
    pub fn value(&self, key: ContextKey) -> Option<&ContextValue> {
        let mut scope: &Scope = &self.scope;
        loop {
            if let Some(binding) = &scope.binding
                && binding.key() == key
            {
                return Some(binding);
            }
            match &scope.parent {
                Some(parent) => scope = &parent.scope,
                None => return None,
            }
        }
    }

    /// Resolved client address, if the enrichment step ran.
    pub fn client_ip(&self) -> Option<&str> {
        self.value(ContextKey::ClientIp).map(ContextValue::as_str)
    }

    /// Request correlation ID, if one was bound.
    pub fn request_id(&self) -> Option<&str> {
        self.value(ContextKey::RequestId).map(ContextValue::as_str)
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("deadline", &self.deadline())
            .field("done", &self.is_done())
            .field("err", &self.err())
            .field("client_ip", &self.client_ip())
            .finish_non_exhaustive()
    }
}
