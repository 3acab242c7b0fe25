//! Cancel trigger and scope guard for derived contexts.

use std::fmt;
use std::sync::Arc;

use super::{ContextError, Scope};

/// Explicit cancel trigger returned by [`Context::with_cancel`] and
/// [`Context::with_deadline`](super::Context::with_deadline).
///
/// Cloneable and safe to invoke from any number of tasks; only the first
/// call has an effect. Invoking it also releases the scope's deadline timer.
///
/// [`Context::with_cancel`]: super::Context::with_cancel
#[derive(Clone)]
pub struct CancelHandle {
    scope: Arc<Scope>,
}

impl CancelHandle {
    pub(super) fn new(scope: Arc<Scope>) -> Self {
        Self { scope }
    }

    /// Fire the scope's done-signal with [`ContextError::Canceled`].
    pub fn cancel(&self) {
        self.scope.finish(ContextError::Canceled);
    }

    /// Whether the scope has already fired, for whatever reason.
    pub fn is_cancelled(&self) -> bool {
        self.scope.token.is_cancelled()
    }

    /// Convert into a guard that cancels when dropped.
    ///
    /// Dropping happens on normal return, early return, and unwinding alike.
    pub fn guard(self) -> CancelGuard {
        CancelGuard { handle: self }
    }
}

impl fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelHandle")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Cancels its scope on drop.
#[must_use = "the scope is cancelled as soon as the guard is dropped"]
pub struct CancelGuard {
    handle: CancelHandle,
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        self.handle.cancel();
    }
}
