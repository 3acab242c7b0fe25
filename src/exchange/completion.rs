//! One-shot settlement between the deadline wrapper and the watcher.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

const PENDING: u8 = 0;
const COMPLETED: u8 = 1;
const EXPIRED: u8 = 2;

/// Terminal outcome recorded in a [`CompletionFlag`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    /// The downstream handler returned first; its response stands.
    Completed,
    /// The watcher seized the response after the deadline.
    Expired,
}

/// Shared "who owns the response" cell for one request.
///
/// Starts pending and settles exactly once, through a compare-and-swap,
/// to either [`Settlement::Completed`] (set by the deadline wrapper when the
/// handler returns) or [`Settlement::Expired`] (set by the watcher). The
/// loser of the race sees `false` and must not touch the response.
#[derive(Clone, Default)]
pub struct CompletionFlag {
    state: Arc<AtomicU8>,
}

impl CompletionFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that the handler finished. Returns `false` if the watcher
    /// already expired the request.
    pub fn mark_completed(&self) -> bool {
        self.settle(COMPLETED)
    }

    /// Record that the deadline won. Returns `false` if the handler already
    /// completed.
    pub fn try_expire(&self) -> bool {
        self.settle(EXPIRED)
    }

    /// Current settlement, `None` while pending.
    pub fn settlement(&self) -> Option<Settlement> {
        match self.state.load(Ordering::Acquire) {
            COMPLETED => Some(Settlement::Completed),
            EXPIRED => Some(Settlement::Expired),
            _ => None,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.settlement() == Some(Settlement::Completed)
    }

    pub fn is_expired(&self) -> bool {
        self.settlement() == Some(Settlement::Expired)
    }

    fn settle(&self, outcome: u8) -> bool {
        self.state
            .compare_exchange(PENDING, outcome, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

impl fmt::Debug for CompletionFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CompletionFlag")
            .field(&self.settlement())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::thread;

    #[test]
    fn test_starts_pending() {
        let flag = CompletionFlag::new();
        assert_eq!(flag.settlement(), None);
        assert!(!flag.is_completed());
        assert!(!flag.is_expired());
    }

    #[test]
    fn test_completed_blocks_expiry() {
        let flag = CompletionFlag::new();
        assert!(flag.mark_completed());
        assert!(!flag.try_expire());
        assert!(flag.is_completed());
    }

    #[test]
    fn test_expired_blocks_completion() {
        let flag = CompletionFlag::new();
        assert!(flag.try_expire());
        assert!(!flag.mark_completed());
        assert!(flag.is_expired());
    }

    #[test]
    fn test_settles_only_once() {
        let flag = CompletionFlag::new();
        assert!(flag.mark_completed());
        assert!(!flag.mark_completed());
    }

    #[test]
    fn test_simultaneous_settlement_has_one_winner() {
        for _ in 0..500 {
            let flag = CompletionFlag::new();
            let barrier = Arc::new(Barrier::new(2));

            let handler = {
                let flag = flag.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    flag.mark_completed()
                })
            };
            let watcher = {
                let flag = flag.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    flag.try_expire()
                })
            };

            let completed = handler.join().unwrap();
            let expired = watcher.join().unwrap();
            assert!(completed ^ expired, "exactly one side must win");
        }
    }
}
