//! Shared application state for Axum handlers.
//!
//! Holds the runtime configuration and owns the lifetime of detached
//! background work: work started by a request but deliberately not bound to
//! that request's context (see `/cancel`).
//!
//! # Structured Concurrency
//!
//! Detached work is spawned on a `tokio_util::task::TaskTracker` and runs
//! under a context derived from the state's root context. `shutdown()`
//! cancels the root, which fires every detached context, then waits for the
//! tracked tasks to finish.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use tokio_util::task::TaskTracker;
use tracing::info;

use crate::config::Config;
use crate::context::{CancelHandle, Context};

/// Shared application state for Axum handlers.
///
/// Cloned for each request; all internal data is reference counted.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<Config>,
    /// Timestamp when the application started
    pub started_at: Instant,
    /// Parent of every detached context
    root: Context,
    root_cancel: CancelHandle,
    /// Tracks detached background work for graceful shutdown
    task_tracker: TaskTracker,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        let (root, root_cancel) = Context::background().with_cancel();

        Self {
            config: Arc::new(config),
            started_at: Instant::now(),
            root,
            root_cancel,
            task_tracker: TaskTracker::new(),
        }
    }

    /// A cancellable context that is not linked to any request.
    ///
    /// It only fires when its own handle is invoked or the application
    /// shuts down.
    pub fn detached_context(&self) -> (Context, CancelHandle) {
        self.root.with_cancel()
    }

    /// Spawn detached work that shutdown will wait for.
    pub fn spawn_detached<F>(&self, work: F) -> tokio::task::JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.task_tracker.spawn(work)
    }

    /// Number of detached tasks still running.
    pub fn detached_tasks(&self) -> usize {
        self.task_tracker.len()
    }

    /// Gracefully stop detached work.
    ///
    /// 1. Fires every detached context
    /// 2. Closes the task tracker (no new tasks are accepted for waiting)
    /// 3. Waits for all tasks to complete
    pub async fn shutdown(&self) {
        info!(
            running = self.task_tracker.len(),
            "Initiating graceful shutdown of detached work"
        );

        self.root_cancel.cancel();
        self.task_tracker.close();
        self.task_tracker.wait().await;

        info!("All detached work has completed");
    }

    /// Get the application uptime in seconds.
    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}
