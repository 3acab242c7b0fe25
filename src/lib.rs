//! # request_deadline
//!
//! Request-scoped deadline and cancellation propagation for an Axum HTTP
//! server:
//!
//! - **Contexts**: hierarchical cancellation scopes carrying a deadline, an
//!   explicit cancel trigger and request-scoped values (client address,
//!   request ID)
//! - **Deadline wrapper**: a tower layer that gives every request a fixed
//!   deadline and hands handlers a shared response writer
//! - **Watcher**: answers requests whose handler overran the deadline with
//!   `504` and severs the connection
//! - **Server**: an accept loop that lets the watcher take over and abort
//!   individual connections
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │          Accept loop (per-connection context + handle)      │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Middleware (Request ID → Trace → Deadline)                 │
//! ├───────────────────────────────┬─────────────────────────────┤
//! │  Handlers (/, /cancel, /health) │  Watcher (504 + abort)    │
//! ├───────────────────────────────┴─────────────────────────────┤
//! │  Exchange (ResponseWriter, CompletionFlag) · Context tree   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use request_deadline::{AppState, Config, build_router, server, utils};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_env()?;
//!     let state = AppState::new(config.clone());
//!     let app = build_router(state.clone());
//!
//!     let listener = tokio::net::TcpListener::bind(config.server_addr()).await?;
//!     server::serve(listener, app, (&config).into(), utils::shutdown_signal()).await?;
//!     state.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Trying It
//!
//! ```bash
//! curl "http://localhost:8085/?d=1s"   # 200, greeting with client address
//! curl "http://localhost:8085/?d=5s"   # 504 after 3s, connection closed
//! curl "http://localhost:8085/?d=abc"  # 400
//! ```

pub mod config;
pub mod context;
pub mod error;
pub mod exchange;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod server;
pub mod services;
pub mod state;
pub mod utils;

// Re-exports for convenience
pub use config::Config;
pub use context::{CancelHandle, Context, ContextError, ContextKey, ContextValue};
pub use error::{AppError, AppResult};
pub use exchange::{CompletionFlag, ResponseWriter};
pub use routes::build_router;
pub use state::AppState;
