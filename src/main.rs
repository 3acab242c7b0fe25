use std::net::SocketAddr;
use std::process::ExitCode;

use tokio::net::TcpListener;
use tracing::{error, info};

use request_deadline::config::LogFormat;
use request_deadline::server::{self, ServeOptions};
use request_deadline::{AppState, Config, build_router, metrics, utils};

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::from(exitcode::OK as u8),
        Err(exit_code) => ExitCode::from(exit_code as u8),
    }
}

/// Run the application, returning an exit code on error.
async fn run() -> Result<(), exitcode::ExitCode> {
    // Load configuration before logging so LOG_FORMAT applies from the start
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            utils::init_tracing(LogFormat::Pretty, "info");
            error!("Configuration error: {e}");
            return Err(exitcode::CONFIG);
        }
    };
    utils::init_tracing(config.log_format, &config.log_level);

    info!(
        "Starting request_deadline v{}",
        env!("CARGO_PKG_VERSION")
    );
    info!(
        host = %config.host,
        port = %config.port,
        timeout_ms = config.request_timeout.as_millis() as u64,
        watcher = config.watcher_enabled,
        interim_flush = config.interim_flush,
        "Configuration loaded"
    );

    if let Some(metrics_addr) = config.metrics_addr() {
        metrics::try_init_metrics(metrics_addr);
    } else {
        info!("Metrics disabled (METRICS_PORT=0)");
    }

    let state = AppState::new(config.clone());
    let app = build_router(state.clone());

    let addr: SocketAddr = config.server_addr().parse().map_err(|e| {
        error!("Invalid server address: {e}");
        exitcode::CONFIG
    })?;
    let listener = TcpListener::bind(addr).await.map_err(|e| {
        error!("Failed to bind to {addr}: {e}");
        exitcode::UNAVAILABLE
    })?;

    info!("Server listening on http://{addr}");
    info!("Endpoints:");
    info!("  GET /?d=<duration>        - Slow query raced against the request deadline");
    info!("  GET /cancel?d=<duration>  - Detached work with an explicit cancel trigger");
    info!("  GET /health               - Health check");

    server::serve(
        listener,
        app,
        ServeOptions::from(&config),
        utils::shutdown_signal(),
    )
    .await
    .map_err(|e| {
        error!("Server error: {e}");
        exitcode::SOFTWARE
    })?;

    info!("HTTP server stopped, waiting for detached work...");
    state.shutdown().await;

    info!("Server shutdown complete");
    Ok(())
}
