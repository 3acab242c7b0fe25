//! Slow-query simulation endpoint.
//!
//! `GET /?d=<duration>` pretends to run a query for `d` and races it
//! against the request context's done-signal:
//!
//! - work first: `Slow query complete... ` followed by a greeting that
//!   carries the client address bound by the enrichment step
//! - deadline (or client disconnect) first: `504` with the advisory message
//!   and no greeting
//!
//! With `INTERIM_FLUSH=true` a `Sloow query here` line is flushed before the
//! work starts. That commits a `200` status, so a later timeout can only
//! append the advisory message.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use tracing::{debug, info, instrument, warn};

use super::util::{tolerate_seizure, write_timeout};
use crate::context::Context;
use crate::error::AppResult;
use crate::exchange::ResponseWriter;
use crate::middleware::UNKNOWN_IP;
use crate::models::DurationQuery;
use crate::services::{parse_work_duration, simulate_work};
use crate::state::AppState;

/// Line flushed before the work starts when interim flushing is enabled.
pub const INTERIM_LINE: &str = "Sloow query here\n";

/// Line written when the work finished in time.
pub const COMPLETE_LINE: &str = "Slow query complete... \n";

#[instrument(skip_all, fields(client_ip = ctx.client_ip().unwrap_or(UNKNOWN_IP)))]
pub async fn slow_query(
    State(state): State<AppState>,
    ctx: Context,
    writer: ResponseWriter,
    Query(query): Query<DurationQuery>,
) -> AppResult<()> {
    let duration = match parse_work_duration(query.d.as_deref()) {
        Ok(duration) => duration,
        Err(message) => {
            warn!(d = query.d.as_deref().unwrap_or_default(), "Bad request");
            writer.write_header(StatusCode::BAD_REQUEST)?;
            writer.write(format!("{message}\n"))?;
            return Ok(());
        }
    };
    info!(
        duration = %humantime::format_duration(duration),
        remaining_ms = ctx.remaining().map(|left| left.as_millis() as u64),
        "Query received"
    );
    if ctx.remaining().is_some_and(|left| left < duration) {
        debug!("Query will outlast the request deadline");
    }

    tolerate_seizure(run_query(&state, &ctx, &writer, duration).await)
}

async fn run_query(
    state: &AppState,
    ctx: &Context,
    writer: &ResponseWriter,
    duration: std::time::Duration,
) -> AppResult<()> {
    if state.config.interim_flush {
        writer.write(INTERIM_LINE)?;
        writer.flush()?;
    }

    tokio::select! {
        _ = simulate_work(duration) => {
            writer.write(COMPLETE_LINE)?;
        }
        _ = ctx.done() => {
            write_timeout(writer)?;
            info!(cause = ?ctx.err(), "Gateway timeout");
            return Ok(());
        }
    }

    writer.write(format!(
        "Hello from request_deadline (IP: {})\n",
        ctx.client_ip().unwrap_or(UNKNOWN_IP)
    ))?;
    debug!("Query complete");
    Ok(())
}
