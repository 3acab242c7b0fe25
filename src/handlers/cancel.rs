//! Detached work with an explicit cancel trigger.
//!
//! `GET /cancel?d=<duration>` starts the simulated work under a context that
//! is *not* derived from the request, so neither the request deadline nor
//! a client disconnect reaches it on its own. The handler forwards the
//! request's done-signal by hand: if the request finishes first it invokes
//! the detached context's cancel trigger, which stops the work.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use tracing::{Instrument, Span, debug, info, instrument, warn};

use super::util::{tolerate_seizure, write_timeout};
use crate::context::Context;
use crate::error::{AppError, AppResult};
use crate::exchange::ResponseWriter;
use crate::middleware::UNKNOWN_IP;
use crate::models::DurationQuery;
use crate::services::{parse_work_duration, simulate_work};
use crate::state::AppState;

/// Body line written when the detached work finished in time.
pub const DETACHED_COMPLETE_LINE: &str = "Detached work complete\n";

#[instrument(skip_all, fields(client_ip = ctx.client_ip().unwrap_or(UNKNOWN_IP)))]
pub async fn cancel_demo(
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

    let (detached, cancel) = state.detached_context();
    let work = state.spawn_detached(
        {
            let detached = detached.clone();
            async move {
                tokio::select! {
                    _ = simulate_work(duration) => true,
                    _ = detached.done() => {
                        debug!(cause = ?detached.err(), "Detached work cancelled");
                        false
                    }
                }
            }
        }
        .instrument(Span::current()),
    );

    let result = tokio::select! {
        finished = work => match finished {
            Ok(true) => write_complete(&ctx, &writer),
            Ok(false) => write_timeout(&writer),
            Err(e) => Err(AppError::Internal(format!("detached work failed: {e}"))),
        },
        _ = ctx.done() => {
            cancel.cancel();
            info!(cause = ?ctx.err(), "Request done first, detached work cancelled");
            write_timeout(&writer)
        }
    };

    tolerate_seizure(result)
}

fn write_complete(ctx: &Context, writer: &ResponseWriter) -> AppResult<()> {
    info!("Detached work complete");
    writer.write(DETACHED_COMPLETE_LINE)?;
    writer.write(format!(
        "Hello from request_deadline (IP: {})\n",
        ctx.client_ip().unwrap_or(UNKNOWN_IP)
    ))?;
    Ok(())
}
