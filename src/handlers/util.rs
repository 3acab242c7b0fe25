//! Shared handler helpers.

use axum::http::StatusCode;
use tracing::debug;

use crate::error::{AppError, AppResult};
use crate::exchange::{ADVISORY_MESSAGE, ResponseWriter, WriteError};

/// Answer a request whose context finished before the work did.
///
/// The status is only written when nothing has been sent yet; after an
/// interim flush the advisory message is appended to the `200` body.
pub(crate) fn write_timeout(writer: &ResponseWriter) -> AppResult<()> {
    if !writer.is_committed() {
        writer.write_header(StatusCode::GATEWAY_TIMEOUT)?;
    }
    writer.write(ADVISORY_MESSAGE)?;
    Ok(())
}

/// A write rejected because the watcher already answered is expected
/// once the deadline has passed; it is not a handler failure.
pub(crate) fn tolerate_seizure(result: AppResult<()>) -> AppResult<()> {
    match result {
        Err(AppError::Write(WriteError::Seized | WriteError::Hijacked)) => {
            debug!("Response already answered by the deadline watcher");
            Ok(())
        }
        other => other,
    }
}
