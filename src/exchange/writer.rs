//! Shared response writer for handlers running behind the deadline wrapper.
//!
//! Handlers write a status, headers and body through a [`ResponseWriter`]
//! instead of returning a `Response`. Writes are buffered until
//! [`flush`](ResponseWriter::flush) or until the handler returns:
//!
//! ```text
//!   write_header ─► status (once)      flush ─► head sent to hyper
//!   write        ─► buffer                    └► buffered bytes streamed
//!   handler returns ─► remaining buffer sent, body closed
//! ```
//!
//! The deadline watcher shares the same writer. Once it seizes the response
//! (settling the [`CompletionFlag`] as expired while holding the writer lock)
//! every further handler-side call fails with [`WriteError::Seized`], so at
//! most one party ever produces the status line and body.

use std::convert::Infallible;
use std::sync::{Arc, Mutex, MutexGuard};

use axum::body::Body;
use axum::http::header::{CONTENT_TYPE, HeaderName, HeaderValue};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, warn};

use super::completion::CompletionFlag;
use crate::server::{ConnectionHandle, HijackError, HijackedConnection};

/// Fixed text sent to callers whose request ran out of time.
pub const ADVISORY_MESSAGE: &str = "Please back off. Cancelling operation\n";

/// Body sent when the watcher cannot take over the connection.
pub const HIJACK_UNSUPPORTED_MESSAGE: &str = "webserver doesn't support hijacking\n";

const TEXT_PLAIN_UTF8: &str = "text/plain; charset=utf-8";

/// Failure of a handler-side write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WriteError {
    #[error("response was seized by the deadline watcher")]
    Seized,

    #[error("status already written ({0})")]
    StatusAlreadyWritten(StatusCode),

    #[error("response head already sent")]
    HeadAlreadySent,

    #[error("connection was hijacked")]
    Hijacked,

    #[error("response body already closed")]
    Closed,
}

/// Who wrote the status line of a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusOrigin {
    Handler,
    Watcher,
}

/// Outcome of the watcher's attempt to seize a response.
#[derive(Debug)]
pub enum Seizure {
    /// The handler already completed; the watcher must stand down.
    Retired,
    /// The watcher answered 504 and holds the connection for closing.
    TimedOut(HijackedConnection),
    /// The watcher answered 500 because the connection cannot be taken over.
    Unsupported,
    /// The connection was already gone or taken.
    HijackFailed(HijackError),
}

/// Receives the response head once it is committed.
pub struct PendingResponse {
    rx: oneshot::Receiver<Response>,
}

impl PendingResponse {
    /// Wait for the head. `None` means every writer was dropped without
    /// producing a response.
    pub async fn recv(self) -> Option<Response> {
        self.rx.await.ok()
    }
}

/// Cloneable handle to the response of one request.
#[derive(Clone)]
pub struct ResponseWriter {
    shared: Arc<Shared>,
}

struct Shared {
    state: Mutex<WriterState>,
    completion: CompletionFlag,
    connection: Option<ConnectionHandle>,
}

struct WriterState {
    status: Option<StatusCode>,
    status_origin: Option<StatusOrigin>,
    headers: HeaderMap,
    buffer: BytesMut,
    /// Present until the head is committed.
    head: Option<oneshot::Sender<Response>>,
    /// Present between a streaming commit and the end of the body.
    body: Option<mpsc::UnboundedSender<Bytes>>,
    sealed: bool,
    hijacked: bool,
}

impl ResponseWriter {
    /// Create a writer bound to `completion`. `connection` enables
    /// [`hijack`](Self::hijack); without it takeover is unsupported.
    pub fn new(
        completion: CompletionFlag,
        connection: Option<ConnectionHandle>,
    ) -> (Self, PendingResponse) {
        let (tx, rx) = oneshot::channel();
        let writer = Self {
            shared: Arc::new(Shared {
                state: Mutex::new(WriterState {
                    status: None,
                    status_origin: None,
                    headers: HeaderMap::new(),
                    buffer: BytesMut::new(),
                    head: Some(tx),
                    body: None,
                    sealed: false,
                    hijacked: false,
                }),
                completion,
                connection,
            }),
        };
        (writer, PendingResponse { rx })
    }

    /// Set the status line. Only the first call takes effect.
    pub fn write_header(&self, status: StatusCode) -> Result<(), WriteError> {
        let mut state = self.handler_state()?;
        if let Some(existing) = state.status {
            warn!(%existing, attempted = %status, "Superfluous status write ignored");
            return Err(WriteError::StatusAlreadyWritten(existing));
        }
        state.set_status(status, StatusOrigin::Handler);
        Ok(())
    }

    /// Add a response header. Fails once the head has been sent.
    pub fn insert_header(&self, name: HeaderName, value: HeaderValue) -> Result<(), WriteError> {
        let mut state = self.handler_state()?;
        if state.is_committed() {
            return Err(WriteError::HeadAlreadySent);
        }
        state.headers.insert(name, value);
        Ok(())
    }

    /// Append to the body. Implies `200 OK` if no status was written yet.
    pub fn write(&self, data: impl AsRef<[u8]>) -> Result<usize, WriteError> {
        let mut state = self.handler_state()?;
        if state.sealed {
            return Err(WriteError::Closed);
        }
        if state.status.is_none() {
            state.set_status(StatusCode::OK, StatusOrigin::Handler);
        }
        let data = data.as_ref();
        state.buffer.extend_from_slice(data);
        Ok(data.len())
    }

    /// Send the head (if not yet sent) and every buffered byte.
    pub fn flush(&self) -> Result<(), WriteError> {
        let mut state = self.handler_state()?;
        if state.sealed {
            return Err(WriteError::Closed);
        }
        state.flush();
        Ok(())
    }

    /// Whether the status line has left the writer.
    pub fn is_committed(&self) -> bool {
        self.lock().is_committed()
    }

    /// Status written so far, if any.
    pub fn status(&self) -> Option<StatusCode> {
        self.lock().status
    }

    /// Which party wrote the status line.
    pub fn status_origin(&self) -> Option<StatusOrigin> {
        self.lock().status_origin
    }

    /// Whether connection takeover is available for this response.
    pub fn supports_hijack(&self) -> bool {
        self.shared.connection.is_some()
    }

    /// Take raw ownership of the underlying connection.
    ///
    /// After a successful hijack the writer refuses further writes.
    pub fn hijack(&self) -> Result<HijackedConnection, HijackError> {
        let connection = self
            .shared
            .connection
            .as_ref()
            .ok_or(HijackError::Unsupported)?;
        let mut state = self.lock();
        state.take_over(connection)
    }

    /// Finalize after the handler returned and the completion flag was won.
    ///
    /// A writer that was never touched forwards `fallback` (the handler's own
    /// `Response`) untouched. Otherwise the buffered response is sent and
    /// the body closed.
    pub(crate) fn finish(&self, fallback: Response) {
        let mut state = self.lock();
        if state.hijacked || state.sealed {
            return;
        }
        if state.is_untouched() {
            if let Some(head) = state.head.take()
                && head.send(fallback).is_err()
            {
                debug!("Client went away before the response was sent");
            }
            state.sealed = true;
            return;
        }
        state.close();
    }

    /// Watcher path: settle the request as expired and answer it.
    ///
    /// Runs entirely under the writer lock so no handler write can
    /// interleave with the check of the completion flag or the timeout
    /// response.
    pub(crate) fn seize_for_deadline(&self) -> Seizure {
        let mut state = self.lock();
        if !self.shared.completion.try_expire() {
            return Seizure::Retired;
        }

        let Some(connection) = self.shared.connection.as_ref() else {
            state.overwrite(
                StatusCode::INTERNAL_SERVER_ERROR,
                HIJACK_UNSUPPORTED_MESSAGE.as_bytes(),
            );
            state.close();
            return Seizure::Unsupported;
        };

        state.overwrite(StatusCode::GATEWAY_TIMEOUT, ADVISORY_MESSAGE.as_bytes());
        state.close();

        match state.take_over(connection) {
            Ok(hijacked) => Seizure::TimedOut(hijacked),
            Err(e) => Seizure::HijackFailed(e),
        }
    }

    fn lock(&self) -> MutexGuard<'_, WriterState> {
        // A poisoned lock only means a writer panicked mid-call; the state
        // itself is always left consistent.
        self.shared
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Lock for a handler-side call, rejecting it once the watcher owns the
    /// response or the connection is gone.
    fn handler_state(&self) -> Result<MutexGuard<'_, WriterState>, WriteError> {
        let state = self.lock();
        if self.shared.completion.is_expired() {
            return Err(WriteError::Seized);
        }
        if state.hijacked {
            return Err(WriteError::Hijacked);
        }
        Ok(state)
    }
}

impl std::fmt::Debug for ResponseWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("ResponseWriter")
            .field("status", &state.status)
            .field("committed", &state.is_committed())
            .field("buffered", &state.buffer.len())
            .field("completion", &self.shared.completion)
            .finish()
    }
}

impl WriterState {
    fn is_committed(&self) -> bool {
        self.head.is_none()
    }

    fn is_untouched(&self) -> bool {
        self.status.is_none() && self.headers.is_empty() && self.buffer.is_empty()
    }

    /// Hijack `connection` unless this writer already did.
    fn take_over(
        &mut self,
        connection: &ConnectionHandle,
    ) -> Result<HijackedConnection, HijackError> {
        if self.hijacked {
            return Err(HijackError::AlreadyHijacked);
        }
        let hijacked = connection.hijack()?;
        self.hijacked = true;
        Ok(hijacked)
    }

    fn set_status(&mut self, status: StatusCode, origin: StatusOrigin) {
        self.status = Some(status);
        self.status_origin = Some(origin);
    }

    /// Replace whatever the handler left unsent with a watcher response.
    /// Bytes already streamed cannot be recalled; the message is appended.
    fn overwrite(&mut self, status: StatusCode, body: &[u8]) {
        if self.is_committed() {
            debug!(sent = ?self.status, "Status already sent, appending timeout message only");
        } else {
            self.headers.clear();
            self.set_status(status, StatusOrigin::Watcher);
        }
        self.buffer.clear();
        self.buffer.extend_from_slice(body);
    }

    fn flush(&mut self) {
        self.commit_streaming();
        if self.buffer.is_empty() {
            return;
        }
        let chunk = self.buffer.split().freeze();
        if let Some(body) = &self.body
            && body.send(chunk).is_err()
        {
            debug!("Response body receiver dropped, discarding chunk");
        }
    }

    /// Flush and close the body stream.
    fn seal(&mut self) {
        self.flush();
        self.body = None;
        self.sealed = true;
    }

    /// Send whatever is left and end the response.
    fn close(&mut self) {
        if self.is_committed() {
            self.seal();
        } else {
            self.commit_full();
        }
    }

    /// Send the head with a streaming body; later chunks go through `body`.
    fn commit_streaming(&mut self) {
        let Some(head) = self.head.take() else {
            return;
        };
        let (tx, rx) = mpsc::unbounded_channel::<Bytes>();
        let stream = UnboundedReceiverStream::new(rx).map(Ok::<_, Infallible>);
        let mut response = Response::new(Body::from_stream(stream));
        self.fill_head(&mut response);
        self.body = Some(tx);
        if head.send(response).is_err() {
            debug!("Client went away before the response head was sent");
        }
    }

    /// Send the head together with the whole buffered body.
    fn commit_full(&mut self) {
        let Some(head) = self.head.take() else {
            return;
        };
        let mut response = Response::new(Body::from(self.buffer.split().freeze()));
        self.fill_head(&mut response);
        self.sealed = true;
        if head.send(response).is_err() {
            debug!("Client went away before the response was sent");
        }
    }

    fn fill_head(&mut self, response: &mut Response) {
        let status = *self.status.get_or_insert(StatusCode::OK);
        *response.status_mut() = status;
        *response.headers_mut() = std::mem::take(&mut self.headers);
        response
            .headers_mut()
            .entry(CONTENT_TYPE)
            .or_insert_with(|| HeaderValue::from_static(TEXT_PLAIN_UTF8));
    }
}
