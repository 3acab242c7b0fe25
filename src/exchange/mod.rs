//! Per-request exchange state shared by the deadline wrapper, the watcher
//! and the handler.
//!
//! The wrapper stores the request [`Context`] and its [`ResponseWriter`] in
//! the request extensions; handlers pick them up with the extractors below.

mod completion;
mod writer;

use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use crate::context::Context;
use crate::error::AppError;

pub use completion::{CompletionFlag, Settlement};
pub use writer::{
    ADVISORY_MESSAGE, HIJACK_UNSUPPORTED_MESSAGE, PendingResponse, ResponseWriter, Seizure,
    StatusOrigin, WriteError,
};

impl<S> FromRequestParts<S> for ResponseWriter
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts.extensions.get::<ResponseWriter>().cloned().ok_or_else(|| {
            AppError::Internal("response writer missing; is the deadline layer installed?".into())
        })
    }
}

impl<S> FromRequestParts<S> for Context
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts.extensions.get::<Context>().cloned().ok_or_else(|| {
            AppError::Internal("request context missing; is the deadline layer installed?".into())
        })
    }
}
