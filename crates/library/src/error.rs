//! Library Error Types
//!
//! The service boundary deliberately exposes very little: callers learn that
//! something was not found, or that it failed internally. Internal failures
//! are logged where they are detected and surface as a fresh error with no
//! cause attached.

use derive_more::{Display, Error};
use std::fmt::{Debug, Display as FmtDisplay};

/// A library error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for library operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Display, Error, PartialEq, Eq)]
pub enum ErrorKind {
    #[display("not found")]
    NotFound,
    #[display("internal error")]
    Internal,
    /// The reconciler could not declare its stream or consumer.
    #[display("event channel setup failed")]
    Setup,
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Internal | Self::Setup)
    }
}

#[track_caller]
pub(crate) fn not_found() -> Error {
    exn::Exn::from(ErrorKind::NotFound)
}

/// Log `cause` against the failing operation and the key it concerned, then
/// hand back a bare [`ErrorKind::Internal`].
#[track_caller]
pub(crate) fn internal(operation: &'static str, key: &dyn FmtDisplay, cause: &dyn Debug) -> Error {
    tracing::error!(operation, key = %key, error = ?cause, "operation failed");
    exn::Exn::from(ErrorKind::Internal)
}
