//! Storage models.

use crate::error::Error;
use futures::io::AsyncRead;
use std::pin::Pin;

/// Streaming reader over an object's content.
///
/// Dropping it before the end of the stream is fine; backends release the
/// underlying connection or file handle on drop.
pub type BoxAsyncRead = Pin<Box<dyn AsyncRead + Send + 'static>>;

/// A key that a batch deletion could not remove, and why.
///
/// Partial failure of [`batch_delete()`](crate::StorageBackend::batch_delete)
/// is reported through a list of these rather than through the call's error,
/// so the caller decides what to do with the keys left behind.
#[derive(Debug)]
pub struct NotDeleted {
    pub path: String,
    pub cause: Error,
}
impl NotDeleted {
    pub fn new(path: impl Into<String>, cause: Error) -> Self {
        Self { path: path.into(), cause }
    }
}
