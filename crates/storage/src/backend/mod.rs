//! Storage backend trait and implementations.
//!
//! This module defines the `StorageBackend` trait, which provides a unified
//! interface for object operations across different backends (local filesystem,
//! S3-compatible services, etc.).

mod local;
#[cfg(feature = "mock")]
mod mock;
#[cfg(feature = "s3")]
mod s3;

pub use self::local::LocalBackend;
#[cfg(feature = "mock")]
pub use self::mock::MockBackend;
#[cfg(feature = "s3")]
pub use self::s3::S3Backend;
use crate::error::{ErrorKind, Result};
use crate::models::{BoxAsyncRead, NotDeleted};
use async_trait::async_trait;
use futures::io::AsyncRead;

/// Content handed to [`StorageBackend::upload()`].
///
/// Borrowed rather than owned so the caller keeps hold of any adapter it
/// wrapped around the stream (a hashing tee, a byte counter) and can inspect
/// it once the upload finishes.
pub type UploadReader<'a> = dyn AsyncRead + Send + Unpin + 'a;

/// Unified interface for object storage backends.
///
/// All keys are relative to the backend's root (bucket + prefix, or root
/// directory) and are validated with [`validate_path`](crate::validate_path)
/// before use. Implementations must enforce this validation.
///
/// # Examples
///
/// ```
/// use futures::io::{AsyncReadExt, Cursor};
/// use shelf_storage::{StorageBackend, error::Result};
///
/// async fn replace_and_read(backend: &dyn StorageBackend) -> Result<Vec<u8>> {
///     let mut content = Cursor::new(b"helloworld".to_vec());
///     backend.upload("owner/book", Some(10), &mut content).await?;
///     let mut data = Vec::new();
///     let mut reader = backend.get("owner/book").await?;
///     reader.read_to_end(&mut data).await.map_err(shelf_storage::error::ErrorKind::Io)?;
///     Ok(data)
/// }
/// ```
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Name of the configured backend. Used for logging only.
    fn name(&self) -> &str;

    /// Check if an object exists.
    async fn exists(&self, path: &str) -> Result<bool>;

    /// Stream content into an object, returning the number of bytes written.
    ///
    /// An existing object at the same key is overwritten.
    ///
    /// `size_hint` is advisory: when given, the number of bytes actually
    /// streamed must equal it or the upload fails with
    /// [`SizeMismatch`](crate::error::ErrorKind::SizeMismatch) and nothing is
    /// left at the key.
    async fn upload(&self, path: &str, size_hint: Option<u64>, content: &mut UploadReader<'_>) -> Result<u64>;

    /// Open an object for streaming reads.
    ///
    /// Returns [`NotFound`](crate::error::ErrorKind::NotFound) if the object
    /// does not exist.
    async fn get(&self, path: &str) -> Result<BoxAsyncRead>;

    /// Delete an object.
    ///
    /// Idempotent: deleting a key that never existed succeeds unless the
    /// backend positively reports the key as missing, in which case
    /// [`NotFound`](crate::error::ErrorKind::NotFound) is returned.
    async fn delete(&self, path: &str) -> Result<()>;

    /// Delete many objects in as few round-trips as the backend allows.
    ///
    /// The returned list holds every key that could not be removed along with
    /// its cause. Keys that are already absent count as deleted. The call
    /// itself only errors when nothing could be attempted at all; partial
    /// failure is never an `Err`. An empty `paths` is a no-op.
    ///
    /// Default implementation of this method is to call
    /// [`delete()`](Self::delete) once per key.
    async fn batch_delete(&self, paths: &[String]) -> Result<Vec<NotDeleted>> {
        let mut not_deleted = Vec::new();
        for path in paths {
            match self.delete(path).await {
                Ok(()) => {},
                Err(e) if matches!(&*e, ErrorKind::NotFound(_)) => {},
                Err(e) => not_deleted.push(NotDeleted::new(path.clone(), e)),
            }
        }
        Ok(not_deleted)
    }
}

/// Compare the streamed length against the caller's size hint.
pub(crate) fn check_size(size_hint: Option<u64>, actual: u64) -> Result<()> {
    match size_hint {
        Some(expected) if expected != actual => exn::bail!(ErrorKind::SizeMismatch { expected, actual }),
        _ => Ok(()),
    }
}
