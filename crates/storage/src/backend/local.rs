//! Local filesystem storage backend.
//!
//! Objects are stored as files under a configured root directory, with the
//! object key used as the relative path. Access goes through `tokio::fs`,
//! bridged to `futures` I/O traits with `tokio_util::compat`.

use crate::backend::{UploadReader, check_size};
use crate::error::{ErrorKind, Result};
use crate::models::BoxAsyncRead;
use crate::{StorageBackend, path::validate as validate_path};
use async_trait::async_trait;
use futures::io::AsyncWriteExt;
use std::fs::create_dir_all as sync_create_dir;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio_util::compat::{TokioAsyncReadCompatExt, TokioAsyncWriteCompatExt};
use uuid::Uuid;

/// Local filesystem storage backend.
///
/// Uploads are written to a hidden staging file next to the target and renamed
/// into place once complete, so readers never observe a partially written
/// object and a failed upload leaves nothing behind at the key.
///
/// # Examples
///
/// ```no_run
/// use shelf_storage::backend::LocalBackend;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let backend = LocalBackend::new("local", "/var/lib/shelf/objects")?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct LocalBackend {
    name: String,
    /// Root directory for all objects
    root: PathBuf,
}
impl LocalBackend {
    /// Create a new local filesystem backend.
    ///
    /// # Errors
    ///
    /// Returns an error if the root is not absolute, or exists and is not a
    /// directory.
    pub fn new(name: impl Into<String>, root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        if !root.is_absolute() {
            exn::bail!(ErrorKind::InvalidPath(root.display().to_string()));
        }
        if root.exists() {
            if !root.is_dir() {
                exn::bail!(ErrorKind::InvalidPath(root.display().to_string()));
            }
        } else {
            // Use non-async here; it'll only happen once on startup and it's
            // not worth the hassle of making the constructor async.
            sync_create_dir(&root).map_err(|e| Self::map_io_error(e, &root.display().to_string()))?;
        }
        Ok(Self { name: name.into(), root })
    }

    /// Validate a key and join it onto the root directory.
    fn absolute_path(&self, path: &str) -> Result<PathBuf> {
        let validated = validate_path(path)?;
        Ok(self.root.join(validated))
    }

    fn map_io_error(e: std::io::Error, path: &str) -> ErrorKind {
        match e.kind() {
            std::io::ErrorKind::NotFound => ErrorKind::NotFound(path.to_string()),
            std::io::ErrorKind::PermissionDenied => ErrorKind::PermissionDenied(path.to_string()),
            _ => ErrorKind::Io(e),
        }
    }

    async fn write_staged(staging: &Path, path: &str, content: &mut UploadReader<'_>) -> Result<u64> {
        let file = fs::File::create(staging).await.map_err(|e| Self::map_io_error(e, path))?;
        let mut writer = file.compat_write();
        let written = futures::io::copy(&mut *content, &mut writer).await.map_err(ErrorKind::Io)?;
        writer.flush().await.map_err(ErrorKind::Io)?;
        writer.into_inner().sync_all().await.map_err(ErrorKind::Io)?;
        Ok(written)
    }
}

#[async_trait]
impl StorageBackend for LocalBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let absolute = self.absolute_path(path)?;
        Ok(fs::try_exists(&absolute).await.map_err(|e| Self::map_io_error(e, path))?)
    }

    async fn upload(&self, path: &str, size_hint: Option<u64>, content: &mut UploadReader<'_>) -> Result<u64> {
        let target = self.absolute_path(path)?;
        // absolute_path() never returns the root itself, so there is always a
        // parent and a file name.
        let (Some(parent), Some(file_name)) = (target.parent(), target.file_name()) else {
            exn::bail!(ErrorKind::InvalidPath(path.to_string()));
        };
        fs::create_dir_all(parent).await.map_err(|e| Self::map_io_error(e, path))?;
        let staging = parent.join(format!(".{}.{}.partial", file_name.to_string_lossy(), Uuid::new_v4()));

        let written = match Self::write_staged(&staging, path, content).await {
            Ok(written) => written,
            Err(e) => {
                _ = fs::remove_file(&staging).await;
                return Err(e);
            },
        };
        if let Err(e) = check_size(size_hint, written) {
            _ = fs::remove_file(&staging).await;
            return Err(e);
        }
        if let Err(e) = fs::rename(&staging, &target).await {
            _ = fs::remove_file(&staging).await;
            return Err(Self::map_io_error(e, path).into());
        }
        Ok(written)
    }

    async fn get(&self, path: &str) -> Result<BoxAsyncRead> {
        let absolute = self.absolute_path(path)?;
        let file = fs::File::open(&absolute).await.map_err(|e| Self::map_io_error(e, path))?;
        Ok(Box::pin(file.compat()))
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let absolute = self.absolute_path(path)?;
        match fs::remove_file(&absolute).await {
            Ok(()) => Ok(()),
            // Already gone is as good as deleted.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Self::map_io_error(e, path).into()),
        }
    }
}
