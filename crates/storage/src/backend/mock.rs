//! In-memory storage backend for testing.

use crate::backend::{UploadReader, check_size};
use crate::error::{ErrorKind, Result};
use crate::models::{BoxAsyncRead, NotDeleted};
use crate::path::validate as validate_path;
use crate::StorageBackend;
use async_trait::async_trait;
use futures::io::{AsyncReadExt, Cursor};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;

/// In-memory storage backend for testing.
///
/// Objects are stored in a map behind a [`RwLock`], so all trait methods can
/// operate on `&self` without external synchronisation. Failures can be
/// injected per operation to exercise the error paths of callers:
///
/// - [`fail_uploads()`](Self::fail_uploads) makes every upload fail after the
///   content has been consumed.
/// - [`fail_delete_of()`](Self::fail_delete_of) makes deletion of one key fail,
///   which shows up as a [`NotDeleted`] entry in batch deletes.
/// - [`fail_batches()`](Self::fail_batches) makes whole batch calls fail
///   before any key is attempted.
///
/// # Examples
///
/// ```
/// use shelf_storage::backend::MockBackend;
/// use shelf_storage::StorageBackend;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let backend = MockBackend::with_objects([("owner/123", b"helloworld")]);
/// assert!(backend.exists("owner/123").await?);
///
/// backend.fail_delete_of("owner/123").await;
/// let not_deleted = backend.batch_delete(&["owner/123".to_string()]).await?;
/// assert_eq!(not_deleted[0].path, "owner/123");
/// # Ok(())
/// # }
/// ```
pub struct MockBackend {
    name: String,
    storage: RwLock<BTreeMap<String, Vec<u8>>>,
    failing_deletes: RwLock<HashSet<String>>,
    batch_calls: RwLock<Vec<Vec<String>>>,
    fail_uploads: AtomicBool,
    fail_batches: AtomicBool,
}

impl MockBackend {
    /// Create a mock backend pre-populated with objects.
    ///
    /// Panics if any key fails validation (e.g. path traversal). If test
    /// setup is wrong, then test should not pass.
    pub fn with_objects(objects: impl IntoIterator<Item = (impl Into<String>, impl Into<Vec<u8>>)>) -> Self {
        let mut map = BTreeMap::new();
        for (path, data) in objects {
            let path = path.into();
            let Ok(validated) = validate_path(&path) else {
                // The panic here is DELIBERATE. MockBackend is intended to be
                // used in tests; panics are expected. There is no error result.
                panic!("MockBackend::with_objects: invalid path {path}");
            };
            map.insert(validated, data.into());
        }
        Self {
            name: "mock".to_string(),
            storage: RwLock::new(map),
            failing_deletes: RwLock::new(HashSet::new()),
            batch_calls: RwLock::new(Vec::new()),
            fail_uploads: AtomicBool::new(false),
            fail_batches: AtomicBool::new(false),
        }
    }

    /// Change the name of the mock backend.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn fail_uploads(&self, fail: bool) {
        self.fail_uploads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_batches(&self, fail: bool) {
        self.fail_batches.store(fail, Ordering::SeqCst);
    }

    pub async fn fail_delete_of(&self, path: impl Into<String>) {
        self.failing_deletes.write().await.insert(path.into());
    }

    pub async fn heal_delete_of(&self, path: &str) {
        self.failing_deletes.write().await.remove(path);
    }

    /// All stored keys, sorted.
    pub async fn keys(&self) -> Vec<String> {
        self.storage.read().await.keys().cloned().collect()
    }

    /// Every key list passed to [`batch_delete()`](StorageBackend::batch_delete),
    /// in call order. Empty calls are not recorded.
    pub async fn batch_calls(&self) -> Vec<Vec<String>> {
        self.batch_calls.read().await.clone()
    }

    async fn delete_one(&self, path: &str) -> Result<()> {
        let path = validate_path(path)?;
        if self.failing_deletes.read().await.contains(&path) {
            exn::bail!(ErrorKind::PermissionDenied(path));
        }
        self.storage.write().await.remove(&path);
        Ok(())
    }
}
impl Default for MockBackend {
    fn default() -> Self {
        let objects: [(&str, &[u8]); 0] = [];
        Self::with_objects(objects)
    }
}

#[async_trait]
impl StorageBackend for MockBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let path = validate_path(path)?;
        Ok(self.storage.read().await.contains_key(&path))
    }

    async fn upload(&self, path: &str, size_hint: Option<u64>, content: &mut UploadReader<'_>) -> Result<u64> {
        let path = validate_path(path)?;
        let mut data = Vec::new();
        content.read_to_end(&mut data).await.map_err(ErrorKind::Io)?;
        if self.fail_uploads.load(Ordering::SeqCst) {
            exn::bail!(ErrorKind::Network(format!("injected upload failure for {path}")));
        }
        let written = data.len() as u64;
        check_size(size_hint, written)?;
        self.storage.write().await.insert(path, data);
        Ok(written)
    }

    async fn get(&self, path: &str) -> Result<BoxAsyncRead> {
        let path = validate_path(path)?;
        let data = self.storage.read().await.get(&path).cloned().ok_or_else(|| exn::Exn::from(ErrorKind::NotFound(path)))?;
        Ok(Box::pin(Cursor::new(data)))
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.delete_one(path).await
    }

    async fn batch_delete(&self, paths: &[String]) -> Result<Vec<NotDeleted>> {
        if paths.is_empty() {
            return Ok(Vec::new());
        }
        self.batch_calls.write().await.push(paths.to_vec());
        if self.fail_batches.load(Ordering::SeqCst) {
            exn::bail!(ErrorKind::Network("injected batch failure".to_string()));
        }
        let mut not_deleted = Vec::new();
        for path in paths {
            if let Err(e) = self.delete_one(path).await {
                not_deleted.push(NotDeleted::new(path.clone(), e));
            }
        }
        Ok(not_deleted)
    }
}
