//! The book lifecycle service.
//!
//! Content and metadata live in two systems that cannot share a transaction,
//! so every write is ordered such that a failure part way through leaves at
//! worst an orphaned object with a queued deletion event:
//!
//! - **Upload** stores the content first and only then records the row. If
//!   the row cannot be written, a deletion event for the fresh object is
//!   published.
//! - **Delete** removes the row and publishes a deletion event inside one
//!   catalog transaction, committing only once the event is durably queued.
//!
//! The [`Reconciler`](crate::Reconciler) eventually removes the objects.

use crate::error::{Result, internal, not_found};
use crate::events::publish_deletion;
use futures::io::AsyncRead;
use shelf_asyncutils::HashingReader;
use shelf_catalog::error::{ErrorKind as CatalogErrorKind, Result as CatalogResult};
use shelf_catalog::{Book, BookHash, Repository};
use shelf_events::ChannelHandle;
use shelf_storage::error::ErrorKind as StorageErrorKind;
use shelf_storage::{BackendHandle, BoxAsyncRead};
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use time::UtcDateTime;
use tracing::instrument;
use uuid::Uuid;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// What the caller supplies for a new book. Everything else is assigned by
/// the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewBook {
    pub title: String,
    pub owner: Uuid,
}
impl NewBook {
    pub fn new(title: impl Into<String>, owner: Uuid) -> Self {
        Self { title: title.into(), owner }
    }
}

/// Orchestrates object storage, the catalog and the deletion queue.
///
/// Cheap to clone; all clones share the same handles.
#[derive(Clone)]
pub struct BookService {
    repo: Repository,
    storage: BackendHandle,
    events: ChannelHandle,
    timeout: Duration,
}

impl BookService {
    pub fn new(repo: Repository, storage: BackendHandle, events: ChannelHandle) -> Self {
        Self { repo, storage, events, timeout: DEFAULT_TIMEOUT }
    }

    /// Upper bound on each catalog read.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Store a new book's content and record it in the catalog.
    ///
    /// The content is streamed straight to storage, hashed on the way
    /// through; it is never buffered whole. `content_length`, when known, is
    /// checked against what was actually read.
    #[instrument(skip(self, content), fields(owner = %book.owner, title = %book.title))]
    pub async fn upload<R>(&self, book: NewBook, content_length: Option<u64>, content: R) -> Result<Book>
    where
        R: AsyncRead + Send + Unpin,
    {
        let path = format!("{}/{}", book.owner, Uuid::new_v4());
        let mut reader = HashingReader::sha256(content);
        if let Err(e) = self.storage.upload(&path, content_length, &mut reader).await {
            return Err(internal("upload", &path, &e));
        }
        let digest: [u8; 32] = reader.finalize().into();
        let now = UtcDateTime::now();
        let record = Book {
            id: Uuid::new_v4(),
            title: book.title,
            path,
            hash: BookHash::from(digest),
            owner: book.owner,
            uploaded_at: now.replace_nanosecond(0).unwrap_or(now),
        };
        match self.repo.create(&record).await {
            Ok(stored) => {
                tracing::info!(book_id = %stored.id, path = %stored.path, "book uploaded");
                Ok(stored)
            },
            Err(e) => {
                let err = internal("upload", &record.path, &e);
                // The object is stored but nothing refers to it.
                if let Err(e) = publish_deletion(&self.events, &record.path).await {
                    tracing::error!(path = %record.path, error = ?e, "could not schedule removal of orphaned content");
                }
                Err(err)
            },
        }
    }

    /// Remove a book from the catalog and schedule removal of its content.
    ///
    /// Nothing changes unless the deletion event is durably queued, so a
    /// failed call can simply be retried.
    #[instrument(skip(self))]
    pub async fn delete(&self, id: Uuid) -> Result<()> {
        let mut tx = self.repo.begin().await.map_err(|e| internal("delete", &id, &e))?;
        let book = match tx.get_by_id(id).await {
            Ok(book) => book,
            Err(e) if matches!(&*e, CatalogErrorKind::BookNotFound(_)) => return Err(not_found()),
            Err(e) => return Err(internal("delete", &id, &e)),
        };
        if let Err(e) = tx.delete(id).await {
            let err = internal("delete", &id, &e);
            Self::rollback(tx, id).await;
            return Err(err);
        }
        if let Err(e) = publish_deletion(&self.events, &book.path).await {
            let err = internal("delete", &book.path, &e);
            Self::rollback(tx, id).await;
            return Err(err);
        }
        // Past this point the content is going away regardless. A failed
        // commit leaves a row whose content reads as not found.
        tx.commit().await.map_err(|e| internal("delete", &id, &e))?;
        tracing::info!(book_id = %id, path = %book.path, "book deleted");
        Ok(())
    }

    async fn rollback(tx: shelf_catalog::BookTransaction, id: Uuid) {
        if let Err(e) = tx.rollback().await {
            tracing::warn!(book_id = %id, error = ?e, "rollback failed");
        }
    }

    // =========================================================================
    // Reads
    // =========================================================================

    async fn read<T>(
        &self,
        operation: &'static str,
        key: &(dyn Display + Sync),
        query: impl Future<Output = CatalogResult<T>>,
    ) -> Result<T> {
        match tokio::time::timeout(self.timeout, query).await {
            Ok(Ok(found)) => Ok(found),
            Ok(Err(e)) if matches!(&*e, CatalogErrorKind::BookNotFound(_)) => Err(not_found()),
            Ok(Err(e)) => Err(internal(operation, key, &e)),
            Err(elapsed) => Err(internal(operation, key, &elapsed)),
        }
    }

    pub async fn get_by_id(&self, id: Uuid) -> Result<Book> {
        self.read("get_by_id", &id, self.repo.get_by_id(id)).await
    }

    pub async fn get_by_title_and_user_id(&self, title: &str, owner: Uuid) -> Result<Book> {
        self.read("get_by_title_and_user_id", &owner, self.repo.get_by_title_and_user_id(title, owner)).await
    }

    /// One page of an owner's books, newest first. An empty page is not an
    /// error.
    pub async fn get_many_by_user_id(&self, owner: Uuid, limit: usize, offset: usize) -> Result<Vec<Book>> {
        self.read("get_many_by_user_id", &owner, self.repo.get_many_by_user_id(owner, limit, offset)).await
    }

    pub async fn get_by_hash(&self, hash: &BookHash) -> Result<Vec<Book>> {
        self.read("get_by_hash", hash, self.repo.get_by_hash(hash)).await
    }

    /// Stream a book's content.
    ///
    /// Not found if either the row or its object is missing; the latter is
    /// what a book looks like between losing its content and losing its row.
    pub async fn get_book_content_by_id(&self, id: Uuid) -> Result<BoxAsyncRead> {
        let book = self.get_by_id(id).await?;
        match self.storage.get(&book.path).await {
            Ok(reader) => Ok(reader),
            Err(e) if matches!(&*e, StorageErrorKind::NotFound(_)) => {
                tracing::warn!(book_id = %id, path = %book.path, "book content is missing from storage");
                Err(not_found())
            },
            Err(e) => Err(internal("get_book_content_by_id", &book.path, &e)),
        }
    }
}
