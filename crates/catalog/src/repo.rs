//! Repository for book rows.
//!
//! Each query lives in `queries/` and is written once as a free function
//! over any SQLite executor, so the same SQL serves both the pooled
//! [`Repository`] and an open [`BookTransaction`].

use crate::Database;
use crate::book::{Book, BookHash};
use crate::error::{ErrorKind, Result, database};
use crate::models::BookRow;
use exn::ResultExt;
use sqlx::{Sqlite, SqliteExecutor, SqlitePool, Transaction};
use uuid::Uuid;

fn id_param(id: Uuid) -> String {
    id.hyphenated().to_string()
}

async fn insert<'e>(executor: impl SqliteExecutor<'e>, book: &Book) -> Result<Book> {
    let row = BookRow::from(book);
    let stored: BookRow = sqlx::query_as(include_str!("../queries/create_book.sql"))
        .bind(row.id)
        .bind(row.title)
        .bind(row.path)
        .bind(row.hash)
        .bind(row.uploaded_by)
        .bind(row.uploaded_at)
        .fetch_one(executor)
        .await
        .map_err(database)?;
    stored.try_into()
}

async fn remove<'e>(executor: impl SqliteExecutor<'e>, id: Uuid) -> Result<u64> {
    let done = sqlx::query(include_str!("../queries/delete_book.sql"))
        .bind(id_param(id))
        .execute(executor)
        .await
        .map_err(database)?;
    Ok(done.rows_affected())
}

async fn find_by_id<'e>(executor: impl SqliteExecutor<'e>, id: Uuid) -> Result<Book> {
    let row: Option<BookRow> = sqlx::query_as(include_str!("../queries/get_by_id.sql"))
        .bind(id_param(id))
        .fetch_optional(executor)
        .await
        .map_err(database)?;
    match row {
        Some(row) => row.try_into(),
        None => exn::bail!(ErrorKind::BookNotFound(id.to_string())),
    }
}

/// CRUD access to the `books` table.
///
/// Lookups that identify a single book (or, for [`get_by_hash()`](Self::get_by_hash),
/// at least one) fail with [`ErrorKind::BookNotFound`] when nothing matches.
/// Listing an owner's books never does; an empty page is just empty.
#[derive(Debug, Clone)]
pub struct Repository {
    pool: SqlitePool,
}
impl From<&Database> for Repository {
    fn from(db: &Database) -> Self {
        Self { pool: db.pool().clone() }
    }
}
impl Repository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    // =========================================================================
    // Insert / Delete
    // =========================================================================

    /// Insert a book and return it as stored.
    ///
    /// Fails with [`ErrorKind::Conflict`] when the path, or the title for the
    /// same owner, is already taken.
    pub async fn create(&self, book: &Book) -> Result<Book> {
        insert(&self.pool, book).await
    }

    /// Delete a book by id. Deleting a book that does not exist is not an
    /// error.
    pub async fn delete(&self, id: Uuid) -> Result<()> {
        remove(&self.pool, id).await?;
        Ok(())
    }

    // =========================================================================
    // Get/Fetch
    // =========================================================================

    pub async fn get_by_id(&self, id: Uuid) -> Result<Book> {
        find_by_id(&self.pool, id).await
    }

    pub async fn get_by_title_and_user_id(&self, title: &str, owner: Uuid) -> Result<Book> {
        let row: Option<BookRow> = sqlx::query_as(include_str!("../queries/get_by_title_and_user_id.sql"))
            .bind(title)
            .bind(id_param(owner))
            .fetch_optional(&self.pool)
            .await
            .map_err(database)?;
        match row {
            Some(row) => row.try_into(),
            None => exn::bail!(ErrorKind::BookNotFound(format!("{owner}: {title}"))),
        }
    }

    /// Every book whose content hashes to `hash`, newest first.
    ///
    /// The same content uploaded twice gives two books with the same hash.
    pub async fn get_by_hash(&self, hash: &BookHash) -> Result<Vec<Book>> {
        let rows: Vec<BookRow> = sqlx::query_as(include_str!("../queries/get_by_hash.sql"))
            .bind(hash.as_bytes().as_slice())
            .fetch_all(&self.pool)
            .await
            .map_err(database)?;
        if rows.is_empty() {
            exn::bail!(ErrorKind::BookNotFound(hash.to_string()));
        }
        rows.into_iter().map(Book::try_from).collect()
    }

    // =========================================================================
    // Listing
    // =========================================================================

    /// One page of an owner's books, newest first.
    pub async fn get_many_by_user_id(&self, owner: Uuid, limit: usize, offset: usize) -> Result<Vec<Book>> {
        let limit = i64::try_from(limit).or_raise(|| ErrorKind::InvalidData("limit"))?;
        let offset = i64::try_from(offset).or_raise(|| ErrorKind::InvalidData("offset"))?;
        let rows: Vec<BookRow> = sqlx::query_as(include_str!("../queries/get_many_by_user_id.sql"))
            .bind(id_param(owner))
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await
            .map_err(database)?;
        rows.into_iter().map(Book::try_from).collect()
    }

    // =========================================================================
    // Transactions
    // =========================================================================

    /// Open a transaction. Nothing done through it is visible to others until
    /// [`commit()`](BookTransaction::commit); dropping it rolls back.
    pub async fn begin(&self) -> Result<BookTransaction> {
        let mut tx = self.pool.begin().await.map_err(database)?;
        // Take the write lock now. A deferred transaction that reads first
        // fails outright, instead of waiting, if another writer commits
        // before it upgrades.
        sqlx::query("UPDATE books SET id = id WHERE 0").execute(&mut *tx).await.map_err(database)?;
        Ok(BookTransaction { tx })
    }
}

/// An open catalog transaction.
pub struct BookTransaction {
    tx: Transaction<'static, Sqlite>,
}
impl BookTransaction {
    pub async fn get_by_id(&mut self, id: Uuid) -> Result<Book> {
        find_by_id(&mut *self.tx, id).await
    }

    /// Delete a book by id, failing with [`ErrorKind::BookNotFound`] if no
    /// row was removed.
    pub async fn delete(&mut self, id: Uuid) -> Result<()> {
        if remove(&mut *self.tx, id).await? == 0 {
            exn::bail!(ErrorKind::BookNotFound(id.to_string()));
        }
        Ok(())
    }

    pub async fn commit(self) -> Result<()> {
        self.tx.commit().await.map_err(database)
    }

    pub async fn rollback(self) -> Result<()> {
        self.tx.rollback().await.map_err(database)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::{Duration, UtcDateTime};

    async fn repo() -> Repository {
        Repository::from(&Database::connect_in_memory().await.unwrap())
    }

    fn book(owner: Uuid, title: &str, hash: u8) -> Book {
        Book {
            id: Uuid::new_v4(),
            title: title.to_string(),
            path: format!("{owner}/{}", Uuid::new_v4()),
            hash: BookHash::new([hash; 32]),
            owner,
            uploaded_at: UtcDateTime::now().replace_nanosecond(0).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let repo = repo().await;
        let owner = Uuid::new_v4();
        let book = book(owner, "Winnie-the-Pooh", 1);
        let stored = repo.create(&book).await.unwrap();
        assert_eq!(stored, book);
        assert_eq!(repo.get_by_id(book.id).await.unwrap(), book);
        assert_eq!(repo.get_by_title_and_user_id("Winnie-the-Pooh", owner).await.unwrap(), book);
    }

    #[tokio::test]
    async fn test_not_found() {
        let repo = repo().await;
        let err = repo.get_by_id(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::BookNotFound(_)));
        let err = repo.get_by_title_and_user_id("missing", Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::BookNotFound(_)));
        let err = repo.get_by_hash(&BookHash::new([9; 32])).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::BookNotFound(_)));
    }

    #[tokio::test]
    async fn test_duplicate_title_for_owner_conflicts() {
        let repo = repo().await;
        let owner = Uuid::new_v4();
        repo.create(&book(owner, "Same", 1)).await.unwrap();
        let err = repo.create(&book(owner, "Same", 2)).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::Conflict));
        // A different owner may reuse the title.
        repo.create(&book(Uuid::new_v4(), "Same", 3)).await.unwrap();
    }

    #[tokio::test]
    async fn test_same_hash_under_different_ids() {
        let repo = repo().await;
        let owner = Uuid::new_v4();
        let a = repo.create(&book(owner, "A", 5)).await.unwrap();
        let b = repo.create(&book(owner, "B", 5)).await.unwrap();
        let found = repo.get_by_hash(&BookHash::new([5; 32])).await.unwrap();
        let mut ids: Vec<_> = found.iter().map(|b| b.id).collect();
        ids.sort();
        let mut expected = vec![a.id, b.id];
        expected.sort();
        assert_eq!(ids, expected);
    }

    #[tokio::test]
    async fn test_get_many_pages_newest_first() {
        let repo = repo().await;
        let owner = Uuid::new_v4();
        let base = UtcDateTime::now().replace_nanosecond(0).unwrap();
        for i in 0..5 {
            let mut book = book(owner, &format!("Book {i}"), i);
            book.uploaded_at = base + Duration::seconds(i64::from(i));
            repo.create(&book).await.unwrap();
        }
        repo.create(&book(Uuid::new_v4(), "Someone else's", 9)).await.unwrap();

        let first = repo.get_many_by_user_id(owner, 2, 0).await.unwrap();
        let titles: Vec<_> = first.iter().map(|b| b.title.as_str()).collect();
        assert_eq!(titles, vec!["Book 4", "Book 3"]);
        let rest = repo.get_many_by_user_id(owner, 10, 2).await.unwrap();
        assert_eq!(rest.len(), 3);
        assert!(repo.get_many_by_user_id(Uuid::new_v4(), 10, 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_is_unconditional() {
        let repo = repo().await;
        let book = repo.create(&book(Uuid::new_v4(), "Gone", 1)).await.unwrap();
        repo.delete(book.id).await.unwrap();
        repo.delete(book.id).await.unwrap();
        assert!(repo.get_by_id(book.id).await.is_err());
    }

    #[tokio::test]
    async fn test_transaction_commit() {
        let repo = repo().await;
        let book = repo.create(&book(Uuid::new_v4(), "Tx", 1)).await.unwrap();
        let mut tx = repo.begin().await.unwrap();
        assert_eq!(tx.get_by_id(book.id).await.unwrap(), book);
        tx.delete(book.id).await.unwrap();
        tx.commit().await.unwrap();
        assert!(matches!(&*repo.get_by_id(book.id).await.unwrap_err(), ErrorKind::BookNotFound(_)));
    }

    #[tokio::test]
    async fn test_transaction_rollback_keeps_row() {
        let repo = repo().await;
        let book = repo.create(&book(Uuid::new_v4(), "Tx", 1)).await.unwrap();
        let mut tx = repo.begin().await.unwrap();
        tx.delete(book.id).await.unwrap();
        tx.rollback().await.unwrap();
        assert_eq!(repo.get_by_id(book.id).await.unwrap(), book);

        // Dropping without committing also rolls back.
        let mut tx = repo.begin().await.unwrap();
        tx.delete(book.id).await.unwrap();
        drop(tx);
        assert_eq!(repo.get_by_id(book.id).await.unwrap(), book);
    }

    #[tokio::test]
    async fn test_transaction_delete_missing() {
        let repo = repo().await;
        let mut tx = repo.begin().await.unwrap();
        let err = tx.delete(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::BookNotFound(_)));
    }
}
