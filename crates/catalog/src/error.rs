//! Catalog Error Types

use derive_more::{Display, Error};

/// A catalog error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for catalog operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    #[display("database error")]
    Database,
    #[display("database migration error")]
    Migration,
    /// No book matched the lookup.
    #[display("book not found: {_0}")]
    BookNotFound(#[error(not(source))] String),
    /// A uniqueness constraint rejected the write (same path, or the same
    /// title for the same owner).
    #[display("book already exists")]
    Conflict,
    /// A stored value could not be converted to or from its model.
    #[display("invalid catalog data: {_0}")]
    InvalidData(#[error(not(source))] &'static str),
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Database)
    }

    /// Classify a driver error, picking out constraint violations.
    pub(crate) fn from_sqlx(err: &sqlx::Error) -> Self {
        match err.as_database_error() {
            Some(db) if db.is_unique_violation() => Self::Conflict,
            _ => Self::Database,
        }
    }
}

/// Raise a driver error into the catalog error tree.
#[track_caller]
pub(crate) fn database(err: sqlx::Error) -> Error {
    let kind = ErrorKind::from_sqlx(&err);
    exn::Exn::from(err).raise(kind)
}
