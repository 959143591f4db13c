//! SQLite metadata catalog for books.
//!
//! The catalog records which books exist, who uploaded them and where their
//! content lives in object storage. It is the source of truth for book
//! metadata; the object store is the source of truth for content. A row is
//! only ever written after its content has been stored.

mod book;
mod db;
pub mod error;
mod models;
mod repo;

pub use crate::book::{Book, BookHash};
pub use crate::db::Database;
pub use crate::repo::{BookTransaction, Repository};
