//! Small adapters over [`futures::io`] traits.
//!
//! Everything here is written against the runtime-agnostic `futures` I/O
//! traits rather than Tokio's, so callers can hand in whatever reader their
//! transport produced.

mod hashing;

pub use crate::hashing::HashingReader;
