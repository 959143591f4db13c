//! Book lifecycle: keeping catalog rows and stored content consistent.
//!
//! [`BookService`] handles uploads, deletes and reads. [`Reconciler`] runs in
//! the background and removes content whose book is gone, driven by the
//! deletion events the service publishes.

mod books;
pub mod error;
pub mod events;
mod reconcile;
#[cfg(test)]
mod testing;

pub use crate::books::{BookService, NewBook};
pub use crate::events::DeletionEvent;
pub use crate::reconcile::{PassReport, Reconciler, ReconcilerConfig};
