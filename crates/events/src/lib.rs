//! Durable, subject-based event log with pull consumers.
//!
//! # Architecture
//! - **Streams** capture every message published to one of their subject
//!   patterns and keep it until retention removes it.
//! - **Consumers** are named, persistent read positions on a stream. Messages
//!   are handed out in batches and must be acknowledged explicitly; anything
//!   left unacknowledged past the consumer's ack wait is delivered again.
//!
//! The [`EventChannel`] trait is the seam. [`SqliteChannel`] keeps the whole
//! log in one SQLite database. `NatsChannel` (feature `nats`) maps the same
//! model onto NATS JetStream, so consumers can be shared across hosts.

mod channel;
pub mod error;
#[cfg(feature = "nats")]
mod nats;
mod sqlite;
pub mod subject;

pub use crate::channel::{
    Ack, Consumer, ConsumerConfig, ConsumerInfo, DeliverPolicy, EventChannel, Message, StreamConfig, StreamInfo,
};
#[cfg(feature = "nats")]
pub use crate::nats::NatsChannel;
pub use crate::sqlite::SqliteChannel;
use std::sync::Arc;

pub type ChannelHandle = Arc<dyn EventChannel + Send + Sync>;
