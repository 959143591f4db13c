//! Deletion events: the queue through which object store cleanup happens.

use exn::ResultExt;
use serde::{Deserialize, Serialize};
use shelf_events::error::{ErrorKind as EventsErrorKind, Result as EventsResult};
use shelf_events::{Ack, ChannelHandle, ConsumerConfig, DeliverPolicy, StreamConfig};
use std::time::Duration;

/// Stream holding every book event.
pub const STREAM: &str = "BOOKS";
pub const STREAM_SUBJECTS: &str = "books.*";
/// Subject deletion events are published to.
pub const DELETE_SUBJECT: &str = "books.delete";
/// Durable consumer name of the reconciler.
pub const DELETER: &str = "books-deleter";

/// Request to remove one object from storage.
///
/// Self-contained and replay-safe: handling the same event twice has the same
/// effect as handling it once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletionEvent {
    pub path: String,
}
impl DeletionEvent {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }

    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn decode(payload: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(payload)
    }
}

pub fn stream_config() -> StreamConfig {
    StreamConfig::new(STREAM, [STREAM_SUBJECTS])
}

pub fn deleter_config(ack_wait: Duration) -> ConsumerConfig {
    ConsumerConfig::new(DELETER)
        .with_filter_subject(DELETE_SUBJECT)
        .with_deliver_policy(DeliverPolicy::All)
        .with_ack_wait(ack_wait)
}

/// Declare the book stream. Publishing fails until this has run once.
pub async fn ensure_stream(channel: &ChannelHandle) -> EventsResult<()> {
    channel.ensure_stream(&stream_config()).await
}

/// Queue removal of the object at `path`.
pub(crate) async fn publish_deletion(channel: &ChannelHandle, path: &str) -> EventsResult<Ack> {
    let payload = DeletionEvent::new(path).encode().or_raise(|| EventsErrorKind::InvalidData("deletion event"))?;
    channel.publish(DELETE_SUBJECT, &payload).await
}
