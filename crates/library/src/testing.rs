//! Shared fixtures for the service and reconciler tests.

use crate::BookService;
use crate::events::{self, DeletionEvent};
use async_trait::async_trait;
use shelf_catalog::{Database, Repository};
use shelf_events::error::{ErrorKind as EventsErrorKind, Result as EventsResult};
use shelf_events::{
    Ack, ChannelHandle, Consumer, ConsumerConfig, ConsumerInfo, EventChannel, Message, SqliteChannel, StreamConfig,
    StreamInfo,
};
use shelf_storage::BackendHandle;
use shelf_storage::backend::MockBackend;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use uuid::Uuid;

/// In-memory event channel whose publishes and fetches can be made to fail.
pub(crate) struct FlakyChannel {
    inner: SqliteChannel,
    fail_publishes: AtomicBool,
    fail_fetches: AtomicBool,
}
impl FlakyChannel {
    pub(crate) fn fail_publishes(&self, fail: bool) {
        self.fail_publishes.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn fail_fetches(&self, fail: bool) {
        self.fail_fetches.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl EventChannel for FlakyChannel {
    async fn ensure_stream(&self, config: &StreamConfig) -> EventsResult<()> {
        self.inner.ensure_stream(config).await
    }

    async fn ensure_consumer(&self, stream: &str, config: &ConsumerConfig) -> EventsResult<Consumer> {
        self.inner.ensure_consumer(stream, config).await
    }

    async fn publish(&self, subject: &str, payload: &[u8]) -> EventsResult<Ack> {
        if self.fail_publishes.load(Ordering::SeqCst) {
            exn::bail!(EventsErrorKind::Database);
        }
        self.inner.publish(subject, payload).await
    }

    async fn fetch(&self, consumer: &Consumer, max_batch: usize, max_wait: Duration) -> EventsResult<Vec<Message>> {
        if self.fail_fetches.load(Ordering::SeqCst) {
            exn::bail!(EventsErrorKind::Database);
        }
        self.inner.fetch(consumer, max_batch, max_wait).await
    }

    async fn ack(&self, message: &Message) -> EventsResult<()> {
        self.inner.ack(message).await
    }

    async fn nak(&self, message: &Message) -> EventsResult<()> {
        self.inner.nak(message).await
    }

    async fn stream_info(&self, stream: &str) -> EventsResult<StreamInfo> {
        self.inner.stream_info(stream).await
    }

    async fn consumer_info(&self, consumer: &Consumer) -> EventsResult<ConsumerInfo> {
        self.inner.consumer_info(consumer).await
    }
}

pub(crate) struct Fixture {
    pub(crate) repo: Repository,
    pub(crate) storage: Arc<MockBackend>,
    pub(crate) channel: Arc<FlakyChannel>,
    pub(crate) service: BookService,
}
impl Fixture {
    pub(crate) async fn new() -> Self {
        let repo = Repository::from(&Database::connect_in_memory().await.unwrap());
        let storage = Arc::new(MockBackend::default());
        let channel = Arc::new(FlakyChannel {
            inner: SqliteChannel::connect_in_memory().await.unwrap(),
            fail_publishes: AtomicBool::new(false),
            fail_fetches: AtomicBool::new(false),
        });
        events::ensure_stream(&(channel.clone() as ChannelHandle)).await.unwrap();
        let service = BookService::new(repo.clone(), storage.clone(), channel.clone());
        Self { repo, storage, channel, service }
    }

    pub(crate) fn storage_handle(&self) -> BackendHandle {
        self.storage.clone()
    }

    pub(crate) fn channel_handle(&self) -> ChannelHandle {
        self.channel.clone()
    }

    /// Number of deletion events currently held by the stream.
    pub(crate) async fn queued(&self) -> u64 {
        self.channel.stream_info(events::STREAM).await.unwrap().messages
    }

    /// Paths of every queued deletion event, oldest first. Reads through a
    /// throwaway consumer so the reconciler's cursor is untouched.
    pub(crate) async fn queued_paths(&self) -> Vec<String> {
        let config = ConsumerConfig::new(format!("inspect-{}", Uuid::new_v4())).with_filter_subject(events::DELETE_SUBJECT);
        let consumer = self.channel.ensure_consumer(events::STREAM, &config).await.unwrap();
        let messages = self.channel.fetch(&consumer, 1000, Duration::ZERO).await.unwrap();
        messages.iter().map(|m| DeletionEvent::decode(&m.payload).unwrap().path).collect()
    }
}
