//! The event channel interface.

use crate::error::Result;
use async_trait::async_trait;
use std::time::Duration;

/// Declaration of a stream: a durable log capturing every message published
/// to one of its subject patterns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamConfig {
    pub name: String,
    pub subjects: Vec<String>,
    /// Messages older than this are discarded. `None` keeps them forever.
    pub max_age: Option<Duration>,
}
impl StreamConfig {
    pub fn new(name: impl Into<String>, subjects: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self { name: name.into(), subjects: subjects.into_iter().map(Into::into).collect(), max_age: None }
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = Some(max_age);
        self
    }
}

/// Where a newly declared consumer starts reading.
///
/// Only consulted when the consumer is first created; redeclaring an existing
/// consumer never moves its cursor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DeliverPolicy {
    /// Start from the first message still held by the stream.
    #[default]
    All,
    /// Only deliver messages published after the consumer was created.
    New,
}
impl DeliverPolicy {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            Self::All => "all",
            Self::New => "new",
        }
    }
}

/// Declaration of a durable pull consumer with explicit acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerConfig {
    pub durable: String,
    /// Only messages whose subject matches this pattern are delivered. The
    /// cursor still moves past messages that do not match.
    pub filter_subject: Option<String>,
    pub deliver_policy: DeliverPolicy,
    /// How long a delivered message may stay unacknowledged before it is
    /// handed out again.
    pub ack_wait: Duration,
}
impl ConsumerConfig {
    pub fn new(durable: impl Into<String>) -> Self {
        Self {
            durable: durable.into(),
            filter_subject: None,
            deliver_policy: DeliverPolicy::All,
            ack_wait: Duration::from_secs(30),
        }
    }

    pub fn with_filter_subject(mut self, subject: impl Into<String>) -> Self {
        self.filter_subject = Some(subject.into());
        self
    }

    pub fn with_deliver_policy(mut self, policy: DeliverPolicy) -> Self {
        self.deliver_policy = policy;
        self
    }

    pub fn with_ack_wait(mut self, ack_wait: Duration) -> Self {
        self.ack_wait = ack_wait;
        self
    }
}

/// Handle to a declared consumer, returned by
/// [`ensure_consumer()`](EventChannel::ensure_consumer).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Consumer {
    pub stream: String,
    pub durable: String,
}

/// A message handed out by [`fetch()`](EventChannel::fetch).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub stream: String,
    pub durable: String,
    pub subject: String,
    pub sequence: u64,
    pub payload: Vec<u8>,
    /// How many times this message has been delivered to this consumer,
    /// including this delivery.
    pub deliveries: u32,
}

/// Confirmation that a published message is durably stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    pub stream: String,
    pub sequence: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamInfo {
    pub name: String,
    pub subjects: Vec<String>,
    pub messages: u64,
    /// Zero when the stream is empty.
    pub first_sequence: u64,
    pub last_sequence: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerInfo {
    pub stream: String,
    pub durable: String,
    /// Highest stream sequence the consumer has moved past.
    pub cursor: u64,
    /// Matching messages not yet delivered.
    pub num_pending: u64,
    /// Messages delivered and awaiting acknowledgement.
    pub num_ack_pending: u64,
}

/// Durable, subject-based publish and pull-consume.
///
/// Delivery is at-least-once: a fetched message stays owned by its consumer
/// until it is [acknowledged](Self::ack). If that does not happen within the
/// consumer's `ack_wait` (the process crashed, the handler gave up, or the
/// message was [rejected](Self::nak)) it becomes eligible for redelivery.
/// There is no delivery limit.
#[async_trait]
pub trait EventChannel: Send + Sync {
    /// Create the stream, or update its subjects and retention if it already
    /// exists. Safe to call on every startup.
    async fn ensure_stream(&self, config: &StreamConfig) -> Result<()>;

    /// Create a durable consumer on `stream`, or update its settings. The
    /// cursor of an existing consumer is kept.
    async fn ensure_consumer(&self, stream: &str, config: &ConsumerConfig) -> Result<Consumer>;

    /// Append a message to the stream capturing `subject`.
    ///
    /// `Ok` means the message is durably recorded.
    async fn publish(&self, subject: &str, payload: &[u8]) -> Result<Ack>;

    /// Pull up to `max_batch` messages, waiting up to `max_wait` for at least
    /// one to become available.
    ///
    /// Expired deliveries come first, then new messages past the cursor. An
    /// empty batch means the wait elapsed and is not an error.
    async fn fetch(&self, consumer: &Consumer, max_batch: usize, max_wait: Duration) -> Result<Vec<Message>>;

    /// Mark a delivered message as processed. Acknowledging twice is harmless.
    async fn ack(&self, message: &Message) -> Result<()>;

    /// Make a delivered message available for redelivery right away.
    async fn nak(&self, message: &Message) -> Result<()>;

    async fn stream_info(&self, stream: &str) -> Result<StreamInfo>;

    async fn consumer_info(&self, consumer: &Consumer) -> Result<ConsumerInfo>;
}
