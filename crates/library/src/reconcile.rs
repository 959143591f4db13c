//! Background removal of objects whose books are gone.
//!
//! The [`Reconciler`] drains deletion events in batches and asks storage to
//! delete the referenced objects in one call per batch. An event is only
//! acknowledged once its object is confirmed gone; anything else is left for
//! the event channel to hand out again after the ack wait. Nothing that goes
//! wrong here stops the loop.

use crate::error::{ErrorKind, Result};
use crate::events::{self, DeletionEvent};
use exn::ResultExt;
use shelf_events::error::Result as EventsResult;
use shelf_events::{ChannelHandle, Consumer, Message};
use shelf_storage::{BackendHandle, NotDeleted};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Pause after a failed fetch before trying again.
const FETCH_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcilerConfig {
    /// Most events handled per pass.
    pub batch_size: usize,
    /// Longest a pass waits for the first event.
    pub max_wait: Duration,
    /// How long an event may go unacknowledged before redelivery.
    pub ack_wait: Duration,
}
impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self { batch_size: 100, max_wait: Duration::from_secs(60), ack_wait: Duration::from_secs(30) }
    }
}

/// Outcome of a single [`run_once()`](Reconciler::run_once) pass.
#[derive(Debug, Default)]
pub struct PassReport {
    /// Events received.
    pub fetched: usize,
    /// Distinct paths confirmed removed. Their events were acknowledged.
    pub deleted: usize,
    /// Objects storage could not remove. Their events stay unacknowledged.
    pub not_deleted: Vec<NotDeleted>,
    /// Events that could not be decoded. Acknowledged and dropped.
    pub malformed: usize,
    /// The batch call itself failed; nothing was acknowledged.
    pub batch_failed: bool,
}

pub struct Reconciler {
    channel: ChannelHandle,
    storage: BackendHandle,
    consumer: Consumer,
    batch_size: usize,
    max_wait: Duration,
}

impl Reconciler {
    /// Declare the book stream and the deleter consumer, then return a
    /// reconciler ready to run.
    pub async fn new(channel: ChannelHandle, storage: BackendHandle, config: ReconcilerConfig) -> Result<Self> {
        events::ensure_stream(&channel).await.or_raise(|| ErrorKind::Setup)?;
        let consumer = channel
            .ensure_consumer(events::STREAM, &events::deleter_config(config.ack_wait))
            .await
            .or_raise(|| ErrorKind::Setup)?;
        Ok(Self { channel, storage, consumer, batch_size: config.batch_size, max_wait: config.max_wait })
    }

    pub fn consumer(&self) -> &Consumer {
        &self.consumer
    }

    /// Fetch one batch (waiting up to the configured maximum) and handle it.
    ///
    /// Only a failed fetch is an error; everything after that is reported.
    pub async fn run_once(&self) -> EventsResult<PassReport> {
        let messages = self.channel.fetch(&self.consumer, self.batch_size, self.max_wait).await?;
        Ok(self.process(messages).await)
    }

    /// Run until `cancel` fires.
    ///
    /// Cancellation abandons a fetch in progress (nothing was handed out yet)
    /// but lets a storage call in progress finish, so its events still get
    /// acknowledged.
    pub async fn run(&self, cancel: CancellationToken) {
        tracing::info!(stream = %self.consumer.stream, durable = %self.consumer.durable, "reconciler started");
        loop {
            let fetched = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                fetched = self.channel.fetch(&self.consumer, self.batch_size, self.max_wait) => fetched,
            };
            match fetched {
                Ok(messages) if messages.is_empty() => {},
                Ok(messages) => {
                    let report = self.process(messages).await;
                    tracing::debug!(
                        fetched = report.fetched,
                        deleted = report.deleted,
                        not_deleted = report.not_deleted.len(),
                        malformed = report.malformed,
                        "reconciliation pass complete"
                    );
                },
                Err(e) => {
                    tracing::error!(error = ?e, "fetching deletion events failed");
                    tokio::select! {
                        () = cancel.cancelled() => break,
                        () = tokio::time::sleep(FETCH_BACKOFF) => {},
                    }
                },
            }
        }
        tracing::info!("reconciler stopped");
    }

    /// Run on the current Tokio runtime until `cancel` fires.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(cancel).await })
    }

    async fn process(&self, messages: Vec<Message>) -> PassReport {
        let mut report = PassReport { fetched: messages.len(), ..PassReport::default() };
        if messages.is_empty() {
            return report;
        }

        // The same path may be queued more than once (a retried delete, a
        // redelivery racing a fresh event). Ask storage once per path.
        let mut paths: Vec<String> = Vec::new();
        let mut by_path: HashMap<String, Vec<&Message>> = HashMap::new();
        for message in &messages {
            match DeletionEvent::decode(&message.payload) {
                Ok(event) => {
                    let waiting = by_path.entry(event.path).or_insert_with_key(|path| {
                        paths.push(path.clone());
                        Vec::new()
                    });
                    waiting.push(message);
                },
                Err(e) => {
                    tracing::warn!(sequence = message.sequence, error = %e, "dropping undecodable deletion event");
                    report.malformed += 1;
                    self.ack(message).await;
                },
            }
        }
        if paths.is_empty() {
            return report;
        }

        let not_deleted = match self.storage.batch_delete(&paths).await {
            Ok(not_deleted) => not_deleted,
            Err(e) => {
                tracing::error!(backend = self.storage.name(), objects = paths.len(), error = ?e, "batch deletion failed");
                report.batch_failed = true;
                return report;
            },
        };
        for failure in &not_deleted {
            tracing::warn!(path = %failure.path, error = ?failure.cause, "object not deleted; will retry");
        }
        let failed: HashSet<&str> = not_deleted.iter().map(|failure| failure.path.as_str()).collect();
        for path in &paths {
            if failed.contains(path.as_str()) {
                continue;
            }
            report.deleted += 1;
            for message in by_path.get(path).into_iter().flatten() {
                self.ack(message).await;
            }
        }
        report.not_deleted = not_deleted;
        report
    }

    /// A failed ack only means the event comes back later, and handling it
    /// again is harmless.
    async fn ack(&self, message: &Message) {
        if let Err(e) = self.channel.ack(message).await {
            tracing::warn!(sequence = message.sequence, error = ?e, "could not acknowledge deletion event");
        }
    }
}
