//! NATS JetStream event channel.
//!
//! Streams and durable pull consumers map one to one onto their JetStream
//! counterparts, so several processes on different hosts can share a durable
//! consumer and the server decides who gets which message. Acknowledgement
//! needs the delivery's reply subject, so every fetched message is remembered
//! until it is acked, nak'd, or handed out again.

use crate::channel::{
    Ack, Consumer, ConsumerConfig, ConsumerInfo, DeliverPolicy, EventChannel, Message, StreamConfig, StreamInfo,
};
use crate::error::{Error, ErrorKind, Result};
use crate::subject;
use async_nats::jetstream::consumer::{self as js_consumer, pull};
use async_nats::jetstream::context::{GetStreamError, GetStreamErrorKind, PublishErrorKind};
use async_nats::jetstream::stream::{self as js_stream, ConsumerError, ConsumerErrorKind};
use async_nats::jetstream::{self, AckKind, ErrorCode};
use async_trait::async_trait;
use exn::ResultExt;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::instrument;

/// JetStream bounds how long a pull request may stay open; longer waits are
/// split by the caller's loop.
const MAX_PULL_WAIT: Duration = Duration::from_secs(300);

type DeliveryKey = (String, String, u64);

/// Event channel backed by a NATS JetStream server.
pub struct NatsChannel {
    context: jetstream::Context,
    deliveries: Mutex<HashMap<DeliveryKey, jetstream::Message>>,
}

impl NatsChannel {
    /// Connect to the server at `url` (e.g. `nats://localhost:4222`).
    pub async fn connect(url: &str) -> Result<Self> {
        let client = async_nats::connect(url).await.or_raise(|| ErrorKind::Transport)?;
        tracing::debug!(url, "connected to NATS");
        Ok(Self::from_client(client))
    }

    pub fn from_client(client: async_nats::Client) -> Self {
        Self { context: jetstream::new(client), deliveries: Mutex::new(HashMap::new()) }
    }

    async fn stream(&self, name: &str) -> Result<js_stream::Stream> {
        self.context.get_stream(name).await.map_err(|e| stream_error(name, e))
    }

    fn remember(&self, key: DeliveryKey, message: jetstream::Message) {
        self.deliveries.lock().unwrap_or_else(PoisonError::into_inner).insert(key, message);
    }

    fn take(&self, message: &Message) -> Option<jetstream::Message> {
        let key = (message.stream.clone(), message.durable.clone(), message.sequence);
        self.deliveries.lock().unwrap_or_else(PoisonError::into_inner).remove(&key)
    }

    fn convert(consumer: &Consumer, delivery: &jetstream::Message) -> Result<Message> {
        let info = delivery
            .info()
            .map_err(std::io::Error::other)
            .or_raise(|| ErrorKind::InvalidData("delivery metadata"))?;
        Ok(Message {
            stream: consumer.stream.clone(),
            durable: consumer.durable.clone(),
            subject: delivery.message.subject.to_string(),
            sequence: info.stream_sequence,
            payload: delivery.message.payload.to_vec(),
            deliveries: u32::try_from(info.delivered).unwrap_or(u32::MAX),
        })
    }
}

fn stream_error(name: &str, err: GetStreamError) -> Error {
    match err.kind() {
        GetStreamErrorKind::JetStream(e) if e.error_code() == ErrorCode::STREAM_NOT_FOUND => {
            Error::from(ErrorKind::StreamNotFound(name.to_string()))
        },
        _ => exn::Exn::from(err).raise(ErrorKind::Transport),
    }
}

fn consumer_error(durable: &str, err: ConsumerError) -> Error {
    match err.kind() {
        ConsumerErrorKind::JetStream(e) if e.error_code() == ErrorCode::CONSUMER_NOT_FOUND => {
            Error::from(ErrorKind::ConsumerNotFound(durable.to_string()))
        },
        _ => exn::Exn::from(err).raise(ErrorKind::Transport),
    }
}

fn stream_config(config: &StreamConfig) -> js_stream::Config {
    js_stream::Config {
        name: config.name.clone(),
        subjects: config.subjects.clone(),
        // Zero means unlimited.
        max_age: config.max_age.unwrap_or_default(),
        ..Default::default()
    }
}

fn consumer_config(config: &ConsumerConfig) -> pull::Config {
    pull::Config {
        durable_name: Some(config.durable.clone()),
        filter_subject: config.filter_subject.clone().unwrap_or_default(),
        deliver_policy: match config.deliver_policy {
            DeliverPolicy::All => js_consumer::DeliverPolicy::All,
            DeliverPolicy::New => js_consumer::DeliverPolicy::New,
        },
        ack_policy: js_consumer::AckPolicy::Explicit,
        ack_wait: config.ack_wait,
        ..Default::default()
    }
}

#[async_trait]
impl EventChannel for NatsChannel {
    #[instrument(skip(self, config), fields(stream = %config.name))]
    async fn ensure_stream(&self, config: &StreamConfig) -> Result<()> {
        if config.subjects.is_empty() {
            exn::bail!(ErrorKind::InvalidSubject(String::new()));
        }
        for pattern in &config.subjects {
            subject::validate_pattern(pattern)?;
        }
        let desired = stream_config(config);
        match self.stream(&config.name).await {
            Ok(_) => {
                self.context.update_stream(&desired).await.or_raise(|| ErrorKind::Transport)?;
            },
            Err(e) if matches!(&*e, ErrorKind::StreamNotFound(_)) => {
                self.context.create_stream(desired).await.or_raise(|| ErrorKind::Transport)?;
                tracing::info!(stream = %config.name, "created stream");
            },
            Err(e) => return Err(e),
        }
        Ok(())
    }

    #[instrument(skip(self, config), fields(durable = %config.durable))]
    async fn ensure_consumer(&self, stream: &str, config: &ConsumerConfig) -> Result<Consumer> {
        if let Some(filter) = &config.filter_subject {
            subject::validate_pattern(filter)?;
        }
        let js_stream = self.stream(stream).await?;
        js_stream
            .get_or_create_consumer::<pull::Config>(&config.durable, consumer_config(config))
            .await
            .or_raise(|| ErrorKind::Transport)?;
        Ok(Consumer { stream: stream.to_string(), durable: config.durable.clone() })
    }

    async fn publish(&self, subject: &str, payload: &[u8]) -> Result<Ack> {
        subject::validate_subject(subject)?;
        let sent = match self.context.publish(subject.to_string(), payload.to_vec().into()).await {
            Ok(sent) => sent,
            Err(e) => return Err(publish_error(subject, e)),
        };
        let ack = sent.await.map_err(|e| publish_error(subject, e))?;
        Ok(Ack { stream: ack.stream, sequence: ack.sequence })
    }

    async fn fetch(&self, consumer: &Consumer, max_batch: usize, max_wait: Duration) -> Result<Vec<Message>> {
        if max_batch == 0 {
            return Ok(Vec::new());
        }
        let js_consumer = self
            .stream(&consumer.stream)
            .await?
            .get_consumer::<pull::Config>(&consumer.durable)
            .await
            .map_err(|e| consumer_error(&consumer.durable, e))?;
        let deliveries = if max_wait.is_zero() {
            js_consumer.fetch().max_messages(max_batch).messages().await.or_raise(|| ErrorKind::Transport)?
        } else {
            js_consumer
                .batch()
                .max_messages(max_batch)
                .expires(max_wait.min(MAX_PULL_WAIT))
                .messages()
                .await
                .or_raise(|| ErrorKind::Transport)?
        };

        let mut deliveries = std::pin::pin!(deliveries);
        let mut batch = Vec::new();
        while let Some(delivery) = deliveries.next().await {
            let delivery = delivery.or_raise(|| ErrorKind::Transport)?;
            let message = Self::convert(consumer, &delivery)?;
            self.remember((message.stream.clone(), message.durable.clone(), message.sequence), delivery);
            batch.push(message);
        }
        Ok(batch)
    }

    async fn ack(&self, message: &Message) -> Result<()> {
        // Unknown deliveries were already settled, or belong to another
        // process; the server redelivers them if needed.
        let Some(delivery) = self.take(message) else {
            tracing::debug!(sequence = message.sequence, "ack for a delivery this channel does not hold");
            return Ok(());
        };
        delivery.ack().await.map_err(std::io::Error::other).or_raise(|| ErrorKind::Transport)
    }

    async fn nak(&self, message: &Message) -> Result<()> {
        let Some(delivery) = self.take(message) else {
            return Ok(());
        };
        delivery.ack_with(AckKind::Nak(None)).await.map_err(std::io::Error::other).or_raise(|| ErrorKind::Transport)
    }

    async fn stream_info(&self, stream: &str) -> Result<StreamInfo> {
        let mut js_stream = self.stream(stream).await?;
        let info = js_stream.info().await.or_raise(|| ErrorKind::Transport)?;
        Ok(StreamInfo {
            name: info.config.name.clone(),
            subjects: info.config.subjects.clone(),
            messages: info.state.messages,
            first_sequence: if info.state.messages == 0 { 0 } else { info.state.first_sequence },
            last_sequence: info.state.last_sequence,
        })
    }

    async fn consumer_info(&self, consumer: &Consumer) -> Result<ConsumerInfo> {
        let mut js_consumer = self
            .stream(&consumer.stream)
            .await?
            .get_consumer::<pull::Config>(&consumer.durable)
            .await
            .map_err(|e| consumer_error(&consumer.durable, e))?;
        let info = js_consumer.info().await.or_raise(|| ErrorKind::Transport)?;
        Ok(ConsumerInfo {
            stream: consumer.stream.clone(),
            durable: consumer.durable.clone(),
            cursor: info.delivered.stream_sequence,
            num_pending: info.num_pending,
            num_ack_pending: info.num_ack_pending as u64,
        })
    }
}

fn publish_error(subject: &str, err: async_nats::jetstream::context::PublishError) -> Error {
    match err.kind() {
        PublishErrorKind::StreamNotFound => Error::from(ErrorKind::NoStream(subject.to_string())),
        _ => exn::Exn::from(err).raise(ErrorKind::Transport),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_config_mapping() {
        let config = stream_config(&StreamConfig::new("BOOKS", ["books.*"]));
        assert_eq!(config.name, "BOOKS");
        assert_eq!(config.subjects, vec!["books.*".to_string()]);
        assert_eq!(config.max_age, Duration::ZERO);

        let aged = stream_config(&StreamConfig::new("BOOKS", ["books.*"]).with_max_age(Duration::from_secs(3600)));
        assert_eq!(aged.max_age, Duration::from_secs(3600));
    }

    #[test]
    fn test_consumer_config_mapping() {
        let config = consumer_config(
            &ConsumerConfig::new("books-deleter")
                .with_filter_subject("books.delete")
                .with_deliver_policy(DeliverPolicy::New)
                .with_ack_wait(Duration::from_secs(45)),
        );
        assert_eq!(config.durable_name.as_deref(), Some("books-deleter"));
        assert_eq!(config.filter_subject, "books.delete");
        assert_eq!(config.deliver_policy, js_consumer::DeliverPolicy::New);
        assert_eq!(config.ack_policy, js_consumer::AckPolicy::Explicit);
        assert_eq!(config.ack_wait, Duration::from_secs(45));

        let unfiltered = consumer_config(&ConsumerConfig::new("all"));
        assert!(unfiltered.filter_subject.is_empty());
        assert_eq!(unfiltered.deliver_policy, js_consumer::DeliverPolicy::All);
    }
}
