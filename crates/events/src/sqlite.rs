//! SQLite-backed event log.
//!
//! Every stream is a range of rows in one `messages` table. A consumer is a
//! cursor (the highest sequence it has looked at) plus a `pending` set of
//! messages it has been handed but not yet acknowledged. All of it lives in
//! the database, so a restarted process picks up exactly where the previous
//! one stopped: anything it fetched but never acknowledged is simply handed
//! out again once its ack wait runs out.

use crate::channel::{
    Ack, Consumer, ConsumerConfig, ConsumerInfo, DeliverPolicy, EventChannel, Message, StreamConfig, StreamInfo,
};
use crate::error::{ErrorKind, Result};
use crate::subject;
use async_trait::async_trait;
use exn::ResultExt;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous};
use std::path::Path;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::instrument;

/// Embedded migrations that are run automatically on connect.
static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");
const MAX_CONNECTIONS: u32 = 4;
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
/// Rows read per query while scanning forward from a consumer's cursor.
const SCAN_CHUNK: i64 = 256;

/// Milliseconds since the Unix epoch, the unit of every timestamp column.
fn now_ms() -> i64 {
    i64::try_from(time::UtcDateTime::now().unix_timestamp_nanos() / 1_000_000).unwrap_or(i64::MAX)
}

fn millis(duration: Duration, what: &'static str) -> Result<i64> {
    i64::try_from(duration.as_millis()).or_raise(|| ErrorKind::InvalidData(what))
}

fn sequence(value: i64) -> Result<u64> {
    u64::try_from(value).or_raise(|| ErrorKind::InvalidData("sequence"))
}

/// Event channel persisted in a SQLite database.
///
/// Blocked [`fetch()`](EventChannel::fetch) calls are woken immediately by
/// publishes made through the same instance. Messages written by other
/// processes sharing the database file are noticed on the next poll.
#[derive(Debug)]
pub struct SqliteChannel {
    pool: SqlitePool,
    notify: Notify,
    poll_interval: Duration,
}

impl SqliteChannel {
    async fn new(options: SqliteConnectOptions, max: u32) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(max)
            .connect_with(options)
            .await
            .or_raise(|| ErrorKind::Database)?;
        let channel = Self { pool, notify: Notify::new(), poll_interval: DEFAULT_POLL_INTERVAL };
        channel.migrate().await?;
        Ok(channel)
    }

    /// Open (creating if needed) the event log at the given path.
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self> {
        let options = Self::base_options().filename(path.as_ref()).create_if_missing(true);
        Self::new(options, MAX_CONNECTIONS).await
    }

    /// Open a private in-memory event log.
    ///
    /// Limited to a single connection, otherwise every pooled connection
    /// would see its own empty database.
    pub async fn connect_in_memory() -> Result<Self> {
        Self::new(Self::base_options().filename(":memory:"), 1).await
    }

    /// How often a waiting fetch re-checks the database for messages that
    /// did not come through this instance.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    fn base_options() -> SqliteConnectOptions {
        SqliteConnectOptions::new()
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .synchronous(SqliteSynchronous::Normal)
            // Concurrent fetchers queue on the write lock.
            .busy_timeout(Duration::from_secs(5))
    }

    #[instrument("performing event log migrations", skip(self))]
    async fn migrate(&self) -> Result<()> {
        MIGRATOR.run(&self.pool).await.or_raise(|| ErrorKind::Migration)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// One non-blocking fetch attempt, in a single transaction.
    async fn try_fetch(&self, consumer: &Consumer, max_batch: usize) -> Result<Vec<Message>> {
        let limit = i64::try_from(max_batch).or_raise(|| ErrorKind::InvalidData("batch size"))?;
        let mut tx = self.pool.begin().await.or_raise(|| ErrorKind::Database)?;
        // Writing first takes the write lock up front; a transaction that
        // reads first cannot upgrade if another writer committed meanwhile.
        let state: Option<(i64, Option<String>, i64)> = sqlx::query_as(
            "UPDATE consumers SET cursor = cursor WHERE stream = ? AND durable = ? \
             RETURNING cursor, filter_subject, ack_wait_ms",
        )
        .bind(consumer.stream.as_str())
        .bind(consumer.durable.as_str())
        .fetch_optional(&mut *tx)
        .await
        .or_raise(|| ErrorKind::Database)?;
        let Some((mut cursor, filter, ack_wait_ms)) = state else {
            exn::bail!(ErrorKind::ConsumerNotFound(consumer.durable.clone()));
        };
        let redeliver_at = now_ms().saturating_add(ack_wait_ms);
        let mut batch = Vec::with_capacity(max_batch);

        let expired: Vec<(i64, i64, String, Vec<u8>)> = sqlx::query_as(
            "SELECT p.sequence, p.deliveries, m.subject, m.payload FROM pending p \
             JOIN messages m ON m.sequence = p.sequence \
             WHERE p.stream = ? AND p.durable = ? AND p.redeliver_at <= ? \
             ORDER BY p.sequence LIMIT ?",
        )
        .bind(consumer.stream.as_str())
        .bind(consumer.durable.as_str())
        .bind(now_ms())
        .bind(limit)
        .fetch_all(&mut *tx)
        .await
        .or_raise(|| ErrorKind::Database)?;
        for (seq, deliveries, subject, payload) in expired {
            sqlx::query(
                "UPDATE pending SET deliveries = deliveries + 1, redeliver_at = ? \
                 WHERE stream = ? AND durable = ? AND sequence = ?",
            )
            .bind(redeliver_at)
            .bind(consumer.stream.as_str())
            .bind(consumer.durable.as_str())
            .bind(seq)
            .execute(&mut *tx)
            .await
            .or_raise(|| ErrorKind::Database)?;
            let deliveries = u32::try_from(deliveries + 1).or_raise(|| ErrorKind::InvalidData("delivery count"))?;
            batch.push(Message {
                stream: consumer.stream.clone(),
                durable: consumer.durable.clone(),
                subject,
                sequence: sequence(seq)?,
                payload,
                deliveries,
            });
        }

        while batch.len() < max_batch {
            let rows: Vec<(i64, String, Vec<u8>)> = sqlx::query_as(
                "SELECT sequence, subject, payload FROM messages \
                 WHERE stream = ? AND sequence > ? ORDER BY sequence LIMIT ?",
            )
            .bind(consumer.stream.as_str())
            .bind(cursor)
            .bind(SCAN_CHUNK)
            .fetch_all(&mut *tx)
            .await
            .or_raise(|| ErrorKind::Database)?;
            let exhausted = rows.len() < SCAN_CHUNK as usize;
            for (seq, subject, payload) in rows {
                if batch.len() == max_batch {
                    break;
                }
                cursor = seq;
                if filter.as_deref().is_some_and(|pattern| !subject::matches(pattern, &subject)) {
                    continue;
                }
                sqlx::query(
                    "INSERT INTO pending (stream, durable, sequence, deliveries, redeliver_at) VALUES (?, ?, ?, 1, ?)",
                )
                .bind(consumer.stream.as_str())
                .bind(consumer.durable.as_str())
                .bind(seq)
                .bind(redeliver_at)
                .execute(&mut *tx)
                .await
                .or_raise(|| ErrorKind::Database)?;
                batch.push(Message {
                    stream: consumer.stream.clone(),
                    durable: consumer.durable.clone(),
                    subject,
                    sequence: sequence(seq)?,
                    payload,
                    deliveries: 1,
                });
            }
            if exhausted {
                break;
            }
        }

        sqlx::query("UPDATE consumers SET cursor = ? WHERE stream = ? AND durable = ?")
            .bind(cursor)
            .bind(consumer.stream.as_str())
            .bind(consumer.durable.as_str())
            .execute(&mut *tx)
            .await
            .or_raise(|| ErrorKind::Database)?;
        tx.commit().await.or_raise(|| ErrorKind::Database)?;
        Ok(batch)
    }

    async fn stream_exists(&self, stream: &str) -> Result<bool> {
        let found: Option<String> = sqlx::query_scalar("SELECT name FROM streams WHERE name = ?")
            .bind(stream)
            .fetch_optional(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(found.is_some())
    }
}

#[async_trait]
impl EventChannel for SqliteChannel {
    #[instrument(skip(self), fields(stream = %config.name))]
    async fn ensure_stream(&self, config: &StreamConfig) -> Result<()> {
        if config.name.is_empty() || config.name.contains(['.', '*', '>']) {
            exn::bail!(ErrorKind::InvalidSubject(config.name.clone()));
        }
        if config.subjects.is_empty() {
            exn::bail!(ErrorKind::InvalidSubject(String::new()));
        }
        for pattern in &config.subjects {
            subject::validate_pattern(pattern)?;
        }
        let max_age_ms = config.max_age.map(|age| millis(age, "max age")).transpose()?;

        let mut tx = self.pool.begin().await.or_raise(|| ErrorKind::Database)?;
        sqlx::query(
            "INSERT INTO streams (name, max_age_ms) VALUES (?, ?) \
             ON CONFLICT (name) DO UPDATE SET max_age_ms = excluded.max_age_ms",
        )
        .bind(config.name.as_str())
        .bind(max_age_ms)
        .execute(&mut *tx)
        .await
        .or_raise(|| ErrorKind::Database)?;
        for pattern in &config.subjects {
            let owner: Option<String> =
                sqlx::query_scalar("SELECT stream FROM stream_subjects WHERE pattern = ? AND stream != ?")
                    .bind(pattern.as_str())
                    .bind(config.name.as_str())
                    .fetch_optional(&mut *tx)
                    .await
                    .or_raise(|| ErrorKind::Database)?;
            if let Some(stream) = owner {
                exn::bail!(ErrorKind::SubjectOverlap { subject: pattern.clone(), stream });
            }
        }
        sqlx::query("DELETE FROM stream_subjects WHERE stream = ?")
            .bind(config.name.as_str())
            .execute(&mut *tx)
            .await
            .or_raise(|| ErrorKind::Database)?;
        for pattern in &config.subjects {
            sqlx::query("INSERT OR IGNORE INTO stream_subjects (pattern, stream) VALUES (?, ?)")
                .bind(pattern.as_str())
                .bind(config.name.as_str())
                .execute(&mut *tx)
                .await
                .or_raise(|| ErrorKind::Database)?;
        }
        tx.commit().await.or_raise(|| ErrorKind::Database)?;
        tracing::debug!(subjects = ?config.subjects, "stream ready");
        Ok(())
    }

    #[instrument(skip(self, config), fields(durable = %config.durable))]
    async fn ensure_consumer(&self, stream: &str, config: &ConsumerConfig) -> Result<Consumer> {
        if config.durable.is_empty() {
            exn::bail!(ErrorKind::InvalidSubject(config.durable.clone()));
        }
        if let Some(filter) = &config.filter_subject {
            subject::validate_pattern(filter)?;
        }
        if !self.stream_exists(stream).await? {
            exn::bail!(ErrorKind::StreamNotFound(stream.to_string()));
        }
        let ack_wait_ms = millis(config.ack_wait, "ack wait")?;
        if ack_wait_ms <= 0 {
            exn::bail!(ErrorKind::InvalidData("ack wait"));
        }
        let initial_cursor: i64 = match config.deliver_policy {
            DeliverPolicy::All => 0,
            DeliverPolicy::New => sqlx::query_scalar("SELECT COALESCE(MAX(sequence), 0) FROM messages WHERE stream = ?")
                .bind(stream)
                .fetch_one(&self.pool)
                .await
                .or_raise(|| ErrorKind::Database)?,
        };
        sqlx::query(
            "INSERT INTO consumers (stream, durable, filter_subject, deliver_policy, ack_wait_ms, cursor) \
             VALUES (?, ?, ?, ?, ?, ?) \
             ON CONFLICT (stream, durable) DO UPDATE SET \
                 filter_subject = excluded.filter_subject, \
                 deliver_policy = excluded.deliver_policy, \
                 ack_wait_ms = excluded.ack_wait_ms",
        )
        .bind(stream)
        .bind(config.durable.as_str())
        .bind(config.filter_subject.as_deref())
        .bind(config.deliver_policy.as_str())
        .bind(ack_wait_ms)
        .bind(initial_cursor)
        .execute(&self.pool)
        .await
        .or_raise(|| ErrorKind::Database)?;
        Ok(Consumer { stream: stream.to_string(), durable: config.durable.clone() })
    }

    async fn publish(&self, subject: &str, payload: &[u8]) -> Result<Ack> {
        subject::validate_subject(subject)?;
        let owners: Vec<(String, String, Option<i64>)> = sqlx::query_as(
            "SELECT ss.pattern, s.name, s.max_age_ms FROM stream_subjects ss \
             JOIN streams s ON s.name = ss.stream ORDER BY s.name, ss.pattern",
        )
        .fetch_all(&self.pool)
        .await
        .or_raise(|| ErrorKind::Database)?;
        let Some((_, stream, max_age_ms)) = owners.into_iter().find(|(pattern, _, _)| subject::matches(pattern, subject))
        else {
            exn::bail!(ErrorKind::NoStream(subject.to_string()));
        };

        let now = now_ms();
        let mut tx = self.pool.begin().await.or_raise(|| ErrorKind::Database)?;
        let seq: i64 = sqlx::query_scalar(
            "INSERT INTO messages (stream, subject, payload, published_at) VALUES (?, ?, ?, ?) RETURNING sequence",
        )
        .bind(stream.as_str())
        .bind(subject)
        .bind(payload)
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .or_raise(|| ErrorKind::Database)?;
        if let Some(max_age_ms) = max_age_ms {
            let pruned = sqlx::query("DELETE FROM messages WHERE stream = ? AND published_at < ?")
                .bind(stream.as_str())
                .bind(now.saturating_sub(max_age_ms))
                .execute(&mut *tx)
                .await
                .or_raise(|| ErrorKind::Database)?
                .rows_affected();
            if pruned > 0 {
                tracing::debug!(stream, pruned, "discarded expired messages");
            }
        }
        tx.commit().await.or_raise(|| ErrorKind::Database)?;
        self.notify.notify_waiters();
        Ok(Ack { stream, sequence: sequence(seq)? })
    }

    async fn fetch(&self, consumer: &Consumer, max_batch: usize, max_wait: Duration) -> Result<Vec<Message>> {
        if max_batch == 0 {
            return Ok(Vec::new());
        }
        // No deadline at all when `max_wait` is too large to represent.
        let deadline = Instant::now().checked_add(max_wait);
        loop {
            // Registered before looking, so a publish landing between the
            // query and the wait below still wakes us.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let batch = self.try_fetch(consumer, max_batch).await?;
            let now = Instant::now();
            if !batch.is_empty() || deadline.is_some_and(|deadline| now >= deadline) {
                return Ok(batch);
            }
            let nap = deadline.map_or(self.poll_interval, |deadline| self.poll_interval.min(deadline - now));
            tokio::select! {
                () = &mut notified => {},
                () = tokio::time::sleep(nap) => {},
            }
        }
    }

    async fn ack(&self, message: &Message) -> Result<()> {
        let seq = i64::try_from(message.sequence).or_raise(|| ErrorKind::InvalidData("sequence"))?;
        let removed = sqlx::query("DELETE FROM pending WHERE stream = ? AND durable = ? AND sequence = ?")
            .bind(message.stream.as_str())
            .bind(message.durable.as_str())
            .bind(seq)
            .execute(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?
            .rows_affected();
        if removed == 0 {
            tracing::debug!(stream = %message.stream, sequence = message.sequence, "message was already acknowledged");
        }
        Ok(())
    }

    async fn nak(&self, message: &Message) -> Result<()> {
        let seq = i64::try_from(message.sequence).or_raise(|| ErrorKind::InvalidData("sequence"))?;
        sqlx::query("UPDATE pending SET redeliver_at = 0 WHERE stream = ? AND durable = ? AND sequence = ?")
            .bind(message.stream.as_str())
            .bind(message.durable.as_str())
            .bind(seq)
            .execute(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        self.notify.notify_waiters();
        Ok(())
    }

    async fn stream_info(&self, stream: &str) -> Result<StreamInfo> {
        if !self.stream_exists(stream).await? {
            exn::bail!(ErrorKind::StreamNotFound(stream.to_string()));
        }
        let subjects: Vec<String> =
            sqlx::query_scalar("SELECT pattern FROM stream_subjects WHERE stream = ? ORDER BY pattern")
                .bind(stream)
                .fetch_all(&self.pool)
                .await
                .or_raise(|| ErrorKind::Database)?;
        let (messages, first, last): (i64, Option<i64>, Option<i64>) =
            sqlx::query_as("SELECT COUNT(*), MIN(sequence), MAX(sequence) FROM messages WHERE stream = ?")
                .bind(stream)
                .fetch_one(&self.pool)
                .await
                .or_raise(|| ErrorKind::Database)?;
        Ok(StreamInfo {
            name: stream.to_string(),
            subjects,
            messages: sequence(messages)?,
            first_sequence: sequence(first.unwrap_or_default())?,
            last_sequence: sequence(last.unwrap_or_default())?,
        })
    }

    async fn consumer_info(&self, consumer: &Consumer) -> Result<ConsumerInfo> {
        let state: Option<(i64, Option<String>)> =
            sqlx::query_as("SELECT cursor, filter_subject FROM consumers WHERE stream = ? AND durable = ?")
                .bind(consumer.stream.as_str())
                .bind(consumer.durable.as_str())
                .fetch_optional(&self.pool)
                .await
                .or_raise(|| ErrorKind::Database)?;
        let Some((cursor, filter)) = state else {
            exn::bail!(ErrorKind::ConsumerNotFound(consumer.durable.clone()));
        };
        let upcoming: Vec<String> = sqlx::query_scalar("SELECT subject FROM messages WHERE stream = ? AND sequence > ?")
            .bind(consumer.stream.as_str())
            .bind(cursor)
            .fetch_all(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        let num_pending = upcoming
            .iter()
            .filter(|subject| filter.as_deref().is_none_or(|pattern| subject::matches(pattern, subject)))
            .count() as u64;
        let ack_pending: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM pending WHERE stream = ? AND durable = ?")
            .bind(consumer.stream.as_str())
            .bind(consumer.durable.as_str())
            .fetch_one(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(ConsumerInfo {
            stream: consumer.stream.clone(),
            durable: consumer.durable.clone(),
            cursor: sequence(cursor)?,
            num_pending,
            num_ack_pending: sequence(ack_pending)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const SUBJECT: &str = "books.delete";

    async fn channel() -> SqliteChannel {
        let channel = SqliteChannel::connect_in_memory().await.unwrap();
        channel.ensure_stream(&StreamConfig::new("BOOKS", ["books.*"])).await.unwrap();
        channel
    }

    async fn consumer(channel: &SqliteChannel, ack_wait: Duration) -> Consumer {
        let config = ConsumerConfig::new("books-deleter").with_filter_subject(SUBJECT).with_ack_wait(ack_wait);
        channel.ensure_consumer("BOOKS", &config).await.unwrap()
    }

    #[tokio::test]
    async fn test_publish_without_stream() {
        let channel = SqliteChannel::connect_in_memory().await.unwrap();
        let err = channel.publish(SUBJECT, b"{}").await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::NoStream(_)));
    }

    #[tokio::test]
    async fn test_publish_invalid_subject() {
        let channel = channel().await;
        let err = channel.publish("books.*", b"{}").await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::InvalidSubject(_)));
    }

    #[tokio::test]
    async fn test_ensure_stream_is_idempotent() {
        let channel = channel().await;
        channel.ensure_stream(&StreamConfig::new("BOOKS", ["books.*"])).await.unwrap();
        let info = channel.stream_info("BOOKS").await.unwrap();
        assert_eq!(info.subjects, vec!["books.*".to_string()]);
        assert_eq!(info.messages, 0);
        assert_eq!(info.first_sequence, 0);
    }

    #[tokio::test]
    async fn test_subject_overlap_rejected() {
        let channel = channel().await;
        let err = channel.ensure_stream(&StreamConfig::new("OTHER", ["books.*"])).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::SubjectOverlap { stream, .. } if stream == "BOOKS"));
        // The rejected stream must not have been half-created.
        assert!(channel.stream_info("OTHER").await.is_err());
    }

    #[tokio::test]
    async fn test_consumer_on_missing_stream() {
        let channel = channel().await;
        let err = channel.ensure_consumer("NOPE", &ConsumerConfig::new("x")).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::StreamNotFound(_)));
    }

    #[tokio::test]
    async fn test_fetch_in_order_and_respects_batch_size() {
        let channel = channel().await;
        let consumer = consumer(&channel, Duration::from_secs(30)).await;
        for i in 0..5 {
            channel.publish(SUBJECT, format!("{i}").as_bytes()).await.unwrap();
        }
        let first = channel.fetch(&consumer, 3, Duration::ZERO).await.unwrap();
        let payloads: Vec<_> = first.iter().map(|m| m.payload.clone()).collect();
        assert_eq!(payloads, vec![b"0".to_vec(), b"1".to_vec(), b"2".to_vec()]);
        let second = channel.fetch(&consumer, 3, Duration::ZERO).await.unwrap();
        assert_eq!(second.len(), 2);
        assert!(second.iter().all(|m| m.deliveries == 1));
        assert!(channel.fetch(&consumer, 3, Duration::ZERO).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_filter_subject_skips_other_messages() {
        let channel = channel().await;
        let consumer = consumer(&channel, Duration::from_secs(30)).await;
        channel.publish("books.created", b"ignored").await.unwrap();
        channel.publish(SUBJECT, b"wanted").await.unwrap();
        let batch = channel.fetch(&consumer, 10, Duration::ZERO).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].payload, b"wanted");
        let info = channel.consumer_info(&consumer).await.unwrap();
        assert_eq!(info.cursor, batch[0].sequence);
        assert_eq!(info.num_pending, 0);
        assert_eq!(info.num_ack_pending, 1);
    }

    #[tokio::test]
    async fn test_ack_removes_from_pending() {
        let channel = channel().await;
        let consumer = consumer(&channel, Duration::from_millis(50)).await;
        channel.publish(SUBJECT, b"x").await.unwrap();
        let batch = channel.fetch(&consumer, 10, Duration::ZERO).await.unwrap();
        channel.ack(&batch[0]).await.unwrap();
        // Acknowledging twice is harmless.
        channel.ack(&batch[0]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(channel.fetch(&consumer, 10, Duration::ZERO).await.unwrap().is_empty());
        assert_eq!(channel.consumer_info(&consumer).await.unwrap().num_ack_pending, 0);
    }

    #[tokio::test]
    async fn test_unacked_message_is_redelivered_after_ack_wait() {
        let channel = channel().await;
        let consumer = consumer(&channel, Duration::from_millis(50)).await;
        channel.publish(SUBJECT, b"x").await.unwrap();
        let first = channel.fetch(&consumer, 10, Duration::ZERO).await.unwrap();
        assert_eq!(first.len(), 1);
        // Still inside the ack wait: nothing to hand out.
        assert!(channel.fetch(&consumer, 10, Duration::ZERO).await.unwrap().is_empty());
        tokio::time::sleep(Duration::from_millis(100)).await;
        let second = channel.fetch(&consumer, 10, Duration::ZERO).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].sequence, first[0].sequence);
        assert_eq!(second[0].deliveries, 2);
    }

    #[tokio::test]
    async fn test_nak_redelivers_immediately() {
        let channel = channel().await;
        let consumer = consumer(&channel, Duration::from_secs(30)).await;
        channel.publish(SUBJECT, b"x").await.unwrap();
        let first = channel.fetch(&consumer, 10, Duration::ZERO).await.unwrap();
        channel.nak(&first[0]).await.unwrap();
        let second = channel.fetch(&consumer, 10, Duration::ZERO).await.unwrap();
        assert_eq!(second[0].sequence, first[0].sequence);
        assert_eq!(second[0].deliveries, 2);
    }

    #[tokio::test]
    async fn test_fetch_times_out_empty() {
        let channel = channel().await;
        let consumer = consumer(&channel, Duration::from_secs(30)).await;
        let started = std::time::Instant::now();
        let batch = channel.fetch(&consumer, 10, Duration::from_millis(50)).await.unwrap();
        assert!(batch.is_empty());
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_publish_wakes_waiting_fetch() {
        let channel = Arc::new(channel().await.with_poll_interval(Duration::from_secs(60)));
        let consumer = consumer(&channel, Duration::from_secs(30)).await;
        let waiter = {
            let channel = Arc::clone(&channel);
            tokio::spawn(async move { channel.fetch(&consumer, 10, Duration::from_secs(30)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        channel.publish(SUBJECT, b"wake").await.unwrap();
        let batch = tokio::time::timeout(Duration::from_secs(5), waiter).await.unwrap().unwrap().unwrap();
        assert_eq!(batch[0].payload, b"wake");
    }

    #[tokio::test]
    async fn test_unbounded_wait_does_not_overflow() {
        let channel = Arc::new(channel().await.with_poll_interval(Duration::from_millis(20)));
        let consumer = consumer(&channel, Duration::from_secs(30)).await;
        let waiter = {
            let channel = Arc::clone(&channel);
            tokio::spawn(async move { channel.fetch(&consumer, 10, Duration::MAX).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        channel.publish(SUBJECT, b"late").await.unwrap();
        let batch = tokio::time::timeout(Duration::from_secs(5), waiter).await.unwrap().unwrap().unwrap();
        assert_eq!(batch[0].payload, b"late");
    }

    #[tokio::test]
    async fn test_deliver_new_skips_backlog() {
        let channel = channel().await;
        channel.publish(SUBJECT, b"old").await.unwrap();
        let config = ConsumerConfig::new("tail").with_deliver_policy(DeliverPolicy::New);
        let consumer = channel.ensure_consumer("BOOKS", &config).await.unwrap();
        channel.publish(SUBJECT, b"new").await.unwrap();
        let batch = channel.fetch(&consumer, 10, Duration::ZERO).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].payload, b"new");
    }

    #[tokio::test]
    async fn test_independent_consumers() {
        let channel = channel().await;
        let a = channel.ensure_consumer("BOOKS", &ConsumerConfig::new("a")).await.unwrap();
        let b = channel.ensure_consumer("BOOKS", &ConsumerConfig::new("b")).await.unwrap();
        channel.publish(SUBJECT, b"x").await.unwrap();
        assert_eq!(channel.fetch(&a, 10, Duration::ZERO).await.unwrap().len(), 1);
        assert_eq!(channel.fetch(&b, 10, Duration::ZERO).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_max_age_prunes_on_publish() {
        let channel = SqliteChannel::connect_in_memory().await.unwrap();
        let config = StreamConfig::new("SHORT", ["short.>"]).with_max_age(Duration::from_millis(10));
        channel.ensure_stream(&config).await.unwrap();
        channel.publish("short.a", b"1").await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        let ack = channel.publish("short.b", b"2").await.unwrap();
        let info = channel.stream_info("SHORT").await.unwrap();
        assert_eq!(info.messages, 1);
        assert_eq!(info.first_sequence, ack.sequence);
    }

    #[tokio::test]
    async fn test_cursor_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.db");
        let config = ConsumerConfig::new("books-deleter").with_filter_subject(SUBJECT);
        {
            let channel = SqliteChannel::connect(&path).await.unwrap();
            channel.ensure_stream(&StreamConfig::new("BOOKS", ["books.*"])).await.unwrap();
            let consumer = channel.ensure_consumer("BOOKS", &config).await.unwrap();
            channel.publish(SUBJECT, b"first").await.unwrap();
            channel.publish(SUBJECT, b"second").await.unwrap();
            let batch = channel.fetch(&consumer, 1, Duration::ZERO).await.unwrap();
            channel.ack(&batch[0]).await.unwrap();
            channel.close().await;
        }
        let channel = SqliteChannel::connect(&path).await.unwrap();
        channel.ensure_stream(&StreamConfig::new("BOOKS", ["books.*"])).await.unwrap();
        let consumer = channel.ensure_consumer("BOOKS", &config).await.unwrap();
        let batch = channel.fetch(&consumer, 10, Duration::ZERO).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].payload, b"second");
        channel.close().await;
    }
}
