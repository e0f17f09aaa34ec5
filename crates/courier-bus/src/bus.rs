//! The cross-process message bus.
//!
//! Topics are append-only logs in the shared store (`mq:<topic>`) consumed
//! through one consumer group per topic, so each message is handled once
//! per group and acknowledged only after its handler returns. Delayed
//! messages wait in a sorted set (`mq:delay:<topic>`) scored by due time
//! until a [delay worker](crate::delay) moves them onto the log. Messages
//! whose handler keeps failing end up in `mq:dead-letter:<topic>`.
//!
//! When the shared store is disabled every operation succeeds without
//! doing anything.

use chrono::Utc;
use courier_store::{ReadCursor, SharedClient, SharedStore, StoreError, StreamEntry};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::delay::DelayWorker;
use crate::envelope::{DeadLetter, Envelope, DEFAULT_MAX_RETRY};
use crate::handler::Handler;

/// Stream field holding the serialized envelope.
pub(crate) const STREAM_FIELD: &str = "message";

pub(crate) fn topic_key(topic: &str) -> String {
    format!("mq:{topic}")
}

pub(crate) fn delay_key(topic: &str) -> String {
    format!("mq:delay:{topic}")
}

pub(crate) fn dead_letter_key(topic: &str) -> String {
    format!("mq:dead-letter:{topic}")
}

pub(crate) fn group_name(topic: &str) -> String {
    format!("consumer-group-{topic}")
}

/// Bus errors.
#[derive(Debug, Error)]
pub enum BusError {
    /// Shared store failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Payload or envelope could not be serialized.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Bus configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Retries granted to messages published without an explicit budget.
    #[serde(default = "default_max_retry")]
    pub default_max_retry: u32,

    /// Bounded wait of each blocking read.
    #[serde(default = "default_block_timeout")]
    pub block_timeout_ms: u64,

    /// Entries fetched per read.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Pause after a failed read.
    #[serde(default = "default_error_backoff")]
    pub error_backoff_ms: u64,

    /// Delay before the first retry, doubled per retry. Zero re-appends
    /// failed messages immediately.
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_ms: u64,

    /// Upper bound on the retry delay.
    #[serde(default = "default_max_retry_backoff")]
    pub max_retry_backoff_ms: u64,

    /// Tick of the delay workers.
    #[serde(default = "default_delay_poll_interval")]
    pub delay_poll_interval_ms: u64,

    /// Lease of the delay poller lock.
    #[serde(default = "default_delay_lock_ttl")]
    pub delay_lock_ttl_ms: u64,

    /// Consumer name within each group. Keep it stable across restarts so
    /// unacknowledged messages are picked up again; random when unset.
    #[serde(default)]
    pub consumer_name: Option<String>,
}

fn default_max_retry() -> u32 {
    DEFAULT_MAX_RETRY
}

fn default_block_timeout() -> u64 {
    5000
}

fn default_batch_size() -> usize {
    10
}

fn default_error_backoff() -> u64 {
    1000
}

fn default_retry_backoff() -> u64 {
    500
}

fn default_max_retry_backoff() -> u64 {
    30_000
}

fn default_delay_poll_interval() -> u64 {
    1000
}

fn default_delay_lock_ttl() -> u64 {
    10_000
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            default_max_retry: default_max_retry(),
            block_timeout_ms: default_block_timeout(),
            batch_size: default_batch_size(),
            error_backoff_ms: default_error_backoff(),
            retry_backoff_ms: default_retry_backoff(),
            max_retry_backoff_ms: default_max_retry_backoff(),
            delay_poll_interval_ms: default_delay_poll_interval(),
            delay_lock_ttl_ms: default_delay_lock_ttl(),
            consumer_name: None,
        }
    }
}

impl BusConfig {
    /// Delay before attempt number `retry` (1-based).
    #[must_use]
    pub fn retry_backoff(&self, retry: u32) -> Duration {
        if self.retry_backoff_ms == 0 {
            return Duration::ZERO;
        }
        let factor = 1u64 << retry.saturating_sub(1).min(20);
        let backoff = self.retry_backoff_ms.saturating_mul(factor);
        Duration::from_millis(backoff.min(self.max_retry_backoff_ms))
    }
}

struct Inner {
    client: SharedClient,
    config: BusConfig,
    consumer: String,
    workers: DashMap<String, DelayWorker>,
    shutdown: CancellationToken,
}

/// Handle to the message bus. Cheap to clone.
#[derive(Clone)]
pub struct MessageBus {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBus")
            .field("backend", &self.inner.client.backend_name())
            .field("consumer", &self.inner.consumer)
            .field("delay_workers", &self.inner.workers.len())
            .finish()
    }
}

impl MessageBus {
    /// Create a bus over a shared client.
    #[must_use]
    pub fn new(client: SharedClient, config: BusConfig) -> Self {
        let consumer = config
            .consumer_name
            .clone()
            .unwrap_or_else(|| format!("consumer-{}", uuid::Uuid::new_v4()));
        Self {
            inner: Arc::new(Inner {
                client,
                config,
                consumer,
                workers: DashMap::new(),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Whether messages actually go anywhere.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.inner.client.is_enabled()
    }

    #[must_use]
    pub fn config(&self) -> &BusConfig {
        &self.inner.config
    }

    /// This process's consumer name.
    #[must_use]
    pub fn consumer_name(&self) -> &str {
        &self.inner.consumer
    }

    fn store(&self) -> Option<&Arc<dyn SharedStore>> {
        self.inner.client.store()
    }

    fn key(&self, key: &str) -> String {
        self.inner.client.key(key)
    }

    /// Publish with the default retry budget. Returns the envelope id.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be serialized or the store
    /// rejects the append.
    pub async fn publish<T: Serialize + Sync + ?Sized>(&self, topic: &str, payload: &T) -> Result<String, BusError> {
        self.publish_with_retry(topic, payload, self.inner.config.default_max_retry)
            .await
    }

    /// Publish with an explicit retry budget.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be serialized or the store
    /// rejects the append.
    pub async fn publish_with_retry<T: Serialize + Sync + ?Sized>(
        &self,
        topic: &str,
        payload: &T,
        max_retry: u32,
    ) -> Result<String, BusError> {
        let envelope = Envelope::new(topic, serde_json::to_value(payload)?, max_retry);
        let Some(store) = self.store() else {
            debug!(topic = %topic, "Bus disabled, dropping publish");
            return Ok(envelope.id);
        };
        let entry = self.append(store.as_ref(), &envelope).await?;
        debug!(topic = %topic, id = %envelope.id, entry = %entry, "Published");
        Ok(envelope.id)
    }

    /// Schedule a message for delivery after `delay` and make sure this
    /// process runs a delay worker for the topic.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be serialized or the store
    /// rejects the write.
    pub async fn publish_delayed<T: Serialize + Sync + ?Sized>(
        &self,
        topic: &str,
        payload: &T,
        delay: Duration,
    ) -> Result<String, BusError> {
        let envelope = Envelope::new(
            topic,
            serde_json::to_value(payload)?,
            self.inner.config.default_max_retry,
        )
        .delayed_by(delay);
        let Some(store) = self.store() else {
            debug!(topic = %topic, "Bus disabled, dropping delayed publish");
            return Ok(envelope.id);
        };
        self.schedule(store.as_ref(), &envelope).await?;
        debug!(topic = %topic, id = %envelope.id, ?delay, "Scheduled");
        Ok(envelope.id)
    }

    async fn append(&self, store: &dyn SharedStore, envelope: &Envelope) -> Result<String, BusError> {
        let data = serde_json::to_string(envelope)?;
        Ok(store
            .xadd(&self.key(&topic_key(&envelope.topic)), STREAM_FIELD, &data)
            .await?)
    }

    /// Add to the scheduled set, due at the envelope timestamp.
    async fn schedule(&self, store: &dyn SharedStore, envelope: &Envelope) -> Result<(), BusError> {
        let data = serde_json::to_string(envelope)?;
        let due = envelope.timestamp.timestamp_millis() as f64;
        store
            .zadd(&self.key(&delay_key(&envelope.topic)), &data, due)
            .await?;
        self.ensure_delay_worker(&envelope.topic);
        Ok(())
    }

    fn ensure_delay_worker(&self, topic: &str) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        self.inner
            .workers
            .entry(topic.to_string())
            .or_insert_with(|| {
                DelayWorker::spawn(
                    self.inner.client.clone(),
                    topic.to_string(),
                    Duration::from_millis(self.inner.config.delay_poll_interval_ms.max(1)),
                    Duration::from_millis(self.inner.config.delay_lock_ttl_ms.max(1)),
                    self.inner.shutdown.child_token(),
                )
            });
    }

    /// Whether this process is currently the delay poller for `topic`.
    #[must_use]
    pub fn is_polling(&self, topic: &str) -> bool {
        self.inner
            .workers
            .get(topic)
            .is_some_and(|worker| worker.is_polling())
    }

    /// Topics this process runs a delay worker for, sorted.
    #[must_use]
    pub fn active_topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self
            .inner
            .workers
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        topics.sort();
        topics
    }

    /// Stop the delay worker of one topic, releasing its lease. Returns
    /// whether a worker was running. A later schedule or subscribe on the
    /// topic starts a new one.
    pub async fn stop_topic(&self, topic: &str) -> bool {
        let Some((_, worker)) = self.inner.workers.remove(topic) else {
            return false;
        };
        worker.stop().await;
        info!(topic = %topic, "Delay worker stopped");
        true
    }

    /// Consume a topic until `cancel` fires.
    ///
    /// Joins the topic's consumer group (creating it if needed), drains
    /// this consumer's unacknowledged entries, then reads new ones. Also
    /// starts a delay worker for the topic, so entries scheduled by
    /// processes that are gone still come due.
    ///
    /// # Errors
    ///
    /// Returns an error if the consumer group cannot be created.
    pub async fn subscribe<H: Handler>(
        &self,
        topic: &str,
        handler: H,
        cancel: CancellationToken,
    ) -> Result<JoinHandle<()>, BusError> {
        let Some(store) = self.store().cloned() else {
            debug!(topic = %topic, "Bus disabled, subscription is idle");
            return Ok(tokio::spawn(async move { cancel.cancelled().await }));
        };

        store
            .xgroup_create(&self.key(&topic_key(topic)), &group_name(topic))
            .await?;
        self.ensure_delay_worker(topic);
        info!(topic = %topic, consumer = %self.inner.consumer, "Subscribed");

        let consumer = Consumer {
            bus: self.clone(),
            store,
            topic: topic.to_string(),
            handler: Arc::new(handler),
        };
        Ok(tokio::spawn(consumer.run(cancel)))
    }

    /// Entries on the live log not yet acknowledged.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn queue_length(&self, topic: &str) -> Result<usize, BusError> {
        match self.store() {
            Some(store) => Ok(store.xlen(&self.key(&topic_key(topic))).await?),
            None => Ok(0),
        }
    }

    /// Delete the live log of a topic. Irreversible.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn purge(&self, topic: &str) -> Result<(), BusError> {
        if let Some(store) = self.store() {
            store.del(&self.key(&topic_key(topic))).await?;
            warn!(topic = %topic, "Topic purged");
        }
        Ok(())
    }

    /// Messages scheduled but not yet due.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn delayed_count(&self, topic: &str) -> Result<usize, BusError> {
        match self.store() {
            Some(store) => Ok(store.zcard(&self.key(&delay_key(topic))).await?),
            None => Ok(0),
        }
    }

    /// Dead-lettered messages of a topic, oldest first. Unreadable records
    /// are skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn dead_letters(&self, topic: &str) -> Result<Vec<DeadLetter>, BusError> {
        let Some(store) = self.store() else {
            return Ok(Vec::new());
        };
        let entries = store.xrange(&self.key(&dead_letter_key(topic)), None).await?;
        Ok(entries
            .iter()
            .filter_map(|entry| entry.field(STREAM_FIELD))
            .filter_map(|data| serde_json::from_str(data).ok())
            .collect())
    }

    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn purge_dead_letters(&self, topic: &str) -> Result<(), BusError> {
        if let Some(store) = self.store() {
            store.del(&self.key(&dead_letter_key(topic))).await?;
        }
        Ok(())
    }

    /// Stop every delay worker, releasing their leases. Subscriptions are
    /// stopped through their own cancellation tokens.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let topics: Vec<String> = self
            .inner
            .workers
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for topic in topics {
            if let Some((_, worker)) = self.inner.workers.remove(&topic) {
                worker.stop().await;
            }
        }
        info!("Message bus stopped");
    }

    /// Retry or dead-letter a message whose handler failed.
    async fn fail(&self, store: &dyn SharedStore, mut envelope: Envelope, reason: String) -> Result<(), BusError> {
        if envelope.can_retry() {
            envelope.retry += 1;
            let backoff = self.inner.config.retry_backoff(envelope.retry);
            warn!(
                topic = %envelope.topic,
                id = %envelope.id,
                retry = envelope.retry,
                max_retry = envelope.max_retry,
                ?backoff,
                error = %reason,
                "Handler failed, retrying"
            );
            if backoff.is_zero() {
                self.append(store, &envelope).await?;
            } else {
                envelope.timestamp = Utc::now();
                let envelope = envelope.delayed_by(backoff);
                self.schedule(store, &envelope).await?;
            }
        } else {
            error!(
                topic = %envelope.topic,
                id = %envelope.id,
                retry = envelope.retry,
                error = %reason,
                "Message exceeded max retries, dead-lettering"
            );
            let key = self.key(&dead_letter_key(&envelope.topic));
            let record = serde_json::to_string(&DeadLetter::new(envelope, reason))?;
            store.xadd(&key, STREAM_FIELD, &record).await?;
        }
        Ok(())
    }
}

/// One subscription's read loop.
struct Consumer {
    bus: MessageBus,
    store: Arc<dyn SharedStore>,
    topic: String,
    handler: Arc<dyn Handler>,
}

impl Consumer {
    async fn run(self, cancel: CancellationToken) {
        let key = self.bus.key(&topic_key(&self.topic));
        let group = group_name(&self.topic);
        let config = &self.bus.inner.config;
        let block = Duration::from_millis(config.block_timeout_ms);
        let mut cursor = ReadCursor::Pending;

        loop {
            let wait = match cursor {
                ReadCursor::Pending => None,
                ReadCursor::New => Some(block),
            };
            let read = tokio::select! {
                () = cancel.cancelled() => break,
                read = self.store.xread_group(
                    &key,
                    &group,
                    &self.bus.inner.consumer,
                    cursor,
                    config.batch_size,
                    wait,
                ) => read,
            };

            match read {
                Ok(entries) if entries.is_empty() => {
                    if cursor == ReadCursor::Pending {
                        debug!(topic = %self.topic, "Pending entries drained");
                        cursor = ReadCursor::New;
                    }
                }
                Ok(entries) => {
                    let mut settled = true;
                    for entry in entries {
                        settled &= self.process(&key, &group, entry).await;
                    }
                    if !settled {
                        cursor = ReadCursor::Pending;
                        self.pause(&cancel).await;
                    }
                }
                Err(err) if err.is_no_group() => {
                    warn!(topic = %self.topic, "Consumer group missing, recreating");
                    if let Err(err) = self.store.xgroup_create(&key, &group).await {
                        error!(topic = %self.topic, error = %err, "Failed to recreate consumer group");
                        self.pause(&cancel).await;
                    }
                }
                Err(err) => {
                    error!(topic = %self.topic, error = %err, "Read failed");
                    self.pause(&cancel).await;
                }
            }
        }

        debug!(topic = %self.topic, "Subscription stopped");
    }

    async fn pause(&self, cancel: &CancellationToken) {
        let backoff = Duration::from_millis(self.bus.inner.config.error_backoff_ms);
        tokio::select! {
            () = cancel.cancelled() => {}
            () = tokio::time::sleep(backoff) => {}
        }
    }

    /// Handle one entry. Returns `false` if it was left unacknowledged.
    async fn process(&self, key: &str, group: &str, entry: StreamEntry) -> bool {
        let envelope = entry
            .field(STREAM_FIELD)
            .map(serde_json::from_str::<Envelope>);

        match envelope {
            Some(Ok(envelope)) => {
                let id = envelope.id.clone();
                match self.handler.handle(envelope.clone()).await {
                    Ok(()) => debug!(topic = %self.topic, id = %id, "Handled"),
                    Err(err) => {
                        if let Err(err) = self.bus.fail(self.store.as_ref(), envelope, err.to_string()).await {
                            error!(topic = %self.topic, id = %id, error = %err, "Failed to record handler failure");
                            return false;
                        }
                    }
                }
            }
            Some(Err(err)) => {
                warn!(topic = %self.topic, entry = %entry.id, error = %err, "Dropping undecodable entry");
            }
            None => {
                warn!(topic = %self.topic, entry = %entry.id, "Dropping entry without payload");
            }
        }

        self.ack(key, group, &entry.id).await
    }

    /// Acknowledge and trim an entry. Returns `false` if the ack failed,
    /// leaving the entry pending for the next pending read.
    async fn ack(&self, key: &str, group: &str, id: &str) -> bool {
        let ids = [id.to_string()];
        if let Err(err) = self.store.xack(key, group, &ids).await {
            warn!(topic = %self.topic, entry = %id, error = %err, "Ack failed");
            return false;
        }
        if let Err(err) = self.store.xdel(key, &ids).await {
            warn!(topic = %self.topic, entry = %id, error = %err, "Failed to trim acknowledged entry");
        }
        true
    }
}
