//! Message bus behaviour against the in-memory store.

use async_trait::async_trait;
use courier_bus::{BusConfig, Envelope, Handler, HandlerError, MessageBus};
use courier_store::{
    Batch, MemoryStore, MessageStream, ReadCursor, SharedClient, SharedStore, StoreError,
    StoreResult, StreamEntry,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn fast_config() -> BusConfig {
    BusConfig {
        block_timeout_ms: 50,
        error_backoff_ms: 50,
        retry_backoff_ms: 0,
        delay_poll_interval_ms: 50,
        ..Default::default()
    }
}

async fn eventually<F, Fut>(within: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + within;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check().await
}

/// Handler failing its first `failures` calls, counting every call.
fn flaky(failures: usize, calls: Arc<AtomicUsize>) -> impl Handler {
    move |_envelope: Envelope| {
        let calls = calls.clone();
        async move {
            if calls.fetch_add(1, Ordering::SeqCst) < failures {
                Err::<(), HandlerError>("payment declined".into())
            } else {
                Ok(())
            }
        }
    }
}

/// Memory store whose first `ack_failures` acks fail.
struct FailingAcks {
    inner: MemoryStore,
    ack_failures: AtomicUsize,
}

impl FailingAcks {
    fn new(ack_failures: usize) -> Self {
        Self {
            inner: MemoryStore::new(),
            ack_failures: AtomicUsize::new(ack_failures),
        }
    }
}

#[async_trait]
impl SharedStore for FailingAcks {
    fn name(&self) -> &'static str {
        "failing-acks"
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        self.inner.set(key, value, ttl).await
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        self.inner.set_nx(key, value, ttl).await
    }

    async fn del(&self, key: &str) -> StoreResult<bool> {
        self.inner.del(key).await
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        self.inner.exists(key).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        self.inner.expire(key, ttl).await
    }

    async fn ttl(&self, key: &str) -> StoreResult<Option<Duration>> {
        self.inner.ttl(key).await
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> StoreResult<bool> {
        self.inner.compare_and_delete(key, expected).await
    }

    async fn compare_and_expire(&self, key: &str, expected: &str, ttl: Duration) -> StoreResult<bool> {
        self.inner.compare_and_expire(key, expected, ttl).await
    }

    async fn hget_all(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        self.inner.hget_all(key).await
    }

    async fn hlen(&self, key: &str) -> StoreResult<usize> {
        self.inner.hlen(key).await
    }

    async fn hexists(&self, key: &str, field: &str) -> StoreResult<bool> {
        self.inner.hexists(key, field).await
    }

    async fn hkeys(&self, key: &str) -> StoreResult<Vec<String>> {
        self.inner.hkeys(key).await
    }

    async fn smembers(&self, key: &str) -> StoreResult<Vec<String>> {
        self.inner.smembers(key).await
    }

    async fn scan_prefix(&self, prefix: &str) -> StoreResult<Vec<String>> {
        self.inner.scan_prefix(prefix).await
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> StoreResult<()> {
        self.inner.zadd(key, member, score).await
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
        limit: Option<usize>,
    ) -> StoreResult<Vec<String>> {
        self.inner.zrange_by_score(key, min, max, limit).await
    }

    async fn zrem(&self, key: &str, member: &str) -> StoreResult<bool> {
        self.inner.zrem(key, member).await
    }

    async fn zcard(&self, key: &str) -> StoreResult<usize> {
        self.inner.zcard(key).await
    }

    async fn xadd(&self, key: &str, field: &str, value: &str) -> StoreResult<String> {
        self.inner.xadd(key, field, value).await
    }

    async fn xlen(&self, key: &str) -> StoreResult<usize> {
        self.inner.xlen(key).await
    }

    async fn xdel(&self, key: &str, ids: &[String]) -> StoreResult<usize> {
        self.inner.xdel(key, ids).await
    }

    async fn xrange(&self, key: &str, count: Option<usize>) -> StoreResult<Vec<StreamEntry>> {
        self.inner.xrange(key, count).await
    }

    async fn xgroup_create(&self, key: &str, group: &str) -> StoreResult<()> {
        self.inner.xgroup_create(key, group).await
    }

    async fn xread_group(
        &self,
        key: &str,
        group: &str,
        consumer: &str,
        cursor: ReadCursor,
        count: usize,
        block: Option<Duration>,
    ) -> StoreResult<Vec<StreamEntry>> {
        self.inner
            .xread_group(key, group, consumer, cursor, count, block)
            .await
    }

    async fn xack(&self, key: &str, group: &str, ids: &[String]) -> StoreResult<usize> {
        let failing = self
            .ack_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(StoreError::Backend("connection reset".into()));
        }
        self.inner.xack(key, group, ids).await
    }

    async fn publish(&self, channel: &str, payload: &str) -> StoreResult<usize> {
        self.inner.publish(channel, payload).await
    }

    async fn psubscribe(&self, patterns: &[String]) -> StoreResult<MessageStream> {
        self.inner.psubscribe(patterns).await
    }

    async fn exec_batch(&self, batch: Batch) -> StoreResult<()> {
        self.inner.exec_batch(batch).await
    }
}

#[tokio::test]
async fn test_orders_dead_letter_after_max_retry() {
    let bus = &MessageBus::new(SharedClient::memory(), fast_config());
    let cancel = CancellationToken::new();
    let calls = &Arc::new(AtomicUsize::new(0));

    bus.subscribe("orders", flaky(usize::MAX, calls.clone()), cancel.clone())
        .await
        .unwrap();
    bus.publish_with_retry("orders", &json!({"id": "42"}), 3)
        .await
        .unwrap();

    assert!(
        eventually(Duration::from_secs(3), || async move {
            bus.dead_letters("orders").await.unwrap().len() == 1
                && bus.queue_length("orders").await.unwrap() == 0
        })
        .await
    );
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(calls.load(Ordering::SeqCst), 4);
    let dead = bus.dead_letters("orders").await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].original_message.retry, 3);
    assert_eq!(dead[0].original_message.payload["id"], "42");
    assert_eq!(dead[0].error, "payment declined");
    assert_eq!(bus.queue_length("orders").await.unwrap(), 0);

    cancel.cancel();
}

#[tokio::test]
async fn test_success_on_second_attempt() {
    let bus = &MessageBus::new(SharedClient::memory(), fast_config());
    let cancel = CancellationToken::new();
    let calls = &Arc::new(AtomicUsize::new(0));

    bus.subscribe("orders", flaky(1, calls.clone()), cancel.clone())
        .await
        .unwrap();
    bus.publish("orders", &json!({"id": "42"})).await.unwrap();

    assert!(
        eventually(Duration::from_secs(3), || async move {
            calls.load(Ordering::SeqCst) == 2 && bus.queue_length("orders").await.unwrap() == 0
        })
        .await
    );
    assert!(bus.dead_letters("orders").await.unwrap().is_empty());

    cancel.cancel();
}

#[tokio::test]
async fn test_retry_backoff_goes_through_schedule() {
    let config = BusConfig {
        retry_backoff_ms: 300,
        ..fast_config()
    };
    let bus = &MessageBus::new(SharedClient::memory(), config);
    let cancel = CancellationToken::new();
    let calls = &Arc::new(AtomicUsize::new(0));

    bus.subscribe("orders", flaky(1, calls.clone()), cancel.clone())
        .await
        .unwrap();
    bus.publish("orders", &json!({"id": "7"})).await.unwrap();

    assert!(
        eventually(Duration::from_secs(2), || async move {
            bus.delayed_count("orders").await.unwrap() == 1
        })
        .await
    );
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    assert!(
        eventually(Duration::from_secs(3), || async move {
            calls.load(Ordering::SeqCst) == 2 && bus.delayed_count("orders").await.unwrap() == 0
        })
        .await
    );

    cancel.cancel();
    bus.shutdown().await;
}

#[tokio::test]
async fn test_delayed_alerts_become_due() {
    let bus = &MessageBus::new(SharedClient::memory(), fast_config());

    bus.publish_delayed("alerts", &json!({"level": "high"}), Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(bus.queue_length("alerts").await.unwrap(), 0);
    assert_eq!(bus.delayed_count("alerts").await.unwrap(), 1);

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(bus.queue_length("alerts").await.unwrap(), 0);
    assert!(bus.is_polling("alerts"));

    assert!(
        eventually(Duration::from_secs(2), || async move {
            bus.queue_length("alerts").await.unwrap() >= 1
        })
        .await
    );
    assert_eq!(bus.delayed_count("alerts").await.unwrap(), 0);

    bus.shutdown().await;
    assert!(!bus.is_polling("alerts"));
}

#[tokio::test]
async fn test_consumer_sees_publish_order() {
    let bus = &MessageBus::new(SharedClient::memory(), fast_config());
    let cancel = CancellationToken::new();
    let seen = &Arc::new(Mutex::new(Vec::new()));

    let sink = seen.clone();
    bus.subscribe(
        "events",
        move |envelope: Envelope| {
            let sink = sink.clone();
            async move {
                sink.lock().unwrap().push(envelope.payload);
                Ok::<(), HandlerError>(())
            }
        },
        cancel.clone(),
    )
    .await
    .unwrap();

    for i in 0..25 {
        bus.publish("events", &i).await.unwrap();
    }

    assert!(
        eventually(Duration::from_secs(3), || async move {
            seen.lock().unwrap().len() == 25
        })
        .await
    );
    let expected: Vec<Value> = (0..25).map(Value::from).collect();
    assert_eq!(*seen.lock().unwrap(), expected);

    cancel.cancel();
}

#[tokio::test]
async fn test_single_delay_poller_across_processes() {
    let client = SharedClient::memory();
    let buses: &Vec<MessageBus> = &(0..3)
        .map(|_| MessageBus::new(client.clone(), fast_config()))
        .collect();

    for bus in buses {
        bus.publish_delayed("jobs", &json!({}), Duration::from_secs(3600))
            .await
            .unwrap();
    }

    tokio::time::sleep(Duration::from_millis(300)).await;
    let leaders: Vec<usize> = (0..3).filter(|&i| buses[i].is_polling("jobs")).collect();
    assert_eq!(leaders.len(), 1);

    // The lease moves on when the poller stops.
    let leader = leaders[0];
    buses[leader].shutdown().await;
    assert!(
        eventually(Duration::from_secs(2), || async move {
            (0..3)
                .filter(|&i| i != leader)
                .filter(|&i| buses[i].is_polling("jobs"))
                .count()
                == 1
        })
        .await
    );

    for bus in buses {
        bus.shutdown().await;
    }
}

#[tokio::test]
async fn test_pending_entries_recovered_on_restart() {
    let client = SharedClient::memory();
    let store = client.store().unwrap().clone();
    let config = BusConfig {
        consumer_name: Some("worker-1".into()),
        ..fast_config()
    };

    let publisher = MessageBus::new(client.clone(), config.clone());
    store
        .xgroup_create("mq:orders", "consumer-group-orders")
        .await
        .unwrap();
    publisher.publish("orders", &json!({"id": "1"})).await.unwrap();

    // A previous run read the entry and died before acknowledging it.
    let taken = store
        .xread_group(
            "mq:orders",
            "consumer-group-orders",
            "worker-1",
            ReadCursor::New,
            10,
            None,
        )
        .await
        .unwrap();
    assert_eq!(taken.len(), 1);

    let bus = &MessageBus::new(client, config);
    let cancel = CancellationToken::new();
    let calls = &Arc::new(AtomicUsize::new(0));
    bus.subscribe("orders", flaky(0, calls.clone()), cancel.clone())
        .await
        .unwrap();

    assert!(
        eventually(Duration::from_secs(2), || async move {
            calls.load(Ordering::SeqCst) == 1 && bus.queue_length("orders").await.unwrap() == 0
        })
        .await
    );

    cancel.cancel();
}

#[tokio::test]
async fn test_scheduled_entry_survives_scheduler_exit() {
    let client = SharedClient::memory();

    let scheduler = MessageBus::new(client.clone(), fast_config());
    scheduler
        .publish_delayed("alerts", &json!({"level": "high"}), Duration::from_millis(200))
        .await
        .unwrap();
    scheduler.shutdown().await;
    assert_eq!(scheduler.delayed_count("alerts").await.unwrap(), 1);

    let bus = &MessageBus::new(client, fast_config());
    let cancel = CancellationToken::new();
    let calls = &Arc::new(AtomicUsize::new(0));
    bus.subscribe("alerts", flaky(0, calls.clone()), cancel.clone())
        .await
        .unwrap();
    assert_eq!(bus.active_topics(), vec!["alerts".to_string()]);

    assert!(
        eventually(Duration::from_secs(3), || async move {
            calls.load(Ordering::SeqCst) == 1 && bus.delayed_count("alerts").await.unwrap() == 0
        })
        .await
    );

    cancel.cancel();
    bus.shutdown().await;
}

#[tokio::test]
async fn test_stop_topic_releases_worker() {
    let client = SharedClient::memory();
    let bus = MessageBus::new(client.clone(), fast_config());
    for topic in ["jobs", "alerts"] {
        bus.publish_delayed(topic, &json!({}), Duration::from_secs(3600))
            .await
            .unwrap();
    }
    assert_eq!(bus.active_topics(), vec!["alerts".to_string(), "jobs".to_string()]);

    let bus = &bus;
    assert!(eventually(Duration::from_secs(2), || async move { bus.is_polling("jobs") }).await);

    assert!(bus.stop_topic("jobs").await);
    assert!(!bus.stop_topic("jobs").await);
    assert_eq!(bus.active_topics(), vec!["alerts".to_string()]);
    assert!(!bus.is_polling("jobs"));

    // The lease is free for another process right away.
    let other = &MessageBus::new(client, fast_config());
    other
        .publish_delayed("jobs", &json!({}), Duration::from_secs(3600))
        .await
        .unwrap();
    assert!(eventually(Duration::from_secs(2), || async move { other.is_polling("jobs") }).await);

    bus.shutdown().await;
    other.shutdown().await;
}

#[tokio::test]
async fn test_failed_ack_is_redelivered() {
    let client = SharedClient::new(Arc::new(FailingAcks::new(1)));
    let bus = &MessageBus::new(client, fast_config());
    let cancel = CancellationToken::new();
    let calls = &Arc::new(AtomicUsize::new(0));

    bus.subscribe("orders", flaky(0, calls.clone()), cancel.clone())
        .await
        .unwrap();
    bus.publish("orders", &json!({"id": "42"})).await.unwrap();

    // The first ack fails, so the entry is read again from the pending list.
    assert!(
        eventually(Duration::from_secs(3), || async move {
            calls.load(Ordering::SeqCst) == 2 && bus.queue_length("orders").await.unwrap() == 0
        })
        .await
    );
    assert!(bus.dead_letters("orders").await.unwrap().is_empty());

    cancel.cancel();
    bus.shutdown().await;
}

#[tokio::test]
async fn test_purge_then_resume() {
    let bus = &MessageBus::new(SharedClient::memory(), fast_config());
    let cancel = CancellationToken::new();
    let calls = &Arc::new(AtomicUsize::new(0));

    bus.subscribe("orders", flaky(0, calls.clone()), cancel.clone())
        .await
        .unwrap();
    bus.purge("orders").await.unwrap();
    bus.publish("orders", &json!({"id": "after"})).await.unwrap();

    assert!(
        eventually(Duration::from_secs(3), || async move {
            calls.load(Ordering::SeqCst) == 1
        })
        .await
    );

    cancel.cancel();
}

#[tokio::test]
async fn test_undecodable_entry_is_dropped() {
    let client = SharedClient::memory();
    let store = client.store().unwrap().clone();
    let bus = &MessageBus::new(client, fast_config());
    let cancel = CancellationToken::new();
    let calls = &Arc::new(AtomicUsize::new(0));

    bus.subscribe("orders", flaky(0, calls.clone()), cancel.clone())
        .await
        .unwrap();
    store.xadd("mq:orders", "message", "{not json").await.unwrap();
    bus.publish("orders", &json!({"id": "ok"})).await.unwrap();

    assert!(
        eventually(Duration::from_secs(3), || async move {
            calls.load(Ordering::SeqCst) == 1 && bus.queue_length("orders").await.unwrap() == 0
        })
        .await
    );
    assert!(bus.dead_letters("orders").await.unwrap().is_empty());

    cancel.cancel();
}

#[tokio::test]
async fn test_disabled_bus_is_noop() {
    let bus = &MessageBus::new(SharedClient::disabled(), fast_config());
    let cancel = CancellationToken::new();

    assert!(!bus.is_enabled());
    assert!(!bus.publish("orders", &json!({"id": "42"})).await.unwrap().is_empty());
    bus.publish_delayed("orders", &json!({}), Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(bus.queue_length("orders").await.unwrap(), 0);
    assert_eq!(bus.delayed_count("orders").await.unwrap(), 0);
    assert!(!bus.is_polling("orders"));
    assert!(bus.dead_letters("orders").await.unwrap().is_empty());
    bus.purge("orders").await.unwrap();

    let handle = bus
        .subscribe("orders", flaky(0, Arc::new(AtomicUsize::new(0))), cancel.clone())
        .await
        .unwrap();
    cancel.cancel();
    handle.await.unwrap();
}

#[test]
fn test_backoff_doubles_and_caps() {
    let config = BusConfig::default();
    assert_eq!(config.retry_backoff(1), Duration::from_millis(500));
    assert_eq!(config.retry_backoff(2), Duration::from_secs(1));
    assert_eq!(config.retry_backoff(3), Duration::from_secs(2));
    assert_eq!(config.retry_backoff(12), Duration::from_secs(30));
    assert_eq!(fast_config().retry_backoff(5), Duration::ZERO);
}
