//! Delayed-delivery workers.
//!
//! Every process that schedules delayed messages on a topic, or subscribes
//! to it, runs one worker for it, but only the holder of `mq:delay-lock:<topic>` actually polls.
//! The others keep competing for the lease on every tick and take over when
//! the holder stops or dies.

use chrono::Utc;
use courier_store::{DistributedLock, LockError, SharedClient, SharedStore, StoreError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::{delay_key, topic_key, STREAM_FIELD};
use crate::envelope::Envelope;

/// Maximum scheduled entries moved per tick.
const POLL_BATCH: usize = 100;

pub(crate) fn lock_key(topic: &str) -> String {
    format!("mq:delay-lock:{topic}")
}

/// Handle to a running worker.
#[derive(Debug)]
pub(crate) struct DelayWorker {
    polling: Arc<AtomicBool>,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl DelayWorker {
    pub(crate) fn spawn(
        client: SharedClient,
        topic: String,
        interval: Duration,
        lock_ttl: Duration,
        cancel: CancellationToken,
    ) -> Self {
        let polling = Arc::new(AtomicBool::new(false));
        let handle = tokio::spawn(run(
            client,
            topic,
            interval,
            lock_ttl,
            polling.clone(),
            cancel.clone(),
        ));
        Self {
            polling,
            cancel,
            handle,
        }
    }

    pub(crate) fn is_polling(&self) -> bool {
        self.polling.load(Ordering::Acquire)
    }

    pub(crate) async fn stop(self) {
        self.cancel.cancel();
        let _ = self.handle.await;
    }
}

async fn run(
    client: SharedClient,
    topic: String,
    interval: Duration,
    lock_ttl: Duration,
    polling: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    let Some(store) = client.store().cloned() else {
        return;
    };
    let lock = DistributedLock::new(client.clone(), &lock_key(&topic), lock_ttl);
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    debug!(topic = %topic, "Delay worker started");

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let was_leader = polling.load(Ordering::Acquire);
        let leader = if was_leader {
            let refreshed = lock.refresh().await;
            if let Err(LockError::Store(err)) = &refreshed {
                warn!(topic = %topic, error = %err, "Failed to refresh delay lock, retrying next tick");
            }
            lease_kept(&refreshed)
        } else {
            match lock.acquire().await {
                Ok(acquired) => acquired,
                Err(err) => {
                    warn!(topic = %topic, error = %err, "Failed to compete for delay lock");
                    false
                }
            }
        };
        if leader != was_leader {
            if leader {
                info!(topic = %topic, "Became delay poller");
            } else {
                warn!(topic = %topic, "Lost delay poller lease");
            }
            polling.store(leader, Ordering::Release);
        }

        if leader {
            match poll_due(store.as_ref(), &client, &topic).await {
                Ok(0) => {}
                Ok(moved) => debug!(topic = %topic, moved, "Delivered due messages"),
                Err(err) => warn!(topic = %topic, error = %err, "Delay poll failed"),
            }
        }
    }

    if polling.swap(false, Ordering::AcqRel) {
        if let Err(err) = lock.release().await {
            debug!(topic = %topic, error = %err, "Delay lock already gone");
        }
    }
    debug!(topic = %topic, "Delay worker stopped");
}

/// Whether a refresh outcome keeps leadership. Only an explicit loss of
/// ownership gives it up; a store error leaves the lease to be refreshed
/// again, since the record still carries this worker's token.
fn lease_kept(refreshed: &Result<(), LockError>) -> bool {
    !matches!(refreshed, Err(LockError::NotOwned(_)) | Err(LockError::NotAcquired(_)))
}

/// Move every due scheduled entry onto the live log. Appending happens
/// before removal, so a crash in between duplicates rather than loses.
pub(crate) async fn poll_due(
    store: &dyn SharedStore,
    client: &SharedClient,
    topic: &str,
) -> Result<usize, StoreError> {
    let scheduled = client.key(&delay_key(topic));
    let live = client.key(&topic_key(topic));
    let mut moved = 0;

    loop {
        let now = Utc::now().timestamp_millis() as f64;
        let due = store
            .zrange_by_score(&scheduled, 0.0, now, Some(POLL_BATCH))
            .await?;
        let batch_len = due.len();

        for member in due {
            if serde_json::from_str::<Envelope>(&member).is_err() {
                warn!(topic = %topic, "Dropping undecodable scheduled entry");
            } else {
                store.xadd(&live, STREAM_FIELD, &member).await?;
                moved += 1;
            }
            store.zrem(&scheduled, &member).await?;
        }

        if batch_len < POLL_BATCH {
            return Ok(moved);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_kept_through_store_errors() {
        assert!(lease_kept(&Ok(())));
        assert!(lease_kept(&Err(LockError::Store(StoreError::Backend(
            "connection reset".into()
        )))));
        assert!(!lease_kept(&Err(LockError::NotOwned("mq:delay-lock:jobs".into()))));
    }
}
