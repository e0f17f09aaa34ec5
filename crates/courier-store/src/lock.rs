//! Lease-based distributed lock.
//!
//! A lock record is a string key holding a holder token with a TTL. Only a
//! request presenting the same token may release or refresh it, and both
//! checks run atomically on the store. When the shared store is disabled
//! every operation succeeds, since there is nobody to coordinate with.

use futures_util::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::client::SharedClient;
use crate::error::StoreError;

/// Poll interval for [`DistributedLock::try_acquire_with_timeout`].
pub const ACQUIRE_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Lock errors.
#[derive(Debug, Error)]
pub enum LockError {
    /// The record is absent or held by another token.
    #[error("Lock not owned: {0}")]
    NotOwned(String),

    /// The lock could not be acquired.
    #[error("Lock not acquired: {0}")]
    NotAcquired(String),

    /// Store failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A distributed mutual-exclusion lock.
#[derive(Debug, Clone)]
pub struct DistributedLock {
    client: SharedClient,
    key: String,
    token: String,
    ttl: Duration,
}

impl DistributedLock {
    /// Create a lock on `key` with a fresh holder token.
    #[must_use]
    pub fn new(client: SharedClient, key: &str, ttl: Duration) -> Self {
        Self {
            key: client.key(key),
            client,
            token: uuid::Uuid::new_v4().to_string(),
            ttl,
        }
    }

    /// The fully prefixed lock key.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// This instance's holder token.
    #[must_use]
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Lease duration.
    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Try once to take the lock.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn acquire(&self) -> Result<bool, LockError> {
        let Some(store) = self.client.store() else {
            return Ok(true);
        };
        let acquired = store.set_nx(&self.key, &self.token, self.ttl).await?;
        trace!(key = %self.key, acquired, "Lock acquire attempt");
        Ok(acquired)
    }

    /// Release the lock if this instance holds it.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::NotOwned`] if the record is absent or held by
    /// another token.
    pub async fn release(&self) -> Result<(), LockError> {
        let Some(store) = self.client.store() else {
            return Ok(());
        };
        if store.compare_and_delete(&self.key, &self.token).await? {
            debug!(key = %self.key, "Lock released");
            Ok(())
        } else {
            Err(LockError::NotOwned(self.key.clone()))
        }
    }

    /// Extend the lease if this instance holds the lock.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::NotOwned`] if the record is absent or held by
    /// another token.
    pub async fn refresh(&self) -> Result<(), LockError> {
        let Some(store) = self.client.store() else {
            return Ok(());
        };
        if store
            .compare_and_expire(&self.key, &self.token, self.ttl)
            .await?
        {
            trace!(key = %self.key, "Lock refreshed");
            Ok(())
        } else {
            Err(LockError::NotOwned(self.key.clone()))
        }
    }

    /// Whether this instance currently holds the lock.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn status(&self) -> Result<bool, LockError> {
        let Some(store) = self.client.store() else {
            return Ok(true);
        };
        Ok(store.get(&self.key).await?.as_deref() == Some(self.token.as_str()))
    }

    /// Poll [`acquire`](Self::acquire) until it succeeds or `timeout`
    /// elapses. Dropping the future cancels the attempt.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn try_acquire_with_timeout(&self, timeout: Duration) -> Result<bool, LockError> {
        let attempt = async {
            let mut ticker = tokio::time::interval(ACQUIRE_POLL_INTERVAL);
            loop {
                ticker.tick().await;
                if self.acquire().await? {
                    return Ok::<_, LockError>(());
                }
            }
        };
        match tokio::time::timeout(timeout, attempt).await {
            Ok(result) => result.map(|()| true),
            Err(_) => {
                debug!(key = %self.key, ?timeout, "Timed out waiting for lock");
                Ok(false)
            }
        }
    }

    /// Run `f` while holding the lock, releasing it on every exit path.
    ///
    /// A panic inside `f` is resumed after the lock is released.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::NotAcquired`] if the lock is held elsewhere.
    pub async fn with_lock<F, Fut, T>(&self, f: F) -> Result<T, LockError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        if !self.acquire().await? {
            return Err(LockError::NotAcquired(self.key.clone()));
        }

        let outcome = AssertUnwindSafe(f()).catch_unwind().await;

        if let Err(err) = self.release().await {
            warn!(key = %self.key, error = %err, "Failed to release lock");
        }

        match outcome {
            Ok(value) => Ok(value),
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }

    /// Refresh the lease every `interval` until cancelled.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::NotOwned`] as soon as the lease is lost.
    pub async fn keep_alive(
        &self,
        interval: Duration,
        cancel: CancellationToken,
    ) -> Result<(), LockError> {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                () = cancel.cancelled() => return Ok(()),
                _ = ticker.tick() => {
                    if let Err(err) = self.refresh().await {
                        warn!(key = %self.key, error = %err, "Lock lease lost");
                        return Err(err);
                    }
                }
            }
        }
    }
}
