//! Durable message wrappers tracked through retries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// Default number of retries before a message is dead-lettered.
pub const DEFAULT_MAX_RETRY: u32 = 3;

/// One payload travelling through a topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: String,
    pub topic: String,
    pub payload: Value,
    /// Creation time, or the due time for delayed messages.
    pub timestamp: DateTime<Utc>,
    pub retry: u32,
    pub max_retry: u32,
}

impl Envelope {
    /// Wrap a payload with a fresh id and zero retries.
    #[must_use]
    pub fn new(topic: impl Into<String>, payload: Value, max_retry: u32) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            topic: topic.into(),
            payload,
            timestamp: Utc::now(),
            retry: 0,
            max_retry,
        }
    }

    /// Shift the timestamp into the future.
    #[must_use]
    pub fn delayed_by(mut self, delay: Duration) -> Self {
        if let Ok(delay) = chrono::Duration::from_std(delay) {
            self.timestamp += delay;
        }
        self
    }

    /// Whether another attempt is allowed after a failure.
    #[must_use]
    pub fn can_retry(&self) -> bool {
        self.retry < self.max_retry
    }

    /// Deserialize the payload into a concrete type.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload does not match `T`.
    pub fn payload_as<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.payload)
    }
}

/// A permanently failed message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub original_message: Envelope,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

impl DeadLetter {
    #[must_use]
    pub fn new(original_message: Envelope, error: impl Into<String>) -> Self {
        Self {
            original_message,
            error: error.into(),
            failed_at: Utc::now(),
        }
    }
}
