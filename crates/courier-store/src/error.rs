//! Store errors.

use thiserror::Error;

/// Errors returned by a [`SharedStore`](crate::SharedStore) backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Generic backend failure.
    #[error("Store backend error: {0}")]
    Backend(String),

    /// Operation against a key holding the wrong kind of value.
    #[error("Wrong value type for key: {0}")]
    WrongType(String),

    /// Consumer group (or its stream) does not exist.
    #[error("No such consumer group {group} on stream {stream}")]
    NoGroup { stream: String, group: String },

    /// Value could not be (de)serialized.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Redis client error.
    #[cfg(feature = "redis")]
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

impl StoreError {
    /// Whether this error reports a missing consumer group.
    #[must_use]
    pub fn is_no_group(&self) -> bool {
        matches!(self, StoreError::NoGroup { .. })
    }
}
