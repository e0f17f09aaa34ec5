//! The shared store capability trait.
//!
//! Everything above this crate (locks, group and session stores, the message
//! bus and the delivery bridge) talks to the shared substrate only through
//! [`SharedStore`]. The primitives mirror a Redis-like server: strings with
//! TTLs, hashes, sets, sorted sets, streams with consumer groups, and
//! pattern pub/sub.

use async_trait::async_trait;
use futures_util::Stream;
use std::collections::HashMap;
use std::pin::Pin;
use std::time::Duration;

use crate::error::StoreError;

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// A stream of pub/sub messages. Dropping it unsubscribes.
pub type MessageStream = Pin<Box<dyn Stream<Item = PubSubMessage> + Send>>;

/// A message received on a pattern subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubSubMessage {
    /// The pattern that matched.
    pub pattern: String,
    /// The concrete channel the message was published on.
    pub channel: String,
    /// Raw payload.
    pub payload: String,
}

/// One entry of a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    /// Entry id, `<ms>-<seq>`.
    pub id: String,
    /// Field/value pairs.
    pub fields: HashMap<String, String>,
}

impl StreamEntry {
    /// Get a field value.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

/// Where a consumer group read starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadCursor {
    /// Entries never delivered to any consumer of the group (`>`).
    New,
    /// Entries already delivered to this consumer but not acknowledged.
    Pending,
}

/// A single write inside a [`Batch`].
#[derive(Debug, Clone, PartialEq)]
pub enum BatchOp {
    Set {
        key: String,
        value: String,
        ttl: Option<Duration>,
    },
    Del {
        key: String,
    },
    Expire {
        key: String,
        ttl: Duration,
    },
    HSet {
        key: String,
        field: String,
        value: String,
    },
    HDel {
        key: String,
        field: String,
    },
    SAdd {
        key: String,
        member: String,
    },
    SRem {
        key: String,
        member: String,
    },
    /// Delete `key` if the hash `hash` has no fields at this point of the
    /// batch.
    DelIfEmpty {
        key: String,
        hash: String,
    },
}

/// An atomic multi-key write batch.
///
/// Either every operation is applied or none is visible to other clients
/// before the whole batch is.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    ops: Vec<BatchOp>,
}

impl Batch {
    /// Create an empty batch.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn set(mut self, key: impl Into<String>, value: impl Into<String>, ttl: Option<Duration>) -> Self {
        self.ops.push(BatchOp::Set {
            key: key.into(),
            value: value.into(),
            ttl,
        });
        self
    }

    #[must_use]
    pub fn del(mut self, key: impl Into<String>) -> Self {
        self.ops.push(BatchOp::Del { key: key.into() });
        self
    }

    #[must_use]
    pub fn expire(mut self, key: impl Into<String>, ttl: Duration) -> Self {
        self.ops.push(BatchOp::Expire {
            key: key.into(),
            ttl,
        });
        self
    }

    #[must_use]
    pub fn hset(
        mut self,
        key: impl Into<String>,
        field: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.ops.push(BatchOp::HSet {
            key: key.into(),
            field: field.into(),
            value: value.into(),
        });
        self
    }

    #[must_use]
    pub fn hdel(mut self, key: impl Into<String>, field: impl Into<String>) -> Self {
        self.ops.push(BatchOp::HDel {
            key: key.into(),
            field: field.into(),
        });
        self
    }

    #[must_use]
    pub fn sadd(mut self, key: impl Into<String>, member: impl Into<String>) -> Self {
        self.ops.push(BatchOp::SAdd {
            key: key.into(),
            member: member.into(),
        });
        self
    }

    #[must_use]
    pub fn srem(mut self, key: impl Into<String>, member: impl Into<String>) -> Self {
        self.ops.push(BatchOp::SRem {
            key: key.into(),
            member: member.into(),
        });
        self
    }

    /// Delete `key` when the hash `hash` is empty once the preceding
    /// operations have run.
    #[must_use]
    pub fn del_if_empty(mut self, key: impl Into<String>, hash: impl Into<String>) -> Self {
        self.ops.push(BatchOp::DelIfEmpty {
            key: key.into(),
            hash: hash.into(),
        });
        self
    }

    /// Whether any operation depends on the state it runs against.
    #[must_use]
    pub fn is_conditional(&self) -> bool {
        self.ops
            .iter()
            .any(|op| matches!(op, BatchOp::DelIfEmpty { .. }))
    }

    /// The queued operations.
    #[must_use]
    pub fn ops(&self) -> &[BatchOp] {
        &self.ops
    }

    /// Whether the batch is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub(crate) fn into_ops(self) -> Vec<BatchOp> {
        self.ops
    }
}

/// Capability interface over the shared key/value substrate.
///
/// Implementations must be safe to share between tasks. Missing keys are
/// never an error: reads return empty values, conditional writes report
/// `false`.
#[async_trait]
pub trait SharedStore: Send + Sync + 'static {
    /// Backend name, for logs and health output.
    fn name(&self) -> &'static str;

    // Strings

    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Set a value, replacing any TTL with `ttl`.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()>;

    /// Set a value only if the key is absent. Returns whether it was set.
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool>;

    /// Delete a key of any type. Returns whether it existed.
    async fn del(&self, key: &str) -> StoreResult<bool>;

    async fn exists(&self, key: &str) -> StoreResult<bool>;

    /// Set a key's TTL. Returns `false` if the key is absent.
    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool>;

    /// Remaining TTL, or `None` if the key is absent or has no expiry.
    async fn ttl(&self, key: &str) -> StoreResult<Option<Duration>>;

    /// Atomically delete `key` if it holds `expected`.
    async fn compare_and_delete(&self, key: &str, expected: &str) -> StoreResult<bool>;

    /// Atomically reset the TTL of `key` if it holds `expected`.
    async fn compare_and_expire(&self, key: &str, expected: &str, ttl: Duration)
        -> StoreResult<bool>;

    // Hashes

    async fn hget_all(&self, key: &str) -> StoreResult<HashMap<String, String>>;

    async fn hlen(&self, key: &str) -> StoreResult<usize>;

    async fn hexists(&self, key: &str, field: &str) -> StoreResult<bool>;

    async fn hkeys(&self, key: &str) -> StoreResult<Vec<String>>;

    // Sets and keys

    async fn smembers(&self, key: &str) -> StoreResult<Vec<String>>;

    /// All live keys starting with `prefix`.
    async fn scan_prefix(&self, prefix: &str) -> StoreResult<Vec<String>>;

    // Sorted sets

    async fn zadd(&self, key: &str, member: &str, score: f64) -> StoreResult<()>;

    /// Members with `min <= score <= max`, lowest score first.
    async fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
        limit: Option<usize>,
    ) -> StoreResult<Vec<String>>;

    /// Remove a member. Returns whether it was present.
    async fn zrem(&self, key: &str, member: &str) -> StoreResult<bool>;

    async fn zcard(&self, key: &str) -> StoreResult<usize>;

    // Streams

    /// Append an entry with a single field. Returns the new entry id.
    async fn xadd(&self, key: &str, field: &str, value: &str) -> StoreResult<String>;

    async fn xlen(&self, key: &str) -> StoreResult<usize>;

    async fn xdel(&self, key: &str, ids: &[String]) -> StoreResult<usize>;

    /// Entries from the start of the stream, oldest first.
    async fn xrange(&self, key: &str, count: Option<usize>) -> StoreResult<Vec<StreamEntry>>;

    /// Create a consumer group reading from the start of the stream,
    /// creating the stream if needed. Existing groups are left untouched.
    async fn xgroup_create(&self, key: &str, group: &str) -> StoreResult<()>;

    /// Read entries for `consumer` in `group`.
    ///
    /// With [`ReadCursor::New`] and a `block` duration, waits up to that long
    /// for new entries. Fails with [`StoreError::NoGroup`] if the group or
    /// the stream is missing.
    async fn xread_group(
        &self,
        key: &str,
        group: &str,
        consumer: &str,
        cursor: ReadCursor,
        count: usize,
        block: Option<Duration>,
    ) -> StoreResult<Vec<StreamEntry>>;

    /// Acknowledge entries. Returns how many were pending.
    async fn xack(&self, key: &str, group: &str, ids: &[String]) -> StoreResult<usize>;

    // Pub/sub

    /// Publish a payload. Returns the number of subscribers reached.
    async fn publish(&self, channel: &str, payload: &str) -> StoreResult<usize>;

    /// Subscribe to glob patterns (`*`, `?`).
    async fn psubscribe(&self, patterns: &[String]) -> StoreResult<MessageStream>;

    // Batches

    /// Apply a batch atomically.
    async fn exec_batch(&self, batch: Batch) -> StoreResult<()>;
}
