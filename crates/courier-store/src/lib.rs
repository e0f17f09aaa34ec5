//! # courier-store
//!
//! Shared store adapter for the Courier realtime delivery engine.
//!
//! - **SharedStore** - Capability trait over a networked key/value substrate
//! - **MemoryStore** - In-process implementation, used in tests and single-node deployments
//! - **RedisStore** - Redis implementation (feature `redis`)
//! - **SharedClient** - Optional store handle with key prefixing
//! - **DistributedLock** - Lease-based mutual exclusion on top of the store
//!
//! ## Example
//!
//! ```rust
//! use courier_store::{DistributedLock, SharedClient};
//! use std::time::Duration;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let client = SharedClient::memory();
//! let lock = DistributedLock::new(client, "jobs:cleanup", Duration::from_secs(10));
//!
//! let ran = lock.with_lock(|| async { "done" }).await.unwrap();
//! assert_eq!(ran, "done");
//! # }
//! ```

pub mod client;
pub mod error;
pub mod lock;
pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;
pub mod store;

pub use client::{SharedClient, StoreBackend, StoreConfig};
pub use error::StoreError;
pub use lock::{DistributedLock, LockError};
pub use memory::MemoryStore;
#[cfg(feature = "redis")]
pub use self::redis::RedisStore;
pub use store::{
    Batch, BatchOp, MessageStream, PubSubMessage, ReadCursor, SharedStore, StoreResult,
    StreamEntry,
};
