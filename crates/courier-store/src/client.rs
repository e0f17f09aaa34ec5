//! Enable/disable wrapper around a store backend.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::StoreError;
use crate::memory::MemoryStore;
use crate::store::SharedStore;

/// Which store backend to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// No shared store; cross-process features become no-ops.
    #[default]
    Disabled,
    /// In-process store.
    Memory,
    /// Redis server.
    Redis,
}

/// Shared store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Backend selection.
    #[serde(default)]
    pub backend: StoreBackend,

    /// Connection URL for networked backends.
    #[serde(default = "default_url")]
    pub url: String,

    /// Prefix prepended to every key.
    #[serde(default)]
    pub prefix: String,
}

fn default_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            url: default_url(),
            prefix: String::new(),
        }
    }
}

/// Handle to the shared store, or to its absence.
///
/// Cheap to clone. Components receive a `SharedClient` and check
/// [`is_enabled`](Self::is_enabled) to decide between the networked path
/// and their local fallback.
#[derive(Clone, Default)]
pub struct SharedClient {
    store: Option<Arc<dyn SharedStore>>,
    prefix: String,
}

impl std::fmt::Debug for SharedClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedClient")
            .field("backend", &self.backend_name())
            .field("prefix", &self.prefix)
            .finish()
    }
}

impl SharedClient {
    /// A client with no backing store.
    #[must_use]
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Wrap an existing store.
    #[must_use]
    pub fn new(store: Arc<dyn SharedStore>) -> Self {
        Self {
            store: Some(store),
            prefix: String::new(),
        }
    }

    /// A client over a fresh [`MemoryStore`].
    #[must_use]
    pub fn memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    /// Set the key prefix.
    #[must_use]
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Build a client from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the networked backend cannot be reached, or if
    /// it was not compiled in.
    pub async fn connect(config: &StoreConfig) -> Result<Self, StoreError> {
        let client = match config.backend {
            StoreBackend::Disabled => {
                warn!("Shared store disabled, running without cross-process delivery");
                return Ok(Self::disabled());
            }
            StoreBackend::Memory => Self::memory(),
            StoreBackend::Redis => Self::connect_redis(&config.url).await?,
        };
        info!(backend = client.backend_name(), prefix = %config.prefix, "Shared store enabled");
        Ok(client.with_prefix(config.prefix.clone()))
    }

    #[cfg(feature = "redis")]
    async fn connect_redis(url: &str) -> Result<Self, StoreError> {
        let store = crate::redis::RedisStore::connect(url).await?;
        Ok(Self::new(Arc::new(store)))
    }

    #[cfg(not(feature = "redis"))]
    async fn connect_redis(_url: &str) -> Result<Self, StoreError> {
        Err(StoreError::Backend(
            "Redis support not compiled in (enable the `redis` feature)".to_string(),
        ))
    }

    /// Whether a backing store is present.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.store.is_some()
    }

    /// The backing store, if any.
    #[must_use]
    pub fn store(&self) -> Option<&Arc<dyn SharedStore>> {
        self.store.as_ref()
    }

    /// Backend name, `disabled` when absent.
    #[must_use]
    pub fn backend_name(&self) -> &'static str {
        self.store.as_ref().map_or("disabled", |s| s.name())
    }

    /// Apply the key prefix.
    #[must_use]
    pub fn key(&self, key: &str) -> String {
        if self.prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}{}", self.prefix, key)
        }
    }

    /// The key prefix.
    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}
