//! Per-connection sessions.
//!
//! A session is a key/value bag identified by the client id and owned by one
//! user. The networked store keeps it under a TTL so another process can
//! read it after a reconnect, and indexes it by user id.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use courier_store::{Batch, SharedClient, SharedStore, StoreError};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Default TTL of networked sessions.
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Session errors.
#[derive(Debug, Error)]
pub enum SessionError {
    /// No session stored under this id.
    #[error("Session not found: {0}")]
    NotFound(String),

    /// No session is associated with this client.
    #[error("Client not found: {0}")]
    ClientNotFound(String),

    /// Key absent from the session data.
    #[error("Session key not found: {0}")]
    KeyNotFound(String),

    /// Shared store failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Session could not be (de)serialized.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub user_id: String,
    #[serde(default)]
    pub data: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    #[must_use]
    pub fn new(id: impl Into<String>, user_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            user_id: user_id.into(),
            data: Map::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.data.insert(key.into(), value.into());
        self.touch();
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        let removed = self.data.remove(key);
        self.touch();
        removed
    }

    pub fn clear(&mut self) {
        self.data.clear();
        self.touch();
    }

    /// Merge `data` into the session, overwriting existing keys.
    pub fn update(&mut self, data: Map<String, Value>) {
        self.data.extend(data);
        self.touch();
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Session persistence contract.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<Session>, SessionError>;

    /// Insert or replace a session.
    async fn save(&self, session: &Session) -> Result<(), SessionError>;

    /// Delete a session. Deleting a missing session succeeds.
    async fn delete(&self, id: &str) -> Result<(), SessionError>;

    /// All sessions of a user.
    async fn by_user(&self, user_id: &str) -> Result<Vec<Session>, SessionError>;
}

#[derive(Debug, Default)]
struct LocalSessions {
    sessions: HashMap<String, Session>,
    by_user: HashMap<String, HashSet<String>>,
}

/// In-process session store.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    inner: RwLock<LocalSessions>,
}

impl MemorySessionStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn get(&self, id: &str) -> Result<Option<Session>, SessionError> {
        Ok(self.inner.read().await.sessions.get(id).cloned())
    }

    async fn save(&self, session: &Session) -> Result<(), SessionError> {
        let mut inner = self.inner.write().await;
        inner
            .by_user
            .entry(session.user_id.clone())
            .or_default()
            .insert(session.id.clone());
        inner.sessions.insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), SessionError> {
        let mut inner = self.inner.write().await;
        let Some(session) = inner.sessions.remove(id) else {
            return Ok(());
        };
        if let Some(ids) = inner.by_user.get_mut(&session.user_id) {
            ids.remove(id);
            if ids.is_empty() {
                inner.by_user.remove(&session.user_id);
            }
        }
        Ok(())
    }

    async fn by_user(&self, user_id: &str) -> Result<Vec<Session>, SessionError> {
        let inner = self.inner.read().await;
        Ok(inner
            .by_user
            .get(user_id)
            .into_iter()
            .flatten()
            .filter_map(|id| inner.sessions.get(id).cloned())
            .collect())
    }
}

/// Session store kept in the shared store under `session:<id>`, indexed by
/// `user_sessions:<user id>`.
#[derive(Clone)]
pub struct SharedSessionStore {
    store: Arc<dyn SharedStore>,
    prefix: String,
    ttl: Duration,
}

impl std::fmt::Debug for SharedSessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedSessionStore")
            .field("prefix", &self.prefix)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl SharedSessionStore {
    #[must_use]
    pub fn new(store: Arc<dyn SharedStore>, prefix: impl Into<String>, ttl: Duration) -> Self {
        Self {
            store,
            prefix: prefix.into(),
            ttl,
        }
    }

    fn session_key(&self, id: &str) -> String {
        format!("{}session:{}", self.prefix, id)
    }

    fn user_key(&self, user_id: &str) -> String {
        format!("{}user_sessions:{}", self.prefix, user_id)
    }
}

#[async_trait]
impl SessionStore for SharedSessionStore {
    async fn get(&self, id: &str) -> Result<Option<Session>, SessionError> {
        match self.store.get(&self.session_key(id)).await? {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn save(&self, session: &Session) -> Result<(), SessionError> {
        let json = serde_json::to_string(session)?;
        let user_key = self.user_key(&session.user_id);
        let batch = Batch::new()
            .set(self.session_key(&session.id), json, Some(self.ttl))
            .sadd(&user_key, &session.id)
            .expire(&user_key, self.ttl);
        self.store.exec_batch(batch).await?;
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), SessionError> {
        let Some(session) = self.get(id).await? else {
            return Ok(());
        };
        let batch = Batch::new()
            .del(self.session_key(id))
            .srem(self.user_key(&session.user_id), id);
        self.store.exec_batch(batch).await?;
        Ok(())
    }

    async fn by_user(&self, user_id: &str) -> Result<Vec<Session>, SessionError> {
        let ids = self.store.smembers(&self.user_key(user_id)).await?;
        let mut sessions = Vec::with_capacity(ids.len());
        for id in ids {
            // Index members outlive expired sessions.
            match self.get(&id).await {
                Ok(Some(session)) => sessions.push(session),
                Ok(None) => {}
                Err(err) => warn!(session = %id, error = %err, "Skipping unreadable session"),
            }
        }
        Ok(sessions)
    }
}

/// Tracks the session of each connection in this process.
pub struct SessionManager {
    store: Arc<dyn SessionStore>,
    clients: DashMap<String, String>,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("clients", &self.clients.len())
            .finish_non_exhaustive()
    }
}

impl SessionManager {
    #[must_use]
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self {
            store,
            clients: DashMap::new(),
        }
    }

    /// A manager over a fresh in-process store.
    #[must_use]
    pub fn memory() -> Self {
        Self::new(Arc::new(MemorySessionStore::new()))
    }

    /// The networked store when the client is enabled, the local one
    /// otherwise.
    #[must_use]
    pub fn for_client(client: &SharedClient, ttl: Duration) -> Self {
        match client.store() {
            Some(store) => Self::new(Arc::new(SharedSessionStore::new(
                store.clone(),
                client.prefix(),
                ttl,
            ))),
            None => Self::memory(),
        }
    }

    /// Create and store the session of a new connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn create_session(&self, client_id: &str, user_id: &str) -> Result<Session, SessionError> {
        let session = Session::new(client_id, user_id);
        self.store.save(&session).await?;
        self.clients
            .insert(client_id.to_string(), session.id.clone());
        debug!(client = %client_id, user = %user_id, "Session created");
        Ok(session)
    }

    /// The session of a connection.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::ClientNotFound`] for unknown clients and
    /// [`SessionError::NotFound`] if the stored session is gone.
    pub async fn session(&self, client_id: &str) -> Result<Session, SessionError> {
        let session_id = self
            .clients
            .get(client_id)
            .map(|id| id.value().clone())
            .ok_or_else(|| SessionError::ClientNotFound(client_id.to_string()))?;
        self.store
            .get(&session_id)
            .await?
            .ok_or(SessionError::NotFound(session_id))
    }

    /// Forget a connection's session. Unknown clients succeed.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails; the association is dropped
    /// either way.
    pub async fn remove_session(&self, client_id: &str) -> Result<(), SessionError> {
        let Some((_, session_id)) = self.clients.remove(client_id) else {
            return Ok(());
        };
        self.store.delete(&session_id).await?;
        debug!(client = %client_id, "Session removed");
        Ok(())
    }

    /// All sessions of a user across processes sharing the store.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn user_sessions(&self, user_id: &str) -> Result<Vec<Session>, SessionError> {
        self.store.by_user(user_id).await
    }

    /// # Errors
    ///
    /// Returns an error if the client has no session or the store fails.
    pub async fn set_data(
        &self,
        client_id: &str,
        key: &str,
        value: impl Into<Value> + Send,
    ) -> Result<(), SessionError> {
        let mut session = self.session(client_id).await?;
        session.set(key, value);
        self.store.save(&session).await
    }

    /// # Errors
    ///
    /// Returns [`SessionError::KeyNotFound`] if the key is not set.
    pub async fn get_data(&self, client_id: &str, key: &str) -> Result<Value, SessionError> {
        let mut session = self.session(client_id).await?;
        session
            .data
            .remove(key)
            .ok_or_else(|| SessionError::KeyNotFound(key.to_string()))
    }

    /// # Errors
    ///
    /// Returns an error if the client has no session or the store fails.
    pub async fn update_data(&self, client_id: &str, data: Map<String, Value>) -> Result<(), SessionError> {
        let mut session = self.session(client_id).await?;
        session.update(data);
        self.store.save(&session).await
    }

    /// # Errors
    ///
    /// Returns an error if the client has no session or the store fails.
    pub async fn delete_data(&self, client_id: &str, key: &str) -> Result<(), SessionError> {
        let mut session = self.session(client_id).await?;
        session.remove(key);
        self.store.save(&session).await
    }

    /// # Errors
    ///
    /// Returns an error if the client has no session or the store fails.
    pub async fn clear_data(&self, client_id: &str) -> Result<(), SessionError> {
        let mut session = self.session(client_id).await?;
        session.clear();
        self.store.save(&session).await
    }

    /// Refresh the session's timestamp and, for networked stores, its TTL.
    ///
    /// # Errors
    ///
    /// Returns an error if the client has no session or the store fails.
    pub async fn touch(&self, client_id: &str) -> Result<(), SessionError> {
        let mut session = self.session(client_id).await?;
        session.touch();
        self.store.save(&session).await
    }

    /// Number of connections with a session in this process.
    #[must_use]
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }
}
