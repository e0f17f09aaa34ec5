//! Room (group) membership stores.
//!
//! A group is a named set of client ids, each with a small JSON info blob,
//! plus free-form metadata. [`MemoryGroupStore`] keeps everything in the
//! process; [`SharedGroupStore`] keeps it in the shared store under a TTL
//! so several processes see the same membership.

use async_trait::async_trait;
use courier_store::{Batch, SharedClient, SharedStore, StoreError};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, trace};

/// Default TTL of networked group keys.
pub const DEFAULT_GROUP_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Group store errors.
#[derive(Debug, Error)]
pub enum GroupError {
    /// Group does not exist.
    #[error("Group not found: {0}")]
    NotFound(String),

    /// Shared store failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Stored value could not be (de)serialized.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Membership store contract shared by the local and networked variants.
#[async_trait]
pub trait GroupStore: Send + Sync {
    /// Add a client to a group, creating the group if needed.
    async fn add_member(&self, group: &str, client_id: &str, info: Value) -> Result<(), GroupError>;

    /// Remove a client from a group.
    async fn remove_member(&self, group: &str, client_id: &str) -> Result<(), GroupError>;

    /// Members of a group with their info.
    async fn members(&self, group: &str) -> Result<HashMap<String, Value>, GroupError>;

    /// Groups a client belongs to.
    async fn client_groups(&self, client_id: &str) -> Result<Vec<String>, GroupError>;

    async fn set_metadata(&self, group: &str, metadata: Map<String, Value>) -> Result<(), GroupError>;

    async fn metadata(&self, group: &str) -> Result<Map<String, Value>, GroupError>;

    async fn all_groups(&self) -> Result<Vec<String>, GroupError>;

    async fn size(&self, group: &str) -> Result<usize, GroupError>;

    async fn exists(&self, group: &str) -> Result<bool, GroupError>;

    async fn contains(&self, group: &str, client_id: &str) -> Result<bool, GroupError>;

    /// Delete a group and drop it from every member's group list.
    async fn delete(&self, group: &str) -> Result<(), GroupError>;
}

#[derive(Debug, Default)]
struct LocalGroup {
    members: HashMap<String, Value>,
    metadata: Map<String, Value>,
}

#[derive(Debug, Default)]
struct LocalGroups {
    groups: HashMap<String, LocalGroup>,
    by_client: HashMap<String, HashSet<String>>,
}

impl LocalGroups {
    fn unlink(&mut self, client_id: &str, group: &str) {
        if let Some(groups) = self.by_client.get_mut(client_id) {
            groups.remove(group);
            if groups.is_empty() {
                self.by_client.remove(client_id);
            }
        }
    }
}

/// In-process group store. Empty groups disappear with their metadata.
#[derive(Debug, Default)]
pub struct MemoryGroupStore {
    inner: RwLock<LocalGroups>,
}

impl MemoryGroupStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl GroupStore for MemoryGroupStore {
    async fn add_member(&self, group: &str, client_id: &str, info: Value) -> Result<(), GroupError> {
        let mut inner = self.inner.write().await;
        inner
            .groups
            .entry(group.to_string())
            .or_default()
            .members
            .insert(client_id.to_string(), info);
        inner
            .by_client
            .entry(client_id.to_string())
            .or_default()
            .insert(group.to_string());
        Ok(())
    }

    async fn remove_member(&self, group: &str, client_id: &str) -> Result<(), GroupError> {
        let mut inner = self.inner.write().await;
        let entry = inner
            .groups
            .get_mut(group)
            .ok_or_else(|| GroupError::NotFound(group.to_string()))?;
        entry.members.remove(client_id);
        if entry.members.is_empty() {
            inner.groups.remove(group);
            trace!(group = %group, "Removed empty group");
        }
        inner.unlink(client_id, group);
        Ok(())
    }

    async fn members(&self, group: &str) -> Result<HashMap<String, Value>, GroupError> {
        let inner = self.inner.read().await;
        inner
            .groups
            .get(group)
            .map(|g| g.members.clone())
            .ok_or_else(|| GroupError::NotFound(group.to_string()))
    }

    async fn client_groups(&self, client_id: &str) -> Result<Vec<String>, GroupError> {
        let inner = self.inner.read().await;
        Ok(inner
            .by_client
            .get(client_id)
            .map(|g| g.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn set_metadata(&self, group: &str, metadata: Map<String, Value>) -> Result<(), GroupError> {
        let mut inner = self.inner.write().await;
        let entry = inner
            .groups
            .get_mut(group)
            .ok_or_else(|| GroupError::NotFound(group.to_string()))?;
        entry.metadata = metadata;
        Ok(())
    }

    async fn metadata(&self, group: &str) -> Result<Map<String, Value>, GroupError> {
        let inner = self.inner.read().await;
        inner
            .groups
            .get(group)
            .map(|g| g.metadata.clone())
            .ok_or_else(|| GroupError::NotFound(group.to_string()))
    }

    async fn all_groups(&self) -> Result<Vec<String>, GroupError> {
        Ok(self.inner.read().await.groups.keys().cloned().collect())
    }

    async fn size(&self, group: &str) -> Result<usize, GroupError> {
        let inner = self.inner.read().await;
        Ok(inner.groups.get(group).map_or(0, |g| g.members.len()))
    }

    async fn exists(&self, group: &str) -> Result<bool, GroupError> {
        Ok(self.inner.read().await.groups.contains_key(group))
    }

    async fn contains(&self, group: &str, client_id: &str) -> Result<bool, GroupError> {
        let inner = self.inner.read().await;
        Ok(inner
            .groups
            .get(group)
            .is_some_and(|g| g.members.contains_key(client_id)))
    }

    async fn delete(&self, group: &str) -> Result<(), GroupError> {
        let mut inner = self.inner.write().await;
        if let Some(removed) = inner.groups.remove(group) {
            for client_id in removed.members.keys() {
                inner.unlink(client_id, group);
            }
        }
        Ok(())
    }
}

/// Group store kept in the shared store.
///
/// Layout: `group:<id>` is a hash of client id to info JSON,
/// `group_meta:<id>` holds the metadata JSON and `client_groups:<id>` is
/// the reverse index. Every membership write is one atomic batch that also
/// refreshes the TTL of the keys it touches. Removing the last member drops
/// the metadata in the same batch.
#[derive(Clone)]
pub struct SharedGroupStore {
    store: Arc<dyn SharedStore>,
    prefix: String,
    ttl: Duration,
}

impl std::fmt::Debug for SharedGroupStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedGroupStore")
            .field("prefix", &self.prefix)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl SharedGroupStore {
    #[must_use]
    pub fn new(store: Arc<dyn SharedStore>, prefix: impl Into<String>, ttl: Duration) -> Self {
        Self {
            store,
            prefix: prefix.into(),
            ttl,
        }
    }

    fn group_key(&self, group: &str) -> String {
        format!("{}group:{}", self.prefix, group)
    }

    fn meta_key(&self, group: &str) -> String {
        format!("{}group_meta:{}", self.prefix, group)
    }

    fn client_key(&self, client_id: &str) -> String {
        format!("{}client_groups:{}", self.prefix, client_id)
    }
}

#[async_trait]
impl GroupStore for SharedGroupStore {
    async fn add_member(&self, group: &str, client_id: &str, info: Value) -> Result<(), GroupError> {
        let group_key = self.group_key(group);
        let client_key = self.client_key(client_id);
        let batch = Batch::new()
            .hset(&group_key, client_id, serde_json::to_string(&info)?)
            .expire(&group_key, self.ttl)
            .expire(self.meta_key(group), self.ttl)
            .sadd(&client_key, group)
            .expire(&client_key, self.ttl);
        self.store.exec_batch(batch).await?;
        debug!(group = %group, client = %client_id, "Added group member");
        Ok(())
    }

    async fn remove_member(&self, group: &str, client_id: &str) -> Result<(), GroupError> {
        let group_key = self.group_key(group);
        let meta_key = self.meta_key(group);
        let client_key = self.client_key(client_id);
        let batch = Batch::new()
            .hdel(&group_key, client_id)
            .expire(&group_key, self.ttl)
            .expire(&meta_key, self.ttl)
            .srem(&client_key, group)
            .expire(&client_key, self.ttl)
            .del_if_empty(&meta_key, &group_key);
        self.store.exec_batch(batch).await?;
        debug!(group = %group, client = %client_id, "Removed group member");
        Ok(())
    }

    async fn members(&self, group: &str) -> Result<HashMap<String, Value>, GroupError> {
        let raw = self.store.hget_all(&self.group_key(group)).await?;
        Ok(raw
            .into_iter()
            .map(|(client_id, info)| {
                let info = serde_json::from_str(&info).unwrap_or(Value::String(info));
                (client_id, info)
            })
            .collect())
    }

    async fn client_groups(&self, client_id: &str) -> Result<Vec<String>, GroupError> {
        Ok(self.store.smembers(&self.client_key(client_id)).await?)
    }

    async fn set_metadata(&self, group: &str, metadata: Map<String, Value>) -> Result<(), GroupError> {
        let json = serde_json::to_string(&metadata)?;
        self.store
            .set(&self.meta_key(group), &json, Some(self.ttl))
            .await?;
        Ok(())
    }

    async fn metadata(&self, group: &str) -> Result<Map<String, Value>, GroupError> {
        match self.store.get(&self.meta_key(group)).await? {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Ok(Map::new()),
        }
    }

    async fn all_groups(&self) -> Result<Vec<String>, GroupError> {
        let prefix = self.group_key("");
        Ok(self
            .store
            .scan_prefix(&prefix)
            .await?
            .into_iter()
            .filter_map(|key| key.strip_prefix(&prefix).map(str::to_string))
            .collect())
    }

    async fn size(&self, group: &str) -> Result<usize, GroupError> {
        Ok(self.store.hlen(&self.group_key(group)).await?)
    }

    async fn exists(&self, group: &str) -> Result<bool, GroupError> {
        Ok(self.store.exists(&self.group_key(group)).await?)
    }

    async fn contains(&self, group: &str, client_id: &str) -> Result<bool, GroupError> {
        Ok(self
            .store
            .hexists(&self.group_key(group), client_id)
            .await?)
    }

    async fn delete(&self, group: &str) -> Result<(), GroupError> {
        let group_key = self.group_key(group);
        let members = self.store.hkeys(&group_key).await?;
        let batch = members.iter().fold(
            Batch::new().del(&group_key).del(self.meta_key(group)),
            |batch, client_id| batch.srem(self.client_key(client_id), group),
        );
        self.store.exec_batch(batch).await?;
        debug!(group = %group, members = members.len(), "Deleted group");
        Ok(())
    }
}

/// Facade over a [`GroupStore`], shared by the registry and collaborators.
#[derive(Clone)]
pub struct GroupManager {
    store: Arc<dyn GroupStore>,
}

impl std::fmt::Debug for GroupManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupManager").finish_non_exhaustive()
    }
}

impl GroupManager {
    #[must_use]
    pub fn new(store: Arc<dyn GroupStore>) -> Self {
        Self { store }
    }

    /// A manager over a fresh in-process store.
    #[must_use]
    pub fn memory() -> Self {
        Self::new(Arc::new(MemoryGroupStore::new()))
    }

    /// The networked store when the client is enabled, the local one
    /// otherwise.
    #[must_use]
    pub fn for_client(client: &SharedClient, ttl: Duration) -> Self {
        match client.store() {
            Some(store) => Self::new(Arc::new(SharedGroupStore::new(
                store.clone(),
                client.prefix(),
                ttl,
            ))),
            None => Self::memory(),
        }
    }

    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn add_member(&self, group: &str, client_id: &str, info: Value) -> Result<(), GroupError> {
        self.store.add_member(group, client_id, info).await
    }

    /// # Errors
    ///
    /// Returns [`GroupError::NotFound`] from the local store if the group
    /// does not exist.
    pub async fn remove_member(&self, group: &str, client_id: &str) -> Result<(), GroupError> {
        self.store.remove_member(group, client_id).await
    }

    /// Member ids of a group; a missing group has no members.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn member_ids(&self, group: &str) -> Result<Vec<String>, GroupError> {
        match self.store.members(group).await {
            Ok(members) => Ok(members.into_keys().collect()),
            Err(GroupError::NotFound(_)) => Ok(Vec::new()),
            Err(err) => Err(err),
        }
    }

    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn members(&self, group: &str) -> Result<HashMap<String, Value>, GroupError> {
        self.store.members(group).await
    }

    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn client_groups(&self, client_id: &str) -> Result<Vec<String>, GroupError> {
        self.store.client_groups(client_id).await
    }

    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn set_metadata(&self, group: &str, metadata: Map<String, Value>) -> Result<(), GroupError> {
        self.store.set_metadata(group, metadata).await
    }

    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn metadata(&self, group: &str) -> Result<Map<String, Value>, GroupError> {
        self.store.metadata(group).await
    }

    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn all_groups(&self) -> Result<Vec<String>, GroupError> {
        self.store.all_groups().await
    }

    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn size(&self, group: &str) -> Result<usize, GroupError> {
        self.store.size(group).await
    }

    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn exists(&self, group: &str) -> Result<bool, GroupError> {
        self.store.exists(group).await
    }

    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn contains(&self, group: &str, client_id: &str) -> Result<bool, GroupError> {
        self.store.contains(group, client_id).await
    }

    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn delete(&self, group: &str) -> Result<(), GroupError> {
        self.store.delete(group).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_store::MemoryStore;
    use serde_json::json;

    fn shared() -> SharedGroupStore {
        SharedGroupStore::new(Arc::new(MemoryStore::new()), "", Duration::from_secs(60))
    }

    async fn membership_roundtrip(store: &dyn GroupStore) {
        store.add_member("lobby", "c1", json!({"user": "u1"})).await.unwrap();
        store.add_member("lobby", "c2", json!({"user": "u2"})).await.unwrap();
        store.add_member("den", "c1", json!(null)).await.unwrap();

        assert_eq!(store.size("lobby").await.unwrap(), 2);
        assert!(store.contains("lobby", "c2").await.unwrap());
        assert_eq!(store.members("lobby").await.unwrap()["c1"], json!({"user": "u1"}));

        let mut groups = store.client_groups("c1").await.unwrap();
        groups.sort();
        assert_eq!(groups, vec!["den", "lobby"]);

        let mut all = store.all_groups().await.unwrap();
        all.sort();
        assert_eq!(all, vec!["den", "lobby"]);

        let mut meta = Map::new();
        meta.insert("topic".into(), json!("general"));
        store.set_metadata("lobby", meta.clone()).await.unwrap();
        assert_eq!(store.metadata("lobby").await.unwrap(), meta);

        store.remove_member("den", "c1").await.unwrap();
        assert!(!store.exists("den").await.unwrap());
        assert_eq!(store.client_groups("c1").await.unwrap(), vec!["lobby"]);

        store.delete("lobby").await.unwrap();
        assert!(!store.exists("lobby").await.unwrap());
        assert!(store.client_groups("c1").await.unwrap().is_empty());
        assert!(store.client_groups("c2").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_memory_store_contract() {
        membership_roundtrip(&MemoryGroupStore::new()).await;
    }

    #[tokio::test]
    async fn test_shared_store_contract() {
        membership_roundtrip(&shared()).await;
    }

    #[tokio::test]
    async fn test_missing_group_members() {
        let local = MemoryGroupStore::new();
        assert!(matches!(
            local.members("nope").await,
            Err(GroupError::NotFound(_))
        ));
        assert!(shared().members("nope").await.unwrap().is_empty());

        let manager = GroupManager::memory();
        assert!(manager.member_ids("nope").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_shared_last_member_drops_metadata() {
        let backing = Arc::new(MemoryStore::new());
        let store = SharedGroupStore::new(backing.clone(), "app:", Duration::from_secs(60));

        store.add_member("g", "c1", json!({})).await.unwrap();
        store.set_metadata("g", Map::new()).await.unwrap();
        assert!(backing.exists("app:group_meta:g").await.unwrap());
        assert!(backing.ttl("app:group:g").await.unwrap().is_some());
        assert!(backing.ttl("app:client_groups:c1").await.unwrap().is_some());

        store.remove_member("g", "c1").await.unwrap();
        assert!(!backing.exists("app:group:g").await.unwrap());
        assert!(!backing.exists("app:group_meta:g").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shared_remove_refreshes_ttl() {
        let backing = Arc::new(MemoryStore::new());
        let store = SharedGroupStore::new(backing.clone(), "", Duration::from_secs(5));
        store.add_member("g", "c1", json!({})).await.unwrap();
        store.add_member("g", "c2", json!({})).await.unwrap();
        store.add_member("h", "c2", json!({})).await.unwrap();
        store.set_metadata("g", Map::new()).await.unwrap();

        tokio::time::advance(Duration::from_secs(4)).await;
        store.remove_member("g", "c2").await.unwrap();
        store.remove_member("h", "c2").await.unwrap();

        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(store.contains("g", "c1").await.unwrap());
        assert!(backing.exists("group_meta:g").await.unwrap());
        assert!(!store.exists("h").await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_shared_rejoin_keeps_new_metadata() {
        let backing: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
        let leaving = SharedGroupStore::new(backing.clone(), "", Duration::from_secs(60));
        let joining = SharedGroupStore::new(backing.clone(), "", Duration::from_secs(60));

        for round in 0..50 {
            leaving.add_member("g", "c1", json!({})).await.unwrap();

            let mut meta = Map::new();
            meta.insert("round".into(), json!(round));
            let leave = {
                let leaving = leaving.clone();
                tokio::spawn(async move { leaving.remove_member("g", "c1").await })
            };
            let join = {
                let joining = joining.clone();
                let meta = meta.clone();
                tokio::spawn(async move {
                    joining.add_member("g", "c2", json!({})).await?;
                    joining.set_metadata("g", meta).await
                })
            };
            leave.await.unwrap().unwrap();
            join.await.unwrap().unwrap();

            assert_eq!(joining.size("g").await.unwrap(), 1);
            assert_eq!(joining.metadata("g").await.unwrap(), meta, "round {round}");

            joining.remove_member("g", "c2").await.unwrap();
            assert!(!backing.exists("group_meta:g").await.unwrap());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_shared_membership_expires() {
        let store = SharedGroupStore::new(Arc::new(MemoryStore::new()), "", Duration::from_secs(5));
        store.add_member("g", "c1", json!({})).await.unwrap();

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(!store.exists("g").await.unwrap());
        assert!(store.client_groups("c1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_for_client_selects_variant() {
        let client = SharedClient::memory();
        let manager = GroupManager::for_client(&client, DEFAULT_GROUP_TTL);
        manager.add_member("g", "c1", json!({})).await.unwrap();
        assert!(client.store().unwrap().exists("group:g").await.unwrap());

        let local = GroupManager::for_client(&SharedClient::disabled(), DEFAULT_GROUP_TTL);
        local.add_member("g", "c1", json!({})).await.unwrap();
        assert!(local.exists("g").await.unwrap());
    }
}
