//! In-process store backend.
//!
//! Implements the full [`SharedStore`] contract inside one process: TTLs are
//! honoured lazily on access, streams keep a pending-entries list per
//! consumer group, and pub/sub fans out through a broadcast channel. Used
//! in tests and in single-process deployments that still want bus
//! semantics.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::ops::Bound;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, Notify};
use tokio::time::Instant;
use tracing::{trace, warn};

use crate::error::StoreError;
use crate::store::{
    Batch, BatchOp, MessageStream, PubSubMessage, ReadCursor, SharedStore, StoreResult,
    StreamEntry,
};

/// Capacity of the pub/sub fan-out channel.
const PUBSUB_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
struct EntryId {
    ms: u64,
    seq: u64,
}

impl EntryId {
    fn parse(id: &str) -> Option<Self> {
        let (ms, seq) = id.split_once('-')?;
        Some(Self {
            ms: ms.parse().ok()?,
            seq: seq.parse().ok()?,
        })
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

#[derive(Debug, Default)]
struct GroupState {
    last_delivered: EntryId,
    /// Delivered but unacknowledged entries, with their consumer.
    pending: BTreeMap<EntryId, String>,
}

#[derive(Debug, Default)]
struct StreamData {
    entries: BTreeMap<EntryId, HashMap<String, String>>,
    last_id: EntryId,
    groups: HashMap<String, GroupState>,
}

#[derive(Debug)]
enum Value {
    Str(String),
    Hash(HashMap<String, String>),
    Set(HashSet<String>),
    ZSet(HashMap<String, f64>),
    Stream(StreamData),
}

impl Value {
    /// Collections vanish when emptied; streams persist.
    fn is_empty_collection(&self) -> bool {
        match self {
            Value::Hash(h) => h.is_empty(),
            Value::Set(s) => s.is_empty(),
            Value::ZSet(z) => z.is_empty(),
            Value::Str(_) | Value::Stream(_) => false,
        }
    }
}

#[derive(Debug)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(value: Value) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

fn wrong_type(key: &str) -> StoreError {
    StoreError::WrongType(key.to_string())
}

fn no_group(key: &str, group: &str) -> StoreError {
    StoreError::NoGroup {
        stream: key.to_string(),
        group: group.to_string(),
    }
}

#[derive(Debug, Default)]
struct State {
    keys: HashMap<String, Entry>,
}

impl State {
    fn live(&mut self, key: &str) -> Option<&mut Entry> {
        let now = Instant::now();
        if self.keys.get(key).is_some_and(|e| e.is_expired(now)) {
            trace!(key = %key, "Key expired");
            self.keys.remove(key);
        }
        self.keys.get_mut(key)
    }

    fn live_or_insert(&mut self, key: &str, make: fn() -> Value) -> &mut Entry {
        let _ = self.live(key);
        self.keys
            .entry(key.to_string())
            .or_insert_with(|| Entry::new(make()))
    }

    fn drop_if_empty(&mut self, key: &str) {
        if self.keys.get(key).is_some_and(|e| e.value.is_empty_collection()) {
            self.keys.remove(key);
        }
    }

    fn string(&mut self, key: &str) -> StoreResult<Option<&String>> {
        match self.live(key) {
            None => Ok(None),
            Some(entry) => match &entry.value {
                Value::Str(s) => Ok(Some(s)),
                _ => Err(wrong_type(key)),
            },
        }
    }

    fn hash(&mut self, key: &str) -> StoreResult<Option<&mut HashMap<String, String>>> {
        match self.live(key) {
            None => Ok(None),
            Some(entry) => match &mut entry.value {
                Value::Hash(h) => Ok(Some(h)),
                _ => Err(wrong_type(key)),
            },
        }
    }

    fn hash_or_create(&mut self, key: &str) -> StoreResult<&mut HashMap<String, String>> {
        match &mut self.live_or_insert(key, || Value::Hash(HashMap::new())).value {
            Value::Hash(h) => Ok(h),
            _ => Err(wrong_type(key)),
        }
    }

    fn set(&mut self, key: &str) -> StoreResult<Option<&mut HashSet<String>>> {
        match self.live(key) {
            None => Ok(None),
            Some(entry) => match &mut entry.value {
                Value::Set(s) => Ok(Some(s)),
                _ => Err(wrong_type(key)),
            },
        }
    }

    fn set_or_create(&mut self, key: &str) -> StoreResult<&mut HashSet<String>> {
        match &mut self.live_or_insert(key, || Value::Set(HashSet::new())).value {
            Value::Set(s) => Ok(s),
            _ => Err(wrong_type(key)),
        }
    }

    fn zset(&mut self, key: &str) -> StoreResult<Option<&mut HashMap<String, f64>>> {
        match self.live(key) {
            None => Ok(None),
            Some(entry) => match &mut entry.value {
                Value::ZSet(z) => Ok(Some(z)),
                _ => Err(wrong_type(key)),
            },
        }
    }

    fn zset_or_create(&mut self, key: &str) -> StoreResult<&mut HashMap<String, f64>> {
        match &mut self.live_or_insert(key, || Value::ZSet(HashMap::new())).value {
            Value::ZSet(z) => Ok(z),
            _ => Err(wrong_type(key)),
        }
    }

    fn stream(&mut self, key: &str) -> StoreResult<Option<&mut StreamData>> {
        match self.live(key) {
            None => Ok(None),
            Some(entry) => match &mut entry.value {
                Value::Stream(s) => Ok(Some(s)),
                _ => Err(wrong_type(key)),
            },
        }
    }

    fn stream_or_create(&mut self, key: &str) -> StoreResult<&mut StreamData> {
        match &mut self
            .live_or_insert(key, || Value::Stream(StreamData::default()))
            .value
        {
            Value::Stream(s) => Ok(s),
            _ => Err(wrong_type(key)),
        }
    }

    fn set_string(&mut self, key: &str, value: &str, ttl: Option<Duration>) {
        self.keys.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
    }

    fn expire(&mut self, key: &str, ttl: Duration) -> bool {
        match self.live(key) {
            Some(entry) => {
                entry.expires_at = Some(Instant::now() + ttl);
                true
            }
            None => false,
        }
    }

    fn read_group(
        &mut self,
        key: &str,
        group: &str,
        consumer: &str,
        cursor: ReadCursor,
        count: usize,
    ) -> StoreResult<Vec<StreamEntry>> {
        let StreamData {
            entries, groups, ..
        } = self.stream(key)?.ok_or_else(|| no_group(key, group))?;
        let state = groups.get_mut(group).ok_or_else(|| no_group(key, group))?;
        let count = count.max(1);

        let picked: Vec<(EntryId, HashMap<String, String>)> = match cursor {
            ReadCursor::New => {
                let fresh: Vec<_> = entries
                    .range((Bound::Excluded(state.last_delivered), Bound::Unbounded))
                    .take(count)
                    .map(|(id, fields)| (*id, fields.clone()))
                    .collect();
                for (id, _) in &fresh {
                    state.pending.insert(*id, consumer.to_string());
                    state.last_delivered = *id;
                }
                fresh
            }
            ReadCursor::Pending => {
                // Entries deleted from the stream are acknowledged on sight.
                state
                    .pending
                    .retain(|id, owner| owner.as_str() != consumer || entries.contains_key(id));
                state
                    .pending
                    .iter()
                    .filter(|(_, owner)| owner.as_str() == consumer)
                    .filter_map(|(id, _)| entries.get(id).map(|fields| (*id, fields.clone())))
                    .take(count)
                    .collect()
            }
        };

        Ok(picked
            .into_iter()
            .map(|(id, fields)| StreamEntry {
                id: id.to_string(),
                fields,
            })
            .collect())
    }

    fn check_batch_op(&mut self, op: &BatchOp) -> StoreResult<()> {
        match op {
            BatchOp::HSet { key, .. } | BatchOp::HDel { key, .. } => self.hash(key).map(|_| ()),
            BatchOp::SAdd { key, .. } | BatchOp::SRem { key, .. } => self.set(key).map(|_| ()),
            BatchOp::DelIfEmpty { hash, .. } => self.hash(hash).map(|_| ()),
            BatchOp::Set { .. } | BatchOp::Del { .. } | BatchOp::Expire { .. } => Ok(()),
        }
    }

    fn apply_batch_op(&mut self, op: BatchOp) -> StoreResult<()> {
        match op {
            BatchOp::Set { key, value, ttl } => self.set_string(&key, &value, ttl),
            BatchOp::Del { key } => {
                self.keys.remove(&key);
            }
            BatchOp::Expire { key, ttl } => {
                self.expire(&key, ttl);
            }
            BatchOp::HSet { key, field, value } => {
                self.hash_or_create(&key)?.insert(field, value);
            }
            BatchOp::HDel { key, field } => {
                if let Some(h) = self.hash(&key)? {
                    h.remove(&field);
                }
                self.drop_if_empty(&key);
            }
            BatchOp::SAdd { key, member } => {
                self.set_or_create(&key)?.insert(member);
            }
            BatchOp::SRem { key, member } => {
                if let Some(s) = self.set(&key)? {
                    s.remove(&member);
                }
                self.drop_if_empty(&key);
            }
            BatchOp::DelIfEmpty { key, hash } => {
                if self.hash(&hash)?.map_or(true, |h| h.is_empty()) {
                    self.keys.remove(&key);
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct Published {
    channel: String,
    payload: String,
}

/// An in-memory [`SharedStore`].
///
/// `publish` reports the number of live subscriptions, whether or not their
/// patterns match the channel.
#[derive(Debug)]
pub struct MemoryStore {
    state: Mutex<State>,
    appended: Notify,
    pubsub: broadcast::Sender<Published>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        let (pubsub, _) = broadcast::channel(PUBSUB_CAPACITY);
        Self {
            state: Mutex::new(State::default()),
            appended: Notify::new(),
            pubsub,
        }
    }

    /// Number of live keys.
    pub async fn key_count(&self) -> usize {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        state.keys.retain(|_, e| !e.is_expired(now));
        state.keys.len()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut state = self.state.lock().await;
        Ok(state.string(key)?.cloned())
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        self.state.lock().await.set_string(key, value, ttl);
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        if state.live(key).is_some() {
            return Ok(false);
        }
        state.set_string(key, value, Some(ttl));
        Ok(true)
    }

    async fn del(&self, key: &str) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        let existed = state.live(key).is_some();
        state.keys.remove(key);
        Ok(existed)
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        Ok(self.state.lock().await.live(key).is_some())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        Ok(self.state.lock().await.expire(key, ttl))
    }

    async fn ttl(&self, key: &str) -> StoreResult<Option<Duration>> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        Ok(state
            .live(key)
            .and_then(|e| e.expires_at)
            .map(|at| at.saturating_duration_since(now)))
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        let owned = matches!(state.string(key), Ok(Some(v)) if v == expected);
        if owned {
            state.keys.remove(key);
        }
        Ok(owned)
    }

    async fn compare_and_expire(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        let owned = matches!(state.string(key), Ok(Some(v)) if v == expected);
        if owned {
            state.expire(key, ttl);
        }
        Ok(owned)
    }

    async fn hget_all(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        let mut state = self.state.lock().await;
        Ok(state.hash(key)?.cloned().unwrap_or_default())
    }

    async fn hlen(&self, key: &str) -> StoreResult<usize> {
        let mut state = self.state.lock().await;
        Ok(state.hash(key)?.map_or(0, |h| h.len()))
    }

    async fn hexists(&self, key: &str, field: &str) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        Ok(state.hash(key)?.is_some_and(|h| h.contains_key(field)))
    }

    async fn hkeys(&self, key: &str) -> StoreResult<Vec<String>> {
        let mut state = self.state.lock().await;
        Ok(state
            .hash(key)?
            .map(|h| h.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn smembers(&self, key: &str) -> StoreResult<Vec<String>> {
        let mut state = self.state.lock().await;
        Ok(state
            .set(key)?
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn scan_prefix(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        state.keys.retain(|_, e| !e.is_expired(now));
        Ok(state
            .keys
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        state.zset_or_create(key)?.insert(member.to_string(), score);
        Ok(())
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
        limit: Option<usize>,
    ) -> StoreResult<Vec<String>> {
        let mut state = self.state.lock().await;
        let Some(zset) = state.zset(key)? else {
            return Ok(Vec::new());
        };
        let mut hits: Vec<(&String, f64)> = zset
            .iter()
            .filter(|(_, score)| **score >= min && **score <= max)
            .map(|(member, score)| (member, *score))
            .collect();
        hits.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(b.0)));
        Ok(hits
            .into_iter()
            .take(limit.unwrap_or(usize::MAX))
            .map(|(member, _)| member.clone())
            .collect())
    }

    async fn zrem(&self, key: &str, member: &str) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        let removed = state
            .zset(key)?
            .is_some_and(|z| z.remove(member).is_some());
        state.drop_if_empty(key);
        Ok(removed)
    }

    async fn zcard(&self, key: &str) -> StoreResult<usize> {
        let mut state = self.state.lock().await;
        Ok(state.zset(key)?.map_or(0, |z| z.len()))
    }

    async fn xadd(&self, key: &str, field: &str, value: &str) -> StoreResult<String> {
        let id = {
            let mut state = self.state.lock().await;
            let stream = state.stream_or_create(key)?;
            let ms = u64::try_from(Utc::now().timestamp_millis()).unwrap_or_default();
            let id = if ms > stream.last_id.ms {
                EntryId { ms, seq: 0 }
            } else {
                EntryId {
                    ms: stream.last_id.ms,
                    seq: stream.last_id.seq + 1,
                }
            };
            let mut fields = HashMap::with_capacity(1);
            fields.insert(field.to_string(), value.to_string());
            stream.entries.insert(id, fields);
            stream.last_id = id;
            id
        };
        self.appended.notify_waiters();
        Ok(id.to_string())
    }

    async fn xlen(&self, key: &str) -> StoreResult<usize> {
        let mut state = self.state.lock().await;
        Ok(state.stream(key)?.map_or(0, |s| s.entries.len()))
    }

    async fn xdel(&self, key: &str, ids: &[String]) -> StoreResult<usize> {
        let mut state = self.state.lock().await;
        let Some(stream) = state.stream(key)? else {
            return Ok(0);
        };
        Ok(ids
            .iter()
            .filter_map(|id| EntryId::parse(id))
            .filter(|id| stream.entries.remove(id).is_some())
            .count())
    }

    async fn xrange(&self, key: &str, count: Option<usize>) -> StoreResult<Vec<StreamEntry>> {
        let mut state = self.state.lock().await;
        let Some(stream) = state.stream(key)? else {
            return Ok(Vec::new());
        };
        Ok(stream
            .entries
            .iter()
            .take(count.unwrap_or(usize::MAX))
            .map(|(id, fields)| StreamEntry {
                id: id.to_string(),
                fields: fields.clone(),
            })
            .collect())
    }

    async fn xgroup_create(&self, key: &str, group: &str) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        state
            .stream_or_create(key)?
            .groups
            .entry(group.to_string())
            .or_default();
        Ok(())
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
        let deadline = block.map(|b| Instant::now() + b);
        loop {
            // Register interest before looking so an append between the
            // check and the wait is not missed.
            let notified = self.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock().await;
                let entries = state.read_group(key, group, consumer, cursor, count)?;
                if !entries.is_empty() || cursor == ReadCursor::Pending {
                    return Ok(entries);
                }
            }

            let Some(deadline) = deadline else {
                return Ok(Vec::new());
            };
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn xack(&self, key: &str, group: &str, ids: &[String]) -> StoreResult<usize> {
        let mut state = self.state.lock().await;
        let Some(stream) = state.stream(key)? else {
            return Ok(0);
        };
        let Some(group_state) = stream.groups.get_mut(group) else {
            return Ok(0);
        };
        Ok(ids
            .iter()
            .filter_map(|id| EntryId::parse(id))
            .filter(|id| group_state.pending.remove(id).is_some())
            .count())
    }

    async fn publish(&self, channel: &str, payload: &str) -> StoreResult<usize> {
        let published = Published {
            channel: channel.to_string(),
            payload: payload.to_string(),
        };
        Ok(self.pubsub.send(published).unwrap_or(0))
    }

    async fn psubscribe(&self, patterns: &[String]) -> StoreResult<MessageStream> {
        let rx = self.pubsub.subscribe();
        let patterns = patterns.to_vec();

        let stream = futures_util::stream::unfold((rx, patterns), |(mut rx, patterns)| async move {
            loop {
                match rx.recv().await {
                    Ok(msg) => {
                        let matched = patterns
                            .iter()
                            .find(|p| glob_match(p, &msg.channel))
                            .cloned();
                        if let Some(pattern) = matched {
                            let item = PubSubMessage {
                                pattern,
                                channel: msg.channel,
                                payload: msg.payload,
                            };
                            return Some((item, (rx, patterns)));
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Pub/sub subscriber lagged, messages dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });

        Ok(Box::pin(stream))
    }

    async fn exec_batch(&self, batch: Batch) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        for op in batch.ops() {
            state.check_batch_op(op)?;
        }
        for op in batch.into_ops() {
            state.apply_batch_op(op)?;
        }
        Ok(())
    }
}

/// Match `text` against a glob pattern supporting `*` and `?`.
pub(crate) fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some((pi, ti));
            pi += 1;
        } else if let Some((sp, st)) = star {
            pi = sp + 1;
            ti = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[test]
    fn test_glob_match() {
        assert!(glob_match("user:*", "user:42"));
        assert!(glob_match("user:*", "user:"));
        assert!(glob_match("*:room:?", "websocket:room:a"));
        assert!(glob_match("broadcast", "broadcast"));
        assert!(!glob_match("user:*", "room:1"));
        assert!(!glob_match("room:?", "room:ab"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry() {
        let store = MemoryStore::new();
        store.set("k", "v", Some(Duration::from_secs(5))).await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));
        assert_eq!(store.ttl("k").await.unwrap(), Some(Duration::from_secs(5)));

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(!store.exists("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_set_nx_and_compare() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(10);
        assert!(store.set_nx("lock", "a", ttl).await.unwrap());
        assert!(!store.set_nx("lock", "b", ttl).await.unwrap());

        assert!(!store.compare_and_delete("lock", "b").await.unwrap());
        assert!(store.compare_and_expire("lock", "a", ttl).await.unwrap());
        assert!(store.compare_and_delete("lock", "a").await.unwrap());
        assert!(!store.exists("lock").await.unwrap());
    }

    #[tokio::test]
    async fn test_wrong_type() {
        let store = MemoryStore::new();
        store.set("k", "v", None).await.unwrap();
        match store.hget_all("k").await {
            Err(StoreError::WrongType(key)) => assert_eq!(key, "k"),
            other => panic!("Expected WrongType, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_batch_and_empty_collections() {
        let store = MemoryStore::new();
        let batch = Batch::new()
            .hset("group:a", "c1", "{}")
            .sadd("client_groups:c1", "a")
            .expire("group:a", Duration::from_secs(60));
        store.exec_batch(batch).await.unwrap();

        assert_eq!(store.hlen("group:a").await.unwrap(), 1);
        assert_eq!(store.smembers("client_groups:c1").await.unwrap(), vec!["a"]);

        let batch = Batch::new()
            .hdel("group:a", "c1")
            .srem("client_groups:c1", "a");
        store.exec_batch(batch).await.unwrap();
        assert!(!store.exists("group:a").await.unwrap());
        assert!(!store.exists("client_groups:c1").await.unwrap());
    }

    #[tokio::test]
    async fn test_batch_rejected_as_a_whole() {
        let store = MemoryStore::new();
        store.set("s", "v", None).await.unwrap();
        let batch = Batch::new().sadd("ok", "m").hset("s", "f", "v");
        assert!(store.exec_batch(batch).await.is_err());
        assert!(!store.exists("ok").await.unwrap());
    }

    #[tokio::test]
    async fn test_zrange_by_score() {
        let store = MemoryStore::new();
        store.zadd("z", "late", 30.0).await.unwrap();
        store.zadd("z", "early", 10.0).await.unwrap();
        store.zadd("z", "mid", 20.0).await.unwrap();

        let due = store.zrange_by_score("z", 0.0, 20.0, None).await.unwrap();
        assert_eq!(due, vec!["early", "mid"]);
        let first = store.zrange_by_score("z", 0.0, 100.0, Some(1)).await.unwrap();
        assert_eq!(first, vec!["early"]);

        assert!(store.zrem("z", "early").await.unwrap());
        assert!(!store.zrem("z", "early").await.unwrap());
        assert_eq!(store.zcard("z").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_stream_consumer_group() {
        let store = MemoryStore::new();
        store.xgroup_create("s", "g").await.unwrap();
        store.xgroup_create("s", "g").await.unwrap();

        let first = store.xadd("s", "message", "one").await.unwrap();
        store.xadd("s", "message", "two").await.unwrap();
        assert_eq!(store.xlen("s").await.unwrap(), 2);

        let read = store
            .xread_group("s", "g", "c1", ReadCursor::New, 1, None)
            .await
            .unwrap();
        assert_eq!(read.len(), 1);
        assert_eq!(read[0].id, first);
        assert_eq!(read[0].field("message"), Some("one"));

        // Unacknowledged entries stay pending for the same consumer only.
        let pending = store
            .xread_group("s", "g", "c1", ReadCursor::Pending, 10, None)
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        let other = store
            .xread_group("s", "g", "c2", ReadCursor::Pending, 10, None)
            .await
            .unwrap();
        assert!(other.is_empty());

        assert_eq!(store.xack("s", "g", &[first.clone()]).await.unwrap(), 1);
        let pending = store
            .xread_group("s", "g", "c1", ReadCursor::Pending, 10, None)
            .await
            .unwrap();
        assert!(pending.is_empty());

        let rest = store
            .xread_group("s", "g", "c2", ReadCursor::New, 10, None)
            .await
            .unwrap();
        assert_eq!(rest[0].field("message"), Some("two"));
    }

    #[tokio::test]
    async fn test_pending_entry_without_data_is_acknowledged() {
        let store = MemoryStore::new();
        store.xgroup_create("s", "g").await.unwrap();
        let gone = store.xadd("s", "message", "one").await.unwrap();
        store.xadd("s", "message", "two").await.unwrap();
        store
            .xread_group("s", "g", "c", ReadCursor::New, 10, None)
            .await
            .unwrap();

        store.xdel("s", &[gone.clone()]).await.unwrap();
        let pending = store
            .xread_group("s", "g", "c", ReadCursor::Pending, 1, None)
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].field("message"), Some("two"));
        assert_eq!(store.xack("s", "g", &[gone]).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_del_if_empty_sees_earlier_ops() {
        let store = MemoryStore::new();
        store.set("meta", "{}", None).await.unwrap();
        store
            .exec_batch(Batch::new().hset("members", "a", "1").hset("members", "b", "1"))
            .await
            .unwrap();

        let remove_a = Batch::new().hdel("members", "a").del_if_empty("meta", "members");
        assert!(remove_a.is_conditional());
        store.exec_batch(remove_a).await.unwrap();
        assert!(store.exists("meta").await.unwrap());

        store
            .exec_batch(Batch::new().hdel("members", "b").del_if_empty("meta", "members"))
            .await
            .unwrap();
        assert!(!store.exists("meta").await.unwrap());
        assert!(!store.exists("members").await.unwrap());
    }

    #[tokio::test]
    async fn test_read_missing_group() {
        let store = MemoryStore::new();
        let err = store
            .xread_group("s", "g", "c", ReadCursor::New, 1, None)
            .await
            .unwrap_err();
        assert!(err.is_no_group());
    }

    #[tokio::test]
    async fn test_blocking_read_wakes_on_append() {
        let store = std::sync::Arc::new(MemoryStore::new());
        store.xgroup_create("s", "g").await.unwrap();

        let reader = {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .xread_group("s", "g", "c", ReadCursor::New, 1, Some(Duration::from_secs(5)))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        store.xadd("s", "message", "hello").await.unwrap();

        let entries = reader.await.unwrap().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].field("message"), Some("hello"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocking_read_times_out() {
        let store = MemoryStore::new();
        store.xgroup_create("s", "g").await.unwrap();
        let entries = store
            .xread_group("s", "g", "c", ReadCursor::New, 1, Some(Duration::from_millis(100)))
            .await
            .unwrap();
        assert!(entries.is_empty());
    }

    #[tokio::test]
    async fn test_pattern_subscribe() {
        let store = MemoryStore::new();
        let mut sub = store
            .psubscribe(&["user:*".to_string(), "broadcast".to_string()])
            .await
            .unwrap();

        store.publish("room:1", "ignored").await.unwrap();
        store.publish("user:7", "hi").await.unwrap();

        let msg = sub.next().await.unwrap();
        assert_eq!(msg.pattern, "user:*");
        assert_eq!(msg.channel, "user:7");
        assert_eq!(msg.payload, "hi");
    }
}
