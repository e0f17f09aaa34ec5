//! Redis store backend.
//!
//! Regular commands share one auto-reconnecting [`ConnectionManager`].
//! Blocking stream reads and pattern subscriptions each take a dedicated
//! connection so they never stall other traffic on the multiplexed link.
//! A blocking reader keeps its connection across reads and only reconnects
//! after an error.

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::streams::{StreamRangeReply, StreamReadReply};
use redis::{Client, RedisError, Script};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::store::{
    Batch, BatchOp, MessageStream, PubSubMessage, ReadCursor, SharedStore, StoreResult,
    StreamEntry,
};

const COMPARE_AND_DELETE: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("del", KEYS[1])
else
    return 0
end
"#;

const COMPARE_AND_EXPIRE: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("pexpire", KEYS[1], ARGV[2])
else
    return 0
end
"#;

/// Runs a batch encoded as `name, argc, args...` groups in ARGV. Plain
/// names are passed to `redis.call`; `DELIFEMPTY key hash` deletes `key`
/// when `hash` has no fields.
const EXEC_BATCH: &str = r#"
local i = 1
while i <= #ARGV do
    local name = ARGV[i]
    local argc = tonumber(ARGV[i + 1])
    local args = {}
    for j = 1, argc do
        args[j] = ARGV[i + 1 + j]
    end
    if name == "DELIFEMPTY" then
        if redis.call("hlen", args[2]) == 0 then
            redis.call("del", args[1])
        end
    else
        redis.call(name, unpack(args))
    end
    i = i + 2 + argc
end
return 0
"#;

/// Keys fetched per `SCAN` round trip.
const SCAN_COUNT: usize = 100;

/// A [`SharedStore`] backed by a Redis server.
pub struct RedisStore {
    client: Client,
    manager: ConnectionManager,
    /// Blocking read connections, one per stream, group and consumer.
    readers: Mutex<HashMap<String, MultiplexedConnection>>,
    compare_and_delete: Script,
    compare_and_expire: Script,
    exec_batch: Script,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore").finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connect to the server at `url` and verify it answers `PING`.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid or the server is unreachable.
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let client = Client::open(url)?;
        let mut manager = ConnectionManager::new(client.clone()).await?;
        let pong: String = redis::cmd("PING").query_async(&mut manager).await?;
        info!(reply = %pong, "Connected to Redis");

        Ok(Self {
            client,
            manager,
            readers: Mutex::new(HashMap::new()),
            compare_and_delete: Script::new(COMPARE_AND_DELETE),
            compare_and_expire: Script::new(COMPARE_AND_EXPIRE),
            exec_batch: Script::new(EXEC_BATCH),
        })
    }

    fn con(&self) -> ConnectionManager {
        self.manager.clone()
    }

    /// The dedicated connection of one blocking reader, opened on first use.
    async fn reader(&self, name: &str) -> StoreResult<MultiplexedConnection> {
        let mut readers = self.readers.lock().await;
        if let Some(con) = readers.get(name) {
            return Ok(con.clone());
        }
        let con = self.client.get_multiplexed_async_connection().await?;
        debug!(reader = %name, "Opened blocking read connection");
        readers.insert(name.to_string(), con.clone());
        Ok(con)
    }

    async fn drop_reader(&self, name: &str) {
        self.readers.lock().await.remove(name);
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX).max(1)
}

/// Command name and arguments of a batch operation.
fn batch_command(op: BatchOp) -> (&'static str, Vec<String>) {
    match op {
        BatchOp::Set { key, value, ttl } => match ttl {
            Some(ttl) => ("SET", vec![key, value, "PX".to_string(), millis(ttl).to_string()]),
            None => ("SET", vec![key, value]),
        },
        BatchOp::Del { key } => ("DEL", vec![key]),
        BatchOp::Expire { key, ttl } => ("PEXPIRE", vec![key, millis(ttl).to_string()]),
        BatchOp::HSet { key, field, value } => ("HSET", vec![key, field, value]),
        BatchOp::HDel { key, field } => ("HDEL", vec![key, field]),
        BatchOp::SAdd { key, member } => ("SADD", vec![key, member]),
        BatchOp::SRem { key, member } => ("SREM", vec![key, member]),
        BatchOp::DelIfEmpty { key, hash } => ("DELIFEMPTY", vec![key, hash]),
    }
}

fn map_group_error(err: RedisError, key: &str, group: &str) -> StoreError {
    if err.code() == Some("NOGROUP") {
        StoreError::NoGroup {
            stream: key.to_string(),
            group: group.to_string(),
        }
    } else {
        StoreError::Redis(err)
    }
}

fn to_entry(id: redis::streams::StreamId) -> StreamEntry {
    let mut fields = HashMap::with_capacity(id.map.len());
    for name in id.map.keys() {
        if let Some(value) = id.get::<String>(name) {
            fields.insert(name.clone(), value);
        }
    }
    StreamEntry { id: id.id, fields }
}

#[async_trait]
impl SharedStore for RedisStore {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut self.con()).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(millis(ttl));
        }
        let _: () = cmd.query_async(&mut self.con()).await?;
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(millis(ttl))
            .query_async(&mut self.con())
            .await?;
        Ok(reply.is_some())
    }

    async fn del(&self, key: &str) -> StoreResult<bool> {
        let removed: u64 = redis::cmd("DEL").arg(key).query_async(&mut self.con()).await?;
        Ok(removed > 0)
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        let count: u64 = redis::cmd("EXISTS").arg(key).query_async(&mut self.con()).await?;
        Ok(count > 0)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        let set: bool = redis::cmd("PEXPIRE")
            .arg(key)
            .arg(millis(ttl))
            .query_async(&mut self.con())
            .await?;
        Ok(set)
    }

    async fn ttl(&self, key: &str) -> StoreResult<Option<Duration>> {
        let ms: i64 = redis::cmd("PTTL").arg(key).query_async(&mut self.con()).await?;
        // -2: missing key, -1: no expiry
        Ok(u64::try_from(ms).ok().map(Duration::from_millis))
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> StoreResult<bool> {
        let removed: i64 = self
            .compare_and_delete
            .key(key)
            .arg(expected)
            .invoke_async(&mut self.con())
            .await?;
        Ok(removed == 1)
    }

    async fn compare_and_expire(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> StoreResult<bool> {
        let set: i64 = self
            .compare_and_expire
            .key(key)
            .arg(expected)
            .arg(millis(ttl))
            .invoke_async(&mut self.con())
            .await?;
        Ok(set == 1)
    }

    async fn hget_all(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        let map: HashMap<String, String> =
            redis::cmd("HGETALL").arg(key).query_async(&mut self.con()).await?;
        Ok(map)
    }

    async fn hlen(&self, key: &str) -> StoreResult<usize> {
        let len: usize = redis::cmd("HLEN").arg(key).query_async(&mut self.con()).await?;
        Ok(len)
    }

    async fn hexists(&self, key: &str, field: &str) -> StoreResult<bool> {
        let present: bool = redis::cmd("HEXISTS")
            .arg(key)
            .arg(field)
            .query_async(&mut self.con())
            .await?;
        Ok(present)
    }

    async fn hkeys(&self, key: &str) -> StoreResult<Vec<String>> {
        let keys: Vec<String> = redis::cmd("HKEYS").arg(key).query_async(&mut self.con()).await?;
        Ok(keys)
    }

    async fn smembers(&self, key: &str) -> StoreResult<Vec<String>> {
        let members: Vec<String> =
            redis::cmd("SMEMBERS").arg(key).query_async(&mut self.con()).await?;
        Ok(members)
    }

    async fn scan_prefix(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let mut con = self.con();
        let pattern = format!("{prefix}*");
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut con)
                .await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> StoreResult<()> {
        let _: () = redis::cmd("ZADD")
            .arg(key)
            .arg(score)
            .arg(member)
            .query_async(&mut self.con())
            .await?;
        Ok(())
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
        limit: Option<usize>,
    ) -> StoreResult<Vec<String>> {
        let mut cmd = redis::cmd("ZRANGEBYSCORE");
        cmd.arg(key).arg(min).arg(max);
        if let Some(limit) = limit {
            cmd.arg("LIMIT").arg(0).arg(limit);
        }
        let members: Vec<String> = cmd.query_async(&mut self.con()).await?;
        Ok(members)
    }

    async fn zrem(&self, key: &str, member: &str) -> StoreResult<bool> {
        let removed: u64 = redis::cmd("ZREM")
            .arg(key)
            .arg(member)
            .query_async(&mut self.con())
            .await?;
        Ok(removed > 0)
    }

    async fn zcard(&self, key: &str) -> StoreResult<usize> {
        let len: usize = redis::cmd("ZCARD").arg(key).query_async(&mut self.con()).await?;
        Ok(len)
    }

    async fn xadd(&self, key: &str, field: &str, value: &str) -> StoreResult<String> {
        let id: String = redis::cmd("XADD")
            .arg(key)
            .arg("*")
            .arg(field)
            .arg(value)
            .query_async(&mut self.con())
            .await?;
        Ok(id)
    }

    async fn xlen(&self, key: &str) -> StoreResult<usize> {
        let len: usize = redis::cmd("XLEN").arg(key).query_async(&mut self.con()).await?;
        Ok(len)
    }

    async fn xdel(&self, key: &str, ids: &[String]) -> StoreResult<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let removed: usize = redis::cmd("XDEL")
            .arg(key)
            .arg(ids)
            .query_async(&mut self.con())
            .await?;
        Ok(removed)
    }

    async fn xrange(&self, key: &str, count: Option<usize>) -> StoreResult<Vec<StreamEntry>> {
        let mut cmd = redis::cmd("XRANGE");
        cmd.arg(key).arg("-").arg("+");
        if let Some(count) = count {
            cmd.arg("COUNT").arg(count);
        }
        let reply: StreamRangeReply = cmd.query_async(&mut self.con()).await?;
        Ok(reply.ids.into_iter().map(to_entry).collect())
    }

    async fn xgroup_create(&self, key: &str, group: &str) -> StoreResult<()> {
        let created: Result<(), RedisError> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(key)
            .arg(group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut self.con())
            .await;
        match created {
            Ok(()) => {
                debug!(stream = %key, group = %group, "Created consumer group");
                Ok(())
            }
            Err(err) if err.code() == Some("BUSYGROUP") => Ok(()),
            Err(err) => Err(err.into()),
        }
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
        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP")
            .arg(group)
            .arg(consumer)
            .arg("COUNT")
            .arg(count.max(1));

        let block = block.filter(|b| !b.is_zero() && cursor == ReadCursor::New);
        if let Some(block) = block {
            cmd.arg("BLOCK").arg(millis(block));
        }
        cmd.arg("STREAMS").arg(key).arg(match cursor {
            ReadCursor::New => ">",
            ReadCursor::Pending => "0",
        });

        let reply: Result<Option<StreamReadReply>, RedisError> = if block.is_some() {
            let reader = format!("{key}\n{group}\n{consumer}");
            let mut con = self.reader(&reader).await?;
            let reply = cmd.query_async(&mut con).await;
            if reply.as_ref().is_err_and(|err| err.code().is_none()) {
                self.drop_reader(&reader).await;
            }
            reply
        } else {
            cmd.query_async(&mut self.con()).await
        };
        let reply = reply.map_err(|err| map_group_error(err, key, group))?;

        // Pending entries deleted from the stream come back empty.
        let (live, gone): (Vec<_>, Vec<_>) = reply
            .map(|reply| reply.keys.into_iter().flat_map(|k| k.ids).collect::<Vec<_>>())
            .unwrap_or_default()
            .into_iter()
            .partition(|id| !id.map.is_empty());

        if !gone.is_empty() {
            let ids: Vec<String> = gone.into_iter().map(|id| id.id).collect();
            debug!(stream = %key, group = %group, count = ids.len(), "Acknowledging pending entries with no data");
            self.xack(key, group, &ids).await?;
        }

        Ok(live.into_iter().map(to_entry).collect())
    }

    async fn xack(&self, key: &str, group: &str, ids: &[String]) -> StoreResult<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let acked: usize = redis::cmd("XACK")
            .arg(key)
            .arg(group)
            .arg(ids)
            .query_async(&mut self.con())
            .await?;
        Ok(acked)
    }

    async fn publish(&self, channel: &str, payload: &str) -> StoreResult<usize> {
        let receivers: usize = redis::cmd("PUBLISH")
            .arg(channel)
            .arg(payload)
            .query_async(&mut self.con())
            .await?;
        Ok(receivers)
    }

    async fn psubscribe(&self, patterns: &[String]) -> StoreResult<MessageStream> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        for pattern in patterns {
            pubsub.psubscribe(pattern).await?;
        }
        debug!(patterns = ?patterns, "Pattern subscription established");

        let stream = pubsub.into_on_message().filter_map(|msg| async move {
            let payload: String = match msg.get_payload() {
                Ok(payload) => payload,
                Err(err) => {
                    warn!(channel = %msg.get_channel_name(), error = %err, "Non-text pub/sub payload");
                    return None;
                }
            };
            let pattern: String = msg.get_pattern().unwrap_or_default();
            Some(PubSubMessage {
                pattern,
                channel: msg.get_channel_name().to_string(),
                payload,
            })
        });
        Ok(Box::pin(stream))
    }

    async fn exec_batch(&self, batch: Batch) -> StoreResult<()> {
        if batch.is_empty() {
            return Ok(());
        }

        if batch.is_conditional() {
            let mut invocation = self.exec_batch.prepare_invoke();
            for (name, args) in batch.into_ops().into_iter().map(batch_command) {
                invocation.arg(name).arg(args.len());
                for arg in args {
                    invocation.arg(arg);
                }
            }
            let _: i64 = invocation.invoke_async(&mut self.con()).await?;
            return Ok(());
        }

        let mut pipe = redis::pipe();
        pipe.atomic();
        for (name, args) in batch.into_ops().into_iter().map(batch_command) {
            pipe.cmd(name).arg(args).ignore();
        }
        let _: () = pipe.query_async(&mut self.con()).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    //! Run against a live server with
    //! `COURIER_REDIS_URL=redis://127.0.0.1:6379 cargo test -p courier-store -- --ignored`.

    use super::*;

    async fn connect() -> Option<(RedisStore, String)> {
        let url = std::env::var("COURIER_REDIS_URL").ok()?;
        let store = RedisStore::connect(&url).await.unwrap();
        Some((store, format!("courier-test:{}:", uuid::Uuid::new_v4())))
    }

    #[tokio::test]
    #[ignore = "needs COURIER_REDIS_URL"]
    async fn test_compare_and_delete_and_expire() {
        let Some((store, ns)) = connect().await else { return };
        let key = format!("{ns}lock");

        assert!(store.set_nx(&key, "me", Duration::from_secs(5)).await.unwrap());
        assert!(!store.set_nx(&key, "you", Duration::from_secs(5)).await.unwrap());

        assert!(!store.compare_and_expire(&key, "you", Duration::from_secs(60)).await.unwrap());
        assert!(store.compare_and_expire(&key, "me", Duration::from_secs(60)).await.unwrap());
        assert!(store.ttl(&key).await.unwrap().unwrap() > Duration::from_secs(5));

        assert!(!store.compare_and_delete(&key, "you").await.unwrap());
        assert!(store.compare_and_delete(&key, "me").await.unwrap());
        assert!(!store.exists(&key).await.unwrap());
        assert!(!store.compare_and_delete(&key, "me").await.unwrap());
    }

    #[tokio::test]
    #[ignore = "needs COURIER_REDIS_URL"]
    async fn test_exec_batch() {
        let Some((store, ns)) = connect().await else { return };
        let (group, meta, index) = (format!("{ns}group"), format!("{ns}meta"), format!("{ns}index"));

        store
            .exec_batch(
                Batch::new()
                    .hset(&group, "c1", "{}")
                    .expire(&group, Duration::from_secs(30))
                    .set(&meta, "{}", Some(Duration::from_secs(30)))
                    .sadd(&index, "g"),
            )
            .await
            .unwrap();
        assert_eq!(store.hkeys(&group).await.unwrap(), vec!["c1"]);
        assert!(store.ttl(&group).await.unwrap().is_some());
        assert_eq!(store.smembers(&index).await.unwrap(), vec!["g"]);

        store
            .exec_batch(Batch::new().hset(&group, "c2", "{}").del_if_empty(&meta, &group))
            .await
            .unwrap();
        assert!(store.exists(&meta).await.unwrap());

        store
            .exec_batch(
                Batch::new()
                    .hdel(&group, "c1")
                    .hdel(&group, "c2")
                    .srem(&index, "g")
                    .del_if_empty(&meta, &group),
            )
            .await
            .unwrap();
        assert!(!store.exists(&group).await.unwrap());
        assert!(!store.exists(&meta).await.unwrap());
        assert!(!store.exists(&index).await.unwrap());
    }

    #[tokio::test]
    #[ignore = "needs COURIER_REDIS_URL"]
    async fn test_blocking_reads_share_one_connection() {
        let Some((store, ns)) = connect().await else { return };
        let stream = format!("{ns}stream");
        store.xgroup_create(&stream, "g").await.unwrap();

        for _ in 0..3 {
            let read = store
                .xread_group(&stream, "g", "c", ReadCursor::New, 10, Some(Duration::from_millis(20)))
                .await
                .unwrap();
            assert!(read.is_empty());
        }
        assert_eq!(store.readers.lock().await.len(), 1);

        let gone = store.xadd(&stream, "message", "one").await.unwrap();
        store.xadd(&stream, "message", "two").await.unwrap();
        let read = store
            .xread_group(&stream, "g", "c", ReadCursor::New, 10, Some(Duration::from_millis(20)))
            .await
            .unwrap();
        assert_eq!(read.len(), 2);

        store.xdel(&stream, &[gone.clone()]).await.unwrap();
        let pending = store
            .xread_group(&stream, "g", "c", ReadCursor::Pending, 10, None)
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].field("message"), Some("two"));
        assert_eq!(store.xack(&stream, "g", &[gone]).await.unwrap(), 0);

        store.del(&stream).await.unwrap();
    }
}
