use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::warn;

use crate::clock::{Clock, SystemClock};
use crate::codec::{Codec, JsonCodec};
use crate::config::RedisConfig;
use crate::error::{QueueError, QueueResult};
use crate::idgen::IdGenerator;
use crate::lifecycle;
use crate::message::Message;
use crate::queue::{Queue, SIZE_UNSUPPORTED};
use crate::recovery::DEFAULT_BATCH_LIMIT;

/// Atomic take: pop the head id off the queued list, score it into the
/// in-flight sorted set at the supplied take-time, and return the stored
/// message bytes. KEYS = [list, sorted set, hash], ARGV = [now_ms].
const TAKE_SCRIPT: &str = r#"
local qid = redis.call("lpop", KEYS[1])
if qid then
  redis.call("zadd", KEYS[2], ARGV[1], qid)
  return redis.call("hget", KEYS[3], qid)
end
return nil
"#;

/// Atomic in-flight -> queued move: only the actor whose ZREM actually
/// removed the id gets to RPUSH it, so concurrent recoverers cannot
/// duplicate a message. KEYS = [sorted set, list], ARGV = [id].
const MOVE_SCRIPT: &str = r#"
local removed = redis.call("zrem", KEYS[1], ARGV[1])
if removed == 1 then
  redis.call("rpush", KEYS[2], ARGV[1])
  return 1
end
return 0
"#;

/// Key-value queue over three Redis structures: a hash (`id → serialized
/// message`), a list of queued ids (FIFO), and a sorted set of in-flight
/// ids scored by take-time.
///
/// Single-command atomicity comes from Redis itself; multi-structure
/// transitions run as `MULTI`/`EXEC` pipelines, and the two races that
/// matter (take, in-flight recovery) as server-side Lua scripts. The
/// multiplexed connection is shared, with a semaphore bounding concurrent
/// borrows to `pool_size` and failing borrows that wait longer than
/// `wait_ms`.
pub struct RedisQueue {
    manager: ConnectionManager,
    permits: Arc<Semaphore>,
    wait: Duration,
    hash_name: String,
    list_name: String,
    sorted_set_name: String,
    take_script: Script,
    move_script: Script,
    codec: Arc<dyn Codec>,
    clock: Arc<dyn Clock>,
    idgen: IdGenerator,
}

impl std::fmt::Debug for RedisQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisQueue")
            .field("wait", &self.wait)
            .field("hash_name", &self.hash_name)
            .field("list_name", &self.list_name)
            .field("sorted_set_name", &self.sorted_set_name)
            .finish_non_exhaustive()
    }
}

impl RedisQueue {
    /// Connect to `host_port` with a dedicated client.
    pub async fn connect(config: RedisConfig) -> QueueResult<Self> {
        let url = format!("redis://{}", config.host_port);
        let client = redis::Client::open(url)
            .map_err(|e| QueueError::Config(format!("invalid redis address: {e}")))?;
        Self::with_client(client, config).await
    }

    /// Build on a caller-supplied client (shared with other components).
    pub async fn with_client(client: redis::Client, config: RedisConfig) -> QueueResult<Self> {
        Self::with_client_and_clock(client, config, Arc::new(SystemClock)).await
    }

    pub async fn with_client_and_clock(
        client: redis::Client,
        config: RedisConfig,
        clock: Arc<dyn Clock>,
    ) -> QueueResult<Self> {
        validate(&config)?;
        let manager = client.get_connection_manager().await?;
        Ok(Self {
            manager,
            permits: Arc::new(Semaphore::new(config.pool_size as usize)),
            wait: Duration::from_millis(config.wait_ms),
            hash_name: config.hash_name,
            list_name: config.list_name,
            sorted_set_name: config.sorted_set_name,
            take_script: Script::new(TAKE_SCRIPT),
            move_script: Script::new(MOVE_SCRIPT),
            codec: Arc::new(JsonCodec),
            clock: clock.clone(),
            idgen: IdGenerator::new(clock),
        })
    }

    /// Swap the wire format. Messages already stored keep their old
    /// encoding, so change codecs only on an empty queue.
    pub fn with_codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = codec;
        self
    }

    /// Borrow a connection slot. The permit rides along with the borrowed
    /// connection and is released on every exit path.
    async fn borrow(&self) -> QueueResult<(OwnedSemaphorePermit, ConnectionManager)> {
        let permit = tokio::time::timeout(self.wait, self.permits.clone().acquire_owned())
            .await
            .map_err(|_| {
                QueueError::Transient("timed out waiting for a redis connection".to_string())
            })?
            .map_err(|e| QueueError::Backend(format!("connection limiter closed: {e}")))?;
        Ok((permit, self.manager.clone()))
    }

    /// Store a message the queue has not seen before: hash entry + queued id.
    async fn store_new(&self, msg: &Message) -> QueueResult<()> {
        let data = self.codec.encode(msg)?;
        let field = msg.id.to_string();
        let (_permit, mut conn) = self.borrow().await?;
        let _: () = redis::pipe()
            .atomic()
            .hset(&self.hash_name, &field, data)
            .ignore()
            .rpush(&self.list_name, &field)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    /// Store a previously delivered message: release the in-flight entry
    /// first, then refresh the hash and append to the queued list, all in
    /// one transaction.
    async fn store_old(&self, msg: &Message) -> QueueResult<()> {
        let data = self.codec.encode(msg)?;
        let field = msg.id.to_string();
        let (_permit, mut conn) = self.borrow().await?;
        let _: () = redis::pipe()
            .atomic()
            .zrem(&self.sorted_set_name, &field)
            .ignore()
            .hset(&self.hash_name, &field, data)
            .ignore()
            .rpush(&self.list_name, &field)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Queue for RedisQueue {
    async fn queue(&self, msg: &Message) -> QueueResult<bool> {
        let mut stamped = lifecycle::prepare_enqueue(msg, self.clock.now_ms());
        if stamped.id == 0 {
            stamped.id = self.idgen.next_id();
        }
        self.store_new(&stamped).await?;
        Ok(true)
    }

    async fn requeue(&self, msg: &Message) -> QueueResult<bool> {
        let stamped = lifecycle::prepare_requeue(msg, self.clock.now_ms());
        self.store_old(&stamped).await?;
        Ok(true)
    }

    async fn requeue_silent(&self, msg: &Message) -> QueueResult<bool> {
        let stamped = lifecycle::prepare_requeue_silent(msg);
        self.store_old(&stamped).await?;
        Ok(true)
    }

    /// Best-effort idempotent: deleting an id that is no longer stored is
    /// not an error.
    async fn finish(&self, msg: &Message) -> QueueResult<()> {
        let field = msg.id.to_string();
        let (_permit, mut conn) = self.borrow().await?;
        let _: () = redis::pipe()
            .atomic()
            .hdel(&self.hash_name, &field)
            .ignore()
            .zrem(&self.sorted_set_name, &field)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    #[tracing::instrument(skip_all)]
    async fn take(&self) -> QueueResult<Option<Message>> {
        let now = self.clock.now_ms();
        let (_permit, mut conn) = self.borrow().await?;
        let data: Option<Vec<u8>> = self
            .take_script
            .key(&self.list_name)
            .key(&self.sorted_set_name)
            .key(&self.hash_name)
            .arg(now)
            .invoke_async(&mut conn)
            .await?;
        match data {
            Some(bytes) => Ok(Some(self.codec.decode(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn orphan_messages(&self, threshold_ms: u64) -> QueueResult<Vec<Message>> {
        let cutoff = self.clock.now_ms().saturating_sub(threshold_ms);
        let (_permit, mut conn) = self.borrow().await?;
        let fields: Vec<String> = conn
            .zrangebyscore_limit(
                &self.sorted_set_name,
                0,
                cutoff as isize,
                0,
                DEFAULT_BATCH_LIMIT as isize,
            )
            .await?;

        let mut orphans = Vec::with_capacity(fields.len());
        for field in fields {
            let data: Option<Vec<u8>> = conn.hget(&self.hash_name, &field).await?;
            match data {
                Some(bytes) => orphans.push(self.codec.decode(&bytes)?),
                // Finished between the scan and the fetch.
                None => warn!(id = %field, "in-flight id has no stored message, skipping"),
            }
        }
        Ok(orphans)
    }

    async fn move_from_ephemeral_to_queue(&self, msg: &Message) -> QueueResult<bool> {
        let (_permit, mut conn) = self.borrow().await?;
        let moved: i64 = self
            .move_script
            .key(&self.sorted_set_name)
            .key(&self.list_name)
            .arg(msg.id.to_string())
            .invoke_async(&mut conn)
            .await?;
        Ok(moved == 1)
    }

    async fn queue_size(&self) -> i64 {
        match self.len_of(LenQuery::QueuedList).await {
            Ok(len) => len,
            Err(e) => {
                warn!(error = %e, "failed to read queue size");
                SIZE_UNSUPPORTED
            }
        }
    }

    async fn ephemeral_size(&self) -> i64 {
        match self.len_of(LenQuery::InFlightSet).await {
            Ok(len) => len,
            Err(e) => {
                warn!(error = %e, "failed to read ephemeral size");
                SIZE_UNSUPPORTED
            }
        }
    }

    /// The multiplexed connection needs no explicit teardown; dropping the
    /// queue closes it.
    async fn close(&self) -> QueueResult<()> {
        Ok(())
    }
}

enum LenQuery {
    QueuedList,
    InFlightSet,
}

impl RedisQueue {
    async fn len_of(&self, which: LenQuery) -> QueueResult<i64> {
        let (_permit, mut conn) = self.borrow().await?;
        let len: i64 = match which {
            LenQuery::QueuedList => conn.llen(&self.list_name).await?,
            LenQuery::InFlightSet => conn.zcard(&self.sorted_set_name).await?,
        };
        Ok(len)
    }
}

fn validate(config: &RedisConfig) -> QueueResult<()> {
    if config.pool_size == 0 {
        return Err(QueueError::Config("pool_size must be at least 1".to_string()));
    }
    let names = [
        &config.hash_name,
        &config.list_name,
        &config.sorted_set_name,
    ];
    if names.iter().any(|name| name.is_empty()) {
        return Err(QueueError::Config(
            "hash_name, list_name and sorted_set_name must be non-empty".to_string(),
        ));
    }
    if names[0] == names[1] || names[0] == names[2] || names[1] == names[2] {
        return Err(QueueError::Config(format!(
            "redis structure names must be distinct, got {names:?}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_script_pops_scores_and_fetches() {
        assert!(TAKE_SCRIPT.contains(r#"redis.call("lpop", KEYS[1])"#));
        assert!(TAKE_SCRIPT.contains(r#"redis.call("zadd", KEYS[2], ARGV[1], qid)"#));
        assert!(TAKE_SCRIPT.contains(r#"redis.call("hget", KEYS[3], qid)"#));
    }

    #[test]
    fn move_script_guards_on_actual_removal() {
        // The rpush must be conditional on zrem having removed the member,
        // otherwise two recoverers could both requeue the same id.
        assert!(MOVE_SCRIPT.contains("if removed == 1"));
        assert!(MOVE_SCRIPT.contains(r#"redis.call("rpush", KEYS[2], ARGV[1])"#));
    }

    #[test]
    fn config_validation_rejects_empty_pool() {
        let config = RedisConfig {
            pool_size: 0,
            ..RedisConfig::default()
        };
        assert!(matches!(validate(&config), Err(QueueError::Config(_))));
    }

    #[test]
    fn config_validation_rejects_colliding_names() {
        let config = RedisConfig {
            list_name: "queue_h".to_string(),
            ..RedisConfig::default()
        };
        assert!(matches!(validate(&config), Err(QueueError::Config(_))));
    }

    #[test]
    fn config_validation_accepts_defaults() {
        assert!(validate(&RedisConfig::default()).is_ok());
    }

    #[test]
    fn bad_address_is_a_config_error() {
        let config = RedisConfig {
            host_port: "not a host port".to_string(),
            ..RedisConfig::default()
        };
        let err = futures_block_on(RedisQueue::connect(config)).unwrap_err();
        assert!(matches!(err, QueueError::Config(_)));
    }

    /// Tiny current-thread executor so the URL-parse test does not need a
    /// full runtime.
    fn futures_block_on<F: std::future::Future>(fut: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
            .block_on(fut)
    }
}
