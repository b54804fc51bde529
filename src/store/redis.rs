//! Redis-backed counter store.
//!
//! Counters are plain integer keys with a millisecond expiry. Consuming runs as
//! a single server-side script so the increment and the expiry are applied
//! atomically, whichever process issues them.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, Script};
use tracing::{debug, error, trace};

use super::{Counter, CounterStore, StoreError, StoreResult};

const BACKEND: &str = "redis";

/// Increment, then attach the window expiry if the key has none yet.
/// Returns `{points, pttl_ms}`.
const CONSUME_SCRIPT: &str = r#"
local points = redis.call('INCRBY', KEYS[1], ARGV[1])
local ttl = redis.call('PTTL', KEYS[1])
if ttl < 0 then
  redis.call('PEXPIRE', KEYS[1], ARGV[2])
  ttl = tonumber(ARGV[2])
end
return {points, ttl}
"#;

/// Replace the expiry of a live key. Returns `{points, pttl_ms}` or nil.
const BLOCK_SCRIPT: &str = r#"
if redis.call('PEXPIRE', KEYS[1], ARGV[1]) == 1 then
  return {tonumber(redis.call('GET', KEYS[1])), tonumber(ARGV[1])}
end
return false
"#;

/// A counter store shared by every process connected to the same Redis.
#[derive(Clone)]
pub struct RedisCounterStore {
    connection: ConnectionManager,
    consume_script: Script,
    block_script: Script,
}

impl std::fmt::Debug for RedisCounterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCounterStore").finish_non_exhaustive()
    }
}

impl RedisCounterStore {
    /// Connect to Redis and verify the connection with `PING`.
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let client = Client::open(url).map_err(|e| {
            error!(error = %e, "Failed to create Redis client");
            StoreError::unavailable(BACKEND, e)
        })?;

        let connection = ConnectionManager::new(client).await.map_err(|e| {
            error!(error = %e, "Failed to create Redis connection manager");
            StoreError::unavailable(BACKEND, e)
        })?;

        let mut conn = connection.clone();
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(|e| {
                error!(error = %e, "Failed to ping Redis");
                StoreError::unavailable(BACKEND, e)
            })?;

        debug!("Connected to Redis counter store");

        Ok(Self {
            connection,
            consume_script: Script::new(CONSUME_SCRIPT),
            block_script: Script::new(BLOCK_SCRIPT),
        })
    }
}

fn to_counter(points: i64, pttl_ms: i64) -> Counter {
    Counter {
        points: points.max(0) as u64,
        ttl: Duration::from_millis(pttl_ms.max(0) as u64),
    }
}

fn duration_ms(ttl: Duration) -> u64 {
    // PEXPIRE rejects 0
    (ttl.as_millis() as u64).max(1)
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn consume(&self, key: &str, points: u64, ttl: Duration) -> StoreResult<Counter> {
        let mut conn = self.connection.clone();
        let (points, pttl): (i64, i64) = self
            .consume_script
            .key(key)
            .arg(points)
            .arg(duration_ms(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| StoreError::unavailable(BACKEND, format!("consume failed: {e}")))?;

        trace!(key = %key, points, pttl_ms = pttl, "Consumed");
        Ok(to_counter(points, pttl))
    }

    async fn get(&self, key: &str) -> StoreResult<Option<Counter>> {
        let mut conn = self.connection.clone();
        let (points, pttl): (Option<i64>, i64) = redis::pipe()
            .atomic()
            .cmd("GET")
            .arg(key)
            .cmd("PTTL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| StoreError::unavailable(BACKEND, format!("get failed: {e}")))?;

        // PTTL is -2 once the key has expired between commands
        Ok(match points {
            Some(points) if pttl != -2 => Some(to_counter(points, pttl)),
            _ => None,
        })
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        let mut conn = self.connection.clone();
        redis::cmd("DEL")
            .arg(key)
            .query_async::<i64>(&mut conn)
            .await
            .map_err(|e| StoreError::unavailable(BACKEND, format!("delete failed: {e}")))?;
        Ok(())
    }

    async fn block(&self, key: &str, ttl: Duration) -> StoreResult<Option<Counter>> {
        let mut conn = self.connection.clone();
        let blocked: Option<(i64, i64)> = self
            .block_script
            .key(key)
            .arg(duration_ms(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| StoreError::unavailable(BACKEND, format!("block failed: {e}")))?;

        Ok(blocked.map(|(points, pttl)| to_counter(points, pttl)))
    }

    fn backend_name(&self) -> &'static str {
        BACKEND
    }
}
