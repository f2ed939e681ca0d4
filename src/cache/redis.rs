//! Redis-backed cache shared across the worker fleet.

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Script};
use std::time::Duration;

use super::{Cache, CacheError, Result};

/// Compare-and-delete: release the lock iff we still own it.
const RELEASE_SCRIPT: &str = r"
if redis.call('get', KEYS[1]) == ARGV[1] then
  return redis.call('del', KEYS[1])
else
  return 0
end";

/// Compare-and-expire: refresh the TTL iff we still own the lock.
const EXTEND_SCRIPT: &str = r"
if redis.call('get', KEYS[1]) == ARGV[1] then
  return redis.call('expire', KEYS[1], ARGV[2])
else
  return 0
end";

/// Increment and (re)apply the retention TTL in one atomic step.
const INCREMENT_SCRIPT: &str = r"
local value = redis.call('incr', KEYS[1])
if tonumber(ARGV[1]) > 0 then
  redis.call('expire', KEYS[1], ARGV[1])
end
return value";

/// Shared [`Cache`] over a Redis multiplexed connection.
///
/// Lock operations never read-then-write from the client side: acquisition
/// uses `SET NX EX`, and release/extend/increment run as server-side Lua
/// scripts, so they are atomic against every other worker in the fleet.
pub struct RedisCache {
    conn: MultiplexedConnection,
    release: Script,
    extend: Script,
    increment: Script,
}

impl RedisCache {
    /// Connect to `url` (e.g. `redis://127.0.0.1:6379/0`).
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).map_err(to_cache_error)?;
        let conn = client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(to_cache_error)?;
        Ok(Self::with_connection(conn))
    }

    /// Wrap an existing multiplexed connection.
    #[must_use]
    pub fn with_connection(conn: MultiplexedConnection) -> Self {
        Self {
            conn,
            release: Script::new(RELEASE_SCRIPT),
            extend: Script::new(EXTEND_SCRIPT),
            increment: Script::new(INCREMENT_SCRIPT),
        }
    }
}

fn to_cache_error(err: redis::RedisError) -> CacheError {
    CacheError::backend(err.to_string())
}

fn ttl_secs(ttl: Duration) -> u64 {
    // Sub-second TTLs round up so a positive duration never becomes "no TTL".
    ttl.as_secs().max(1)
}

#[async_trait]
impl Cache for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        conn.get(key).await.map_err(to_cache_error)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.conn.clone();
        match ttl {
            Some(ttl) => conn
                .set_ex(key, value, ttl_secs(ttl))
                .await
                .map_err(to_cache_error),
            None => conn.set(key, value).await.map_err(to_cache_error),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(key).await.map_err(to_cache_error)
    }

    async fn acquire_lock(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(token)
            .arg("NX")
            .arg("EX")
            .arg(ttl_secs(ttl))
            .query_async(&mut conn)
            .await
            .map_err(to_cache_error)?;
        Ok(reply.is_some())
    }

    async fn release_lock(&self, key: &str, token: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = self
            .release
            .key(key)
            .arg(token)
            .invoke_async(&mut conn)
            .await
            .map_err(to_cache_error)?;
        Ok(removed == 1)
    }

    async fn extend_lock(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let extended: i64 = self
            .extend
            .key(key)
            .arg(token)
            .arg(ttl_secs(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(to_cache_error)?;
        Ok(extended == 1)
    }

    async fn increment(&self, key: &str, ttl: Option<Duration>) -> Result<i64> {
        let mut conn = self.conn.clone();
        self.increment
            .key(key)
            .arg(ttl.map(ttl_secs).unwrap_or(0))
            .invoke_async(&mut conn)
            .await
            .map_err(to_cache_error)
    }
}
