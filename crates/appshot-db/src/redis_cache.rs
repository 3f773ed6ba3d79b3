use std::fmt;
use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};

use appshot_core::cache::{CacheStore, CounterState};
use appshot_core::error::AppError;

/// INCRBY and set the window TTL only when the key had none, in one round
/// trip. Returns `{count, pttl_ms}`.
const INCREMENT_WITH_TTL: &str = r#"
local count = redis.call('INCRBY', KEYS[1], ARGV[1])
local ttl = redis.call('PTTL', KEYS[1])
if ttl < 0 then
  redis.call('PEXPIRE', KEYS[1], ARGV[2])
  ttl = tonumber(ARGV[2])
end
return {count, ttl}
"#;

/// Shared cache backed by Redis. Expiry is left to Redis itself.
#[derive(Clone)]
pub struct RedisCache {
    conn: ConnectionManager,
    increment_script: Script,
}

impl fmt::Debug for RedisCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisCache")
            .field("connection", &"ConnectionManager")
            .finish()
    }
}

fn cache_err(op: &str, e: redis::RedisError) -> AppError {
    AppError::CacheUnavailable(format!("Redis {op} failed: {e}"))
}

/// Redis rejects a zero PX/PEXPIRE, so sub-millisecond TTLs round up.
fn millis(ttl: Duration) -> u64 {
    (ttl.as_millis().min(u64::MAX as u128) as u64).max(1)
}

/// PTTL reply: -2 missing, -1 no expiry.
fn ttl_from_pttl(pttl: i64) -> Option<Duration> {
    (pttl >= 0).then(|| Duration::from_millis(pttl as u64))
}

impl RedisCache {
    pub async fn connect(redis_url: &str) -> Result<Self, AppError> {
        tracing::info!("Connecting to Redis cache");

        let client = redis::Client::open(redis_url)
            .map_err(|e| AppError::ConfigError(format!("Invalid Redis URL: {e}")))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| AppError::CacheUnavailable(format!("Failed to connect to Redis: {e}")))?;

        Ok(Self::from_manager(conn))
    }

    pub fn from_manager(conn: ConnectionManager) -> Self {
        Self {
            conn,
            increment_script: Script::new(INCREMENT_WITH_TTL),
        }
    }
}

impl CacheStore for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, AppError> {
        let mut conn = self.conn.clone();
        let value: Option<Vec<u8>> = conn.get(key).await.map_err(|e| cache_err("GET", e))?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), AppError> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(|e| cache_err("SET", e))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, AppError> {
        let mut conn = self.conn.clone();
        let removed: u64 = conn.del(key).await.map_err(|e| cache_err("DEL", e))?;
        Ok(removed > 0)
    }

    async fn exists(&self, key: &str) -> Result<bool, AppError> {
        let mut conn = self.conn.clone();
        let found: bool = conn.exists(key).await.map_err(|e| cache_err("EXISTS", e))?;
        Ok(found)
    }

    async fn increment(&self, key: &str, amount: u64) -> Result<u64, AppError> {
        let mut conn = self.conn.clone();
        let count: i64 = redis::cmd("INCRBY")
            .arg(key)
            .arg(amount)
            .query_async(&mut conn)
            .await
            .map_err(|e| cache_err("INCRBY", e))?;
        Ok(count.max(0) as u64)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, AppError> {
        let mut conn = self.conn.clone();
        let applied: i64 = redis::cmd("PEXPIRE")
            .arg(key)
            .arg(millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(|e| cache_err("PEXPIRE", e))?;
        Ok(applied == 1)
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, AppError> {
        let mut conn = self.conn.clone();
        let pttl: i64 = redis::cmd("PTTL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| cache_err("PTTL", e))?;
        Ok(ttl_from_pttl(pttl))
    }

    async fn increment_with_ttl(
        &self,
        key: &str,
        amount: u64,
        ttl: Duration,
    ) -> Result<CounterState, AppError> {
        let mut conn = self.conn.clone();
        let reply = self
            .increment_script
            .key(key)
            .arg(amount)
            .arg(millis(ttl))
            .invoke_async::<Vec<i64>>(&mut conn)
            .await
            .map_err(|e| cache_err("increment script", e))?;

        match reply.as_slice() {
            [count, pttl] => Ok(CounterState {
                count: (*count).max(0) as u64,
                ttl_remaining: ttl_from_pttl(*pttl),
            }),
            other => Err(AppError::CacheUnavailable(format!(
                "Unexpected increment script reply: {other:?}"
            ))),
        }
    }

    async fn purge_expired(&self) -> Result<u64, AppError> {
        Ok(0)
    }
}
