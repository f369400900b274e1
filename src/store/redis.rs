use async_trait::async_trait;
use deadpool_redis::redis::{self, Script};
use deadpool_redis::{Config, Pool, Runtime};
use std::time::Duration;

use super::{AtomicTtlStore, StoredValue, TtlEntry};
use crate::utils::error::{AppError, Result};

const COMPARE_AND_SWAP: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    redis.call("SET", KEYS[1], ARGV[2], "PX", ARGV[3])
    return 1
end
return 0
"#;

const COMPARE_AND_DELETE: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
end
return 0
"#;

// ARGV holds value/ttl pairs in KEYS order.
const SET_ALL_IF_ABSENT: &str = r#"
for i = 1, #KEYS do
    if redis.call("EXISTS", KEYS[i]) == 1 then
        return 0
    end
end
for i = 1, #KEYS do
    redis.call("SET", KEYS[i], ARGV[i * 2 - 1], "PX", ARGV[i * 2])
end
return 1
"#;

/// Redis-backed store for multi-process deployments.
pub struct RedisStore {
    pool: Pool,
}

fn millis(ttl: Duration) -> u64 {
    ttl.as_millis().max(1) as u64
}

impl RedisStore {
    pub fn connect(url: &str) -> Result<Self> {
        let pool = Config::from_url(url)
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| AppError::Store(format!("Failed to create redis pool: {}", e)))?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl AtomicTtlStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<StoredValue>> {
        let mut conn = self.pool.get().await?;
        let (value, pttl): (Option<String>, i64) = redis::pipe()
            .cmd("GET")
            .arg(key)
            .cmd("PTTL")
            .arg(key)
            .query_async(&mut conn)
            .await?;

        Ok(value.map(|value| StoredValue {
            value,
            ttl_remaining: (pttl >= 0).then(|| Duration::from_millis(pttl as u64)),
        }))
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.pool.get().await?;
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.pool.get().await?;
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn set_all_if_absent(&self, entries: &[TtlEntry<'_>]) -> Result<bool> {
        let mut conn = self.pool.get().await?;
        let script = Script::new(SET_ALL_IF_ABSENT);
        let mut invocation = script.prepare_invoke();
        for entry in entries {
            invocation.key(entry.key).arg(entry.value).arg(millis(entry.ttl));
        }
        let written: i64 = invocation.invoke_async(&mut conn).await?;
        Ok(written == 1)
    }

    async fn compare_and_swap(&self, key: &str, expected: &str, new: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.pool.get().await?;
        let swapped: i64 = Script::new(COMPARE_AND_SWAP)
            .key(key)
            .arg(expected)
            .arg(new)
            .arg(millis(ttl))
            .invoke_async(&mut conn)
            .await?;
        Ok(swapped == 1)
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool> {
        let mut conn = self.pool.get().await?;
        let deleted: i64 = Script::new(COMPARE_AND_DELETE)
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await?;
        Ok(deleted == 1)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.pool.get().await?;
        let deleted: i64 = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(deleted > 0)
    }
}
