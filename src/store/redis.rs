//! Redis store provider.
//!
//! Uses `redis::aio::ConnectionManager` for async multiplexed connections.
//! Conditional writes map onto native Redis primitives: `SET NX PX` for
//! set-if-absent, and small Lua scripts for compare-and-swap and
//! delete-if-value so the check and the write are a single atomic step on the
//! server. Requires the `store-redis` feature flag.

use super::{CoordinationStore, StoreError, StoreResult};
use async_trait::async_trait;
use redis::AsyncCommands;
use std::time::Duration;
use tracing::debug;

const CAS_SCRIPT: &str = r"
local current = redis.call('GET', KEYS[1])
if ARGV[1] == '1' then
    if current == false or current ~= ARGV[2] then return 0 end
else
    if current ~= false then return 0 end
end
if tonumber(ARGV[4]) > 0 then
    redis.call('SET', KEYS[1], ARGV[3], 'PX', ARGV[4])
else
    redis.call('SET', KEYS[1], ARGV[3])
end
return 1
";

const DELETE_IF_VALUE_SCRIPT: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
";

/// Distributed `CoordinationStore` implementation backed by Redis
#[derive(Clone)]
pub struct RedisStore {
    manager: redis::aio::ConnectionManager,
    cas_script: redis::Script,
    delete_if_value_script: redis::Script,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore").finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connect to Redis and build the store
    pub async fn new(redis_url: &str) -> StoreResult<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| StoreError::connection(format!("Invalid Redis URL: {e}")))?;

        let manager = redis::aio::ConnectionManager::new(client)
            .await
            .map_err(|e| StoreError::connection(format!("Failed to connect to Redis: {e}")))?;

        debug!("Redis coordination store connected");

        Ok(Self {
            manager,
            cas_script: redis::Script::new(CAS_SCRIPT),
            delete_if_value_script: redis::Script::new(DELETE_IF_VALUE_SCRIPT),
        })
    }

    fn ttl_millis(ttl: Option<Duration>) -> u64 {
        // PX requires a positive value; 0 encodes "no expiry" for the scripts
        ttl.map(|t| (t.as_millis() as u64).max(1)).unwrap_or(0)
    }

    fn command_error(operation: &str, error: redis::RedisError) -> StoreError {
        StoreError::command(operation, error.to_string())
    }
}

#[async_trait]
impl CoordinationStore for RedisStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.manager.clone();
        conn.get(key)
            .await
            .map_err(|e| Self::command_error("GET", e))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        let mut conn = self.manager.clone();
        match ttl {
            Some(t) => {
                let millis = Self::ttl_millis(Some(t));
                redis::cmd("SET")
                    .arg(key)
                    .arg(value)
                    .arg("PX")
                    .arg(millis)
                    .query_async(&mut conn)
                    .await
                    .map_err(|e| Self::command_error("SET PX", e))
            }
            None => conn
                .set(key, value)
                .await
                .map_err(|e| Self::command_error("SET", e)),
        }
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> StoreResult<bool> {
        let mut conn = self.manager.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value).arg("NX");
        if let Some(t) = ttl {
            cmd.arg("PX").arg(Self::ttl_millis(Some(t)));
        }

        // SET NX replies OK on write, nil when the key already exists
        let reply: Option<String> = cmd
            .query_async(&mut conn)
            .await
            .map_err(|e| Self::command_error("SET NX", e))?;
        Ok(reply.is_some())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
        ttl: Option<Duration>,
    ) -> StoreResult<bool> {
        let mut conn = self.manager.clone();
        let swapped: i64 = self
            .cas_script
            .key(key)
            .arg(if expected.is_some() { "1" } else { "0" })
            .arg(expected.unwrap_or(""))
            .arg(new)
            .arg(Self::ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| Self::command_error("CAS", e))?;
        Ok(swapped == 1)
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        let mut conn = self.manager.clone();
        conn.del(key)
            .await
            .map_err(|e| Self::command_error("DEL", e))
    }

    async fn delete_if_value(&self, key: &str, expected: &str) -> StoreResult<bool> {
        let mut conn = self.manager.clone();
        let deleted: i64 = self
            .delete_if_value_script
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| Self::command_error("DEL_IF_VALUE", e))?;
        Ok(deleted == 1)
    }

    async fn scan_prefix(&self, prefix: &str) -> StoreResult<Vec<(String, String)>> {
        let mut conn = self.manager.clone();
        let pattern = format!("{prefix}*");
        let mut keys: Vec<String> = Vec::new();
        let mut cursor: u64 = 0;

        // SCAN keeps the server responsive on large keyspaces (no KEYS)
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await
                .map_err(|e| Self::command_error("SCAN", e))?;
            keys.extend(batch);
            cursor = next;
            if cursor == 0 {
                break;
            }
        }

        let mut entries = Vec::with_capacity(keys.len());
        for key in keys {
            // A key may expire between SCAN and GET; skip those
            let value: Option<String> = conn
                .get(&key)
                .await
                .map_err(|e| Self::command_error("GET", e))?;
            if let Some(value) = value {
                entries.push((key, value));
            }
        }
        Ok(entries)
    }

    async fn health_check(&self) -> StoreResult<bool> {
        let mut conn = self.manager.clone();
        let reply: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| Self::command_error("PING", e))?;
        Ok(reply == "PONG")
    }

    fn provider_name(&self) -> &'static str {
        "redis"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // These tests require a running Redis instance.
    // Skipped when TEST_REDIS_URL is not provided.

    async fn test_store() -> Option<RedisStore> {
        let url = std::env::var("TEST_REDIS_URL").ok()?;
        Some(RedisStore::new(&url).await.expect("redis connection"))
    }

    #[tokio::test]
    async fn test_redis_conditional_writes() {
        let Some(store) = test_store().await else {
            println!("Skipping redis test - no TEST_REDIS_URL provided");
            return;
        };

        let key = format!("fleet_test:{}", uuid::Uuid::new_v4());
        assert!(store.set_if_absent(&key, "first", None).await.unwrap());
        assert!(!store.set_if_absent(&key, "second", None).await.unwrap());
        assert!(store
            .compare_and_swap(&key, Some("first"), "third", None)
            .await
            .unwrap());
        assert!(!store
            .compare_and_swap(&key, Some("first"), "fourth", None)
            .await
            .unwrap());
        assert!(store.delete_if_value(&key, "third").await.unwrap());
        assert_eq!(store.get(&key).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_redis_health_check() {
        let Some(store) = test_store().await else {
            println!("Skipping redis test - no TEST_REDIS_URL provided");
            return;
        };
        assert!(store.health_check().await.unwrap());
    }
}
