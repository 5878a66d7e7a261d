//! Key-value backends for persisted payment state
//!
//! Values are stored as JSON strings. Two implementations:
//! - [`RedisStore`]: survives process restarts, shared by every instance
//! - [`MemoryStore`]: process-local, used in tests and when no Redis is configured

use super::error::StoreResult;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::debug;

#[cfg(feature = "cache")]
use super::RedisPool;
#[cfg(feature = "cache")]
use redis::AsyncCommands;
#[cfg(feature = "cache")]
use tracing::warn;

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Get a raw value by key
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Set a value, replacing whatever was stored under the key
    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> StoreResult<()>;

    /// Delete a key, returning whether it existed
    async fn delete(&self, key: &str) -> StoreResult<bool>;
}

/// Process-local store
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, (String, Option<Instant>)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let entries = self.entries.read().await;
        match entries.get(key) {
            Some((_, Some(expires_at))) if *expires_at <= Instant::now() => {
                debug!("Store entry expired for key: {}", key);
                Ok(None)
            }
            Some((value, _)) => Ok(Some(value.clone())),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> StoreResult<()> {
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        self.entries
            .write()
            .await
            .insert(key.to_string(), (value, expires_at));
        debug!("Store set for key: {} (ttl: {:?})", key, ttl);
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        Ok(self.entries.write().await.remove(key).is_some())
    }
}

/// Redis-backed store
#[cfg(feature = "cache")]
pub struct RedisStore {
    pool: RedisPool,
}

#[cfg(feature = "cache")]
impl RedisStore {
    pub fn new(pool: RedisPool) -> Self {
        Self { pool }
    }
}

#[cfg(feature = "cache")]
#[async_trait]
impl KeyValueStore for RedisStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = match self.pool.get().await {
            Ok(conn) => conn,
            Err(e) => {
                // Callers fall back to the backend when nothing is found
                warn!("Failed to get Redis connection for GET '{}': {}", key, e);
                return Ok(None);
            }
        };

        let value: Option<String> = conn.get(key).await.map_err(|e| {
            warn!("Redis GET failed for key '{}': {}", key, e);
            e
        })?;

        debug!(
            "Store {} for key: {}",
            if value.is_some() { "hit" } else { "miss" },
            key
        );
        Ok(value)
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> StoreResult<()> {
        let mut conn = self.pool.get().await.map_err(|e| {
            warn!("Failed to get Redis connection for SET '{}': {}", key, e);
            e
        })?;

        match ttl {
            Some(ttl) => {
                let _: () = conn.set_ex(key, value, ttl.as_secs()).await.map_err(|e| {
                    warn!("Redis SET_EX failed for key '{}': {}", key, e);
                    e
                })?;
            }
            None => {
                let _: () = conn.set(key, value).await.map_err(|e| {
                    warn!("Redis SET failed for key '{}': {}", key, e);
                    e
                })?;
            }
        }

        debug!("Store set for key: {} (ttl: {:?})", key, ttl);
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let mut conn = match self.pool.get().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!("Failed to get Redis connection for DEL '{}': {}", key, e);
                return Ok(false);
            }
        };

        let removed: i32 = conn.del(key).await.map_err(|e| {
            warn!("Redis DEL failed for key '{}': {}", key, e);
            e
        })?;
        Ok(removed > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_set_get_delete() {
        let store = MemoryStore::new();
        store.set("k", "v".to_string(), None).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some("v".to_string()));
        assert!(store.delete("k").await.unwrap());
        assert!(!store.delete("k").await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_memory_store_expires_entries() {
        let store = MemoryStore::new();
        store
            .set("k", "v".to_string(), Some(Duration::from_millis(1)))
            .await
            .unwrap();
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[cfg(feature = "cache")]
    #[tokio::test]
    #[ignore] // Requires Redis
    async fn test_redis_store_roundtrip() {
        let pool = super::super::init_store_pool(super::super::StoreConfig::default())
            .await
            .unwrap();
        let store = RedisStore::new(pool);
        store
            .set("test:payment:key", "value".to_string(), Some(Duration::from_secs(60)))
            .await
            .unwrap();
        assert_eq!(
            store.get("test:payment:key").await.unwrap(),
            Some("value".to_string())
        );
        assert!(store.delete("test:payment:key").await.unwrap());
    }
}
