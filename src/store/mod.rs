//! Persisted payment state
//!
//! Holds exactly one in-flight [`PendingPayload`] and the last resolved
//! outcome, each under a single well-known key. Writes overwrite: a second
//! attempt started before the first resolves replaces the first's recovery data.

pub mod error;
pub mod kv;

pub use error::{StoreError, StoreResult};
pub use kv::{KeyValueStore, MemoryStore};
#[cfg(feature = "cache")]
pub use kv::RedisStore;

use crate::payments::types::PendingPayload;
use crate::transaction::TransactionState;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Single slot holding the in-flight transaction
pub const PENDING_PAYLOAD_KEY: &str = "pending_payment_payload";
/// Last resolved outcome, for recovery after a restart
pub const LAST_OUTCOME_KEY: &str = "last_payment_outcome";

pub mod ttl {
    use std::time::Duration;

    /// In-flight recovery data: 24 hours
    pub const PENDING_PAYLOAD: Duration = Duration::from_secs(86_400);

    /// Last outcome: 7 days
    pub const LAST_OUTCOME: Duration = Duration::from_secs(604_800);
}

#[cfg(feature = "cache")]
pub type RedisPool = bb8::Pool<bb8_redis::RedisConnectionManager>;

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub redis_url: String,
    pub max_connections: u32,
    pub connection_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            max_connections: 10,
            connection_timeout: Duration::from_secs(5),
        }
    }
}

#[cfg(feature = "cache")]
pub async fn init_store_pool(config: StoreConfig) -> Result<RedisPool, StoreError> {
    use tracing::error;

    info!(
        "Initializing Redis store pool: max_connections={}, redis_url={}",
        config.max_connections, config.redis_url
    );

    let manager = bb8_redis::RedisConnectionManager::new(config.redis_url.clone()).map_err(|e| {
        error!("Failed to create Redis connection manager: {}", e);
        StoreError::ConnectionError(e.to_string())
    })?;

    let pool = bb8::Pool::builder()
        .max_size(config.max_connections)
        .connection_timeout(config.connection_timeout)
        .test_on_check_out(false)
        .build(manager)
        .await
        .map_err(|e| {
            error!("Failed to build Redis connection pool: {}", e);
            StoreError::ConnectionError(e.to_string())
        })?;

    let mut conn = pool.get().await?;
    let _: String = redis::cmd("PING").query_async(&mut *conn).await?;
    drop(conn);

    info!("Redis store pool initialized successfully");
    Ok(pool)
}

/// Terminal (or error) outcome recorded for UI recovery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedOutcome {
    pub transaction_id: String,
    pub state: TransactionState,
    pub resolved_at: DateTime<Utc>,
}

/// Typed access to the pending-payload slot and the last-outcome slot
#[derive(Clone)]
pub struct PendingPayloadStore {
    backend: Arc<dyn KeyValueStore>,
}

impl PendingPayloadStore {
    pub fn new(backend: Arc<dyn KeyValueStore>) -> Self {
        Self { backend }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    /// Replaces any stored payload
    pub async fn save(&self, payload: &PendingPayload) -> StoreResult<()> {
        if let Ok(Some(previous)) = self.load().await {
            if previous.transaction_id != payload.transaction_id {
                warn!(
                    previous = %previous.transaction_id,
                    transaction_id = %payload.transaction_id,
                    "Replacing unresolved pending payload"
                );
            }
        }
        self.put_json(PENDING_PAYLOAD_KEY, payload, ttl::PENDING_PAYLOAD)
            .await?;
        debug!(transaction_id = %payload.transaction_id, "Pending payload saved");
        Ok(())
    }

    pub async fn load(&self) -> StoreResult<Option<PendingPayload>> {
        self.get_json(PENDING_PAYLOAD_KEY).await
    }

    /// Loads the payload only if it belongs to `transaction_id`
    pub async fn load_for(&self, transaction_id: &str) -> StoreResult<Option<PendingPayload>> {
        Ok(self
            .load()
            .await?
            .filter(|payload| payload.transaction_id == transaction_id))
    }

    pub async fn clear(&self) -> StoreResult<bool> {
        self.backend.delete(PENDING_PAYLOAD_KEY).await
    }

    pub async fn record_outcome(&self, outcome: &ResolvedOutcome) -> StoreResult<()> {
        self.put_json(LAST_OUTCOME_KEY, outcome, ttl::LAST_OUTCOME)
            .await
    }

    pub async fn last_outcome(&self) -> StoreResult<Option<ResolvedOutcome>> {
        self.get_json(LAST_OUTCOME_KEY).await
    }

    async fn put_json<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) -> StoreResult<()> {
        let json = serde_json::to_string(value)?;
        self.backend.set(key, json, Some(ttl)).await
    }

    async fn get_json<T: DeserializeOwned>(&self, key: &str) -> StoreResult<Option<T>> {
        match self.backend.get(key).await? {
            Some(json) => match serde_json::from_str(&json) {
                Ok(value) => Ok(Some(value)),
                Err(e) => {
                    warn!("Discarding unreadable value under '{}': {}", key, e);
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payments::types::PaymentType;

    fn payload(id: &str, amount: f64) -> PendingPayload {
        PendingPayload {
            transaction_id: id.to_string(),
            view_bill_response: serde_json::json!({"dueDate": "2026-11-01"}),
            validity: None,
            operator_id: 12,
            circle_id: Some("MH".to_string()),
            amount,
            payment_type: PaymentType::Gateway,
            created_at: Utc::now(),
            original_request_params: serde_json::Value::Null,
        }
    }

    #[tokio::test]
    async fn test_second_write_replaces_first() {
        let store = PendingPayloadStore::in_memory();
        store.save(&payload("A", 10.0)).await.unwrap();
        store.save(&payload("B", 20.0)).await.unwrap();

        let current = store.load().await.unwrap().unwrap();
        assert_eq!(current.transaction_id, "B");
        assert_eq!(current.amount, 20.0);
        assert!(store.load_for("A").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_clear_empties_slot() {
        let store = PendingPayloadStore::in_memory();
        store.save(&payload("A", 10.0)).await.unwrap();
        assert!(store.clear().await.unwrap());
        assert!(store.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_outcome_is_kept_separately() {
        let store = PendingPayloadStore::in_memory();
        store.save(&payload("A", 10.0)).await.unwrap();
        store
            .record_outcome(&ResolvedOutcome {
                transaction_id: "A".to_string(),
                state: TransactionState::Success,
                resolved_at: Utc::now(),
            })
            .await
            .unwrap();

        assert_eq!(store.load().await.unwrap().unwrap().transaction_id, "A");
        let outcome = store.last_outcome().await.unwrap().unwrap();
        assert_eq!(outcome.state, TransactionState::Success);
    }

    #[tokio::test]
    async fn test_unreadable_value_is_treated_as_empty() {
        let backend = Arc::new(MemoryStore::new());
        backend
            .set(PENDING_PAYLOAD_KEY, "{not json".to_string(), None)
            .await
            .unwrap();
        let store = PendingPayloadStore::new(backend);
        assert!(store.load().await.unwrap().is_none());
    }
}
