//! Shared low-latency key/value store with per-key expiry.
//!
//! The scan lock, alert dedupe entries, per-product cooldowns and category
//! error cooldowns all live here. Every mutating operation is atomic with
//! respect to other callers of the same store, which is what lets concurrent
//! category scans share state without a coarse lock.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{StoreBackend, StoreConfig};
use crate::utils::error::{AppError, Result};

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

pub use memory::MemoryStore;
#[cfg(feature = "redis")]
pub use self::redis::RedisStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredValue {
    pub value: String,
    pub ttl_remaining: Option<Duration>,
}

#[derive(Debug, Clone, Copy)]
pub struct TtlEntry<'a> {
    pub key: &'a str,
    pub value: &'a str,
    pub ttl: Duration,
}

#[async_trait]
pub trait AtomicTtlStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<StoredValue>>;

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// Writes every entry or none of them.
    async fn set_all_if_absent(&self, entries: &[TtlEntry<'_>]) -> Result<bool>;

    async fn compare_and_swap(&self, key: &str, expected: &str, new: &str, ttl: Duration) -> Result<bool>;

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool>;

    async fn delete(&self, key: &str) -> Result<bool>;
}

pub async fn connect(config: &StoreConfig) -> Result<Arc<dyn AtomicTtlStore>> {
    match config.backend {
        StoreBackend::Memory => {
            tracing::info!("Using in-process TTL store");
            Ok(Arc::new(MemoryStore::new()))
        }
        #[cfg(feature = "redis")]
        StoreBackend::Redis => {
            let url = config
                .redis_url
                .as_deref()
                .ok_or_else(|| AppError::Store("store.redis_url is not set".to_string()))?;
            tracing::info!("Using redis TTL store");
            Ok(Arc::new(RedisStore::connect(url)?))
        }
        #[cfg(not(feature = "redis"))]
        StoreBackend::Redis => Err(AppError::Store(
            "redis backend requested but the `redis` feature is not enabled".to_string(),
        )),
    }
}
