use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::{AtomicTtlStore, StoredValue, TtlEntry};
use crate::utils::error::Result;

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Instant,
}

/// Single-process store. Expiry follows tokio's clock, so paused-time tests
/// can step through TTL windows.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn live<'a>(entries: &'a mut HashMap<String, Entry>, key: &str, now: Instant) -> Option<&'a Entry> {
        if entries.get(key).is_some_and(|entry| entry.expires_at <= now) {
            entries.remove(key);
        }
        entries.get(key)
    }

    fn holds(entries: &mut HashMap<String, Entry>, key: &str, expected: &str, now: Instant) -> bool {
        Self::live(entries, key, now).is_some_and(|entry| entry.value == expected)
    }

    fn insert(entries: &mut HashMap<String, Entry>, key: &str, value: &str, ttl: Duration, now: Instant) {
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: now + ttl,
            },
        );
    }
}

#[async_trait]
impl AtomicTtlStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<StoredValue>> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        Ok(Self::live(&mut entries, key, now).map(|entry| StoredValue {
            value: entry.value.clone(),
            ttl_remaining: Some(entry.expires_at - now),
        }))
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        Self::insert(&mut entries, key, value, ttl, now);
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        if Self::live(&mut entries, key, now).is_some() {
            return Ok(false);
        }
        Self::insert(&mut entries, key, value, ttl, now);
        Ok(true)
    }

    async fn set_all_if_absent(&self, batch: &[TtlEntry<'_>]) -> Result<bool> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        for entry in batch {
            if Self::live(&mut entries, entry.key, now).is_some() {
                return Ok(false);
            }
        }
        for entry in batch {
            Self::insert(&mut entries, entry.key, entry.value, entry.ttl, now);
        }
        Ok(true)
    }

    async fn compare_and_swap(&self, key: &str, expected: &str, new: &str, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        if !Self::holds(&mut entries, key, expected, now) {
            return Ok(false);
        }
        Self::insert(&mut entries, key, new, ttl, now);
        Ok(true)
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        if !Self::holds(&mut entries, key, expected, now) {
            return Ok(false);
        }
        entries.remove(key);
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        let existed = Self::live(&mut entries, key, now).is_some();
        entries.remove(key);
        Ok(existed)
    }
}
