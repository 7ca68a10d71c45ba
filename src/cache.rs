//! Key-value cache
//!
//! The login throttle and the permission cache only talk to [`KvCache`], the
//! shape of a Redis-like service (get/set/incr/expire). [`MemoryCache`] is the
//! in-process implementation the binary ships with: every operation is a
//! single critical section on a `parking_lot` mutex, so `incr` is atomic with
//! respect to concurrent callers in the same process.

use anyhow::{bail, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

#[async_trait]
pub trait KvCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Store `value`, replacing any existing entry and its TTL.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    /// Increment an integer counter, creating it at 1 when absent.
    /// An existing TTL is preserved.
    async fn incr(&self, key: &str) -> Result<i64>;

    /// Attach a TTL to an existing key. Returns false if the key is absent.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;

    async fn exists(&self, key: &str) -> Result<bool>;

    async fn delete(&self, key: &str) -> Result<bool>;
}

struct CacheEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.map_or(false, |at| now >= at)
    }
}

/// In-memory cache with lazy expiry.
#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every expired entry. Called periodically by the maintenance task.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        let purged = before - entries.len();
        if purged > 0 {
            debug!(purged, "Purged expired cache entries");
        }
        purged
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn live<'a>(
        entries: &'a mut HashMap<String, CacheEntry>,
        key: &str,
        now: Instant,
    ) -> Option<&'a mut CacheEntry> {
        if entries.get(key).is_some_and(|e| e.is_expired(now)) {
            entries.remove(key);
            return None;
        }
        entries.get_mut(key)
    }
}

#[async_trait]
impl KvCache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut entries = self.entries.lock();
        Ok(Self::live(&mut entries, key, Instant::now()).map(|e| e.value.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        self.entries.lock().insert(
            key.to_string(),
            CacheEntry {
                value: value.to_string(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        let mut entries = self.entries.lock();
        match Self::live(&mut entries, key, Instant::now()) {
            Some(entry) => {
                let Ok(current) = entry.value.parse::<i64>() else {
                    bail!("value at {key} is not an integer");
                };
                let next = current + 1;
                entry.value = next.to_string();
                Ok(next)
            }
            None => {
                entries.insert(
                    key.to_string(),
                    CacheEntry {
                        value: "1".to_string(),
                        expires_at: None,
                    },
                );
                Ok(1)
            }
        }
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        match Self::live(&mut entries, key, now) {
            Some(entry) => {
                entry.expires_at = Some(now + ttl);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut entries = self.entries.lock();
        Ok(Self::live(&mut entries, key, Instant::now()).is_some())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.entries.lock().remove(key).is_some())
    }
}
