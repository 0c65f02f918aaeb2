//! Bounded in-memory response cache with per-entry expiry.

use std::time::Duration;

use busline_core::CacheType;
use quick_cache::sync::Cache;
use tokio::time::Instant;

use crate::traits::ResponseCache;

#[derive(Debug, Clone)]
struct Entry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

/// Response cache backed by `quick_cache`. Expired entries are dropped
/// lazily on read; capacity pressure evicts the coldest entries.
pub struct MemoryResponseCache {
    entries: Cache<(CacheType, String, String), Entry>,
}

impl std::fmt::Debug for MemoryResponseCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryResponseCache")
            .field("len", &self.entries.len())
            .finish()
    }
}

impl MemoryResponseCache {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Cache::new(capacity),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl ResponseCache for MemoryResponseCache {
    fn get(&self, cache_type: CacheType, name: &str, key: &str) -> Option<Vec<u8>> {
        let k = (cache_type, name.to_string(), key.to_string());
        let entry = self.entries.get(&k)?;
        if entry.is_expired(Instant::now()) {
            self.entries.remove(&k);
            return None;
        }
        Some(entry.value)
    }

    fn set(&self, cache_type: CacheType, name: &str, key: &str, value: Vec<u8>, ttl: Option<Duration>) {
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        self.entries.insert(
            (cache_type, name.to_string(), key.to_string()),
            Entry { value, expires_at },
        );
    }
}
