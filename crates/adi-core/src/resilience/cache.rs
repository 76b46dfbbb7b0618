//! Result cache placed in front of fallback chains.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::clock::{Clock, SystemClock};

/// Stale entries stay eligible for similar-target lookups for this many TTLs.
const SIMILAR_STALENESS_FACTOR: u64 = 4;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub key: String,
    /// Grouping tag for similar-target lookups (agent and brand).
    pub tag: String,
    pub data: serde_json::Value,
    pub created_at: u64,
    pub ttl_ms: u64,
}

impl CacheEntry {
    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.created_at) >= self.ttl_ms
    }
}

/// Derive the cache key for `agent` evaluating `url` for `brand`.
pub fn cache_key(agent: &str, url: &str, brand: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(url.trim().to_lowercase().as_bytes());
    hasher.update(b"\n");
    hasher.update(brand.trim().to_lowercase().as_bytes());
    format!("{agent}:{}", hex::encode(hasher.finalize()))
}

/// Grouping tag shared by every target of the same brand.
pub fn similarity_tag(agent: &str, brand: &str) -> String {
    format!("{agent}:{}", brand.trim().to_lowercase())
}

pub trait CacheStore: Send + Sync {
    /// Fresh entry for `key`; expired entries are treated as absent.
    fn get(&self, key: &str) -> Option<CacheEntry>;
    fn put(&self, entry: CacheEntry);
    /// Most recent entry sharing `tag`, excluding `exclude_key`, that is
    /// no older than a few TTLs.
    fn find_similar(&self, tag: &str, exclude_key: &str) -> Option<CacheEntry>;
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug)]
pub struct MemoryCacheStore {
    entries: Mutex<HashMap<String, CacheEntry>>,
    clock: Arc<dyn Clock>,
}

impl Default for MemoryCacheStore {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl MemoryCacheStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
        }
    }

    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, CacheEntry>> {
        match self.entries.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl CacheStore for MemoryCacheStore {
    fn get(&self, key: &str) -> Option<CacheEntry> {
        let now = self.clock.now_ms();
        let entries = self.entries();
        entries.get(key).filter(|e| !e.is_expired(now)).cloned()
    }

    fn put(&self, entry: CacheEntry) {
        let now = self.clock.now_ms();
        let mut entries = self.entries();
        entries.retain(|_, e| now.saturating_sub(e.created_at) < e.ttl_ms.saturating_mul(SIMILAR_STALENESS_FACTOR));
        entries.insert(entry.key.clone(), entry);
    }

    fn find_similar(&self, tag: &str, exclude_key: &str) -> Option<CacheEntry> {
        let now = self.clock.now_ms();
        let entries = self.entries();
        entries
            .values()
            .filter(|e| e.tag == tag && e.key != exclude_key)
            .filter(|e| now.saturating_sub(e.created_at) < e.ttl_ms.saturating_mul(SIMILAR_STALENESS_FACTOR))
            .max_by_key(|e| e.created_at)
            .cloned()
    }

    fn len(&self) -> usize {
        self.entries().len()
    }
}

/// Build an entry stamped with the store's notion of now.
pub fn new_entry(
    clock: &dyn Clock,
    key: String,
    tag: String,
    data: serde_json::Value,
    ttl: Duration,
) -> CacheEntry {
    CacheEntry {
        key,
        tag,
        data,
        created_at: clock.now_ms(),
        ttl_ms: u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX),
    }
}
