//! TTL response cache keyed by request identity

use relay_core::{CacheConfig, DedupKey};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Successful agent response kept for reuse
#[derive(Debug, Clone, PartialEq)]
pub struct CachedResponse {
    pub agent_id: String,
    pub response: serde_json::Value,
}

#[derive(Debug)]
struct Entry {
    value: CachedResponse,
    inserted_at: Instant,
}

/// Bounded TTL cache
///
/// A zero TTL or zero capacity disables caching. When full, the oldest
/// entry is evicted.
#[derive(Debug)]
pub struct ResponseCache {
    ttl: Duration,
    max_entries: usize,
    entries: Mutex<HashMap<DedupKey, Entry>>,
}

impl ResponseCache {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            ttl,
            max_entries,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.ttl(), config.max_entries)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<DedupKey, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn enabled(&self) -> bool {
        !self.ttl.is_zero() && self.max_entries > 0
    }

    /// Fresh entry for `key`; expired entries are dropped on the way
    pub fn get(&self, key: &DedupKey) -> Option<CachedResponse> {
        let mut entries = self.lock();
        let entry = entries.get(key)?;
        if entry.inserted_at.elapsed() < self.ttl {
            return Some(entry.value.clone());
        }
        entries.remove(key);
        debug!(%key, "Cache entry expired");
        None
    }

    pub fn insert(&self, key: DedupKey, value: CachedResponse) {
        if !self.enabled() {
            return;
        }
        let mut entries = self.lock();
        if !entries.contains_key(&key) && entries.len() >= self.max_entries {
            let ttl = self.ttl;
            entries.retain(|_, e| e.inserted_at.elapsed() < ttl);
            if entries.len() >= self.max_entries {
                let oldest = entries
                    .iter()
                    .min_by_key(|(_, e)| e.inserted_at)
                    .map(|(k, _)| k.clone());
                if let Some(oldest) = oldest {
                    entries.remove(&oldest);
                }
            }
        }
        entries.insert(
            key,
            Entry {
                value,
                inserted_at: Instant::now(),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::from_config(&CacheConfig::default())
    }
}
