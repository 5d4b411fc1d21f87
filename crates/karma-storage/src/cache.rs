//! Bounded TTL cache in front of the persistent store.
//!
//! Entries are visible only while `now - inserted_at < ttl`. When full, the
//! entry with the smallest `inserted_at` is evicted before inserting. A miss
//! is `None`; repopulating from the store is the caller's job.

use chrono::{DateTime, Utc};
use karma_config_and_utils::SharedClock;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tracing::{debug, trace};

/// Cache sizing and expiry policy.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum number of entries.
    pub capacity: usize,
    /// TTL for keys without an override.
    pub default_ttl: Duration,
    /// TTL overrides by key prefix. The longest matching prefix wins.
    pub ttl_overrides: BTreeMap<String, Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 1000,
            default_ttl: Duration::from_secs(5 * 60),
            ttl_overrides: BTreeMap::new(),
        }
    }
}

impl CacheConfig {
    /// TTL that applies to `key`.
    pub fn ttl_for(&self, key: &str) -> Duration {
        self.ttl_overrides
            .iter()
            .filter(|(prefix, _)| key.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, ttl)| *ttl)
            .unwrap_or(self.default_ttl)
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: Value,
    inserted_at: DateTime<Utc>,
    /// Insertion order, breaks ties between equal timestamps.
    seq: u64,
    ttl: Duration,
}

impl CacheEntry {
    fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        // A clock that moved backwards counts as zero elapsed.
        let elapsed = (now - self.inserted_at).to_std().unwrap_or(Duration::ZERO);
        elapsed < self.ttl
    }
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    next_seq: u64,
}

/// Bounded, TTL-based cache keyed by store key.
#[derive(Debug)]
pub struct CacheLayer {
    config: CacheConfig,
    clock: SharedClock,
    state: Mutex<CacheState>,
}

impl CacheLayer {
    pub fn new(config: CacheConfig, clock: SharedClock) -> Self {
        Self {
            config,
            clock,
            state: Mutex::new(CacheState::default()),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Cached value if present and fresh. Expired entries are dropped on access.
    pub fn get(&self, key: &str) -> Option<Value> {
        let now = self.clock.now();
        let mut state = self.state.lock();

        match state.entries.get(key).map(|entry| entry.is_fresh(now)) {
            Some(true) => {
                trace!(key, "cache hit");
                state.entries.get(key).map(|entry| entry.value.clone())
            }
            Some(false) => {
                state.entries.remove(key);
                trace!(key, "cache entry expired");
                None
            }
            None => None,
        }
    }

    /// Insert or overwrite `key`, evicting the oldest entry if at capacity.
    pub fn put(&self, key: &str, value: Value) {
        let now = self.clock.now();
        let ttl = self.config.ttl_for(key);
        let mut state = self.state.lock();

        if !state.entries.contains_key(key) && state.entries.len() >= self.config.capacity {
            let oldest = state
                .entries
                .iter()
                .min_by_key(|(_, entry)| (entry.inserted_at, entry.seq))
                .map(|(k, _)| k.clone());
            if let Some(oldest) = oldest {
                state.entries.remove(&oldest);
                debug!(evicted = %oldest, capacity = self.config.capacity, "cache eviction");
            }
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        state.entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                inserted_at: now,
                seq,
                ttl,
            },
        );
    }

    /// Remove `key` immediately.
    pub fn invalidate(&self, key: &str) -> bool {
        self.state.lock().entries.remove(key).is_some()
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.state.lock().entries.clear();
    }

    /// Drop expired entries. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let before = state.entries.len();
        state.entries.retain(|_, entry| entry.is_fresh(now));
        before - state.entries.len()
    }

    /// Number of stored entries, expired ones included until accessed or purged.
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
