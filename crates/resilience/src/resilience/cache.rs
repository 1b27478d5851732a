//! TTL cache for last-known-good responses
//!
//! Shared by fallback orchestrators: a primary success is stored under a
//! caller-chosen key and served while unexpired if the primary later fails.
//! Storage, per-entry expiry and capacity eviction are handled by
//! `moka::sync::Cache`; the injected [`Clock`] decides freshness on reads so
//! expiry stays deterministic under `MockClock`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use moka::sync::Cache;
use moka::Expiry;
use serde::Serialize;

use super::clock::{Clock, SystemClock};

/// Longest honoured time-to-live (roughly ten years)
const MAX_TTL: Duration = Duration::from_secs(10 * 365 * 24 * 60 * 60);

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    ttl: Duration,
    expires_at: Instant,
}

/// Expires every entry after its own time-to-live
struct EntryExpiry;

impl<V> Expiry<String, CacheEntry<V>> for EntryExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        entry: &CacheEntry<V>,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(entry.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        entry: &CacheEntry<V>,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(entry.ttl)
    }
}

/// Hit/miss counters for a [`ResponseCache`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
}

/// Thread-safe cache with per-entry time-to-live
///
/// With a capacity set, moka's admission policy decides which entry leaves
/// a full cache.
pub struct ResponseCache<V: Clone + Send + Sync + 'static> {
    entries: Cache<String, CacheEntry<V>>,
    max_entries: Option<u64>,
    clock: Arc<dyn Clock>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<V: Clone + Send + Sync + 'static> std::fmt::Debug for ResponseCache<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseCache")
            .field("entries", &self.entries.entry_count())
            .field("max_entries", &self.max_entries)
            .finish_non_exhaustive()
    }
}

impl<V: Clone + Send + Sync + 'static> Default for ResponseCache<V> {
    fn default() -> Self {
        Self::new()
    }
}

fn build_cache<V: Clone + Send + Sync + 'static>(
    max_entries: Option<u64>,
) -> Cache<String, CacheEntry<V>> {
    let builder = Cache::builder().expire_after(EntryExpiry);
    match max_entries {
        Some(max_entries) => builder.max_capacity(max_entries).build(),
        None => builder.build(),
    }
}

impl<V: Clone + Send + Sync + 'static> ResponseCache<V> {
    /// Unbounded cache on the system clock
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Unbounded cache with a custom clock (useful for testing)
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: build_cache(None),
            max_entries: None,
            clock,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Bound the number of entries; existing entries are discarded
    #[must_use]
    pub fn with_capacity_limit(mut self, max_entries: usize) -> Self {
        let max_entries = u64::try_from(max_entries.max(1)).unwrap_or(u64::MAX);
        self.entries = build_cache(Some(max_entries));
        self.max_entries = Some(max_entries);
        self
    }

    /// Unexpired value for `key`
    pub fn get(&self, key: &str) -> Option<V> {
        let now = self.clock.now();

        if let Some(entry) = self.entries.get(key) {
            if entry.expires_at > now {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.value);
            }
            self.entries.invalidate(key);
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Store `value` for `ttl`, replacing any previous entry
    pub fn insert<K: Into<String>>(&self, key: K, value: V, ttl: Duration) {
        let now = self.clock.now();
        let ttl = ttl.min(MAX_TTL);
        let expires_at = now.checked_add(ttl).unwrap_or(now);
        self.entries.insert(key.into(), CacheEntry { value, ttl, expires_at });
    }

    pub fn remove(&self, key: &str) -> Option<V> {
        self.entries.remove(key).map(|entry| entry.value)
    }

    pub fn clear(&self) {
        self.entries.invalidate_all();
        self.entries.run_pending_tasks();
    }

    /// Number of stored entries after pending evictions are applied
    pub fn len(&self) -> usize {
        self.entries.run_pending_tasks();
        usize::try_from(self.entries.entry_count()).unwrap_or(usize::MAX)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}
