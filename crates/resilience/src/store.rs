//! Key/value persistence port
//!
//! The idempotency store and the failed-operation journal persist JSON
//! documents through [`KeyValueStore`]. Hosts back it with Redis or a
//! database table; [`MemoryStore`] serves tests and single-process
//! deployments.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tracing::trace;

use crate::error::{ControlError, ControlResult};
use crate::resilience::{Clock, SystemClock};

/// Persistence for JSON documents with optional expiry
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Get an unexpired value
    async fn get(&self, key: &str) -> ControlResult<Option<Value>>;

    /// Store a value, replacing any existing one; `None` never expires
    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> ControlResult<()>;

    /// Delete a value; returns whether it existed
    async fn delete(&self, key: &str) -> ControlResult<bool>;

    /// Keys of unexpired values starting with `prefix`
    ///
    /// Only the listing helpers of the admin surface need this; backends
    /// without key scans keep the default, which reports it unsupported.
    async fn keys_with_prefix(&self, prefix: &str) -> ControlResult<Vec<String>> {
        Err(ControlError::store("keys_with_prefix", format!("listing '{prefix}*' is not supported")))
    }
}

#[derive(Debug, Clone)]
struct StoredValue {
    value: Value,
    expires_at: Option<Instant>,
}

/// In-memory [`KeyValueStore`]
///
/// Expired values are dropped lazily when read or listed.
pub struct MemoryStore {
    values: DashMap<String, StoredValue>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore").field("len", &self.values.len()).finish_non_exhaustive()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self { values: DashMap::new(), clock }
    }

    /// Stored entries, expired ones included until touched
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    fn is_live(entry: &StoredValue, now: Instant) -> bool {
        entry.expires_at.map_or(true, |at| at > now)
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> ControlResult<Option<Value>> {
        let now = self.clock.now();
        let live = self
            .values
            .get(key)
            .map(|entry| (Self::is_live(&entry, now), entry.value.clone()));

        match live {
            Some((true, value)) => Ok(Some(value)),
            Some((false, _)) => {
                self.values.remove_if(key, |_, entry| !Self::is_live(entry, now));
                trace!(key, "Dropped expired value");
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> ControlResult<()> {
        let now = self.clock.now();
        let expires_at = ttl.map(|ttl| now.checked_add(ttl).unwrap_or(now));
        self.values.insert(key.to_string(), StoredValue { value, expires_at });
        Ok(())
    }

    async fn delete(&self, key: &str) -> ControlResult<bool> {
        Ok(self.values.remove(key).is_some())
    }

    async fn keys_with_prefix(&self, prefix: &str) -> ControlResult<Vec<String>> {
        let now = self.clock.now();
        self.values.retain(|_, entry| Self::is_live(entry, now));

        let mut keys: Vec<String> = self
            .values
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}
