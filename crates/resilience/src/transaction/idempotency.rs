//! Idempotency records and per-key execution locks
//!
//! Completed results are stored as JSON records in a [`KeyValueStore`] under
//! `idem:{key}` with a time-to-live. Concurrent executions for one key are
//! serialized by an async mutex per key, held only while that key has an
//! execution in flight.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info};

use crate::error::ControlResult;
use crate::store::KeyValueStore;

const KEY_PREFIX: &str = "idem:";

/// Default lifetime of a stored result
pub const DEFAULT_IDEMPOTENCY_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Stored outcome of a completed execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub key: String,
    pub result: Value,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Idempotency records plus the in-flight lock table
pub struct IdempotencyStore {
    store: Arc<dyn KeyValueStore>,
    ttl: Duration,
    in_flight: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl std::fmt::Debug for IdempotencyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdempotencyStore")
            .field("ttl", &self.ttl)
            .field("in_flight", &self.in_flight.len())
            .finish_non_exhaustive()
    }
}

/// Exclusive right to execute for one key
///
/// Dropping the guard releases the key and removes its lock entry once no
/// other caller is waiting on it.
pub struct KeyGuard {
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
    in_flight: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl std::fmt::Debug for KeyGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyGuard").field("key", &self.key).finish_non_exhaustive()
    }
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.in_flight.remove_if(&self.key, |_, lock| Arc::strong_count(lock) == 1);
    }
}

impl IdempotencyStore {
    pub fn new(store: Arc<dyn KeyValueStore>, ttl: Duration) -> Self {
        Self { store, ttl, in_flight: Arc::new(DashMap::new()) }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Unexpired record for `key`
    pub async fn lookup(&self, key: &str) -> ControlResult<Option<IdempotencyRecord>> {
        match self.store.get(&storage_key(key)).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Store the result of a completed execution
    pub async fn record(&self, key: &str, result: Value) -> ControlResult<IdempotencyRecord> {
        let created_at = Utc::now();
        let expires_at = chrono::Duration::from_std(self.ttl)
            .ok()
            .and_then(|ttl| created_at.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let record = IdempotencyRecord { key: key.to_string(), result, created_at, expires_at };

        self.store.set(&storage_key(key), serde_json::to_value(&record)?, Some(self.ttl)).await?;
        debug!(key, "Stored idempotency record");
        Ok(record)
    }

    /// Wait for exclusive execution rights on `key`
    pub async fn lock(&self, key: &str) -> KeyGuard {
        let lock = Arc::clone(
            self.in_flight.entry(key.to_string()).or_insert_with(|| Arc::new(Mutex::new(()))).value(),
        );
        let guard = lock.lock_owned().await;
        KeyGuard { key: key.to_string(), guard: Some(guard), in_flight: Arc::clone(&self.in_flight) }
    }

    /// Whether `key` currently has an execution in flight
    pub fn is_in_flight(&self, key: &str) -> bool {
        self.in_flight.contains_key(key)
    }

    pub async fn remove(&self, key: &str) -> ControlResult<bool> {
        self.store.delete(&storage_key(key)).await
    }

    /// Keys with an unexpired record
    pub async fn keys(&self) -> ControlResult<Vec<String>> {
        let keys = self.store.keys_with_prefix(KEY_PREFIX).await?;
        Ok(keys.into_iter().filter_map(|key| key.strip_prefix(KEY_PREFIX).map(str::to_string)).collect())
    }

    /// Delete every record, returning how many were removed
    pub async fn clear(&self) -> ControlResult<usize> {
        let mut removed = 0;
        for key in self.store.keys_with_prefix(KEY_PREFIX).await? {
            if self.store.delete(&key).await? {
                removed += 1;
            }
        }
        info!(removed, "Cleared idempotency records");
        Ok(removed)
    }
}

fn storage_key(key: &str) -> String {
    format!("{KEY_PREFIX}{key}")
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::resilience::MockClock;
    use crate::store::MemoryStore;

    fn idempotency(ttl: Duration) -> (IdempotencyStore, MockClock) {
        let clock = MockClock::new();
        let store = Arc::new(MemoryStore::with_clock(Arc::new(clock.clone())));
        (IdempotencyStore::new(store, ttl), clock)
    }

    #[tokio::test]
    async fn test_record_and_lookup() {
        let (store, _clock) = idempotency(DEFAULT_IDEMPOTENCY_TTL);
        let record = store.record("charge-17", json!({"charge_id": "ch_1"})).await.expect("record");

        let found = store.lookup("charge-17").await.expect("lookup").expect("present");
        assert_eq!(found, record);
        assert!(found.expires_at > found.created_at);
        assert_eq!(store.keys().await.expect("keys"), ["charge-17"]);
    }

    #[tokio::test]
    async fn test_record_expires_with_ttl() {
        let (store, clock) = idempotency(Duration::from_secs(60));
        store.record("k", json!(1)).await.expect("record");

        clock.advance(Duration::from_secs(61));
        assert!(store.lookup("k").await.expect("lookup").is_none());
    }

    #[tokio::test]
    async fn test_clear_removes_all_records() {
        let (store, _clock) = idempotency(DEFAULT_IDEMPOTENCY_TTL);
        store.record("a", json!(1)).await.expect("record");
        store.record("b", json!(2)).await.expect("record");

        assert_eq!(store.clear().await.expect("clear"), 2);
        assert!(store.keys().await.expect("keys").is_empty());
    }

    #[tokio::test]
    async fn test_lock_entry_removed_after_release() {
        let (store, _clock) = idempotency(DEFAULT_IDEMPOTENCY_TTL);
        {
            let _guard = store.lock("order-9").await;
            assert!(store.is_in_flight("order-9"));
        }
        assert!(!store.is_in_flight("order-9"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_lock_serializes_same_key() {
        let (store, _clock) = idempotency(DEFAULT_IDEMPOTENCY_TTL);
        let store = Arc::new(store);
        let first = store.lock("k").await;

        let waiter = tokio::spawn({
            let store = Arc::clone(&store);
            async move {
                let _guard = store.lock("k").await;
            }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(first);
        waiter.await.expect("waiter acquires after release");
        assert!(!store.is_in_flight("k"));
    }
}
