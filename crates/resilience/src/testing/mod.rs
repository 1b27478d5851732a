//! Testing utilities
//!
//! Available to this crate's own tests and, with the `test-utils` feature,
//! to downstream test suites:
//! - [`init_test_tracing`]: install a test-friendly `tracing` subscriber once
//! - [`FlakyOperation`]: an operation that fails a set number of times
//! - [`RecordingListener`]: captures retry and breaker notifications
//! - [`FlakyStore`]: a [`KeyValueStore`] whose writes can be made to fail
//! - [`MockClock`]: controllable time for breakers, caches and stores

#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

pub use crate::resilience::{Clock, MockClock, SystemClock};
use crate::error::{ControlError, ControlResult};
use crate::observability::{BreakerListener, RetryListener};
use crate::resilience::CircuitState;
use crate::store::{KeyValueStore, MemoryStore};

static INIT_TRACING: Once = Once::new();

/// Install a `fmt` subscriber writing through the test harness
///
/// Honors `RUST_LOG`, defaulting to `accora_resilience=debug`. Safe to call
/// from every test; only the first call has an effect.
pub fn init_test_tracing() {
    INIT_TRACING.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("accora_resilience=debug"));
        let _ = tracing_subscriber::fmt().with_env_filter(filter).with_test_writer().try_init();
    });
}

/// Operation that fails its first `failures` calls, then succeeds
#[derive(Debug, Clone)]
pub struct FlakyOperation {
    failures: u32,
    calls: Arc<AtomicU32>,
    error: ControlError,
}

impl FlakyOperation {
    /// Fails `failures` times with a retryable network error
    pub fn new(failures: u32) -> Self {
        Self::with_error(failures, ControlError::network("flaky", "connection reset"))
    }

    pub fn with_error(failures: u32, error: ControlError) -> Self {
        Self { failures, calls: Arc::new(AtomicU32::new(0)), error }
    }

    /// Operation that never succeeds
    pub fn always_failing(error: ControlError) -> Self {
        Self::with_error(u32::MAX, error)
    }

    pub async fn call(&self) -> ControlResult<u32> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.failures {
            Err(self.error.clone())
        } else {
            Ok(call)
        }
    }

    /// Calls made so far (clones share the count)
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

/// Listener that remembers what it was told
#[derive(Debug, Default)]
pub struct RecordingListener {
    retries: Mutex<Vec<(u32, Duration)>>,
    transitions: Mutex<Vec<(String, CircuitState, CircuitState)>>,
}

impl RecordingListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// `(attempt, delay)` pairs in notification order
    pub fn retries(&self) -> Vec<(u32, Duration)> {
        self.retries.lock().clone()
    }

    pub fn transitions(&self) -> Vec<(String, CircuitState, CircuitState)> {
        self.transitions.lock().clone()
    }
}

impl<E> RetryListener<E> for RecordingListener {
    fn on_retry(&self, _error: &E, attempt: u32, delay: Duration) {
        self.retries.lock().push((attempt, delay));
    }
}

impl BreakerListener for RecordingListener {
    fn on_state_change(&self, name: &str, from: CircuitState, to: CircuitState) {
        self.transitions.lock().push((name.to_string(), from, to));
    }
}

/// [`MemoryStore`] whose next `set` calls fail with a store error
#[derive(Debug, Default)]
pub struct FlakyStore {
    inner: MemoryStore,
    failing_sets: AtomicU32,
}

impl FlakyStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fail the next `count` writes
    pub fn fail_next_sets(&self, count: u32) {
        self.failing_sets.store(count, Ordering::SeqCst);
    }

    pub fn inner(&self) -> &MemoryStore {
        &self.inner
    }
}

#[async_trait]
impl KeyValueStore for FlakyStore {
    async fn get(&self, key: &str) -> ControlResult<Option<Value>> {
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> ControlResult<()> {
        let failing = self
            .failing_sets
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(ControlError::store("set", "connection lost"));
        }
        self.inner.set(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> ControlResult<bool> {
        self.inner.delete(key).await
    }

    async fn keys_with_prefix(&self, prefix: &str) -> ControlResult<Vec<String>> {
        self.inner.keys_with_prefix(prefix).await
    }
}
