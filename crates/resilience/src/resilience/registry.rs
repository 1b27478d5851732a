//! Process-wide registry of named circuit breakers

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, info};

use super::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats};
use super::clock::{Clock, SystemClock};
use crate::error::ConfigResult;
use crate::observability::BreakerListener;

/// One breaker per dependency name
///
/// The first `get_or_create` for a name fixes its configuration; later calls
/// return the existing instance regardless of the config they pass.
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    clock: Arc<dyn Clock>,
    listener: Option<Arc<dyn BreakerListener>>,
}

impl std::fmt::Debug for CircuitBreakerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreakerRegistry").field("breakers", &self.names()).finish()
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CircuitBreakerRegistry {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Registry whose breakers read time from `clock`
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self { breakers: DashMap::new(), clock, listener: None }
    }

    /// Attach `listener` to every breaker created from now on
    #[must_use]
    pub fn with_listener(mut self, listener: Arc<dyn BreakerListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Breaker for `name`, created with `config` if it does not exist yet
    ///
    /// Fails only if a new breaker would be created from an invalid config.
    pub fn get_or_create(
        &self,
        name: &str,
        config: CircuitBreakerConfig,
    ) -> ConfigResult<Arc<CircuitBreaker>> {
        if let Some(existing) = self.breakers.get(name) {
            if existing.config() != &config {
                debug!(breaker = name, "Ignoring differing config for existing breaker");
            }
            return Ok(Arc::clone(existing.value()));
        }

        match self.breakers.entry(name.to_string()) {
            Entry::Occupied(entry) => Ok(Arc::clone(entry.get())),
            Entry::Vacant(entry) => {
                let mut breaker = CircuitBreaker::with_clock(name, config, Arc::clone(&self.clock))?;
                if let Some(listener) = &self.listener {
                    breaker = breaker.with_listener(Arc::clone(listener));
                }
                let breaker = Arc::new(breaker);
                entry.insert(Arc::clone(&breaker));
                info!(breaker = name, "Registered circuit breaker");
                Ok(breaker)
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(name).map(|entry| Arc::clone(entry.value()))
    }

    /// Reset one breaker; returns `false` if `name` is unknown
    pub fn reset(&self, name: &str) -> bool {
        match self.get(name) {
            Some(breaker) => {
                breaker.reset();
                true
            }
            None => false,
        }
    }

    pub fn reset_all(&self) {
        for breaker in self.snapshot() {
            breaker.reset();
        }
        info!(count = self.breakers.len(), "Reset all circuit breakers");
    }

    /// Stats for every breaker, sorted by name
    pub fn get_all_stats(&self) -> Vec<CircuitBreakerStats> {
        let mut stats: Vec<_> = self.snapshot().iter().map(|breaker| breaker.get_stats()).collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.breakers.iter().map(|entry| entry.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }

    // Clone out of the map so no shard lock is held while breakers lock
    fn snapshot(&self) -> Vec<Arc<CircuitBreaker>> {
        self.breakers.iter().map(|entry| Arc::clone(entry.value())).collect()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::error::ControlError;
    use crate::resilience::CircuitState;

    fn strict() -> CircuitBreakerConfig {
        CircuitBreakerConfig::builder()
            .failure_threshold(1)
            .volume_threshold(0)
            .build()
            .expect("config")
    }

    #[test]
    fn test_same_name_returns_same_instance() {
        let registry = CircuitBreakerRegistry::new();
        let first = registry.get_or_create("stripe", strict()).expect("created");
        let second = registry
            .get_or_create(
                "stripe",
                CircuitBreakerConfig::builder().failure_threshold(50).build().expect("config"),
            )
            .expect("existing");

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.config().failure_threshold, 1);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_invalid_config_rejected_on_creation() {
        let registry = CircuitBreakerRegistry::new();
        let config = CircuitBreakerConfig { failure_threshold: 0, ..CircuitBreakerConfig::default() };
        assert!(registry.get_or_create("bad", config).is_err());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_stats_sorted_and_reset() {
        let registry = CircuitBreakerRegistry::new();
        for name in ["sendgrid", "algolia", "stripe"] {
            let _ = registry.get_or_create(name, strict());
        }
        let stripe = registry.get("stripe").expect("registered");
        let _ = stripe.call(|| Err::<(), _>(ControlError::network("stripe", "down")));
        assert_eq!(stripe.state(), CircuitState::Open);

        let names: Vec<_> = registry.get_all_stats().into_iter().map(|s| s.name).collect();
        assert_eq!(names, ["algolia", "sendgrid", "stripe"]);

        assert!(registry.reset("stripe"));
        assert!(!registry.reset("unknown"));
        assert_eq!(stripe.state(), CircuitState::Closed);
    }

    #[test]
    fn test_reset_all() {
        let registry = CircuitBreakerRegistry::new();
        for name in ["a", "b"] {
            let breaker = registry.get_or_create(name, strict()).expect("created");
            let _ = breaker.call(|| Err::<(), _>(ControlError::timeout(name, Duration::from_secs(1))));
        }

        registry.reset_all();
        assert!(registry
            .get_all_stats()
            .iter()
            .all(|stats| stats.state == CircuitState::Closed));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_get_or_create_yields_one_instance() {
        let registry = Arc::new(CircuitBreakerRegistry::new());
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let registry = Arc::clone(&registry);
                tokio::spawn(async move {
                    registry
                        .get_or_create("inventory", CircuitBreakerConfig::default())
                        .expect("created")
                })
            })
            .collect();

        let mut breakers = Vec::new();
        for handle in handles {
            breakers.push(handle.await.expect("task"));
        }
        assert!(breakers.windows(2).all(|pair| Arc::ptr_eq(&pair[0], &pair[1])));
    }
}
