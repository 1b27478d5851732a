//! Shared long-lived state of the control plane

use std::sync::Arc;

use crate::config::ControlPlaneConfig;
use crate::error::ConfigResult;
use crate::observability::BreakerListener;
use crate::queue::FailedOperationQueue;
use crate::resilience::{CircuitBreaker, CircuitBreakerRegistry, Clock, SystemClock};
use crate::store::KeyValueStore;

/// Breaker registry and failed-operation queue, built once and shared
///
/// Hosts create one context at startup and hand clones to the components
/// that need it. Clones share the same registry and queue.
#[derive(Debug, Clone)]
pub struct ResilienceContext {
    breakers: Arc<CircuitBreakerRegistry>,
    failed_operations: Arc<FailedOperationQueue>,
    config: Arc<ControlPlaneConfig>,
}

impl Default for ResilienceContext {
    fn default() -> Self {
        Self {
            breakers: Arc::new(CircuitBreakerRegistry::new()),
            failed_operations: Arc::new(FailedOperationQueue::new()),
            config: Arc::new(ControlPlaneConfig::default()),
        }
    }
}

impl ResilienceContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style construction from a validated configuration
    pub fn builder(config: ControlPlaneConfig) -> ResilienceContextBuilder {
        ResilienceContextBuilder {
            config,
            clock: Arc::new(SystemClock),
            listener: None,
            journal: None,
        }
    }

    pub fn from_config(config: ControlPlaneConfig) -> ConfigResult<Self> {
        Self::builder(config).build()
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    pub fn failed_operations(&self) -> &Arc<FailedOperationQueue> {
        &self.failed_operations
    }

    pub fn config(&self) -> &ControlPlaneConfig {
        &self.config
    }

    /// Breaker for `name` using the configured breaker defaults
    pub fn breaker(&self, name: &str) -> ConfigResult<Arc<CircuitBreaker>> {
        self.breakers.get_or_create(name, self.config.circuit_breaker.clone())
    }
}

/// Builder for [`ResilienceContext`]
pub struct ResilienceContextBuilder {
    config: ControlPlaneConfig,
    clock: Arc<dyn Clock>,
    listener: Option<Arc<dyn BreakerListener>>,
    journal: Option<Arc<dyn KeyValueStore>>,
}

impl std::fmt::Debug for ResilienceContextBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilienceContextBuilder")
            .field("config", &self.config)
            .field("has_listener", &self.listener.is_some())
            .field("has_journal", &self.journal.is_some())
            .finish_non_exhaustive()
    }
}

impl ResilienceContextBuilder {
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn breaker_listener(mut self, listener: Arc<dyn BreakerListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Journal failed-operation entries into `store`
    #[must_use]
    pub fn journal(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.journal = Some(store);
        self
    }

    pub fn build(self) -> ConfigResult<ResilienceContext> {
        self.config.validate()?;

        let mut registry = CircuitBreakerRegistry::with_clock(self.clock);
        if let Some(listener) = self.listener {
            registry = registry.with_listener(listener);
        }

        let mut queue = FailedOperationQueue::with_config(self.config.queue.clone())?;
        if let Some(journal) = self.journal {
            queue = queue.with_journal(journal);
        }

        Ok(ResilienceContext {
            breakers: Arc::new(registry),
            failed_operations: Arc::new(queue),
            config: Arc::new(self.config),
        })
    }
}
