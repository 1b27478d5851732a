//! Resilience patterns for calls to external dependencies
//!
//! This module provides **generic** building blocks, parameterised over the
//! caller's error type:
//! - **Backoff**: exponential delay with symmetric jitter
//! - **Circuit Breaker**: fast-fails calls to an unhealthy dependency and
//!   probes recovery with trial calls
//! - **Registry**: one breaker per dependency name, shared process-wide
//! - **Retry**: re-runs transient failures with backoff, optionally behind a
//!   breaker
//! - **Fallback**: cached results, alternative operations and static
//!   defaults when the primary fails
//!
//! ## Relationship to `transaction` and `queue`
//!
//! | Feature | `resilience` | `transaction` / `queue` |
//! |---------|--------------|-------------------------|
//! | **Error Type** | Generic `<E>` | Concrete `ControlError` |
//! | **State** | In-process only | Key/value store and transaction sources |
//! | **Unit** | One operation | Units of work, sagas, replayable operations |
//!
//! The transaction manager builds on [`RetryExecutor`] for its retries.

pub mod backoff;
pub mod cache;
pub mod circuit_breaker;
pub mod clock;
pub mod fallback;
pub mod registry;
pub mod retry;

pub use backoff::{sample_jitter, ExponentialBackoff};
pub use cache::{CacheStats, ResponseCache};
pub use circuit_breaker::{
    BreakerError, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerConfigBuilder,
    CircuitBreakerStats, CircuitState,
};
pub use clock::{Clock, MockClock, SystemClock};
pub use fallback::{
    graceful_degrade, AllSourcesFailedError, FallbackChain, FallbackOptions,
    FallbackOrchestrator, DEFAULT_CACHE_TTL,
};
pub use registry::CircuitBreakerRegistry;
pub use retry::{RetryDecision, RetryExecutor, RetryPolicy, RetryPolicyBuilder};
