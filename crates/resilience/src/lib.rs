//! Resilience and recovery control plane for the Accora marketplace backend.
//!
//! Layers, from the outside in:
//! - **Fallback** ([`FallbackOrchestrator`], [`FallbackChain`],
//!   [`graceful_degrade`]): cached, alternate or default results once the
//!   primary path gives up
//! - **Retry** ([`RetryExecutor`]): exponential backoff with jitter for
//!   transient failures
//! - **Circuit breaking** ([`CircuitBreaker`], [`CircuitBreakerRegistry`]):
//!   fast-fail calls to an unhealthy dependency
//! - **Transactions** ([`TransactionManager`], [`SagaCoordinator`]):
//!   idempotent units of work with rollback and saga compensation
//! - **Replay** ([`FailedOperationQueue`]): failed operations retried later
//!   with a bounded budget
//!
//! Long-lived shared state lives in a [`ResilienceContext`]; operators reach
//! it through [`AdminApi`].
//!
//! # Feature Flags
//! - `test-utils`: exposes the [`testing`] module to downstream test suites

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms)]
#![warn(clippy::all, clippy::perf, clippy::complexity, clippy::suspicious)]

pub mod admin;
pub mod config;
pub mod context;
pub mod error;
pub mod observability;
pub mod queue;
pub mod resilience;
pub mod store;
pub mod transaction;
pub mod utils;

// Testing utilities
// ---------------------------------------------------------------
#[cfg(any(feature = "test-utils", test))]
pub mod testing;

// Re-export commonly used types and traits for convenience
// ------------------------
pub use admin::{AdminApi, ControlPlaneStatus};
pub use config::ControlPlaneConfig;
pub use context::{ResilienceContext, ResilienceContextBuilder};
pub use error::{
    CircuitOpenError, ConfigError, ConfigResult, ControlError, ControlResult, ErrorCategory,
    ErrorClassification, ErrorSeverity, RecoverableError, ResultRejected, TimeoutError,
};
pub use observability::{BreakerListener, RetryListener, SagaListener, TracingObserver};
pub use queue::{
    replayable, FailedOperationQueue, ProcessReport, QueueConfig, QueueStats, ReplayableOperation,
};
pub use resilience::{
    graceful_degrade, BreakerError, CircuitBreaker, CircuitBreakerConfig,
    CircuitBreakerRegistry, CircuitBreakerStats, CircuitState, Clock, FallbackChain,
    FallbackOptions, FallbackOrchestrator, MockClock, RetryDecision, RetryExecutor, RetryPolicy,
    SystemClock,
};
pub use store::{KeyValueStore, MemoryStore};
pub use transaction::{
    SagaCoordinator, SagaOutcome, SagaStep, TransactionConfig, TransactionManager,
    TransactionSource, TxOptions,
};
pub use utils::serde::duration_millis;
