//! Observability hooks
//!
//! The control plane performs no observability I/O of its own beyond
//! `tracing` events. Hosts that want metrics or audit trails register
//! listeners; each listener is a one-method trait so it can carry explicit
//! context instead of relying on ambient closures. Plain closures implement
//! the traits too.

use std::fmt;
use std::time::Duration;

use tracing::{info, warn};

use crate::error::ControlError;
use crate::resilience::CircuitState;

/// Notified before each retry sleep
pub trait RetryListener<E>: Send + Sync {
    /// `attempt` is the 1-based number of the attempt that just failed
    fn on_retry(&self, error: &E, attempt: u32, delay: Duration);
}

impl<E, F> RetryListener<E> for F
where
    F: Fn(&E, u32, Duration) + Send + Sync,
{
    fn on_retry(&self, error: &E, attempt: u32, delay: Duration) {
        self(error, attempt, delay);
    }
}

/// Notified after a circuit breaker changes state
pub trait BreakerListener: Send + Sync {
    fn on_state_change(&self, name: &str, from: CircuitState, to: CircuitState);
}

impl<F> BreakerListener for F
where
    F: Fn(&str, CircuitState, CircuitState) + Send + Sync,
{
    fn on_state_change(&self, name: &str, from: CircuitState, to: CircuitState) {
        self(name, from, to);
    }
}

/// Notified when a saga compensation fails during the rollback sweep
pub trait SagaListener: Send + Sync {
    fn on_compensation_failure(&self, saga: &str, step: &str, error: &ControlError);
}

impl<F> SagaListener for F
where
    F: Fn(&str, &str, &ControlError) + Send + Sync,
{
    fn on_compensation_failure(&self, saga: &str, step: &str, error: &ControlError) {
        self(saga, step, error);
    }
}

/// Listener that forwards every hook to `tracing`
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl<E: fmt::Display> RetryListener<E> for TracingObserver {
    fn on_retry(&self, error: &E, attempt: u32, delay: Duration) {
        warn!(attempt, delay_ms = delay.as_millis() as u64, error = %error, "Retrying operation");
    }
}

impl BreakerListener for TracingObserver {
    fn on_state_change(&self, name: &str, from: CircuitState, to: CircuitState) {
        info!(breaker = name, %from, %to, "Circuit breaker state changed");
    }
}

impl SagaListener for TracingObserver {
    fn on_compensation_failure(&self, saga: &str, step: &str, error: &ControlError) {
        warn!(saga, step, error = %error, "Saga compensation failed");
    }
}
