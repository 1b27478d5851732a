//! Circuit breaker for named dependencies
//!
//! A breaker fast-fails calls to a dependency once its failure rate crosses
//! a threshold, then probes recovery with a limited number of trial calls.
//!
//! ```text
//!            failures >= threshold            timeout elapsed
//!  CLOSED ─────────────────────────► OPEN ─────────────────────► HALF_OPEN
//!    ▲                                 ▲                            │
//!    │        any trial failure        └────────────────────────────┤
//!    └──────────────────────────────────────────────────────────────┘
//!                   success_threshold consecutive successes
//! ```
//!
//! All state lives in a single [`parking_lot::Mutex`]; the protected
//! operation always runs outside the lock. Outcomes of calls that started
//! before a state transition are counted in the statistics but do not drive
//! the state machine of the new generation.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use super::clock::{Clock, SystemClock};
use crate::error::{CircuitOpenError, ConfigError, ConfigResult};
use crate::observability::BreakerListener;
use crate::utils::serde::duration_millis;

/// Upper bound on outcomes remembered for the rolling window
const MAX_WINDOW_ENTRIES: usize = 10_000;

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Circuit is closed, allowing requests
    Closed,
    /// Circuit is open, rejecting requests
    Open,
    /// Circuit is half-open, allowing limited trial requests
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Failures within `monitoring_period` that open the circuit
    pub failure_threshold: u64,
    /// Consecutive half-open successes needed to close the circuit
    pub success_threshold: u64,
    /// Time to wait before transitioning from open to half-open
    #[serde(with = "duration_millis")]
    pub timeout: Duration,
    /// Maximum number of concurrent trial calls in half-open state
    pub half_open_max_calls: u64,
    /// Minimum requests in the window before the error percentage applies
    /// (0 disables percentage-based tripping)
    pub volume_threshold: u64,
    /// Failure percentage (0-100] that opens the circuit once the volume
    /// threshold is met
    pub error_threshold_percentage: f64,
    /// Length of the rolling window used while closed
    #[serde(with = "duration_millis")]
    pub monitoring_period: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout: Duration::from_secs(60),
            half_open_max_calls: 1,
            volume_threshold: 10,
            error_threshold_percentage: 50.0,
            monitoring_period: Duration::from_secs(60),
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a configuration builder
    pub fn builder() -> CircuitBreakerConfigBuilder {
        CircuitBreakerConfigBuilder::new()
    }

    /// Validate the configuration
    pub fn validate(&self) -> ConfigResult<()> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::field("failure_threshold", "must be greater than 0"));
        }

        if self.success_threshold == 0 {
            return Err(ConfigError::field("success_threshold", "must be greater than 0"));
        }

        if self.half_open_max_calls == 0 {
            return Err(ConfigError::field("half_open_max_calls", "must be greater than 0"));
        }

        if !(self.error_threshold_percentage > 0.0 && self.error_threshold_percentage <= 100.0) {
            return Err(ConfigError::field(
                "error_threshold_percentage",
                "must be within (0, 100]",
            ));
        }

        if self.monitoring_period.is_zero() {
            return Err(ConfigError::field("monitoring_period", "must be greater than 0"));
        }

        Ok(())
    }
}

/// Builder for [`CircuitBreakerConfig`]
#[derive(Debug, Default)]
pub struct CircuitBreakerConfigBuilder {
    config: CircuitBreakerConfig,
}

impl CircuitBreakerConfigBuilder {
    pub fn new() -> Self {
        Self { config: CircuitBreakerConfig::default() }
    }

    pub fn failure_threshold(mut self, threshold: u64) -> Self {
        self.config.failure_threshold = threshold;
        self
    }

    pub fn success_threshold(mut self, threshold: u64) -> Self {
        self.config.success_threshold = threshold;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    pub fn half_open_max_calls(mut self, max_calls: u64) -> Self {
        self.config.half_open_max_calls = max_calls;
        self
    }

    pub fn volume_threshold(mut self, volume: u64) -> Self {
        self.config.volume_threshold = volume;
        self
    }

    pub fn error_threshold_percentage(mut self, percentage: f64) -> Self {
        self.config.error_threshold_percentage = percentage;
        self
    }

    pub fn monitoring_period(mut self, period: Duration) -> Self {
        self.config.monitoring_period = period;
        self
    }

    pub fn build(self) -> ConfigResult<CircuitBreakerConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Error returned by [`CircuitBreaker::execute_guarded`]
///
/// Separates a rejection from a failure of the protected operation so
/// callers (notably the retry executor) can treat them differently.
#[derive(Debug)]
pub enum BreakerError<E> {
    /// The breaker rejected the call without running it
    Open(CircuitOpenError),
    /// The protected operation ran and failed
    Failed(E),
}

impl<E> BreakerError<E> {
    /// Collapse into the caller's error type
    pub fn into_error(self) -> E
    where
        E: From<CircuitOpenError>,
    {
        match self {
            Self::Open(open) => E::from(open),
            Self::Failed(error) => error,
        }
    }

    /// Whether the call was rejected without running
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::Open(_))
    }
}

impl<E: fmt::Display> fmt::Display for BreakerError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open(open) => write!(f, "{open}"),
            Self::Failed(error) => write!(f, "{error}"),
        }
    }
}

impl<E> std::error::Error for BreakerError<E>
where
    E: std::error::Error + 'static,
{
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Open(open) => Some(open),
            Self::Failed(error) => Some(error),
        }
    }
}

/// Point-in-time view of a breaker
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitBreakerStats {
    pub name: String,
    pub state: CircuitState,
    /// Failures in the current closed window
    pub failure_count: u64,
    /// Consecutive successes in the current half-open phase
    pub success_count: u64,
    /// Calls that were allowed to run
    pub total_requests: u64,
    /// Calls that ran and failed
    pub failed_requests: u64,
    /// Calls rejected without running
    pub rejected_requests: u64,
    /// `failed_requests / total_requests` as a percentage
    pub failure_rate: f64,
    /// Wall-clock time the breaker last opened
    pub opened_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    generation: u64,
    failure_count: u64,
    success_count: u64,
    half_open_in_flight: u64,
    window: VecDeque<(Instant, bool)>,
    opened_at: Option<Instant>,
    opened_at_wall: Option<SystemTime>,
    total_requests: u64,
    failed_requests: u64,
    rejected_requests: u64,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            generation: 0,
            failure_count: 0,
            success_count: 0,
            half_open_in_flight: 0,
            window: VecDeque::new(),
            opened_at: None,
            opened_at_wall: None,
            total_requests: 0,
            failed_requests: 0,
            rejected_requests: 0,
        }
    }

    fn prune(&mut self, now: Instant, period: Duration) {
        while let Some((at, _)) = self.window.front() {
            if now.duration_since(*at) > period || self.window.len() > MAX_WINDOW_ENTRIES {
                self.window.pop_front();
            } else {
                break;
            }
        }
        self.failure_count = self.window.iter().filter(|(_, ok)| !ok).count() as u64;
    }
}

type Transition = (CircuitState, CircuitState);

/// Per-dependency circuit breaker
///
/// Cheap to share behind an `Arc`; see
/// [`CircuitBreakerRegistry`](super::CircuitBreakerRegistry) for the
/// process-wide cache of named instances.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
    clock: Arc<dyn Clock>,
    listener: Option<Arc<dyn BreakerListener>>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Admission ticket for one call
///
/// Dropping an unsettled trial permit (the caller's future was cancelled)
/// frees its half-open slot.
struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    generation: u64,
    trial: bool,
    settled: bool,
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.trial {
            self.breaker.release_trial(self.generation);
        }
    }
}

impl CircuitBreaker {
    /// Create a breaker using the system clock
    pub fn new<S: Into<String>>(name: S, config: CircuitBreakerConfig) -> ConfigResult<Self> {
        Self::with_clock(name, config, Arc::new(SystemClock))
    }

    /// Create a breaker with a custom clock (useful for testing)
    pub fn with_clock<S: Into<String>>(
        name: S,
        config: CircuitBreakerConfig,
        clock: Arc<dyn Clock>,
    ) -> ConfigResult<Self> {
        config.validate()?;
        Ok(Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerState::new()),
            clock,
            listener: None,
        })
    }

    /// Attach a state change listener
    #[must_use]
    pub fn with_listener(mut self, listener: Arc<dyn BreakerListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Name of the protected dependency
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configuration this breaker was created with
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Whether the breaker is currently open
    ///
    /// An open breaker whose timeout has elapsed still reports `true` until
    /// the next call moves it to half-open.
    pub fn is_open(&self) -> bool {
        self.state() == CircuitState::Open
    }

    /// Execute an operation with circuit breaker protection
    ///
    /// Rejections surface as `E::from(CircuitOpenError)`; operation errors
    /// are returned unchanged.
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<CircuitOpenError>,
    {
        self.execute_guarded(operation).await.map_err(BreakerError::into_error)
    }

    /// Execute an operation, keeping rejections distinct from failures
    #[instrument(skip(self, operation), fields(breaker = %self.name))]
    pub async fn execute_guarded<F, Fut, T, E>(&self, operation: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut permit = self.acquire().map_err(BreakerError::Open)?;

        match operation().await {
            Ok(value) => {
                self.settle(&mut permit, true);
                Ok(value)
            }
            Err(error) => {
                self.settle(&mut permit, false);
                Err(BreakerError::Failed(error))
            }
        }
    }

    /// Synchronous variant of [`execute`](Self::execute)
    pub fn call<F, T, E>(&self, operation: F) -> Result<T, E>
    where
        F: FnOnce() -> Result<T, E>,
        E: From<CircuitOpenError>,
    {
        let mut permit = self.acquire().map_err(E::from)?;
        let result = operation();
        self.settle(&mut permit, result.is_ok());
        result
    }

    /// Snapshot of the breaker's counters
    pub fn get_stats(&self) -> CircuitBreakerStats {
        let inner = self.inner.lock();
        let failure_rate = if inner.total_requests == 0 {
            0.0
        } else {
            inner.failed_requests as f64 / inner.total_requests as f64 * 100.0
        };
        CircuitBreakerStats {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            total_requests: inner.total_requests,
            failed_requests: inner.failed_requests,
            rejected_requests: inner.rejected_requests,
            failure_rate,
            opened_at: inner.opened_at_wall.map(DateTime::<Utc>::from),
        }
    }

    /// Reset the breaker to a fresh closed state, clearing all counters
    pub fn reset(&self) {
        let transition = {
            let mut inner = self.inner.lock();
            let from = inner.state;
            let generation = inner.generation + 1;
            *inner = BreakerState::new();
            inner.generation = generation;
            (from != CircuitState::Closed).then_some((from, CircuitState::Closed))
        };
        info!(breaker = %self.name, "Circuit breaker manually reset to closed state");
        self.notify(transition);
    }

    fn acquire(&self) -> Result<CallPermit<'_>, CircuitOpenError> {
        let now = self.clock.now();
        let mut transition = None;

        let admitted = {
            let mut inner = self.inner.lock();

            if inner.state == CircuitState::Open {
                let elapsed = inner.opened_at.map_or(self.config.timeout, |at| now.duration_since(at));
                if elapsed >= self.config.timeout {
                    transition = Some(self.transition(&mut inner, CircuitState::HalfOpen, now));
                } else {
                    inner.rejected_requests += 1;
                    debug!(breaker = %self.name, "Circuit open, rejecting call");
                    return Err(CircuitOpenError {
                        name: self.name.clone(),
                        retry_after: Some(self.config.timeout - elapsed),
                    });
                }
            }

            match inner.state {
                CircuitState::HalfOpen => {
                    if inner.half_open_in_flight >= self.config.half_open_max_calls {
                        inner.rejected_requests += 1;
                        debug!(breaker = %self.name, "Half-open trial slots exhausted, rejecting call");
                        None
                    } else {
                        inner.half_open_in_flight += 1;
                        inner.total_requests += 1;
                        Some((inner.generation, true))
                    }
                }
                _ => {
                    inner.total_requests += 1;
                    Some((inner.generation, false))
                }
            }
        };

        self.notify(transition);

        match admitted {
            Some((generation, trial)) => {
                Ok(CallPermit { breaker: self, generation, trial, settled: false })
            }
            None => Err(CircuitOpenError { name: self.name.clone(), retry_after: None }),
        }
    }

    fn settle(&self, permit: &mut CallPermit<'_>, success: bool) {
        permit.settled = true;
        let now = self.clock.now();

        let transition = {
            let mut inner = self.inner.lock();
            if !success {
                inner.failed_requests += 1;
            }

            if inner.generation != permit.generation {
                debug!(breaker = %self.name, success, "Ignoring outcome from previous breaker generation");
                return;
            }

            match inner.state {
                CircuitState::Closed => {
                    inner.window.push_back((now, success));
                    inner.prune(now, self.config.monitoring_period);
                    if !success && self.should_trip(&inner) {
                        Some(self.transition(&mut inner, CircuitState::Open, now))
                    } else {
                        None
                    }
                }
                CircuitState::HalfOpen => {
                    inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
                    if success {
                        inner.success_count += 1;
                        if inner.success_count >= self.config.success_threshold {
                            Some(self.transition(&mut inner, CircuitState::Closed, now))
                        } else {
                            None
                        }
                    } else {
                        Some(self.transition(&mut inner, CircuitState::Open, now))
                    }
                }
                CircuitState::Open => None,
            }
        };

        self.notify(transition);
    }

    fn release_trial(&self, generation: u64) {
        let mut inner = self.inner.lock();
        if inner.generation == generation && inner.state == CircuitState::HalfOpen {
            inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
        }
    }

    fn should_trip(&self, inner: &BreakerState) -> bool {
        if inner.failure_count >= self.config.failure_threshold {
            return true;
        }

        let volume = inner.window.len() as u64;
        if self.config.volume_threshold == 0 || volume < self.config.volume_threshold {
            return false;
        }
        let rate = inner.failure_count as f64 / volume as f64 * 100.0;
        rate >= self.config.error_threshold_percentage
    }

    /// Apply a state change; caller holds the lock
    fn transition(&self, inner: &mut BreakerState, to: CircuitState, now: Instant) -> Transition {
        let from = inner.state;
        inner.state = to;
        inner.generation += 1;
        inner.success_count = 0;
        inner.half_open_in_flight = 0;

        match to {
            CircuitState::Open => {
                inner.opened_at = Some(now);
                inner.opened_at_wall = Some(self.clock.system_time());
                warn!(
                    breaker = %self.name,
                    failures = inner.failure_count,
                    "Circuit breaker opened"
                );
            }
            CircuitState::HalfOpen => {
                debug!(breaker = %self.name, "Circuit breaker half-open, allowing trial calls");
            }
            CircuitState::Closed => {
                inner.failure_count = 0;
                inner.window.clear();
                inner.opened_at = None;
                info!(breaker = %self.name, "Circuit breaker closed");
            }
        }

        (from, to)
    }

    fn notify(&self, transition: Option<Transition>) {
        if let (Some((from, to)), Some(listener)) = (transition, &self.listener) {
            listener.on_state_change(&self.name, from, to);
        }
    }
}

#[cfg(test)]
mod tests {
    //! Unit tests for circuit breaker state transitions
    //!
    //! Tests cover configuration validation, threshold and percentage
    //! tripping, timeout-driven half-open probing, stale outcomes and
    //! concurrent access.

    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::error::ControlError;
    use crate::resilience::clock::MockClock;

    fn breaker(config: CircuitBreakerConfig) -> (CircuitBreaker, MockClock) {
        let clock = MockClock::new();
        let breaker = CircuitBreaker::with_clock("payments", config, Arc::new(clock.clone()))
            .expect("valid config");
        (breaker, clock)
    }

    fn config(failure_threshold: u64) -> CircuitBreakerConfig {
        CircuitBreakerConfig::builder()
            .failure_threshold(failure_threshold)
            .success_threshold(1)
            .timeout(Duration::from_secs(30))
            .volume_threshold(0)
            .build()
            .expect("valid config")
    }

    fn fail(breaker: &CircuitBreaker) -> Result<(), ControlError> {
        breaker.call(|| Err(ControlError::network("gateway", "connection reset")))
    }

    fn succeed(breaker: &CircuitBreaker) -> Result<(), ControlError> {
        breaker.call(|| Ok(()))
    }

    #[test]
    fn test_config_validation() {
        assert!(CircuitBreakerConfig::default().validate().is_ok());
        assert!(CircuitBreakerConfig::builder().failure_threshold(0).build().is_err());
        assert!(CircuitBreakerConfig::builder().success_threshold(0).build().is_err());
        assert!(CircuitBreakerConfig::builder().half_open_max_calls(0).build().is_err());
        assert!(CircuitBreakerConfig::builder().error_threshold_percentage(0.0).build().is_err());
        assert!(CircuitBreakerConfig::builder().error_threshold_percentage(120.0).build().is_err());
        assert!(CircuitBreakerConfig::builder().monitoring_period(Duration::ZERO).build().is_err());
    }

    /// Validates the absolute failure threshold.
    ///
    /// Assertions:
    /// - Four failures keep the breaker closed.
    /// - The fifth failure opens it.
    #[test]
    fn test_opens_on_fifth_failure() {
        let (breaker, _clock) = breaker(config(5));

        for _ in 0..4 {
            let _ = fail(&breaker);
        }
        assert_eq!(breaker.state(), CircuitState::Closed);

        let _ = fail(&breaker);
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(breaker.is_open());
        assert!(breaker.get_stats().opened_at.is_some());
    }

    #[test]
    fn test_open_rejects_without_invoking() {
        let (breaker, _clock) = breaker(config(1));
        let _ = fail(&breaker);

        let calls = AtomicU32::new(0);
        for _ in 0..3 {
            let result: Result<(), ControlError> = breaker.call(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
            assert!(matches!(result, Err(ControlError::CircuitOpen(_))));
        }

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        let stats = breaker.get_stats();
        assert_eq!(stats.rejected_requests, 3);
        assert_eq!(stats.total_requests, 1);
    }

    #[test]
    fn test_rejection_reports_remaining_time() {
        let (breaker, clock) = breaker(config(1));
        let _ = fail(&breaker);
        clock.advance(Duration::from_secs(10));

        match fail(&breaker) {
            Err(ControlError::CircuitOpen(open)) => {
                assert_eq!(open.name, "payments");
                assert_eq!(open.retry_after, Some(Duration::from_secs(20)));
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[test]
    fn test_half_open_success_closes_with_zeroed_counters() {
        let (breaker, clock) = breaker(config(2));
        let _ = fail(&breaker);
        let _ = fail(&breaker);
        assert_eq!(breaker.state(), CircuitState::Open);

        clock.advance(Duration::from_secs(30));
        assert!(succeed(&breaker).is_ok());

        let stats = breaker.get_stats();
        assert_eq!(stats.state, CircuitState::Closed);
        assert_eq!(stats.failure_count, 0);
        assert_eq!(stats.success_count, 0);
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let (breaker, clock) = breaker(config(1));
        let _ = fail(&breaker);
        let first_open = breaker.get_stats().opened_at;

        clock.advance(Duration::from_secs(31));
        let _ = fail(&breaker);

        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(breaker.get_stats().opened_at > first_open);

        // New open period restarts the timeout
        clock.advance(Duration::from_secs(10));
        assert!(matches!(succeed(&breaker), Err(ControlError::CircuitOpen(_))));
    }

    #[test]
    fn test_success_threshold_requires_consecutive_successes() {
        let config = CircuitBreakerConfig::builder()
            .failure_threshold(1)
            .success_threshold(3)
            .half_open_max_calls(3)
            .timeout(Duration::from_secs(5))
            .build()
            .expect("valid config");
        let (breaker, clock) = breaker(config);
        let _ = fail(&breaker);
        clock.advance(Duration::from_secs(5));

        assert!(succeed(&breaker).is_ok());
        assert!(succeed(&breaker).is_ok());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert_eq!(breaker.get_stats().success_count, 2);
        assert!(succeed(&breaker).is_ok());
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_error_percentage_trips_after_volume() {
        let config = CircuitBreakerConfig::builder()
            .failure_threshold(100)
            .volume_threshold(10)
            .error_threshold_percentage(50.0)
            .build()
            .expect("valid config");
        let (breaker, _clock) = breaker(config);

        for _ in 0..5 {
            let _ = succeed(&breaker);
        }
        for _ in 0..4 {
            let _ = fail(&breaker);
        }
        // 9 requests: below the volume threshold
        assert_eq!(breaker.state(), CircuitState::Closed);

        let _ = fail(&breaker);
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn test_failures_outside_monitoring_period_expire() {
        let config = CircuitBreakerConfig::builder()
            .failure_threshold(3)
            .volume_threshold(0)
            .monitoring_period(Duration::from_secs(10))
            .build()
            .expect("valid config");
        let (breaker, clock) = breaker(config);

        let _ = fail(&breaker);
        let _ = fail(&breaker);
        clock.advance(Duration::from_secs(11));
        let _ = fail(&breaker);

        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.get_stats().failure_count, 1);
    }

    #[test]
    fn test_reset_clears_state() {
        let (breaker, _clock) = breaker(config(1));
        let _ = fail(&breaker);
        assert!(breaker.is_open());

        breaker.reset();
        let stats = breaker.get_stats();
        assert_eq!(stats.state, CircuitState::Closed);
        assert_eq!(stats.total_requests, 0);
        assert_eq!(stats.rejected_requests, 0);
        assert!(succeed(&breaker).is_ok());
    }

    #[test]
    fn test_listener_sees_transitions() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let clock = MockClock::new();
        let breaker = CircuitBreaker::with_clock("mailer", config(1), Arc::new(clock.clone()))
            .expect("valid config")
            .with_listener(Arc::new(move |_: &str, from: CircuitState, to: CircuitState| {
                sink.lock().push((from, to));
            }));

        let _ = fail(&breaker);
        clock.advance(Duration::from_secs(30));
        let _ = succeed(&breaker);

        assert_eq!(
            seen.lock().as_slice(),
            [
                (CircuitState::Closed, CircuitState::Open),
                (CircuitState::Open, CircuitState::HalfOpen),
                (CircuitState::HalfOpen, CircuitState::Closed),
            ]
        );
    }

    #[test]
    fn test_failure_rate() {
        let (breaker, _clock) = breaker(config(10));
        let _ = succeed(&breaker);
        let _ = fail(&breaker);
        let _ = succeed(&breaker);
        let _ = fail(&breaker);

        let stats = breaker.get_stats();
        assert_eq!(stats.total_requests, 4);
        assert_eq!(stats.failed_requests, 2);
        assert!((stats.failure_rate - 50.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_async_execute_guarded_distinguishes_rejection() {
        let (breaker, _clock) = breaker(config(1));

        let failed = breaker
            .execute_guarded(|| async { Err::<(), _>(ControlError::network("db", "down")) })
            .await;
        assert!(matches!(failed, Err(BreakerError::Failed(_))));

        let rejected = breaker.execute_guarded(|| async { Ok::<_, ControlError>(1) }).await;
        assert!(matches!(rejected, Err(ref e) if e.is_rejection()));
    }

    /// Validates half-open admits only the configured number of trials.
    #[tokio::test]
    async fn test_half_open_admits_single_trial() {
        let (breaker, clock) = breaker(config(1));
        let _ = fail(&breaker);
        clock.advance(Duration::from_secs(30));

        let (gate_tx, gate_rx) = tokio::sync::oneshot::channel::<()>();
        let trial = breaker.execute(|| async move {
            let _ = gate_rx.await;
            Ok::<_, ControlError>("probe")
        });
        tokio::pin!(trial);

        // Drive the trial until it parks on the gate
        assert!(futures::poll!(trial.as_mut()).is_pending());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        let second = breaker.execute(|| async { Ok::<_, ControlError>("second") }).await;
        assert!(matches!(second, Err(ControlError::CircuitOpen(_))));

        let _ = gate_tx.send(());
        assert_eq!(trial.await.expect("trial succeeds"), "probe");
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_cancelled_trial_frees_slot() {
        let (breaker, clock) = breaker(config(1));
        let _ = fail(&breaker);
        clock.advance(Duration::from_secs(30));

        {
            let trial = breaker.execute(|| async {
                futures::future::pending::<()>().await;
                Ok::<_, ControlError>(())
            });
            tokio::pin!(trial);
            assert!(futures::poll!(trial.as_mut()).is_pending());
        }

        assert!(breaker.execute(|| async { Ok::<_, ControlError>(()) }).await.is_ok());
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_failures_open_once() {
        let transitions = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&transitions);
        let breaker = Arc::new(
            CircuitBreaker::new("ledger", config(5))
                .expect("valid config")
                .with_listener(Arc::new(move |_: &str, _: CircuitState, to: CircuitState| {
                    if to == CircuitState::Open {
                        counter.fetch_add(1, Ordering::SeqCst);
                    }
                })),
        );

        let handles: Vec<_> = (0..32)
            .map(|_| {
                let breaker = Arc::clone(&breaker);
                tokio::spawn(async move {
                    breaker
                        .execute(|| async { Err::<(), _>(ControlError::network("ledger", "down")) })
                        .await
                })
            })
            .collect();
        for handle in handles {
            let _ = handle.await;
        }

        let stats = breaker.get_stats();
        assert_eq!(transitions.load(Ordering::SeqCst), 1);
        assert_eq!(stats.state, CircuitState::Open);
        assert_eq!(stats.total_requests + stats.rejected_requests, 32);
    }

    #[test]
    fn test_stats_serialize_state_names() {
        let (breaker, _clock) = breaker(config(1));
        let json = serde_json::to_value(breaker.get_stats()).expect("stats serialize");
        assert_eq!(json["state"], "CLOSED");
        assert_eq!(json["name"], "payments");
    }
}
