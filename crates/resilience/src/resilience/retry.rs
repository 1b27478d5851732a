//! Retry executor with exponential backoff
//!
//! Re-runs an async operation while its error is classified as transient.
//! The executor never wraps the caller's error: after the last attempt the
//! original error is returned unchanged. Interruptions raised by the
//! executor itself (breaker rejection, attempt timeout, rejected results)
//! reach the caller through the `From` conversions of
//! [`RecoverableError`](crate::error::RecoverableError).
//!
//! # Examples
//!
//! ```rust,no_run
//! use accora_resilience::error::ControlError;
//! use accora_resilience::resilience::{RetryExecutor, RetryPolicy};
//!
//! # async fn example() -> Result<(), ControlError> {
//! let executor = RetryExecutor::<ControlError>::new(RetryPolicy::default())?;
//! let balance = executor.execute(|| async { Ok::<_, ControlError>(42) }).await?;
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use super::backoff::ExponentialBackoff;
use super::circuit_breaker::{BreakerError, CircuitBreaker};
use crate::error::{
    ConfigError, ConfigResult, ErrorClassification, RecoverableError, ResultRejected, TimeoutError,
};
use crate::observability::RetryListener;
use crate::utils::serde::{duration_millis, option_duration_millis};

/// Decision returned by a classifier for a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after the computed backoff delay
    Retry,
    /// Retry after a specific delay (capped at the policy's `max_delay`)
    RetryAfter(Duration),
    /// Do not retry, return the error
    Stop,
}

/// Retry policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first attempt (total attempts = `max_retries + 1`)
    pub max_retries: u32,
    #[serde(with = "duration_millis")]
    pub initial_delay: Duration,
    #[serde(with = "duration_millis")]
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// Jitter as a fraction of the delay, applied in both directions
    pub jitter_ratio: f64,
    /// Deadline for a single attempt
    #[serde(with = "option_duration_millis")]
    pub attempt_timeout: Option<Duration>,
    /// Whether an attempt that hit `attempt_timeout` is retried
    pub retry_on_timeout: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter_ratio: 0.1,
            attempt_timeout: None,
            retry_on_timeout: true,
        }
    }
}

impl RetryPolicy {
    /// Create a policy builder
    pub fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder::new()
    }

    /// Validate the policy
    pub fn validate(&self) -> ConfigResult<()> {
        if self.initial_delay > self.max_delay {
            return Err(ConfigError::field("initial_delay", "must not exceed max_delay"));
        }

        if !(self.backoff_multiplier.is_finite() && self.backoff_multiplier >= 1.0) {
            return Err(ConfigError::field("backoff_multiplier", "must be at least 1.0"));
        }

        if !(0.0..=1.0).contains(&self.jitter_ratio) {
            return Err(ConfigError::field("jitter_ratio", "must be within [0.0, 1.0]"));
        }

        if self.attempt_timeout.is_some_and(|timeout| timeout.is_zero()) {
            return Err(ConfigError::field("attempt_timeout", "must be greater than 0"));
        }

        Ok(())
    }

    /// Backoff calculator for this policy
    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_delay: self.initial_delay,
            max_delay: self.max_delay,
            multiplier: self.backoff_multiplier,
            jitter_ratio: self.jitter_ratio,
        }
    }
}

/// Builder for [`RetryPolicy`]
#[derive(Debug, Default)]
pub struct RetryPolicyBuilder {
    policy: RetryPolicy,
}

impl RetryPolicyBuilder {
    pub fn new() -> Self {
        Self { policy: RetryPolicy::default() }
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.policy.max_retries = retries;
        self
    }

    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.policy.initial_delay = delay;
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.policy.max_delay = delay;
        self
    }

    pub fn backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.policy.backoff_multiplier = multiplier;
        self
    }

    pub fn jitter_ratio(mut self, ratio: f64) -> Self {
        self.policy.jitter_ratio = ratio;
        self
    }

    /// Disable jitter for predictable delays
    pub fn no_jitter(mut self) -> Self {
        self.policy.jitter_ratio = 0.0;
        self
    }

    pub fn attempt_timeout(mut self, timeout: Duration) -> Self {
        self.policy.attempt_timeout = Some(timeout);
        self
    }

    pub fn retry_on_timeout(mut self, retry: bool) -> Self {
        self.policy.retry_on_timeout = retry;
        self
    }

    pub fn build(self) -> ConfigResult<RetryPolicy> {
        self.policy.validate()?;
        Ok(self.policy)
    }
}

type Classifier<E> = Arc<dyn Fn(&E) -> RetryDecision + Send + Sync>;

/// Default classification through [`ErrorClassification`]
fn classify<E: ErrorClassification>(error: &E) -> RetryDecision {
    if !error.is_retryable() {
        RetryDecision::Stop
    } else if let Some(after) = error.retry_after() {
        RetryDecision::RetryAfter(after)
    } else {
        RetryDecision::Retry
    }
}

enum AttemptError<E> {
    Failed(E),
    TimedOut(Duration),
}

enum Attempt<T, E> {
    Succeeded(T),
    /// Breaker rejected the call; never retried
    Rejected(E),
    TimedOut(E),
    Failed(E),
}

/// Executes operations with retry, backoff and optional breaker protection
pub struct RetryExecutor<E> {
    policy: RetryPolicy,
    classifier: Classifier<E>,
    breaker: Option<Weak<CircuitBreaker>>,
    listener: Option<Arc<dyn RetryListener<E>>>,
    cancellation: Option<CancellationToken>,
}

impl<E> Clone for RetryExecutor<E> {
    fn clone(&self) -> Self {
        Self {
            policy: self.policy.clone(),
            classifier: Arc::clone(&self.classifier),
            breaker: self.breaker.clone(),
            listener: self.listener.clone(),
            cancellation: self.cancellation.clone(),
        }
    }
}

impl<E> fmt::Debug for RetryExecutor<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryExecutor")
            .field("policy", &self.policy)
            .field("has_breaker", &self.breaker.is_some())
            .field("has_listener", &self.listener.is_some())
            .finish_non_exhaustive()
    }
}

impl<E: ErrorClassification + 'static> RetryExecutor<E> {
    /// Create an executor that classifies errors through [`ErrorClassification`]
    pub fn new(policy: RetryPolicy) -> ConfigResult<Self> {
        Self::with_classifier(policy, classify::<E>)
    }
}

impl<E: 'static> RetryExecutor<E> {
    /// Create an executor with a custom classifier
    pub fn with_classifier<C>(policy: RetryPolicy, classifier: C) -> ConfigResult<Self>
    where
        C: Fn(&E) -> RetryDecision + Send + Sync + 'static,
    {
        policy.validate()?;
        Ok(Self {
            policy,
            classifier: Arc::new(classifier),
            breaker: None,
            listener: None,
            cancellation: None,
        })
    }

    /// Create an executor that retries whenever `predicate` returns `true`
    pub fn with_predicate<P>(policy: RetryPolicy, predicate: P) -> ConfigResult<Self>
    where
        P: Fn(&E) -> bool + Send + Sync + 'static,
    {
        Self::with_classifier(policy, move |error| {
            if predicate(error) {
                RetryDecision::Retry
            } else {
                RetryDecision::Stop
            }
        })
    }

    /// Route every attempt through `breaker`
    ///
    /// Only a weak handle is kept; once the breaker is dropped attempts run
    /// unprotected.
    #[must_use]
    pub fn with_breaker(mut self, breaker: &Arc<CircuitBreaker>) -> Self {
        self.breaker = Some(Arc::downgrade(breaker));
        self
    }

    #[must_use]
    pub fn with_listener(mut self, listener: Arc<dyn RetryListener<E>>) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Stop retrying once `token` is cancelled
    ///
    /// The first attempt always runs and a running attempt is never
    /// interrupted; cancellation returns the most recent error.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}

impl<E: RecoverableError> RetryExecutor<E> {
    /// Execute an operation with retry
    #[instrument(skip(self, operation), fields(max_retries = self.policy.max_retries))]
    pub async fn execute<F, Fut, T>(&self, mut operation: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.run(&mut operation, |_: &T, _: u32| None).await
    }

    /// Execute an operation, treating results refused by `validate` as
    /// retryable failures
    ///
    /// If the final attempt is still refused the error is
    /// `E::from(ResultRejected)`.
    #[instrument(skip(self, operation, validate), fields(max_retries = self.policy.max_retries))]
    pub async fn execute_with_validation<F, Fut, T, V>(
        &self,
        mut operation: F,
        validate: V,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        V: Fn(&T) -> bool,
        E: From<ResultRejected>,
    {
        self.run(&mut operation, |value: &T, attempts: u32| {
            (!validate(value)).then(|| E::from(ResultRejected { attempts }))
        })
        .await
    }

    /// Execute independent operations concurrently, each with its own
    /// retry budget
    ///
    /// The output has one entry per operation, in input order.
    pub async fn execute_batch<F, Fut, T>(&self, operations: Vec<F>) -> Vec<Result<T, E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        debug!(count = operations.len(), "Executing retry batch");
        join_all(operations.into_iter().map(|operation| self.execute(operation))).await
    }

    async fn run<F, Fut, T, R>(&self, operation: &mut F, reject: R) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        R: Fn(&T, u32) -> Option<E>,
    {
        let max_attempts = self.policy.max_retries.saturating_add(1);
        let mut attempt = 0;

        loop {
            attempt += 1;

            let (error, forced) = match self.attempt(operation).await {
                Attempt::Succeeded(value) => match reject(&value, attempt) {
                    None => {
                        if attempt > 1 {
                            debug!(attempt, "Operation succeeded after retry");
                        }
                        return Ok(value);
                    }
                    Some(rejected) => (rejected, Some(RetryDecision::Retry)),
                },
                Attempt::Rejected(error) => {
                    debug!(attempt, "Circuit breaker rejected attempt, not retrying");
                    return Err(error);
                }
                Attempt::TimedOut(error) => {
                    let decision = if self.policy.retry_on_timeout {
                        RetryDecision::Retry
                    } else {
                        RetryDecision::Stop
                    };
                    (error, Some(decision))
                }
                Attempt::Failed(error) => (error, None),
            };

            let decision = forced.unwrap_or_else(|| (self.classifier)(&error));
            if decision == RetryDecision::Stop {
                debug!(attempt, error = %error, "Error is not retryable");
                return Err(error);
            }

            if attempt >= max_attempts {
                warn!(attempts = attempt, error = %error, "Retry attempts exhausted");
                return Err(error);
            }

            let delay = match decision {
                RetryDecision::RetryAfter(after) => after.min(self.policy.max_delay),
                _ => self.backoff_delay(attempt),
            };

            if let Some(listener) = &self.listener {
                listener.on_retry(&error, attempt, delay);
            }
            debug!(attempt, delay_ms = delay.as_millis() as u64, error = %error, "Retrying after delay");

            if !self.pause(delay).await {
                debug!(attempt, "Retry cancelled");
                return Err(error);
            }
        }
    }

    async fn attempt<F, Fut, T>(&self, operation: &mut F) -> Attempt<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let limit = self.policy.attempt_timeout;
        let run_once = move || async move {
            match limit {
                Some(limit) => match tokio::time::timeout(limit, operation()).await {
                    Ok(result) => result.map_err(AttemptError::Failed),
                    Err(_) => Err(AttemptError::TimedOut(limit)),
                },
                None => operation().await.map_err(AttemptError::Failed),
            }
        };

        let breaker = self.breaker.as_ref().and_then(Weak::upgrade);
        let outcome = match breaker {
            Some(breaker) => breaker.execute_guarded(run_once).await,
            None => run_once().await.map_err(BreakerError::Failed),
        };

        match outcome {
            Ok(value) => Attempt::Succeeded(value),
            Err(BreakerError::Open(open)) => Attempt::Rejected(E::from(open)),
            Err(BreakerError::Failed(AttemptError::TimedOut(timeout))) => {
                Attempt::TimedOut(E::from(TimeoutError { timeout }))
            }
            Err(BreakerError::Failed(AttemptError::Failed(error))) => Attempt::Failed(error),
        }
    }

    fn backoff_delay(&self, retry: u32) -> Duration {
        self.policy.backoff().jittered_delay(retry)
    }

    /// Sleep for `delay`; returns `false` if cancelled first
    async fn pause(&self, delay: Duration) -> bool {
        match &self.cancellation {
            Some(token) => {
                if token.is_cancelled() {
                    return false;
                }
                tokio::select! {
                    () = token.cancelled() => false,
                    () = tokio::time::sleep(delay) => !token.is_cancelled(),
                }
            }
            None => {
                tokio::time::sleep(delay).await;
                true
            }
        }
    }
}
