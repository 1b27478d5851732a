//! Fallback orchestration
//!
//! Two shapes are provided:
//!
//! - [`FallbackOrchestrator::with_fallback`] runs a primary operation
//!   (optionally under a [`RetryExecutor`]) and on failure tries, in order,
//!   an unexpired cached result, a fallback operation and a static value.
//! - [`FallbackChain`] and [`graceful_degrade`] evaluate an ordered list of
//!   sources and return the first success or the last error.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::{debug, info, instrument, warn};

use super::cache::ResponseCache;
use super::retry::RetryExecutor;
use crate::error::{ControlError, RecoverableError};

/// Default time-to-live for cached primary results
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(300);

type FallbackFn<'a, T, E> = Box<dyn FnOnce() -> BoxFuture<'a, Result<T, E>> + Send + 'a>;

/// Raised when the primary and every fallback source failed
#[derive(Debug)]
pub struct AllSourcesFailedError<E> {
    /// Number of operations that ran (primary plus fallback function)
    pub attempted: usize,
    /// Error of the last source that ran
    pub last_error: E,
}

impl<E> AllSourcesFailedError<E> {
    pub fn into_last_error(self) -> E {
        self.last_error
    }
}

impl<E: fmt::Display> fmt::Display for AllSourcesFailedError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "All {} fallback sources failed; last error: {}",
            self.attempted, self.last_error
        )
    }
}

impl<E> std::error::Error for AllSourcesFailedError<E>
where
    E: std::error::Error + 'static,
{
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.last_error)
    }
}

impl From<AllSourcesFailedError<ControlError>> for ControlError {
    fn from(err: AllSourcesFailedError<ControlError>) -> Self {
        Self::AllSourcesFailed { attempted: err.attempted, source: Box::new(err.last_error) }
    }
}

/// Per-call fallback configuration
pub struct FallbackOptions<'a, T, E> {
    fallback_fn: Option<FallbackFn<'a, T, E>>,
    fallback_value: Option<T>,
    cache_key: Option<String>,
    cache_ttl: Option<Duration>,
}

impl<T, E> Default for FallbackOptions<'_, T, E> {
    fn default() -> Self {
        Self { fallback_fn: None, fallback_value: None, cache_key: None, cache_ttl: None }
    }
}

impl<T: fmt::Debug, E> fmt::Debug for FallbackOptions<'_, T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FallbackOptions")
            .field("has_fallback_fn", &self.fallback_fn.is_some())
            .field("fallback_value", &self.fallback_value)
            .field("cache_key", &self.cache_key)
            .field("cache_ttl", &self.cache_ttl)
            .finish()
    }
}

impl<'a, T, E> FallbackOptions<'a, T, E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Operation tried when the primary fails and no cached result exists
    #[must_use]
    pub fn fallback_fn<F, Fut>(mut self, fallback: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'a,
        Fut: Future<Output = Result<T, E>> + Send + 'a,
    {
        self.fallback_fn = Some(Box::new(move || fallback().boxed()));
        self
    }

    /// Static value returned when everything else failed
    #[must_use]
    pub fn fallback_value(mut self, value: T) -> Self {
        self.fallback_value = Some(value);
        self
    }

    /// Cache key for storing and serving the primary's result
    #[must_use]
    pub fn cache_key<S: Into<String>>(mut self, key: S) -> Self {
        self.cache_key = Some(key.into());
        self
    }

    #[must_use]
    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = Some(ttl);
        self
    }
}

/// Runs a primary operation with cache, function and value fallbacks
pub struct FallbackOrchestrator<T: Clone + Send + Sync + 'static, E> {
    retry: Option<RetryExecutor<E>>,
    cache: Option<Arc<ResponseCache<T>>>,
    default_ttl: Duration,
}

impl<T: Clone + Send + Sync + 'static, E> fmt::Debug for FallbackOrchestrator<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FallbackOrchestrator")
            .field("retry", &self.retry)
            .field("caching", &self.cache.is_some())
            .field("default_ttl", &self.default_ttl)
            .finish()
    }
}

impl<T: Clone + Send + Sync + 'static, E> Default for FallbackOrchestrator<T, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + Sync + 'static, E> FallbackOrchestrator<T, E> {
    /// Orchestrator without retry or caching
    pub fn new() -> Self {
        Self { retry: None, cache: None, default_ttl: DEFAULT_CACHE_TTL }
    }

    /// Run the primary through `executor`
    #[must_use]
    pub fn with_retry(mut self, executor: RetryExecutor<E>) -> Self {
        self.retry = Some(executor);
        self
    }

    /// Store primary results in `cache` (shareable between orchestrators)
    #[must_use]
    pub fn with_cache(mut self, cache: Arc<ResponseCache<T>>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// TTL used when a call does not set `cache_ttl`
    #[must_use]
    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    pub fn cache(&self) -> Option<&Arc<ResponseCache<T>>> {
        self.cache.as_ref()
    }
}

impl<T: Clone + Send + Sync + 'static, E: RecoverableError> FallbackOrchestrator<T, E> {
    /// Execute `primary`, falling back per `options` on failure
    ///
    /// Fallback order: cached result, fallback function, fallback value.
    #[instrument(skip_all, fields(cache_key = options.cache_key.as_deref()))]
    pub async fn with_fallback<F, Fut>(
        &self,
        mut primary: F,
        options: FallbackOptions<'_, T, E>,
    ) -> Result<T, AllSourcesFailedError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let primary_result = match &self.retry {
            Some(executor) => executor.execute(&mut primary).await,
            None => primary().await,
        };

        let cache_slot = self.cache.as_ref().zip(options.cache_key.as_deref());

        let mut last_error = match primary_result {
            Ok(value) => {
                if let Some((cache, key)) = cache_slot {
                    let ttl = options.cache_ttl.unwrap_or(self.default_ttl);
                    cache.insert(key, value.clone(), ttl);
                }
                return Ok(value);
            }
            Err(error) => error,
        };
        let mut attempted = 1;
        warn!(error = %last_error, "Primary operation failed, trying fallbacks");

        if let Some((cache, key)) = cache_slot {
            if let Some(cached) = cache.get(key) {
                info!(key, "Serving cached result");
                return Ok(cached);
            }
            debug!(key, "No cached result available");
        }

        if let Some(fallback) = options.fallback_fn {
            attempted += 1;
            match fallback().await {
                Ok(value) => {
                    info!("Fallback operation succeeded");
                    return Ok(value);
                }
                Err(error) => {
                    warn!(error = %error, "Fallback operation failed");
                    last_error = error;
                }
            }
        }

        if let Some(value) = options.fallback_value {
            info!("Serving static fallback value");
            return Ok(value);
        }

        Err(AllSourcesFailedError { attempted, last_error })
    }
}

enum Source<'a, T, E> {
    Operation(FallbackFn<'a, T, E>),
    Value(T),
}

impl<T, E> Source<'_, T, E> {
    async fn run(self) -> Result<T, E> {
        match self {
            Source::Operation(operation) => operation().await,
            Source::Value(value) => Ok(value),
        }
    }
}

/// Ordered list of alternative sources
///
/// ```rust,no_run
/// use accora_resilience::error::ControlError;
/// use accora_resilience::resilience::FallbackChain;
///
/// # async fn example() -> Result<(), ControlError> {
/// let price = FallbackChain::new(|| async { Err(ControlError::network("pricing", "down")) })
///     .then(|| async { Ok(1099_u64) })
///     .then_value(999)
///     .run()
///     .await?;
/// # Ok(())
/// # }
/// ```
pub struct FallbackChain<'a, T, E> {
    first: Source<'a, T, E>,
    rest: Vec<Source<'a, T, E>>,
}

impl<T, E> fmt::Debug for FallbackChain<'_, T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FallbackChain").field("sources", &(self.rest.len() + 1)).finish()
    }
}

impl<'a, T, E> FallbackChain<'a, T, E> {
    /// Start a chain with its primary source
    pub fn new<F, Fut>(primary: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'a,
        Fut: Future<Output = Result<T, E>> + Send + 'a,
    {
        Self { first: Source::Operation(Box::new(move || primary().boxed())), rest: Vec::new() }
    }

    /// Append an alternative source
    #[must_use]
    pub fn then<F, Fut>(mut self, source: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'a,
        Fut: Future<Output = Result<T, E>> + Send + 'a,
    {
        self.rest.push(Source::Operation(Box::new(move || source().boxed())));
        self
    }

    /// Append a source that always succeeds with `value`
    ///
    /// Sources after a value are never reached.
    #[must_use]
    pub fn then_value(mut self, value: T) -> Self {
        self.rest.push(Source::Value(value));
        self
    }

    pub fn len(&self) -> usize {
        self.rest.len() + 1
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    /// Evaluate sources in order; first success wins, otherwise the last
    /// error is returned
    pub async fn run(self) -> Result<T, E> {
        let mut result = self.first.run().await;
        for (position, source) in self.rest.into_iter().enumerate() {
            if result.is_ok() {
                break;
            }
            debug!(source = position + 2, "Falling back to next source");
            result = source.run().await;
        }
        result
    }
}

/// Try `first`, then each of `alternatives` in order
///
/// Returns the first success or the last error. The futures are lazy, so an
/// alternative does no work unless every earlier source failed.
pub async fn graceful_degrade<T, E, Fut, I>(first: Fut, alternatives: I) -> Result<T, E>
where
    Fut: Future<Output = Result<T, E>>,
    I: IntoIterator<Item = Fut>,
{
    let mut result = first.await;
    for alternative in alternatives {
        if result.is_ok() {
            break;
        }
        result = alternative.await;
    }
    result
}
