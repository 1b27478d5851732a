//! Idempotent transaction manager
//!
//! Runs caller work inside a unit of work from a [`TransactionSource`]:
//! committed on success, rolled back on failure or timeout, retried with
//! backoff while the error is transient. With an idempotency key the first
//! successful result is stored and replayed to every later (or concurrent)
//! caller for that key without running the work again.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, instrument, warn};

use super::idempotency::{IdempotencyStore, DEFAULT_IDEMPOTENCY_TTL};
use super::unit::{Transaction, TransactionSource};
use crate::error::{ConfigError, ConfigResult, ControlError, ControlResult};
use crate::resilience::{RetryExecutor, RetryPolicy};
use crate::store::KeyValueStore;
use crate::utils::serde::duration_millis;

/// Work run by [`TransactionManager::execute_parallel`]
pub type ParallelWork<'a, T> =
    Box<dyn FnOnce(Arc<dyn Transaction>) -> BoxFuture<'a, ControlResult<T>> + Send + 'a>;

/// Step run by [`TransactionManager::execute_sequence`]; receives the
/// previous step's result (`Value::Null` for the first step)
pub type SequenceStep<'a> =
    Box<dyn FnOnce(Arc<dyn Transaction>, Value) -> BoxFuture<'a, ControlResult<Value>> + Send + 'a>;

/// Box a closure as a [`ParallelWork`]
pub fn parallel_work<'a, T, F, Fut>(work: F) -> ParallelWork<'a, T>
where
    F: FnOnce(Arc<dyn Transaction>) -> Fut + Send + 'a,
    Fut: Future<Output = ControlResult<T>> + Send + 'a,
{
    Box::new(move |tx| work(tx).boxed())
}

/// Box a closure as a [`SequenceStep`]
pub fn sequence_step<'a, F, Fut>(step: F) -> SequenceStep<'a>
where
    F: FnOnce(Arc<dyn Transaction>, Value) -> Fut + Send + 'a,
    Fut: Future<Output = ControlResult<Value>> + Send + 'a,
{
    Box::new(move |tx, previous| step(tx, previous).boxed())
}

/// Transaction manager configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransactionConfig {
    /// Default deadline for one attempt of the work
    #[serde(with = "duration_millis")]
    pub timeout: Duration,
    /// Lifetime of stored idempotent results
    #[serde(with = "duration_millis")]
    pub idempotency_ttl: Duration,
    /// Backoff between attempts; `retry.max_retries` is the default budget
    /// for calls that set no [`TxOptions::max_retries`]
    pub retry: RetryPolicy,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            idempotency_ttl: DEFAULT_IDEMPOTENCY_TTL,
            retry: RetryPolicy {
                initial_delay: Duration::from_millis(100),
                max_delay: Duration::from_secs(5),
                ..RetryPolicy::default()
            },
        }
    }
}

impl TransactionConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        if self.timeout.is_zero() {
            return Err(ConfigError::field("timeout", "must be greater than 0"));
        }
        if self.idempotency_ttl.is_zero() {
            return Err(ConfigError::field("idempotency_ttl", "must be greater than 0"));
        }
        self.retry.validate()
    }
}

/// Per-call options for [`TransactionManager::execute`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TxOptions {
    pub idempotency_key: Option<String>,
    /// Falls back to `retry.max_retries` of [`TransactionConfig`]
    pub max_retries: Option<u32>,
    /// Falls back to [`TransactionConfig::timeout`]
    pub timeout: Option<Duration>,
}

impl TxOptions {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn idempotency_key<S: Into<String>>(mut self, key: S) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    #[must_use]
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Executes work in rollback-scoped units with retries and idempotency
pub struct TransactionManager {
    source: Arc<dyn TransactionSource>,
    idempotency: IdempotencyStore,
    config: TransactionConfig,
}

impl std::fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionManager")
            .field("config", &self.config)
            .field("idempotency", &self.idempotency)
            .finish_non_exhaustive()
    }
}

impl TransactionManager {
    pub fn new(
        source: Arc<dyn TransactionSource>,
        store: Arc<dyn KeyValueStore>,
        config: TransactionConfig,
    ) -> ConfigResult<Self> {
        config.validate()?;
        let idempotency = IdempotencyStore::new(store, config.idempotency_ttl);
        Ok(Self { source, idempotency, config })
    }

    pub fn config(&self) -> &TransactionConfig {
        &self.config
    }

    pub fn idempotency(&self) -> &IdempotencyStore {
        &self.idempotency
    }

    /// Keys with a stored result
    pub async fn idempotency_keys(&self) -> ControlResult<Vec<String>> {
        self.idempotency.keys().await
    }

    /// Drop every stored result
    pub async fn clear_idempotency(&self) -> ControlResult<usize> {
        self.idempotency.clear().await
    }

    /// Run `work` in a unit of work with retry and optional idempotency
    ///
    /// Each attempt gets a fresh transaction. Failed executions store
    /// nothing, so a later call with the same key runs the work again. Once
    /// the unit has committed the call succeeds even if storing the record
    /// fails; that failure is logged at error level.
    #[instrument(skip(self, options, work), fields(idempotency_key = options.idempotency_key.as_deref()))]
    pub async fn execute<T, F, Fut>(&self, options: TxOptions, work: F) -> ControlResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: Fn(Arc<dyn Transaction>) -> Fut,
        Fut: Future<Output = ControlResult<T>>,
    {
        let Some(key) = options.idempotency_key.as_deref() else {
            return self.run_with_retry(&options, &work).await;
        };

        if let Some(cached) = self.cached_result(key).await? {
            return Ok(cached);
        }

        let _guard = self.idempotency.lock(key).await;

        // Another caller may have completed while we waited
        if let Some(cached) = self.cached_result(key).await? {
            return Ok(cached);
        }

        let value = self.run_with_retry(&options, &work).await?;

        // Committed: the call succeeds whether or not the record is stored
        let recorded = match serde_json::to_value(&value) {
            Ok(result) => self.idempotency.record(key, result).await.map(|_| ()),
            Err(encode_error) => Err(encode_error.into()),
        };
        if let Err(record_error) = recorded {
            error!(key, error = %record_error, "Committed result could not be recorded");
        }
        Ok(value)
    }

    /// Run independent works concurrently, each in its own unit of work
    ///
    /// All units commit only if every work succeeded; otherwise every unit
    /// is rolled back, last opened first, and the first error (in input
    /// order) is returned.
    /// Without two-phase commit a commit failure part-way leaves earlier
    /// units committed; the remaining ones are rolled back.
    #[instrument(skip(self, works), fields(count = works.len()))]
    pub async fn execute_parallel<T>(&self, works: Vec<ParallelWork<'_, T>>) -> ControlResult<Vec<T>> {
        let mut transactions = Vec::with_capacity(works.len());
        for _ in 0..works.len() {
            match self.source.begin().await {
                Ok(tx) => transactions.push(tx),
                Err(error) => {
                    rollback_all(&transactions).await;
                    return Err(error);
                }
            }
        }

        let timeout = self.config.timeout;
        let results = join_all(works.into_iter().zip(&transactions).map(|(work, tx)| {
            let running = work(Arc::clone(tx));
            async move {
                tokio::time::timeout(timeout, running)
                    .await
                    .unwrap_or_else(|_| Err(ControlError::timeout("parallel work", timeout)))
            }
        }))
        .await;

        let mut values = Vec::with_capacity(results.len());
        let mut first_error = None;
        for (index, result) in results.into_iter().enumerate() {
            match result {
                Ok(value) => values.push(value),
                Err(error) => {
                    warn!(index, error = %error, "Parallel work failed");
                    first_error.get_or_insert(error);
                }
            }
        }

        if let Some(error) = first_error {
            rollback_all(&transactions).await;
            return Err(error);
        }

        for (index, tx) in transactions.iter().enumerate() {
            if let Err(commit_error) = tx.commit().await {
                error!(
                    index,
                    committed = index,
                    error = %commit_error,
                    "Commit failed part-way through parallel execution"
                );
                rollback_all(&transactions[index..]).await;
                return Err(commit_error);
            }
        }

        debug!(count = transactions.len(), "Parallel units committed");
        Ok(values)
    }

    /// Run steps in order inside one unit of work, threading each step's
    /// result into the next
    ///
    /// The first failure rolls the whole unit back.
    #[instrument(skip(self, steps), fields(count = steps.len()))]
    pub async fn execute_sequence(&self, steps: Vec<SequenceStep<'_>>) -> ControlResult<Value> {
        let tx = self.source.begin().await?;
        let timeout = self.config.timeout;

        let run = async {
            let mut previous = Value::Null;
            for (index, step) in steps.into_iter().enumerate() {
                previous = step(Arc::clone(&tx), previous).await.map_err(|error| {
                    warn!(step = index, error = %error, "Sequence step failed");
                    error
                })?;
            }
            Ok::<_, ControlError>(previous)
        };

        let outcome = tokio::time::timeout(timeout, run)
            .await
            .unwrap_or_else(|_| Err(ControlError::timeout("sequence", timeout)));
        self.finish(&tx, outcome).await
    }

    /// Insert `records` in chunks of `chunk_size` inside one unit of work
    ///
    /// Returns the number of records inserted. The whole batch shares the
    /// configured timeout and rolls back when it elapses.
    #[instrument(skip(self, records), fields(total = records.len()))]
    pub async fn batch_insert(
        &self,
        entity: &str,
        records: Vec<Value>,
        chunk_size: usize,
    ) -> ControlResult<u64> {
        if chunk_size == 0 {
            return Err(ConfigError::field("chunk_size", "must be greater than 0").into());
        }
        if records.is_empty() {
            return Ok(0);
        }

        let tx = self.source.begin().await?;
        let run = async {
            let mut inserted = 0;
            for chunk in records.chunks(chunk_size) {
                inserted += tx.insert_many(entity, chunk.to_vec()).await?;
            }
            Ok::<_, ControlError>(inserted)
        };

        let timeout = self.config.timeout;
        let outcome = tokio::time::timeout(timeout, run)
            .await
            .unwrap_or_else(|_| Err(ControlError::timeout("batch insert", timeout)));
        let inserted = self.finish(&tx, outcome).await?;
        info!(entity, inserted, "Batch insert committed");
        Ok(inserted)
    }

    async fn cached_result<T: DeserializeOwned>(&self, key: &str) -> ControlResult<Option<T>> {
        match self.idempotency.lookup(key).await? {
            Some(record) => {
                debug!(key, "Returning stored idempotent result");
                Ok(Some(serde_json::from_value(record.result)?))
            }
            None => Ok(None),
        }
    }

    async fn run_with_retry<T, F, Fut>(&self, options: &TxOptions, work: &F) -> ControlResult<T>
    where
        F: Fn(Arc<dyn Transaction>) -> Fut,
        Fut: Future<Output = ControlResult<T>>,
    {
        let policy = RetryPolicy {
            max_retries: options.max_retries.unwrap_or(self.config.retry.max_retries),
            ..self.config.retry.clone()
        };
        let timeout = options.timeout.unwrap_or(self.config.timeout);
        let executor = RetryExecutor::<ControlError>::new(policy)?;

        executor.execute(|| self.run_once(timeout, work)).await
    }

    async fn run_once<T, F, Fut>(&self, timeout: Duration, work: &F) -> ControlResult<T>
    where
        F: Fn(Arc<dyn Transaction>) -> Fut,
        Fut: Future<Output = ControlResult<T>>,
    {
        let tx = self.source.begin().await?;
        let outcome = tokio::time::timeout(timeout, work(Arc::clone(&tx)))
            .await
            .unwrap_or_else(|_| Err(ControlError::timeout("transaction", timeout)));
        self.finish(&tx, outcome).await
    }

    /// Commit on success, roll back on failure
    async fn finish<T>(&self, tx: &Arc<dyn Transaction>, outcome: ControlResult<T>) -> ControlResult<T> {
        match outcome {
            Ok(value) => match tx.commit().await {
                Ok(()) => Ok(value),
                Err(commit_error) => {
                    warn!(tx = tx.id(), error = %commit_error, "Commit failed, rolling back");
                    rollback_logged(tx.as_ref()).await;
                    Err(commit_error)
                }
            },
            Err(error) => {
                debug!(tx = tx.id(), error = %error, "Work failed, rolling back");
                rollback_logged(tx.as_ref()).await;
                Err(error)
            }
        }
    }
}

async fn rollback_logged(tx: &dyn Transaction) {
    if let Err(rollback_error) = tx.rollback().await {
        error!(tx = tx.id(), error = %rollback_error, "Rollback failed");
    }
}

/// Roll back in reverse order of opening
async fn rollback_all(transactions: &[Arc<dyn Transaction>]) {
    for tx in transactions.iter().rev() {
        rollback_logged(tx.as_ref()).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use serde_json::json;

    use super::*;
    use crate::store::MemoryStore;
    use crate::testing::FlakyStore;
    use crate::transaction::MemoryTransactionSource;

    fn manager() -> (TransactionManager, MemoryTransactionSource) {
        let source = MemoryTransactionSource::new();
        let config = TransactionConfig {
            retry: RetryPolicy {
                initial_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(100),
                jitter_ratio: 0.0,
                ..RetryPolicy::default()
            },
            ..TransactionConfig::default()
        };
        let manager = TransactionManager::new(
            Arc::new(source.clone()),
            Arc::new(MemoryStore::new()),
            config,
        )
        .expect("valid config");
        (manager, source)
    }

    #[tokio::test]
    async fn test_commit_on_success() {
        let (manager, source) = manager();

        let inserted = manager
            .execute(TxOptions::new(), |tx| async move {
                tx.insert_many("orders", vec![json!({"id": 1})]).await
            })
            .await
            .expect("committed");

        assert_eq!(inserted, 1);
        assert_eq!(source.count("orders"), 1);
        assert_eq!(source.stats().committed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_failure_with_fresh_unit() {
        let (manager, source) = manager();
        let calls = AtomicU32::new(0);

        let result = manager
            .execute(TxOptions::new().max_retries(2), |tx| {
                let call = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    tx.insert_many("orders", vec![json!({"call": call})]).await?;
                    if call == 0 {
                        return Err(ControlError::network("postgres", "connection reset"));
                    }
                    Ok(call)
                }
            })
            .await;

        assert_eq!(result.expect("second attempt"), 1);
        assert_eq!(source.records("orders"), [json!({"call": 1})]);
        let stats = source.stats();
        assert_eq!((stats.begun, stats.committed, stats.rolled_back), (2, 1, 1));
    }

    #[tokio::test]
    async fn test_non_retryable_failure_rolls_back_once() {
        let (manager, source) = manager();

        let result: ControlResult<()> = manager
            .execute(TxOptions::new(), |tx| async move {
                tx.insert_many("orders", vec![json!({})]).await?;
                Err(ControlError::validation("total", "negative"))
            })
            .await;

        assert!(matches!(result, Err(ControlError::Validation { .. })));
        assert_eq!(source.stats().begun, 1);
        assert_eq!(source.count("orders"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_rolls_back() {
        let (manager, source) = manager();

        let result: ControlResult<()> = manager
            .execute(
                TxOptions::new().max_retries(0).timeout(Duration::from_millis(50)),
                |_tx| async {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    Ok(())
                },
            )
            .await;

        assert!(matches!(result, Err(ControlError::Timeout { .. })));
        assert_eq!(source.stats().rolled_back, 1);
    }

    #[tokio::test]
    async fn test_idempotent_replay_skips_work() {
        let (manager, source) = manager();
        let calls = AtomicU32::new(0);
        let work = |tx: Arc<dyn Transaction>| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                tx.insert_many("charges", vec![json!({"amount": 500})]).await?;
                Ok(json!({"charge_id": "ch_42"}))
            }
        };

        let first = manager
            .execute(TxOptions::new().idempotency_key("charge:42"), work)
            .await
            .expect("first");
        let second = manager
            .execute(TxOptions::new().idempotency_key("charge:42"), work)
            .await
            .expect("replayed");

        assert_eq!(first, second);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(source.count("charges"), 1);
        assert_eq!(manager.idempotency_keys().await.expect("keys"), ["charge:42"]);
    }

    #[tokio::test]
    async fn test_failed_execution_is_not_cached() {
        let (manager, _source) = manager();
        let options = TxOptions::new().idempotency_key("refund:7").max_retries(0);

        let failed: ControlResult<u32> = manager
            .execute(options.clone(), |_tx| async { Err(ControlError::validation("amount", "zero")) })
            .await;
        assert!(failed.is_err());

        let retried = manager.execute(options, |_tx| async { Ok(7u32) }).await;
        assert_eq!(retried.expect("runs again"), 7);
    }

    #[tokio::test]
    async fn test_parallel_commits_all_on_success() {
        let (manager, source) = manager();
        let works: Vec<ParallelWork<'_, u64>> = (0..3)
            .map(|shard| {
                parallel_work(move |tx| async move {
                    tx.insert_many("events", vec![json!({"shard": shard})]).await
                })
            })
            .collect();

        let results = manager.execute_parallel(works).await.expect("all commit");
        assert_eq!(results, [1, 1, 1]);
        assert_eq!(source.count("events"), 3);
        assert_eq!(source.stats().committed, 3);
    }

    #[tokio::test]
    async fn test_parallel_rolls_back_all_on_failure() {
        let (manager, source) = manager();
        let works: Vec<ParallelWork<'_, u64>> = vec![
            parallel_work(|tx| async move { tx.insert_many("events", vec![json!(1)]).await }),
            parallel_work(|_tx| async { Err(ControlError::validation("event", "bad")) }),
            parallel_work(|tx| async move { tx.insert_many("events", vec![json!(3)]).await }),
        ];

        let result = manager.execute_parallel(works).await;
        assert!(matches!(result, Err(ControlError::Validation { .. })));
        assert_eq!(source.count("events"), 0);
        assert_eq!(source.stats().rolled_back, 3);
    }

    #[tokio::test]
    async fn test_sequence_threads_results() {
        let (manager, source) = manager();
        let steps = vec![
            sequence_step(|tx, previous| async move {
                assert_eq!(previous, Value::Null);
                tx.insert_many("orders", vec![json!({"id": 1})]).await?;
                Ok(json!({"order_id": 1}))
            }),
            sequence_step(|_tx, previous| async move {
                Ok(json!({"order_id": previous["order_id"], "invoice": "INV-1"}))
            }),
        ];

        let result = manager.execute_sequence(steps).await.expect("sequence");
        assert_eq!(result, json!({"order_id": 1, "invoice": "INV-1"}));
        assert_eq!(source.count("orders"), 1);
    }

    #[tokio::test]
    async fn test_sequence_failure_rolls_back_earlier_steps() {
        let (manager, source) = manager();
        let steps = vec![
            sequence_step(|tx, _| async move {
                tx.insert_many("orders", vec![json!({"id": 1})]).await?;
                Ok(Value::Null)
            }),
            sequence_step(|_tx, _| async { Err(ControlError::http("tax", 400, "bad region")) }),
        ];

        assert!(manager.execute_sequence(steps).await.is_err());
        assert_eq!(source.count("orders"), 0);
        assert_eq!(source.stats().rolled_back, 1);
    }

    #[tokio::test]
    async fn test_batch_insert_chunks() {
        let (manager, source) = manager();
        let records: Vec<_> = (0..10).map(|id| json!({"id": id})).collect();

        let inserted = manager.batch_insert("products", records, 3).await.expect("inserted");
        assert_eq!(inserted, 10);
        assert_eq!(source.count("products"), 10);
        assert_eq!(source.stats().begun, 1);
    }

    #[tokio::test]
    async fn test_batch_insert_rejects_zero_chunk() {
        let (manager, _source) = manager();
        let result = manager.batch_insert("products", vec![json!(1)], 0).await;
        assert!(matches!(result, Err(ControlError::Config(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_insert_times_out_and_rolls_back() {
        let source = MemoryTransactionSource::new();
        let config = TransactionConfig { timeout: Duration::from_millis(50), ..TransactionConfig::default() };
        let manager =
            TransactionManager::new(Arc::new(source.clone()), Arc::new(MemoryStore::new()), config)
                .expect("valid config");
        source.delay_inserts(Duration::from_secs(1));

        let result = manager.batch_insert("products", vec![json!(1), json!(2)], 1).await;

        assert!(matches!(result, Err(ControlError::Timeout { .. })));
        assert_eq!(source.count("products"), 0);
        assert_eq!(source.stats().rolled_back, 1);
    }

    /// Validates that a committed result is not re-run when recording fails.
    ///
    /// Assertions:
    /// - The first call succeeds although the record write fails.
    /// - The work committed exactly once.
    #[tokio::test]
    async fn test_record_failure_after_commit_still_succeeds() {
        let source = MemoryTransactionSource::new();
        let store = FlakyStore::new();
        let manager = TransactionManager::new(
            Arc::new(source.clone()),
            store.clone(),
            TransactionConfig::default(),
        )
        .expect("valid config");
        store.fail_next_sets(1);
        let runs = AtomicU32::new(0);

        let charged = manager
            .execute(TxOptions::new().idempotency_key("charge-1"), |tx| {
                runs.fetch_add(1, Ordering::SeqCst);
                async move {
                    tx.insert_many("charges", vec![json!({"amount": 1200})]).await?;
                    Ok(json!("ch"))
                }
            })
            .await;

        assert_eq!(charged.expect("committed result returned"), json!("ch"));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(source.stats().committed, 1);
        assert!(manager.idempotency_keys().await.expect("keys").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_budget_defaults_to_config() {
        let source = MemoryTransactionSource::new();
        let config = TransactionConfig {
            retry: RetryPolicy { max_retries: 1, jitter_ratio: 0.0, ..RetryPolicy::default() },
            ..TransactionConfig::default()
        };
        let manager =
            TransactionManager::new(Arc::new(source.clone()), Arc::new(MemoryStore::new()), config)
                .expect("valid config");

        let result: ControlResult<()> = manager
            .execute(TxOptions::new(), |_tx| async { Err(ControlError::network("db", "reset")) })
            .await;

        assert!(result.is_err());
        assert_eq!(source.stats().begun, 2);
    }

    #[tokio::test]
    async fn test_idempotency_without_key_listing() {
        struct PointStore(MemoryStore);

        #[async_trait::async_trait]
        impl KeyValueStore for PointStore {
            async fn get(&self, key: &str) -> ControlResult<Option<Value>> {
                self.0.get(key).await
            }
            async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> ControlResult<()> {
                self.0.set(key, value, ttl).await
            }
            async fn delete(&self, key: &str) -> ControlResult<bool> {
                self.0.delete(key).await
            }
        }

        let manager = TransactionManager::new(
            Arc::new(MemoryTransactionSource::new()),
            Arc::new(PointStore(MemoryStore::new())),
            TransactionConfig::default(),
        )
        .expect("valid config");
        let options = TxOptions::new().idempotency_key("order-5");

        let first = manager.execute(options.clone(), |_tx| async { Ok(5u32) }).await;
        let replay = manager.execute(options, |_tx| async { Ok(6u32) }).await;

        assert_eq!((first.expect("first"), replay.expect("replay")), (5, 5));
        assert!(matches!(manager.idempotency_keys().await, Err(ControlError::Store { .. })));
    }
}
