//! Administrative surface
//!
//! Plain async functions a host can expose over whatever transport it uses
//! (HTTP handlers, a CLI, an ops console). Nothing here does routing or
//! authorization.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::context::ResilienceContext;
use crate::error::ControlResult;
use crate::queue::{ProcessReport, QueueStats};
use crate::resilience::CircuitBreakerStats;
use crate::transaction::{IdempotencyRecord, TransactionManager};

/// Point-in-time view of the whole control plane
#[derive(Debug, Clone, Serialize)]
pub struct ControlPlaneStatus {
    pub breakers: Vec<CircuitBreakerStats>,
    pub queues: BTreeMap<String, QueueStats>,
    /// Idempotency keys with a stored result (empty without a manager)
    pub idempotency_keys: Vec<String>,
}

/// Operator actions over a [`ResilienceContext`] and, optionally, a
/// [`TransactionManager`]
#[derive(Debug, Clone)]
pub struct AdminApi {
    context: ResilienceContext,
    transactions: Option<Arc<TransactionManager>>,
}

impl AdminApi {
    pub fn new(context: ResilienceContext) -> Self {
        Self { context, transactions: None }
    }

    #[must_use]
    pub fn with_transactions(mut self, manager: Arc<TransactionManager>) -> Self {
        self.transactions = Some(manager);
        self
    }

    pub async fn list_breakers(&self) -> Vec<CircuitBreakerStats> {
        self.context.breakers().get_all_stats()
    }

    /// Reset one breaker; `false` when no breaker has that name
    #[instrument(skip(self))]
    pub async fn reset_breaker(&self, name: &str) -> bool {
        let reset = self.context.breakers().reset(name);
        if reset {
            info!(breaker = name, "Circuit breaker reset by operator");
        } else {
            warn!(breaker = name, "Reset requested for unknown circuit breaker");
        }
        reset
    }

    pub async fn reset_all_breakers(&self) {
        self.context.breakers().reset_all();
    }

    pub async fn queue_stats(&self) -> BTreeMap<String, QueueStats> {
        self.context.failed_operations().stats()
    }

    pub async fn process_queue(&self, name: &str) -> ProcessReport {
        self.context.failed_operations().process_queue(name).await
    }

    /// One replay pass over every known queue
    pub async fn process_all_queues(&self) -> BTreeMap<String, ProcessReport> {
        let queue = self.context.failed_operations();
        let mut reports = BTreeMap::new();
        for name in queue.queue_names() {
            let report = queue.process_queue(&name).await;
            reports.insert(name, report);
        }
        reports
    }

    pub async fn clear_queue(&self, name: &str) -> usize {
        self.context.failed_operations().clear_queue(name).await
    }

    pub async fn idempotency_keys(&self) -> ControlResult<Vec<String>> {
        match &self.transactions {
            Some(manager) => manager.idempotency_keys().await,
            None => Ok(Vec::new()),
        }
    }

    pub async fn idempotency_record(&self, key: &str) -> ControlResult<Option<IdempotencyRecord>> {
        match &self.transactions {
            Some(manager) => manager.idempotency().lookup(key).await,
            None => Ok(None),
        }
    }

    /// Forget a single stored result so the next execution runs again
    pub async fn forget_idempotency_key(&self, key: &str) -> ControlResult<bool> {
        match &self.transactions {
            Some(manager) => manager.idempotency().remove(key).await,
            None => Ok(false),
        }
    }

    #[instrument(skip(self))]
    pub async fn clear_idempotency(&self) -> ControlResult<usize> {
        match &self.transactions {
            Some(manager) => manager.clear_idempotency().await,
            None => Ok(0),
        }
    }

    pub async fn status(&self) -> ControlResult<ControlPlaneStatus> {
        Ok(ControlPlaneStatus {
            breakers: self.list_breakers().await,
            queues: self.queue_stats().await,
            idempotency_keys: self.idempotency_keys().await?,
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::*;
    use crate::error::ControlError;
    use crate::queue::replayable;
    use crate::resilience::CircuitState;
    use crate::store::MemoryStore;
    use crate::transaction::{MemoryTransactionSource, TransactionConfig, TxOptions};

    async fn trip(context: &ResilienceContext, name: &str) {
        let breaker = context.breaker(name).expect("breaker");
        for _ in 0..breaker.config().failure_threshold {
            let _ = breaker
                .execute(|| async { Err::<(), _>(ControlError::network(name, "refused")) })
                .await;
        }
    }

    #[tokio::test]
    async fn test_reset_breaker() {
        let context = ResilienceContext::new();
        let admin = AdminApi::new(context.clone());
        trip(&context, "stripe").await;
        assert_eq!(admin.list_breakers().await[0].state, CircuitState::Open);

        assert!(admin.reset_breaker("stripe").await);
        assert!(!admin.reset_breaker("unknown").await);
        assert_eq!(admin.list_breakers().await[0].state, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_process_all_queues() {
        let context = ResilienceContext::new();
        let admin = AdminApi::new(context.clone());
        let queue = context.failed_operations();
        queue
            .enqueue("emails", replayable("welcome", || async { Ok(()) }), None, Value::Null)
            .await
            .expect("enqueued");
        queue
            .enqueue(
                "webhooks",
                replayable("notify", || async { Err(ControlError::http("crm", 502, "bad gateway")) }),
                Some(1),
                Value::Null,
            )
            .await
            .expect("enqueued");

        let reports = admin.process_all_queues().await;

        assert_eq!(reports["emails"].succeeded, 1);
        assert_eq!(reports["webhooks"].dropped, 1);
        assert_eq!(admin.queue_stats().await["webhooks"].dropped, 1);
    }

    #[tokio::test]
    async fn test_idempotency_inspection() {
        let manager = TransactionManager::new(
            Arc::new(MemoryTransactionSource::new()),
            Arc::new(MemoryStore::new()),
            TransactionConfig::default(),
        )
        .expect("config");
        let manager = Arc::new(manager);
        let admin = AdminApi::new(ResilienceContext::new()).with_transactions(Arc::clone(&manager));

        manager
            .execute(TxOptions::new().idempotency_key("invoice-7"), |_tx| async {
                Ok(json!({"invoice": 7}))
            })
            .await
            .expect("executed");

        assert_eq!(admin.idempotency_keys().await.expect("keys"), ["invoice-7"]);
        let record = admin.idempotency_record("invoice-7").await.expect("lookup");
        assert_eq!(record.map(|r| r.result), Some(json!({"invoice": 7})));

        let status = admin.status().await.expect("status");
        assert_eq!(status.idempotency_keys.len(), 1);

        assert_eq!(admin.clear_idempotency().await.expect("clear"), 1);
        assert!(admin.idempotency_keys().await.expect("keys").is_empty());
    }

    #[tokio::test]
    async fn test_without_manager_reports_nothing() {
        let admin = AdminApi::new(ResilienceContext::new());
        assert!(admin.idempotency_keys().await.expect("keys").is_empty());
        assert_eq!(admin.clear_idempotency().await.expect("clear"), 0);
        assert!(!admin.forget_idempotency_key("k").await.expect("forget"));
    }
}
