//! Rollback-scoped units of work
//!
//! [`TransactionSource`] is the port the transaction manager opens units of
//! work through. Database-backed hosts wrap their driver's transaction type;
//! [`MemoryTransactionSource`] stages writes in memory and applies them on
//! commit.

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::error::{ControlError, ControlResult};

/// A unit of work that is either committed or rolled back as a whole
#[async_trait]
pub trait Transaction: Send + Sync {
    /// Identifier used in logs
    fn id(&self) -> &str;

    /// Insert records into `entity`, returning the number inserted
    async fn insert_many(&self, entity: &str, records: Vec<Value>) -> ControlResult<u64>;

    async fn commit(&self) -> ControlResult<()>;

    async fn rollback(&self) -> ControlResult<()>;

    /// Concrete transaction, for work that needs driver-specific calls
    fn as_any(&self) -> &dyn Any;
}

/// Opens units of work
#[async_trait]
pub trait TransactionSource: Send + Sync {
    async fn begin(&self) -> ControlResult<Arc<dyn Transaction>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxState {
    Active,
    Committed,
    RolledBack,
}

/// Lifetime counters of a [`MemoryTransactionSource`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TransactionStats {
    pub begun: u64,
    pub committed: u64,
    pub rolled_back: u64,
}

#[derive(Debug, Default)]
struct Counters {
    begun: AtomicU64,
    committed: AtomicU64,
    rolled_back: AtomicU64,
}

type Tables = Arc<Mutex<HashMap<String, Vec<Value>>>>;

/// In-memory transaction source with staged writes
#[derive(Debug, Clone, Default)]
pub struct MemoryTransactionSource {
    tables: Tables,
    counters: Arc<Counters>,
    fail_commits: Arc<AtomicBool>,
    insert_latency: Arc<Mutex<Duration>>,
}

impl MemoryTransactionSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Committed records of `entity`
    pub fn records(&self, entity: &str) -> Vec<Value> {
        self.tables.lock().get(entity).cloned().unwrap_or_default()
    }

    pub fn count(&self, entity: &str) -> usize {
        self.tables.lock().get(entity).map_or(0, Vec::len)
    }

    pub fn stats(&self) -> TransactionStats {
        TransactionStats {
            begun: self.counters.begun.load(Ordering::SeqCst),
            committed: self.counters.committed.load(Ordering::SeqCst),
            rolled_back: self.counters.rolled_back.load(Ordering::SeqCst),
        }
    }

    /// Make every subsequent commit fail (simulates a lost connection)
    pub fn fail_commits(&self, fail: bool) {
        self.fail_commits.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent insert wait `latency` (simulates a slow store)
    pub fn delay_inserts(&self, latency: Duration) {
        *self.insert_latency.lock() = latency;
    }
}

#[async_trait]
impl TransactionSource for MemoryTransactionSource {
    async fn begin(&self) -> ControlResult<Arc<dyn Transaction>> {
        self.counters.begun.fetch_add(1, Ordering::SeqCst);
        let tx = MemoryTransaction {
            id: Uuid::new_v4().to_string(),
            staged: Mutex::new(Vec::new()),
            state: Mutex::new(TxState::Active),
            tables: Arc::clone(&self.tables),
            counters: Arc::clone(&self.counters),
            fail_commits: Arc::clone(&self.fail_commits),
            insert_latency: Arc::clone(&self.insert_latency),
        };
        trace!(tx = %tx.id, "Transaction begun");
        Ok(Arc::new(tx))
    }
}

/// Transaction opened by [`MemoryTransactionSource`]
#[derive(Debug)]
pub struct MemoryTransaction {
    id: String,
    staged: Mutex<Vec<(String, Value)>>,
    state: Mutex<TxState>,
    tables: Tables,
    counters: Arc<Counters>,
    fail_commits: Arc<AtomicBool>,
    insert_latency: Arc<Mutex<Duration>>,
}

impl MemoryTransaction {
    /// Number of records written but not yet committed
    pub fn staged_len(&self) -> usize {
        self.staged.lock().len()
    }

    fn ensure_active(&self, operation: &str) -> ControlResult<()> {
        match *self.state.lock() {
            TxState::Active => Ok(()),
            finished => Err(ControlError::store(
                operation,
                format!("transaction {} already {:?}", self.id, finished),
            )),
        }
    }
}

#[async_trait]
impl Transaction for MemoryTransaction {
    fn id(&self) -> &str {
        &self.id
    }

    async fn insert_many(&self, entity: &str, records: Vec<Value>) -> ControlResult<u64> {
        self.ensure_active("insert_many")?;
        let latency = *self.insert_latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        let inserted = records.len() as u64;
        self.staged.lock().extend(records.into_iter().map(|record| (entity.to_string(), record)));
        Ok(inserted)
    }

    async fn commit(&self) -> ControlResult<()> {
        let mut state = self.state.lock();
        if *state != TxState::Active {
            return Err(ControlError::store(
                "commit",
                format!("transaction {} already {:?}", self.id, *state),
            ));
        }
        if self.fail_commits.load(Ordering::SeqCst) {
            return Err(ControlError::store("commit", "connection lost during commit"));
        }

        let staged = std::mem::take(&mut *self.staged.lock());
        let mut tables = self.tables.lock();
        for (entity, record) in staged {
            tables.entry(entity).or_default().push(record);
        }
        *state = TxState::Committed;
        self.counters.committed.fetch_add(1, Ordering::SeqCst);
        debug!(tx = %self.id, "Transaction committed");
        Ok(())
    }

    async fn rollback(&self) -> ControlResult<()> {
        let mut state = self.state.lock();
        if *state != TxState::Active {
            trace!(tx = %self.id, "Rollback of finished transaction ignored");
            return Ok(());
        }
        self.staged.lock().clear();
        *state = TxState::RolledBack;
        self.counters.rolled_back.fetch_add(1, Ordering::SeqCst);
        debug!(tx = %self.id, "Transaction rolled back");
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
