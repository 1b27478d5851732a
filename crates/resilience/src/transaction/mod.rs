//! Transactional recovery: idempotent units of work and sagas
//!
//! Unlike the generic [`resilience`](crate::resilience) layer, everything
//! here works with the concrete [`ControlError`](crate::error::ControlError)
//! because results are persisted and replayed.

pub mod idempotency;
pub mod manager;
pub mod saga;
pub mod unit;

pub use idempotency::{IdempotencyRecord, IdempotencyStore, KeyGuard, DEFAULT_IDEMPOTENCY_TTL};
pub use manager::{
    parallel_work, sequence_step, ParallelWork, SequenceStep, TransactionConfig,
    TransactionManager, TxOptions,
};
pub use saga::{CompensationFailure, SagaContext, SagaCoordinator, SagaOutcome, SagaStep};
pub use unit::{
    MemoryTransaction, MemoryTransactionSource, Transaction, TransactionSource, TransactionStats,
};
