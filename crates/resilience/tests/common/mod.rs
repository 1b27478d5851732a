//! Shared fixtures for integration tests

#![allow(dead_code)]

use std::sync::{Arc, Once};

use accora_resilience::transaction::MemoryTransactionSource;
use accora_resilience::{MemoryStore, TransactionConfig, TransactionManager};

static TRACING: Once = Once::new();

/// Route `tracing` output through the test harness (`RUST_LOG` aware)
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Manager over in-memory collaborators, plus the source for assertions
pub fn memory_manager(config: TransactionConfig) -> (Arc<TransactionManager>, MemoryTransactionSource) {
    let source = MemoryTransactionSource::new();
    let manager = TransactionManager::new(
        Arc::new(source.clone()),
        Arc::new(MemoryStore::new()),
        config,
    )
    .expect("valid transaction config");
    (Arc::new(manager), source)
}
