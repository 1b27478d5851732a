use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{ConfigError, ConfigResult, ControlResult};

/// An operation that failed and can be attempted again later
#[async_trait]
pub trait ReplayableOperation: Send + Sync {
    /// Short label for logs and journal entries (e.g. `"send_receipt"`)
    fn kind(&self) -> &str;

    async fn replay(&self) -> ControlResult<()>;
}

/// Closure-backed [`ReplayableOperation`]
pub struct FnOperation<F> {
    kind: String,
    operation: F,
}

impl<F> fmt::Debug for FnOperation<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnOperation").field("kind", &self.kind).finish_non_exhaustive()
    }
}

#[async_trait]
impl<F> ReplayableOperation for FnOperation<F>
where
    F: Fn() -> BoxFuture<'static, ControlResult<()>> + Send + Sync,
{
    fn kind(&self) -> &str {
        &self.kind
    }

    async fn replay(&self) -> ControlResult<()> {
        (self.operation)().await
    }
}

/// Wrap a closure as a shareable replayable operation
pub fn replayable<F, Fut>(kind: &str, operation: F) -> Arc<dyn ReplayableOperation>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ControlResult<()>> + Send + 'static,
{
    Arc::new(FnOperation { kind: kind.to_string(), operation: move || operation().boxed() })
}

/// Queued failed operation
#[derive(Clone)]
pub struct FailedOperationEntry {
    pub id: Uuid,
    pub queue_name: String,
    pub operation: Arc<dyn ReplayableOperation>,
    /// Replays left before the entry is dropped
    pub attempts_remaining: u32,
    pub metadata: Value,
    pub enqueued_at: DateTime<Utc>,
}

impl fmt::Debug for FailedOperationEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FailedOperationEntry")
            .field("id", &self.id)
            .field("queue_name", &self.queue_name)
            .field("kind", &self.operation.kind())
            .field("attempts_remaining", &self.attempts_remaining)
            .field("enqueued_at", &self.enqueued_at)
            .finish_non_exhaustive()
    }
}

impl FailedOperationEntry {
    pub fn descriptor(&self) -> EntryDescriptor {
        EntryDescriptor {
            id: self.id,
            queue_name: self.queue_name.clone(),
            kind: self.operation.kind().to_string(),
            attempts_remaining: self.attempts_remaining,
            metadata: self.metadata.clone(),
            enqueued_at: self.enqueued_at,
        }
    }
}

/// Serializable view of an entry, as written to the journal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryDescriptor {
    pub id: Uuid,
    pub queue_name: String,
    pub kind: String,
    pub attempts_remaining: u32,
    pub metadata: Value,
    pub enqueued_at: DateTime<Utc>,
}

/// Per-queue statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub size: usize,
    /// Enqueue time of the oldest pending entry
    pub oldest_item: Option<DateTime<Utc>>,
    /// Entries discarded after exhausting their attempts
    pub dropped: u64,
}

/// Summary of one `process_queue` pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProcessReport {
    pub processed: usize,
    pub succeeded: usize,
    pub requeued: usize,
    pub dropped: usize,
}

/// Failed-operation queue configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Replays granted when a caller does not specify a budget
    pub default_max_retries: u32,
    /// Upper bound on pending entries per named queue
    pub max_queue_size: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { default_max_retries: 3, max_queue_size: 10_000 }
    }
}

impl QueueConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        if self.max_queue_size == 0 {
            return Err(ConfigError::field("max_queue_size", "must be greater than 0"));
        }
        Ok(())
    }
}
