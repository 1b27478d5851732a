use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::types::{
    EntryDescriptor, FailedOperationEntry, ProcessReport, QueueConfig, QueueStats,
    ReplayableOperation,
};
use crate::error::{ConfigResult, ControlError, ControlResult};
use crate::store::KeyValueStore;

const JOURNAL_PREFIX: &str = "fq:";

#[derive(Default)]
struct NamedQueue {
    entries: VecDeque<FailedOperationEntry>,
    dropped: u64,
}

/// Named FIFO queues of failed operations awaiting replay
///
/// Entries are held in memory. With a journal attached, a descriptor of every
/// pending entry is mirrored into the key/value store under
/// `fq:{queue}:{id}` so a host can see what was pending after a crash.
pub struct FailedOperationQueue {
    queues: Mutex<HashMap<String, NamedQueue>>,
    journal: Option<Arc<dyn KeyValueStore>>,
    config: QueueConfig,
}

impl std::fmt::Debug for FailedOperationQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FailedOperationQueue")
            .field("queues", &self.queue_names())
            .field("journaled", &self.journal.is_some())
            .field("config", &self.config)
            .finish()
    }
}

impl Default for FailedOperationQueue {
    fn default() -> Self {
        Self { queues: Mutex::new(HashMap::new()), journal: None, config: QueueConfig::default() }
    }
}

impl FailedOperationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: QueueConfig) -> ConfigResult<Self> {
        config.validate()?;
        Ok(Self { config, ..Self::default() })
    }

    /// Mirror pending entries into `store`
    #[must_use]
    pub fn with_journal(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.journal = Some(store);
        self
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Add a failed operation to `queue_name`
    ///
    /// `max_retries` is the number of replays the entry gets before it is
    /// dropped (`None` uses the configured default).
    #[instrument(skip(self, operation, metadata), fields(kind = operation.kind()))]
    pub async fn enqueue(
        &self,
        queue_name: &str,
        operation: Arc<dyn ReplayableOperation>,
        max_retries: Option<u32>,
        metadata: Value,
    ) -> ControlResult<Uuid> {
        let entry = FailedOperationEntry {
            id: Uuid::new_v4(),
            queue_name: queue_name.to_string(),
            operation,
            attempts_remaining: max_retries.unwrap_or(self.config.default_max_retries),
            metadata,
            enqueued_at: Utc::now(),
        };
        let id = entry.id;
        let descriptor = entry.descriptor();

        self.check_capacity(queue_name)?;
        // Journal first: an entry is only replayed once its enqueue succeeded
        self.journal_write(&descriptor).await?;

        let pushed = {
            let mut queues = self.queues.lock();
            let queue = queues.entry(queue_name.to_string()).or_default();
            if queue.entries.len() >= self.config.max_queue_size {
                Err(full_queue(queue_name, queue.entries.len()))
            } else {
                queue.entries.push_back(entry);
                Ok(())
            }
        };
        if let Err(full) = pushed {
            self.journal_delete(queue_name, id).await;
            return Err(full);
        }

        debug!(queue = queue_name, %id, "Failed operation enqueued");
        Ok(id)
    }

    /// Replay every pending entry of `queue_name` once
    ///
    /// Successful entries are removed. A failed entry loses one attempt and
    /// is re-enqueued while attempts remain, otherwise it is dropped and
    /// counted in [`stats`](Self::stats).
    #[instrument(skip(self))]
    pub async fn process_queue(&self, queue_name: &str) -> ProcessReport {
        let batch: Vec<FailedOperationEntry> = {
            let mut queues = self.queues.lock();
            match queues.get_mut(queue_name) {
                Some(queue) => queue.entries.drain(..).collect(),
                None => Vec::new(),
            }
        };

        let mut report = ProcessReport { processed: batch.len(), ..ProcessReport::default() };
        let mut requeue = Vec::new();
        let mut dropped = Vec::new();

        for mut entry in batch {
            match entry.operation.replay().await {
                Ok(()) => {
                    report.succeeded += 1;
                    debug!(id = %entry.id, kind = entry.operation.kind(), "Replay succeeded");
                    self.journal_remove(&entry).await;
                }
                Err(replay_error) => {
                    entry.attempts_remaining = entry.attempts_remaining.saturating_sub(1);
                    if entry.attempts_remaining > 0 {
                        debug!(
                            id = %entry.id,
                            attempts_remaining = entry.attempts_remaining,
                            error = %replay_error,
                            "Replay failed, re-enqueueing"
                        );
                        requeue.push(entry);
                    } else {
                        warn!(
                            id = %entry.id,
                            kind = entry.operation.kind(),
                            error = %replay_error,
                            "Replay attempts exhausted, dropping entry"
                        );
                        dropped.push(entry);
                    }
                }
            }
        }

        report.requeued = requeue.len();
        report.dropped = dropped.len();

        let descriptors: Vec<EntryDescriptor> =
            requeue.iter().map(FailedOperationEntry::descriptor).collect();
        {
            let mut queues = self.queues.lock();
            let queue = queues.entry(queue_name.to_string()).or_default();
            queue.dropped += dropped.len() as u64;
            for entry in requeue.into_iter().rev() {
                queue.entries.push_front(entry);
            }
        }

        for descriptor in &descriptors {
            if let Err(journal_error) = self.journal_write(descriptor).await {
                warn!(id = %descriptor.id, error = %journal_error, "Failed to update journal entry");
            }
        }
        for entry in &dropped {
            self.journal_remove(entry).await;
        }

        if report.processed > 0 {
            info!(
                queue = queue_name,
                processed = report.processed,
                succeeded = report.succeeded,
                requeued = report.requeued,
                dropped = report.dropped,
                "Processed failed-operation queue"
            );
        }
        report
    }

    pub fn queue_size(&self, queue_name: &str) -> usize {
        self.queues.lock().get(queue_name).map_or(0, |queue| queue.entries.len())
    }

    /// Names of every queue that has been used, sorted
    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.queues.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Statistics per queue
    pub fn stats(&self) -> BTreeMap<String, QueueStats> {
        self.queues
            .lock()
            .iter()
            .map(|(name, queue)| {
                let stats = QueueStats {
                    size: queue.entries.len(),
                    oldest_item: queue.entries.iter().map(|entry| entry.enqueued_at).min(),
                    dropped: queue.dropped,
                };
                (name.clone(), stats)
            })
            .collect()
    }

    /// Discard every pending entry of `queue_name`, returning how many were
    /// removed
    pub async fn clear_queue(&self, queue_name: &str) -> usize {
        let cleared: Vec<FailedOperationEntry> = {
            let mut queues = self.queues.lock();
            match queues.get_mut(queue_name) {
                Some(queue) => queue.entries.drain(..).collect(),
                None => Vec::new(),
            }
        };

        for entry in &cleared {
            self.journal_remove(entry).await;
        }
        info!(queue = queue_name, cleared = cleared.len(), "Cleared failed-operation queue");
        cleared.len()
    }

    /// Descriptors currently in the journal (empty without a journal)
    pub async fn journaled(&self) -> ControlResult<Vec<EntryDescriptor>> {
        let Some(journal) = &self.journal else {
            return Ok(Vec::new());
        };

        let mut descriptors = Vec::new();
        for key in journal.keys_with_prefix(JOURNAL_PREFIX).await? {
            if let Some(value) = journal.get(&key).await? {
                descriptors.push(serde_json::from_value(value)?);
            }
        }
        Ok(descriptors)
    }

    async fn journal_write(&self, descriptor: &EntryDescriptor) -> ControlResult<()> {
        if let Some(journal) = &self.journal {
            let key = journal_key(&descriptor.queue_name, descriptor.id);
            journal.set(&key, serde_json::to_value(descriptor)?, None).await?;
        }
        Ok(())
    }

    async fn journal_remove(&self, entry: &FailedOperationEntry) {
        self.journal_delete(&entry.queue_name, entry.id).await;
    }

    async fn journal_delete(&self, queue_name: &str, id: Uuid) {
        if let Some(journal) = &self.journal {
            if let Err(journal_error) = journal.delete(&journal_key(queue_name, id)).await {
                warn!(%id, error = %journal_error, "Failed to remove journal entry");
            }
        }
    }

    fn check_capacity(&self, queue_name: &str) -> ControlResult<()> {
        let queues = self.queues.lock();
        match queues.get(queue_name) {
            Some(queue) if queue.entries.len() >= self.config.max_queue_size => {
                Err(full_queue(queue_name, queue.entries.len()))
            }
            _ => Ok(()),
        }
    }
}

fn full_queue(queue_name: &str, len: usize) -> ControlError {
    ControlError::store("enqueue", format!("queue '{queue_name}' is full ({len} entries)"))
}

fn journal_key(queue_name: &str, id: Uuid) -> String {
    format!("{JOURNAL_PREFIX}{queue_name}:{id}")
}
