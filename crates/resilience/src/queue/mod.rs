// Failed-operation queue
// Named FIFO queues of operations replayed later with a bounded attempt budget

mod core;
mod types;

pub use self::core::FailedOperationQueue;
pub use self::types::{
    replayable, EntryDescriptor, FailedOperationEntry, FnOperation, ProcessReport, QueueConfig,
    QueueStats, ReplayableOperation,
};
