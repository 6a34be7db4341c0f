//! Work queue substrate: durable items, claiming, workers, and recovery.

pub mod recovery;
pub mod types;
pub mod worker;

pub use recovery::{recover_orphaned_work_items, RecoveryReport};
pub use types::{
    parse_item_status, ClaimOptions, ExecutionOutcome, Field, Identity, NewWorkItem,
    NewWorkItemExecution, NewWorkQueue, TranscriptRecord, WorkItem, WorkItemError,
    WorkItemExecution, WorkItemFilter, WorkItemPatch, WorkItemStatus, WorkQueue, WorkQueuePatch,
};
pub use worker::{
    spawn_worker, ExecutionFailure, WorkItemExecutor, WorkerConfig, WorkerHandle, WorkerLoop,
};
