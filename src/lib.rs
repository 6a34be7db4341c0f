//! foreman - task-orchestration core for long-horizon autonomous agents.
//!
//! Two subsystems live here. The completion-decision pipeline decides,
//! after each unit of agent work, whether the agent should keep working:
//! completion events flow through a priority-ordered bus to signal
//! detectors, the continuation manager, and the overseer bridge that keeps
//! a durable assignment ledger. The work queue substrate stores the
//! discrete units of work agents pull from shared queues, with
//! concurrency-limited claiming, retry bookkeeping, and crash recovery.
//!
//! Reply generation, tool execution, and channel integrations are external
//! collaborators; this crate only decides whether to continue and how work
//! is queued, claimed, retried, and recovered.

pub mod completion;
pub mod config;
pub mod db;
pub mod error;
pub mod overseer;
pub mod queue;

pub use completion::{
    CompletionBus, CompletionEvent, CompletionHandler, CompletionLevel, CompletionPipeline,
    ContinuationDecision, ContinuationManager, ContinuationSignal, DecisionAction, Goal,
    GoalPatch, GoalStatus, QueueCompletion, RunCompletion, StructuredReport, TurnCompletion,
};
pub use config::DatabaseConfig;
pub use db::{Database, MemoryStore, Store};
pub use error::{ConfigError, DatabaseError};
pub use overseer::{
    mark_assignment_needs_recovery, report_structured_update, Assignment, AssignmentStatus,
    OverseerBridge, OverseerBridgeConfig, SchedulerTick,
};
pub use queue::{
    recover_orphaned_work_items, spawn_worker, Identity, NewWorkItem, NewWorkQueue, WorkItem,
    WorkItemExecutor, WorkItemStatus, WorkQueue, WorkerConfig,
};
