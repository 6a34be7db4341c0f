//! Database abstraction layer.
//!
//! One trait covers the whole durable surface: the work queue substrate
//! (queues, items, executions, transcripts) and the overseer's assignment
//! ledger. The Postgres backend is the production store; the memory
//! backend serves unit tests and embeddable hosts.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::overseer::ledger::{Assignment, NewAssignment, NewOverseerEvent, OverseerEvent};
use crate::queue::types::{
    ClaimOptions, Identity, NewWorkItem, NewWorkItemExecution, NewWorkQueue, TranscriptRecord,
    WorkItem, WorkItemExecution, WorkItemFilter, WorkItemPatch, WorkQueue, WorkQueuePatch,
};

pub use memory::MemoryStore;
pub use postgres::Store;

#[async_trait]
pub trait Database: Send + Sync {
    /// Whether durable storage exists yet.
    ///
    /// Must never create storage as a side effect of the check; the
    /// recovery scan depends on that.
    async fn storage_ready(&self) -> Result<bool, DatabaseError>;

    // --- Work queues ---

    /// Create a queue. Fails on a duplicate `agent_id`.
    async fn create_queue(&self, queue: &NewWorkQueue) -> Result<WorkQueue, DatabaseError>;

    async fn update_queue(
        &self,
        id: Uuid,
        patch: &WorkQueuePatch,
    ) -> Result<WorkQueue, DatabaseError>;

    async fn get_queue(&self, id: Uuid) -> Result<Option<WorkQueue>, DatabaseError>;

    async fn get_queue_for_agent(&self, agent_id: &str)
        -> Result<Option<WorkQueue>, DatabaseError>;

    async fn list_queues(&self) -> Result<Vec<WorkQueue>, DatabaseError>;

    // --- Work items ---

    /// Insert an item. Status defaults to pending, or blocked when the
    /// item is created with blockers.
    async fn create_item(&self, item: &NewWorkItem) -> Result<WorkItem, DatabaseError>;

    async fn get_item(&self, id: Uuid) -> Result<Option<WorkItem>, DatabaseError>;

    /// Partial update. A patch field of `Field::Clear` removes the stored
    /// value; `Field::Keep` leaves it untouched.
    async fn update_item(&self, id: Uuid, patch: &WorkItemPatch)
        -> Result<WorkItem, DatabaseError>;

    /// Atomically claim the next eligible pending item, respecting the
    /// queue's concurrency limit. Safe under concurrent callers.
    async fn claim_next_item(
        &self,
        queue_id: Uuid,
        identity: &Identity,
        opts: &ClaimOptions,
    ) -> Result<Option<WorkItem>, DatabaseError>;

    async fn list_items(&self, filter: &WorkItemFilter) -> Result<Vec<WorkItem>, DatabaseError>;

    /// Flip blocked items whose blockers have all completed back to
    /// pending. Returns how many were promoted.
    async fn promote_unblocked_items(&self, queue_id: Uuid) -> Result<u64, DatabaseError>;

    // --- Executions ---

    async fn record_execution(
        &self,
        execution: &NewWorkItemExecution,
    ) -> Result<WorkItemExecution, DatabaseError>;

    async fn list_executions(&self, item_id: Uuid)
        -> Result<Vec<WorkItemExecution>, DatabaseError>;

    // --- Transcripts ---

    async fn store_transcript(
        &self,
        item_id: Uuid,
        session_key: Option<&str>,
        content: &serde_json::Value,
    ) -> Result<Uuid, DatabaseError>;

    async fn get_transcript(&self, id: Uuid) -> Result<Option<TranscriptRecord>, DatabaseError>;

    async fn list_transcripts(&self, item_id: Uuid)
        -> Result<Vec<TranscriptRecord>, DatabaseError>;

    // --- Assignment ledger ---

    async fn create_assignment(
        &self,
        assignment: &NewAssignment,
    ) -> Result<Assignment, DatabaseError>;

    async fn get_assignment(&self, id: Uuid) -> Result<Option<Assignment>, DatabaseError>;

    /// First non-terminal assignment for a session, most recently updated
    /// first. Uniqueness is an upstream invariant.
    async fn find_assignment_by_session_key(
        &self,
        session_key: &str,
    ) -> Result<Option<Assignment>, DatabaseError>;

    async fn find_assignment_by_run_id(
        &self,
        run_id: Uuid,
    ) -> Result<Option<Assignment>, DatabaseError>;

    /// Read-modify-write one assignment inside a single transaction.
    ///
    /// Returns the updated record, or `None` when the assignment does not
    /// exist. `updated_at` is stamped after the mutation runs.
    async fn with_assignment(
        &self,
        id: Uuid,
        mutate: Box<dyn for<'a> FnOnce(&'a mut Assignment) + Send>,
    ) -> Result<Option<Assignment>, DatabaseError>;

    // --- Overseer audit log ---

    async fn append_overseer_event(
        &self,
        event: &NewOverseerEvent,
    ) -> Result<OverseerEvent, DatabaseError>;

    async fn list_overseer_events(
        &self,
        assignment_id: Uuid,
        limit: usize,
    ) -> Result<Vec<OverseerEvent>, DatabaseError>;
}
