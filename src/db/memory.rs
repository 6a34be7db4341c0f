//! In-memory store.
//!
//! Implements the full [`Database`] surface behind a single mutex, which
//! makes every operation (claiming included) trivially atomic. Used by
//! unit tests and by hosts that embed the pipeline without Postgres.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::db::Database;
use crate::error::DatabaseError;
use crate::overseer::ledger::{Assignment, NewAssignment, NewOverseerEvent, OverseerEvent};
use crate::queue::types::{
    ClaimOptions, Identity, NewWorkItem, NewWorkItemExecution, NewWorkQueue, TranscriptRecord,
    WorkItem, WorkItemExecution, WorkItemFilter, WorkItemPatch, WorkItemStatus, WorkQueue,
    WorkQueuePatch,
};

#[derive(Default)]
struct MemoryState {
    queues: HashMap<Uuid, WorkQueue>,
    items: HashMap<Uuid, WorkItem>,
    executions: Vec<WorkItemExecution>,
    transcripts: HashMap<Uuid, TranscriptRecord>,
    assignments: HashMap<Uuid, Assignment>,
    events: Vec<OverseerEvent>,
    next_event_id: i64,
    /// Set on the first write; mirrors "has storage ever been created".
    touched: bool,
}

/// Mutex-guarded in-memory implementation of [`Database`].
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Database for MemoryStore {
    async fn storage_ready(&self) -> Result<bool, DatabaseError> {
        Ok(self.state.lock().await.touched)
    }

    // --- Work queues ---

    async fn create_queue(&self, queue: &NewWorkQueue) -> Result<WorkQueue, DatabaseError> {
        if queue.concurrency_limit < 1 {
            return Err(DatabaseError::Constraint(
                "concurrency_limit must be at least 1".into(),
            ));
        }

        let mut state = self.state.lock().await;
        if state.queues.values().any(|q| q.agent_id == queue.agent_id) {
            return Err(DatabaseError::Constraint(format!(
                "queue for agent {} already exists",
                queue.agent_id
            )));
        }

        let now = Utc::now();
        let record = WorkQueue {
            id: Uuid::new_v4(),
            agent_id: queue.agent_id.clone(),
            name: queue.name.clone(),
            concurrency_limit: queue.concurrency_limit,
            default_priority: queue.default_priority,
            created_at: now,
            updated_at: now,
        };
        state.queues.insert(record.id, record.clone());
        state.touched = true;
        Ok(record)
    }

    async fn update_queue(
        &self,
        id: Uuid,
        patch: &WorkQueuePatch,
    ) -> Result<WorkQueue, DatabaseError> {
        if patch.concurrency_limit.is_some_and(|limit| limit < 1) {
            return Err(DatabaseError::Constraint(
                "concurrency_limit must be at least 1".into(),
            ));
        }

        let mut state = self.state.lock().await;
        let queue = state
            .queues
            .get_mut(&id)
            .ok_or_else(|| DatabaseError::NotFound(format!("queue {}", id)))?;

        if let Some(name) = &patch.name {
            queue.name = name.clone();
        }
        if let Some(limit) = patch.concurrency_limit {
            queue.concurrency_limit = limit;
        }
        if let Some(priority) = patch.default_priority {
            queue.default_priority = priority;
        }
        queue.updated_at = Utc::now();
        Ok(queue.clone())
    }

    async fn get_queue(&self, id: Uuid) -> Result<Option<WorkQueue>, DatabaseError> {
        Ok(self.state.lock().await.queues.get(&id).cloned())
    }

    async fn get_queue_for_agent(
        &self,
        agent_id: &str,
    ) -> Result<Option<WorkQueue>, DatabaseError> {
        Ok(self
            .state
            .lock()
            .await
            .queues
            .values()
            .find(|q| q.agent_id == agent_id)
            .cloned())
    }

    async fn list_queues(&self) -> Result<Vec<WorkQueue>, DatabaseError> {
        let state = self.state.lock().await;
        let mut queues: Vec<WorkQueue> = state.queues.values().cloned().collect();
        queues.sort_by_key(|q| q.created_at);
        Ok(queues)
    }

    // --- Work items ---

    async fn create_item(&self, item: &NewWorkItem) -> Result<WorkItem, DatabaseError> {
        let mut state = self.state.lock().await;
        let queue = state
            .queues
            .get(&item.queue_id)
            .ok_or_else(|| DatabaseError::NotFound(format!("queue {}", item.queue_id)))?;
        let default_priority = queue.default_priority;

        if let Some(parent_id) = item.parent_item_id {
            if !state.items.contains_key(&parent_id) {
                return Err(DatabaseError::NotFound(format!("parent item {}", parent_id)));
            }
        }

        let now = Utc::now();
        let status = if item.blocked_by.is_empty() {
            WorkItemStatus::Pending
        } else {
            WorkItemStatus::Blocked
        };
        let record = WorkItem {
            id: Uuid::new_v4(),
            queue_id: item.queue_id,
            title: item.title.clone(),
            description: item.description.clone(),
            payload: item.payload.clone(),
            status,
            status_reason: None,
            parent_item_id: item.parent_item_id,
            depends_on: item.depends_on.clone(),
            blocked_by: item.blocked_by.clone(),
            created_by: item.created_by.clone(),
            assigned_to: None,
            priority: item.priority.unwrap_or(default_priority),
            tags: item.tags.clone(),
            result: None,
            error: None,
            retry_count: 0,
            max_retries: item.max_retries,
            deadline: item.deadline,
            last_outcome: None,
            workstream: item.workstream.clone(),
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        };
        state.items.insert(record.id, record.clone());
        state.touched = true;
        Ok(record)
    }

    async fn get_item(&self, id: Uuid) -> Result<Option<WorkItem>, DatabaseError> {
        Ok(self.state.lock().await.items.get(&id).cloned())
    }

    async fn update_item(
        &self,
        id: Uuid,
        patch: &WorkItemPatch,
    ) -> Result<WorkItem, DatabaseError> {
        let mut state = self.state.lock().await;
        let item = state
            .items
            .get_mut(&id)
            .ok_or_else(|| DatabaseError::NotFound(format!("work item {}", id)))?;
        item.apply_patch(patch);
        Ok(item.clone())
    }

    async fn claim_next_item(
        &self,
        queue_id: Uuid,
        identity: &Identity,
        opts: &ClaimOptions,
    ) -> Result<Option<WorkItem>, DatabaseError> {
        let mut state = self.state.lock().await;
        let limit = state
            .queues
            .get(&queue_id)
            .ok_or_else(|| DatabaseError::NotFound(format!("queue {}", queue_id)))?
            .concurrency_limit;

        let in_progress = state
            .items
            .values()
            .filter(|i| i.queue_id == queue_id && i.status == WorkItemStatus::InProgress)
            .count();
        if in_progress >= limit as usize {
            return Ok(None);
        }

        let candidate_id = state
            .items
            .values()
            .filter(|i| {
                i.queue_id == queue_id
                    && i.status == WorkItemStatus::Pending
                    && opts
                        .workstream
                        .as_ref()
                        .is_none_or(|w| i.workstream.as_ref() == Some(w))
            })
            .min_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then_with(|| a.created_at.cmp(&b.created_at))
            })
            .map(|i| i.id);

        let Some(item) = candidate_id.and_then(|id| state.items.get_mut(&id)) else {
            return Ok(None);
        };
        let now = Utc::now();
        item.status = WorkItemStatus::InProgress;
        item.assigned_to = Some(identity.clone());
        item.started_at = Some(now);
        item.updated_at = now;
        Ok(Some(item.clone()))
    }

    async fn list_items(&self, filter: &WorkItemFilter) -> Result<Vec<WorkItem>, DatabaseError> {
        let state = self.state.lock().await;
        let mut items: Vec<WorkItem> = state
            .items
            .values()
            .filter(|i| {
                filter.queue_id.is_none_or(|q| i.queue_id == q)
                    && filter.status.is_none_or(|s| i.status == s)
                    && filter
                        .assigned_to
                        .as_ref()
                        .is_none_or(|a| i.assigned_to.as_ref() == Some(a))
                    && filter
                        .workstream
                        .as_ref()
                        .is_none_or(|w| i.workstream.as_ref() == Some(w))
            })
            .cloned()
            .collect();
        items.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.created_at.cmp(&b.created_at))
        });
        Ok(items)
    }

    async fn promote_unblocked_items(&self, queue_id: Uuid) -> Result<u64, DatabaseError> {
        let mut state = self.state.lock().await;

        let blocked_ids: Vec<Uuid> = state
            .items
            .values()
            .filter(|i| i.queue_id == queue_id && i.status == WorkItemStatus::Blocked)
            .filter(|i| {
                i.blocked_by.iter().all(|dep| {
                    state
                        .items
                        .get(dep)
                        .is_none_or(|d| d.status == WorkItemStatus::Completed)
                })
            })
            .map(|i| i.id)
            .collect();

        let now = Utc::now();
        let mut promoted = 0;
        for id in &blocked_ids {
            if let Some(item) = state.items.get_mut(id) {
                item.status = WorkItemStatus::Pending;
                item.status_reason = Some("Dependencies satisfied".to_string());
                item.updated_at = now;
                promoted += 1;
            }
        }
        Ok(promoted)
    }

    // --- Executions ---

    async fn record_execution(
        &self,
        execution: &NewWorkItemExecution,
    ) -> Result<WorkItemExecution, DatabaseError> {
        let mut state = self.state.lock().await;
        if !state.items.contains_key(&execution.item_id) {
            return Err(DatabaseError::NotFound(format!(
                "work item {}",
                execution.item_id
            )));
        }

        let duration_ms = (execution.completed_at - execution.started_at).num_milliseconds();
        let record = WorkItemExecution {
            id: Uuid::new_v4(),
            item_id: execution.item_id,
            attempt_number: execution.attempt_number,
            session_key: execution.session_key.clone(),
            outcome: execution.outcome,
            error: execution.error.clone(),
            started_at: execution.started_at,
            completed_at: execution.completed_at,
            duration_ms,
        };
        state.executions.push(record.clone());
        Ok(record)
    }

    async fn list_executions(
        &self,
        item_id: Uuid,
    ) -> Result<Vec<WorkItemExecution>, DatabaseError> {
        Ok(self
            .state
            .lock()
            .await
            .executions
            .iter()
            .filter(|e| e.item_id == item_id)
            .cloned()
            .collect())
    }

    // --- Transcripts ---

    async fn store_transcript(
        &self,
        item_id: Uuid,
        session_key: Option<&str>,
        content: &serde_json::Value,
    ) -> Result<Uuid, DatabaseError> {
        let mut state = self.state.lock().await;
        if !state.items.contains_key(&item_id) {
            return Err(DatabaseError::NotFound(format!("work item {}", item_id)));
        }

        let record = TranscriptRecord {
            id: Uuid::new_v4(),
            item_id,
            session_key: session_key.map(String::from),
            content: content.clone(),
            created_at: Utc::now(),
        };
        let id = record.id;
        state.transcripts.insert(id, record);
        Ok(id)
    }

    async fn get_transcript(&self, id: Uuid) -> Result<Option<TranscriptRecord>, DatabaseError> {
        Ok(self.state.lock().await.transcripts.get(&id).cloned())
    }

    async fn list_transcripts(
        &self,
        item_id: Uuid,
    ) -> Result<Vec<TranscriptRecord>, DatabaseError> {
        let state = self.state.lock().await;
        let mut transcripts: Vec<TranscriptRecord> = state
            .transcripts
            .values()
            .filter(|t| t.item_id == item_id)
            .cloned()
            .collect();
        transcripts.sort_by_key(|t| t.created_at);
        Ok(transcripts)
    }

    // --- Assignment ledger ---

    async fn create_assignment(
        &self,
        assignment: &NewAssignment,
    ) -> Result<Assignment, DatabaseError> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let record = Assignment {
            assignment_id: Uuid::new_v4(),
            session_key: assignment.session_key.clone(),
            run_id: assignment.run_id,
            goal_id: assignment.goal_id,
            status: assignment.status,
            retry_count: 0,
            last_retry_at: None,
            last_observed_activity_at: None,
            blocked_reason: None,
            recovery_policy: assignment.recovery_policy.clone(),
            created_at: now,
            updated_at: now,
        };
        state.assignments.insert(record.assignment_id, record.clone());
        state.touched = true;
        Ok(record)
    }

    async fn get_assignment(&self, id: Uuid) -> Result<Option<Assignment>, DatabaseError> {
        Ok(self.state.lock().await.assignments.get(&id).cloned())
    }

    async fn find_assignment_by_session_key(
        &self,
        session_key: &str,
    ) -> Result<Option<Assignment>, DatabaseError> {
        let state = self.state.lock().await;
        Ok(state
            .assignments
            .values()
            .filter(|a| a.session_key == session_key && !a.status.is_terminal())
            .max_by_key(|a| a.updated_at)
            .cloned())
    }

    async fn find_assignment_by_run_id(
        &self,
        run_id: Uuid,
    ) -> Result<Option<Assignment>, DatabaseError> {
        let state = self.state.lock().await;
        Ok(state
            .assignments
            .values()
            .filter(|a| a.run_id == Some(run_id) && !a.status.is_terminal())
            .max_by_key(|a| a.updated_at)
            .cloned())
    }

    async fn with_assignment(
        &self,
        id: Uuid,
        mutate: Box<dyn for<'a> FnOnce(&'a mut Assignment) + Send>,
    ) -> Result<Option<Assignment>, DatabaseError> {
        let mut state = self.state.lock().await;
        let Some(assignment) = state.assignments.get_mut(&id) else {
            return Ok(None);
        };
        mutate(assignment);
        assignment.updated_at = Utc::now();
        Ok(Some(assignment.clone()))
    }

    // --- Overseer audit log ---

    async fn append_overseer_event(
        &self,
        event: &NewOverseerEvent,
    ) -> Result<OverseerEvent, DatabaseError> {
        let mut state = self.state.lock().await;
        state.next_event_id += 1;
        let record = OverseerEvent {
            id: state.next_event_id,
            ts: Utc::now(),
            event_type: event.event_type.clone(),
            assignment_id: event.assignment_id,
            goal_id: event.goal_id,
            work_node_id: event.work_node_id,
            data: event.data.clone(),
        };
        state.events.push(record.clone());
        Ok(record)
    }

    async fn list_overseer_events(
        &self,
        assignment_id: Uuid,
        limit: usize,
    ) -> Result<Vec<OverseerEvent>, DatabaseError> {
        Ok(self
            .state
            .lock()
            .await
            .events
            .iter()
            .filter(|e| e.assignment_id == assignment_id)
            .take(limit)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::types::Field;
    use pretty_assertions::assert_eq;

    async fn store_with_queue(limit: i32) -> (MemoryStore, WorkQueue) {
        let store = MemoryStore::new();
        let queue = store
            .create_queue(&NewWorkQueue::new("agent-1", "Agent 1").with_concurrency_limit(limit))
            .await
            .unwrap();
        (store, queue)
    }

    #[tokio::test]
    async fn test_update_queue() {
        let (store, queue) = store_with_queue(1).await;
        let updated = store
            .update_queue(
                queue.id,
                &WorkQueuePatch {
                    concurrency_limit: Some(4),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.concurrency_limit, 4);
        assert_eq!(updated.name, queue.name);

        let err = store
            .update_queue(
                queue.id,
                &WorkQueuePatch {
                    concurrency_limit: Some(0),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::Constraint(_)));
    }

    #[tokio::test]
    async fn test_duplicate_agent_queue_rejected() {
        let (store, _queue) = store_with_queue(1).await;
        let err = store
            .create_queue(&NewWorkQueue::new("agent-1", "Again"))
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::Constraint(_)));
    }

    #[tokio::test]
    async fn test_create_item_defaults() {
        let (store, queue) = store_with_queue(1).await;
        let item = store
            .create_item(&NewWorkItem::new(queue.id, "task"))
            .await
            .unwrap();
        assert_eq!(item.status, WorkItemStatus::Pending);
        assert_eq!(item.retry_count, 0);
        assert_eq!(item.priority, queue.default_priority);
        assert!(item.tags.is_empty());
        assert!(item.assigned_to.is_none());
    }

    #[tokio::test]
    async fn test_create_item_with_blockers_starts_blocked() {
        let (store, queue) = store_with_queue(1).await;
        let first = store
            .create_item(&NewWorkItem::new(queue.id, "first"))
            .await
            .unwrap();
        let second = store
            .create_item(&NewWorkItem::new(queue.id, "second").blocked_on(vec![first.id]))
            .await
            .unwrap();
        assert_eq!(second.status, WorkItemStatus::Blocked);
    }

    #[tokio::test]
    async fn test_clear_vs_omit() {
        let (store, queue) = store_with_queue(1).await;
        let item = store
            .create_item(&NewWorkItem::new(queue.id, "task"))
            .await
            .unwrap();
        store
            .claim_next_item(queue.id, &Identity::for_session("sess-1"), &ClaimOptions::default())
            .await
            .unwrap()
            .unwrap();

        // Omitting assigned_to leaves it untouched.
        let updated = store
            .update_item(item.id, &WorkItemPatch::status(WorkItemStatus::Pending))
            .await
            .unwrap();
        assert!(updated.assigned_to.is_some());

        // Explicitly clearing removes it.
        let patch = WorkItemPatch {
            status: Some(WorkItemStatus::Pending),
            assigned_to: Field::Clear,
            ..Default::default()
        };
        let updated = store.update_item(item.id, &patch).await.unwrap();
        assert!(updated.assigned_to.is_none());
    }

    #[tokio::test]
    async fn test_claim_respects_concurrency_and_priority() {
        let (store, queue) = store_with_queue(1).await;
        let a = store
            .create_item(&NewWorkItem::new(queue.id, "A").with_priority(10))
            .await
            .unwrap();
        let b = store
            .create_item(&NewWorkItem::new(queue.id, "B").with_priority(1))
            .await
            .unwrap();

        let identity = Identity::for_agent("agent-1");
        let claimed = store
            .claim_next_item(queue.id, &identity, &ClaimOptions::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.id, a.id);

        // Limit of 1 is saturated.
        assert!(store
            .claim_next_item(queue.id, &identity, &ClaimOptions::default())
            .await
            .unwrap()
            .is_none());

        store
            .update_item(a.id, &WorkItemPatch::status(WorkItemStatus::Completed))
            .await
            .unwrap();
        let claimed = store
            .claim_next_item(queue.id, &identity, &ClaimOptions::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.id, b.id);
    }

    #[tokio::test]
    async fn test_claim_scoped_to_workstream() {
        let (store, queue) = store_with_queue(4).await;
        store
            .create_item(&NewWorkItem::new(queue.id, "other").with_workstream("research"))
            .await
            .unwrap();
        let wanted = store
            .create_item(&NewWorkItem::new(queue.id, "mine").with_workstream("coding"))
            .await
            .unwrap();

        let opts = ClaimOptions {
            workstream: Some("coding".into()),
        };
        let claimed = store
            .claim_next_item(queue.id, &Identity::for_agent("agent-1"), &opts)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.id, wanted.id);
    }

    #[tokio::test]
    async fn test_concurrent_claims_never_exceed_limit() {
        let (store, queue) = store_with_queue(2).await;
        for n in 0..10 {
            store
                .create_item(&NewWorkItem::new(queue.id, format!("task-{n}")))
                .await
                .unwrap();
        }

        let store = std::sync::Arc::new(store);
        let mut handles = Vec::new();
        for n in 0..10 {
            let store = std::sync::Arc::clone(&store);
            let queue_id = queue.id;
            handles.push(tokio::spawn(async move {
                store
                    .claim_next_item(
                        queue_id,
                        &Identity::for_agent(format!("w{n}")),
                        &ClaimOptions::default(),
                    )
                    .await
                    .unwrap()
            }));
        }

        let claimed: Vec<_> = futures::future::join_all(handles)
            .await
            .into_iter()
            .filter_map(|r| r.unwrap())
            .collect();
        assert_eq!(claimed.len(), 2);

        let in_progress = store
            .list_items(&WorkItemFilter::for_queue(queue.id).with_status(WorkItemStatus::InProgress))
            .await
            .unwrap();
        assert_eq!(in_progress.len(), 2);
    }

    #[tokio::test]
    async fn test_promote_unblocked_items() {
        let (store, queue) = store_with_queue(1).await;
        let first = store
            .create_item(&NewWorkItem::new(queue.id, "first"))
            .await
            .unwrap();
        let second = store
            .create_item(&NewWorkItem::new(queue.id, "second").blocked_on(vec![first.id]))
            .await
            .unwrap();

        // Blocker still pending: nothing to promote.
        assert_eq!(store.promote_unblocked_items(queue.id).await.unwrap(), 0);

        store
            .update_item(first.id, &WorkItemPatch::status(WorkItemStatus::Completed))
            .await
            .unwrap();
        assert_eq!(store.promote_unblocked_items(queue.id).await.unwrap(), 1);

        let second = store.get_item(second.id).await.unwrap().unwrap();
        assert_eq!(second.status, WorkItemStatus::Pending);
    }

    #[tokio::test]
    async fn test_execution_and_transcript_history() {
        let (store, queue) = store_with_queue(1).await;
        let item = store
            .create_item(&NewWorkItem::new(queue.id, "task"))
            .await
            .unwrap();

        let started = Utc::now();
        store
            .record_execution(&NewWorkItemExecution {
                item_id: item.id,
                attempt_number: 1,
                session_key: Some("sess-1".into()),
                outcome: crate::queue::types::ExecutionOutcome::Error,
                error: Some("timeout".into()),
                started_at: started,
                completed_at: started + chrono::TimeDelta::milliseconds(250),
            })
            .await
            .unwrap();

        let executions = store.list_executions(item.id).await.unwrap();
        assert_eq!(executions.len(), 1);
        assert_eq!(executions[0].duration_ms, 250);

        let transcript_id = store
            .store_transcript(item.id, Some("sess-1"), &serde_json::json!({"turns": []}))
            .await
            .unwrap();
        let transcript = store.get_transcript(transcript_id).await.unwrap().unwrap();
        assert_eq!(transcript.item_id, item.id);
        assert_eq!(store.list_transcripts(item.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_assignment_lookup_excludes_terminal() {
        let store = MemoryStore::new();
        let done = store
            .create_assignment(&NewAssignment::new("s1"))
            .await
            .unwrap();
        store
            .with_assignment(
                done.assignment_id,
                Box::new(|a| a.status = crate::overseer::ledger::AssignmentStatus::Done),
            )
            .await
            .unwrap();

        assert!(store
            .find_assignment_by_session_key("s1")
            .await
            .unwrap()
            .is_none());

        let live = store
            .create_assignment(&NewAssignment::new("s1").with_run_id(Uuid::new_v4()))
            .await
            .unwrap();
        let found = store
            .find_assignment_by_session_key("s1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.assignment_id, live.assignment_id);
        let by_run = store
            .find_assignment_by_run_id(live.run_id.unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(by_run.assignment_id, live.assignment_id);
    }

    #[tokio::test]
    async fn test_storage_ready_tracks_first_write() {
        let store = MemoryStore::new();
        assert!(!store.storage_ready().await.unwrap());
        store
            .create_queue(&NewWorkQueue::new("agent-1", "Agent 1"))
            .await
            .unwrap();
        assert!(store.storage_ready().await.unwrap());
    }
}
