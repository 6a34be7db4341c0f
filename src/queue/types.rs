//! Work queue data model: queues, items, executions, transcripts, patches.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Status of a work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkItemStatus {
    Pending,
    Blocked,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl WorkItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkItemStatus::Pending => "pending",
            WorkItemStatus::Blocked => "blocked",
            WorkItemStatus::InProgress => "in_progress",
            WorkItemStatus::Completed => "completed",
            WorkItemStatus::Failed => "failed",
            WorkItemStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkItemStatus::Completed | WorkItemStatus::Failed | WorkItemStatus::Cancelled
        )
    }
}

impl std::fmt::Display for WorkItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parse a stored status string, defaulting unknown values to pending.
pub fn parse_item_status(s: &str) -> WorkItemStatus {
    match s {
        "pending" => WorkItemStatus::Pending,
        "blocked" => WorkItemStatus::Blocked,
        "in_progress" => WorkItemStatus::InProgress,
        "completed" => WorkItemStatus::Completed,
        "failed" => WorkItemStatus::Failed,
        "cancelled" => WorkItemStatus::Cancelled,
        _ => WorkItemStatus::Pending,
    }
}

/// Who created or currently holds a work item.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub agent_id: Option<String>,
    pub session_key: Option<String>,
}

impl Identity {
    pub fn for_agent(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: Some(agent_id.into()),
            session_key: None,
        }
    }

    pub fn for_session(session_key: impl Into<String>) -> Self {
        Self {
            agent_id: None,
            session_key: Some(session_key.into()),
        }
    }

    pub fn with_session(mut self, session_key: impl Into<String>) -> Self {
        self.session_key = Some(session_key.into());
        self
    }

    /// Human-readable label, preferring the session key.
    pub fn label(&self) -> String {
        self.session_key
            .clone()
            .or_else(|| self.agent_id.clone())
            .unwrap_or_else(|| "unknown".to_string())
    }
}

/// A per-agent queue of work items.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkQueue {
    pub id: Uuid,
    /// One queue per agent.
    pub agent_id: String,
    pub name: String,
    /// Maximum items in progress at once. Always >= 1.
    pub concurrency_limit: i32,
    pub default_priority: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields for creating a queue.
#[derive(Debug, Clone)]
pub struct NewWorkQueue {
    pub agent_id: String,
    pub name: String,
    pub concurrency_limit: i32,
    pub default_priority: i32,
}

impl NewWorkQueue {
    pub fn new(agent_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            name: name.into(),
            concurrency_limit: 1,
            default_priority: 0,
        }
    }

    pub fn with_concurrency_limit(mut self, limit: i32) -> Self {
        self.concurrency_limit = limit;
        self
    }
}

/// Partial update for queue metadata.
#[derive(Debug, Clone, Default)]
pub struct WorkQueuePatch {
    pub name: Option<String>,
    pub concurrency_limit: Option<i32>,
    pub default_priority: Option<i32>,
}

/// Structured error attached to a failed item.
///
/// `recoverable` lets operators distinguish "give up" from "could be
/// retried manually".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItemError {
    pub message: String,
    pub details: Option<serde_json::Value>,
    pub recoverable: bool,
}

/// One schedulable unit of agent work, durably stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: Uuid,
    pub queue_id: Uuid,
    pub title: String,
    pub description: String,
    /// Opaque payload handed to the executor.
    pub payload: serde_json::Value,
    pub status: WorkItemStatus,
    pub status_reason: Option<String>,
    /// Tree relationship; set at creation only, so no cycle can form.
    pub parent_item_id: Option<Uuid>,
    pub depends_on: Vec<Uuid>,
    pub blocked_by: Vec<Uuid>,
    pub created_by: Option<Identity>,
    /// The worker currently holding the claim.
    pub assigned_to: Option<Identity>,
    pub priority: i32,
    pub tags: Vec<String>,
    pub result: Option<serde_json::Value>,
    pub error: Option<WorkItemError>,
    pub retry_count: i32,
    /// Absent means no retry budget is enforced.
    pub max_retries: Option<i32>,
    pub deadline: Option<DateTime<Utc>>,
    pub last_outcome: Option<String>,
    /// Free-text partition key used to scope claiming.
    pub workstream: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkItem {
    /// Apply a partial update in place, honoring the Keep/Clear/Set
    /// semantics of [`Field`], and stamp `updated_at`.
    pub fn apply_patch(&mut self, patch: &WorkItemPatch) {
        if let Some(title) = &patch.title {
            self.title = title.clone();
        }
        if let Some(description) = &patch.description {
            self.description = description.clone();
        }
        if let Some(payload) = &patch.payload {
            self.payload = payload.clone();
        }
        if let Some(status) = patch.status {
            self.status = status;
        }
        self.status_reason = patch
            .status_reason
            .clone()
            .resolve(self.status_reason.take());
        self.assigned_to = patch.assigned_to.clone().resolve(self.assigned_to.take());
        if let Some(priority) = patch.priority {
            self.priority = priority;
        }
        if let Some(tags) = &patch.tags {
            self.tags = tags.clone();
        }
        if let Some(depends_on) = &patch.depends_on {
            self.depends_on = depends_on.clone();
        }
        if let Some(blocked_by) = &patch.blocked_by {
            self.blocked_by = blocked_by.clone();
        }
        self.result = patch.result.clone().resolve(self.result.take());
        self.error = patch.error.clone().resolve(self.error.take());
        if let Some(retry_count) = patch.retry_count {
            self.retry_count = retry_count;
        }
        self.max_retries = patch.max_retries.clone().resolve(self.max_retries.take());
        self.deadline = patch.deadline.clone().resolve(self.deadline.take());
        self.last_outcome = patch.last_outcome.clone().resolve(self.last_outcome.take());
        self.workstream = patch.workstream.clone().resolve(self.workstream.take());
        self.started_at = patch.started_at.clone().resolve(self.started_at.take());
        self.completed_at = patch.completed_at.clone().resolve(self.completed_at.take());
        self.updated_at = Utc::now();
    }
}

/// Fields for creating a work item.
#[derive(Debug, Clone)]
pub struct NewWorkItem {
    pub queue_id: Uuid,
    pub title: String,
    pub description: String,
    pub payload: serde_json::Value,
    pub parent_item_id: Option<Uuid>,
    pub depends_on: Vec<Uuid>,
    pub blocked_by: Vec<Uuid>,
    pub created_by: Option<Identity>,
    /// Falls back to the queue's default priority.
    pub priority: Option<i32>,
    pub tags: Vec<String>,
    pub max_retries: Option<i32>,
    pub deadline: Option<DateTime<Utc>>,
    pub workstream: Option<String>,
}

impl NewWorkItem {
    pub fn new(queue_id: Uuid, title: impl Into<String>) -> Self {
        Self {
            queue_id,
            title: title.into(),
            description: String::new(),
            payload: serde_json::Value::Null,
            parent_item_id: None,
            depends_on: Vec::new(),
            blocked_by: Vec::new(),
            created_by: None,
            priority: None,
            tags: Vec::new(),
            max_retries: None,
            deadline: None,
            workstream: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_workstream(mut self, workstream: impl Into<String>) -> Self {
        self.workstream = Some(workstream.into());
        self
    }

    pub fn with_max_retries(mut self, max_retries: i32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn blocked_on(mut self, blockers: Vec<Uuid>) -> Self {
        self.blocked_by = blockers;
        self
    }
}

/// Tri-state wrapper for nullable columns in a partial update.
///
/// "Field omitted" (`Keep`) and "field explicitly cleared" (`Clear`) are
/// distinct on purpose: recovery relies on clearing `assigned_to` and
/// `started_at` without touching anything else.
#[derive(Debug, Clone, PartialEq)]
pub enum Field<T> {
    Keep,
    Clear,
    Set(T),
}

impl<T> Field<T> {
    pub fn is_keep(&self) -> bool {
        matches!(self, Field::Keep)
    }

    /// Flatten to the stored value: `Keep` falls back to `current`.
    pub fn resolve(self, current: Option<T>) -> Option<T> {
        match self {
            Field::Keep => current,
            Field::Clear => None,
            Field::Set(value) => Some(value),
        }
    }
}

impl<T> Default for Field<T> {
    fn default() -> Self {
        Field::Keep
    }
}

/// Partial update for a work item. Every field defaults to "leave as is".
#[derive(Debug, Clone, Default)]
pub struct WorkItemPatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub payload: Option<serde_json::Value>,
    pub status: Option<WorkItemStatus>,
    pub status_reason: Field<String>,
    pub assigned_to: Field<Identity>,
    pub priority: Option<i32>,
    pub tags: Option<Vec<String>>,
    pub depends_on: Option<Vec<Uuid>>,
    pub blocked_by: Option<Vec<Uuid>>,
    pub result: Field<serde_json::Value>,
    pub error: Field<WorkItemError>,
    pub retry_count: Option<i32>,
    pub max_retries: Field<i32>,
    pub deadline: Field<DateTime<Utc>>,
    pub last_outcome: Field<String>,
    pub workstream: Field<String>,
    pub started_at: Field<DateTime<Utc>>,
    pub completed_at: Field<DateTime<Utc>>,
}

impl WorkItemPatch {
    pub fn status(status: WorkItemStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }
}

/// Options for [`claim_next_item`](crate::db::Database::claim_next_item).
#[derive(Debug, Clone, Default)]
pub struct ClaimOptions {
    /// Restrict claiming to one workstream.
    pub workstream: Option<String>,
}

/// Filter for listing work items.
#[derive(Debug, Clone, Default)]
pub struct WorkItemFilter {
    pub queue_id: Option<Uuid>,
    pub status: Option<WorkItemStatus>,
    pub assigned_to: Option<Identity>,
    pub workstream: Option<String>,
}

impl WorkItemFilter {
    pub fn for_queue(queue_id: Uuid) -> Self {
        Self {
            queue_id: Some(queue_id),
            ..Default::default()
        }
    }

    pub fn with_status(mut self, status: WorkItemStatus) -> Self {
        self.status = Some(status);
        self
    }
}

/// Outcome of one execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Success,
    Error,
}

impl ExecutionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionOutcome::Success => "success",
            ExecutionOutcome::Error => "error",
        }
    }
}

/// Append-only record of one execution attempt. Never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItemExecution {
    pub id: Uuid,
    pub item_id: Uuid,
    pub attempt_number: i32,
    pub session_key: Option<String>,
    pub outcome: ExecutionOutcome,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: i64,
}

/// Fields for recording an execution attempt.
#[derive(Debug, Clone)]
pub struct NewWorkItemExecution {
    pub item_id: Uuid,
    pub attempt_number: i32,
    pub session_key: Option<String>,
    pub outcome: ExecutionOutcome,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

/// Archived conversation transcript for a work item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptRecord {
    pub id: Uuid,
    pub item_id: Uuid,
    pub session_key: Option<String>,
    pub content: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_defaults_to_keep() {
        let patch = WorkItemPatch::default();
        assert!(patch.assigned_to.is_keep());
        assert!(patch.started_at.is_keep());
        assert!(patch.status.is_none());
    }

    #[test]
    fn test_field_resolve() {
        let current = Some("worker-1".to_string());
        assert_eq!(
            Field::Keep.resolve(current.clone()),
            Some("worker-1".to_string())
        );
        assert_eq!(Field::<String>::Clear.resolve(current.clone()), None);
        assert_eq!(
            Field::Set("worker-2".to_string()).resolve(current),
            Some("worker-2".to_string())
        );
    }

    #[test]
    fn test_identity_label() {
        assert_eq!(Identity::for_session("sess-9").label(), "sess-9");
        assert_eq!(Identity::for_agent("agent-1").label(), "agent-1");
        assert_eq!(Identity::default().label(), "unknown");
        // Session key wins when both are present.
        assert_eq!(
            Identity::for_agent("agent-1").with_session("sess-9").label(),
            "sess-9"
        );
    }

    #[test]
    fn test_status_parse_unknown_defaults_to_pending() {
        assert_eq!(parse_item_status("in_progress"), WorkItemStatus::InProgress);
        assert_eq!(parse_item_status("garbage"), WorkItemStatus::Pending);
    }
}
