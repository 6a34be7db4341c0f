//! Assignment ledger types.
//!
//! An assignment is the overseer's durable record of one active piece of
//! delegated work, distinct from a work item. At most one non-terminal
//! assignment per session is considered current; lookups exclude `done`
//! and `cancelled`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::completion::event::{ReportedStatus, StructuredReport};

/// Lifecycle status of an assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentStatus {
    Dispatched,
    Active,
    Stalled,
    Blocked,
    Done,
    Cancelled,
}

impl AssignmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssignmentStatus::Dispatched => "dispatched",
            AssignmentStatus::Active => "active",
            AssignmentStatus::Stalled => "stalled",
            AssignmentStatus::Blocked => "blocked",
            AssignmentStatus::Done => "done",
            AssignmentStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, AssignmentStatus::Done | AssignmentStatus::Cancelled)
    }
}

impl std::fmt::Display for AssignmentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parse a stored status string, defaulting unknown values to dispatched.
pub fn parse_assignment_status(s: &str) -> AssignmentStatus {
    match s {
        "dispatched" => AssignmentStatus::Dispatched,
        "active" => AssignmentStatus::Active,
        "stalled" => AssignmentStatus::Stalled,
        "blocked" => AssignmentStatus::Blocked,
        "done" => AssignmentStatus::Done,
        "cancelled" => AssignmentStatus::Cancelled,
        _ => AssignmentStatus::Dispatched,
    }
}

/// The overseer's durable record of one piece of delegated work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Assignment {
    pub assignment_id: Uuid,
    pub session_key: String,
    pub run_id: Option<Uuid>,
    pub goal_id: Option<Uuid>,
    pub status: AssignmentStatus,
    pub retry_count: i32,
    pub last_retry_at: Option<DateTime<Utc>>,
    pub last_observed_activity_at: Option<DateTime<Utc>>,
    pub blocked_reason: Option<String>,
    pub recovery_policy: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Assignment {
    /// Map a structured agent self-report onto this assignment.
    pub fn apply_report(&mut self, report: &StructuredReport) {
        match report.status {
            Some(ReportedStatus::Working) => {
                self.status = AssignmentStatus::Active;
            }
            Some(ReportedStatus::Blocked) => {
                self.status = AssignmentStatus::Blocked;
                if !report.blockers.is_empty() {
                    self.blocked_reason = Some(report.blockers.join("; "));
                } else if let Some(summary) = &report.summary {
                    self.blocked_reason = Some(summary.clone());
                }
            }
            Some(ReportedStatus::Done) => {
                self.status = AssignmentStatus::Done;
            }
            None => {}
        }
    }
}

/// Fields for creating an assignment.
#[derive(Debug, Clone)]
pub struct NewAssignment {
    pub session_key: String,
    pub run_id: Option<Uuid>,
    pub goal_id: Option<Uuid>,
    pub status: AssignmentStatus,
    pub recovery_policy: Option<String>,
}

impl NewAssignment {
    pub fn new(session_key: impl Into<String>) -> Self {
        Self {
            session_key: session_key.into(),
            run_id: None,
            goal_id: None,
            status: AssignmentStatus::Dispatched,
            recovery_policy: None,
        }
    }

    pub fn with_run_id(mut self, run_id: Uuid) -> Self {
        self.run_id = Some(run_id);
        self
    }

    pub fn with_goal_id(mut self, goal_id: Uuid) -> Self {
        self.goal_id = Some(goal_id);
        self
    }
}

/// Append-only audit log entry. Never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverseerEvent {
    pub id: i64,
    pub ts: DateTime<Utc>,
    /// Dotted event type, e.g. `continuation.turn.tool_error`.
    pub event_type: String,
    pub assignment_id: Uuid,
    pub goal_id: Option<Uuid>,
    pub work_node_id: Option<Uuid>,
    pub data: serde_json::Value,
}

/// Fields for appending an audit entry.
#[derive(Debug, Clone)]
pub struct NewOverseerEvent {
    pub event_type: String,
    pub assignment_id: Uuid,
    pub goal_id: Option<Uuid>,
    pub work_node_id: Option<Uuid>,
    pub data: serde_json::Value,
}

impl NewOverseerEvent {
    pub fn new(event_type: impl Into<String>, assignment: &Assignment) -> Self {
        Self {
            event_type: event_type.into(),
            assignment_id: assignment.assignment_id,
            goal_id: assignment.goal_id,
            work_node_id: None,
            data: serde_json::Value::Null,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assignment() -> Assignment {
        Assignment {
            assignment_id: Uuid::new_v4(),
            session_key: "s1".into(),
            run_id: None,
            goal_id: None,
            status: AssignmentStatus::Dispatched,
            retry_count: 0,
            last_retry_at: None,
            last_observed_activity_at: None,
            blocked_reason: None,
            recovery_policy: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_apply_report_blocked_maps_blockers() {
        let mut a = assignment();
        a.apply_report(&StructuredReport {
            status: Some(ReportedStatus::Blocked),
            summary: Some("waiting".into()),
            blockers: vec!["needs credentials".into(), "rate limit".into()],
        });
        assert_eq!(a.status, AssignmentStatus::Blocked);
        assert_eq!(
            a.blocked_reason.as_deref(),
            Some("needs credentials; rate limit")
        );
    }

    #[test]
    fn test_apply_report_without_status_is_noop_on_status() {
        let mut a = assignment();
        a.apply_report(&StructuredReport {
            status: None,
            summary: Some("halfway there".into()),
            blockers: vec![],
        });
        assert_eq!(a.status, AssignmentStatus::Dispatched);
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(AssignmentStatus::Done.is_terminal());
        assert!(AssignmentStatus::Cancelled.is_terminal());
        assert!(!AssignmentStatus::Stalled.is_terminal());
    }
}
