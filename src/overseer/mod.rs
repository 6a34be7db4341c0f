//! Overseer: durable assignment tracking driven by completion events.
//!
//! The bridge subscribes to the completion bus and keeps the assignment
//! ledger current; the functions here are the manual integration points
//! external collaborators use to push state in outside the event pipeline.

pub mod bridge;
pub mod ledger;

use std::sync::Arc;

pub use bridge::{
    BridgeHandle, OverseerBridge, OverseerBridgeConfig, OverseerHooks, SchedulerTick, TickReason,
    BRIDGE_HANDLER_ID, BRIDGE_PRIORITY,
};
pub use ledger::{
    Assignment, AssignmentStatus, NewAssignment, NewOverseerEvent, OverseerEvent,
};

use crate::completion::event::StructuredReport;
use crate::db::Database;
use crate::error::DatabaseError;

/// Apply a structured self-report to a session's current assignment,
/// outside the event pipeline.
///
/// Returns the updated assignment, or `None` when the session has no
/// non-terminal assignment.
pub async fn report_structured_update(
    store: &Arc<dyn Database>,
    session_key: &str,
    report: StructuredReport,
) -> Result<Option<Assignment>, DatabaseError> {
    let Some(assignment) = store.find_assignment_by_session_key(session_key).await? else {
        return Ok(None);
    };

    let report_for_mutation = report.clone();
    let updated = store
        .with_assignment(
            assignment.assignment_id,
            Box::new(move |a| a.apply_report(&report_for_mutation)),
        )
        .await?;
    let Some(updated) = updated else {
        return Ok(None);
    };

    store
        .append_overseer_event(
            &NewOverseerEvent::new("continuation.report.manual", &updated).with_data(
                serde_json::json!({
                    "status": report.status,
                    "summary": report.summary,
                    "blockers": report.blockers,
                }),
            ),
        )
        .await?;
    Ok(Some(updated))
}

/// Flag an assignment as needing recovery: mark it stalled with a reason
/// and log an audit entry. Terminal assignments are left untouched.
pub async fn mark_assignment_needs_recovery(
    store: &Arc<dyn Database>,
    assignment_id: uuid::Uuid,
    reason: &str,
) -> Result<Option<Assignment>, DatabaseError> {
    let reason_for_mutation = reason.to_string();
    let updated = store
        .with_assignment(
            assignment_id,
            Box::new(move |a| {
                if !a.status.is_terminal() {
                    a.status = AssignmentStatus::Stalled;
                    a.blocked_reason = Some(reason_for_mutation);
                }
            }),
        )
        .await?;
    let Some(updated) = updated else {
        return Ok(None);
    };

    store
        .append_overseer_event(
            &NewOverseerEvent::new("assignment.needs_recovery", &updated)
                .with_data(serde_json::json!({ "reason": reason })),
        )
        .await?;
    Ok(Some(updated))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::event::ReportedStatus;
    use crate::db::MemoryStore;

    #[tokio::test]
    async fn test_manual_report() {
        let store: Arc<dyn Database> = Arc::new(MemoryStore::new());
        let assignment = store
            .create_assignment(&NewAssignment::new("s1"))
            .await
            .unwrap();

        let updated = report_structured_update(
            &store,
            "s1",
            StructuredReport {
                status: Some(ReportedStatus::Done),
                summary: Some("finished".into()),
                blockers: vec![],
            },
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(updated.status, AssignmentStatus::Done);

        let events = store
            .list_overseer_events(assignment.assignment_id, 10)
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "continuation.report.manual");

        // Session has no live assignment anymore.
        let missing = report_structured_update(&store, "s1", StructuredReport::default())
            .await
            .unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn test_mark_needs_recovery() {
        let store: Arc<dyn Database> = Arc::new(MemoryStore::new());
        let assignment = store
            .create_assignment(&NewAssignment::new("s1"))
            .await
            .unwrap();

        let updated = mark_assignment_needs_recovery(
            &store,
            assignment.assignment_id,
            "no activity for 20 minutes",
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(updated.status, AssignmentStatus::Stalled);
        assert_eq!(
            updated.blocked_reason.as_deref(),
            Some("no activity for 20 minutes")
        );

        let events = store
            .list_overseer_events(assignment.assignment_id, 10)
            .await
            .unwrap();
        assert_eq!(events[0].event_type, "assignment.needs_recovery");
    }

    #[tokio::test]
    async fn test_mark_needs_recovery_skips_terminal() {
        let store: Arc<dyn Database> = Arc::new(MemoryStore::new());
        let assignment = store
            .create_assignment(&NewAssignment::new("s1"))
            .await
            .unwrap();
        store
            .with_assignment(
                assignment.assignment_id,
                Box::new(|a| a.status = AssignmentStatus::Done),
            )
            .await
            .unwrap();

        let updated =
            mark_assignment_needs_recovery(&store, assignment.assignment_id, "stale")
                .await
                .unwrap()
                .unwrap();
        assert_eq!(updated.status, AssignmentStatus::Done);
    }
}
