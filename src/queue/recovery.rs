//! Startup recovery for orphaned work items.
//!
//! A process crash leaves claimed items stranded in `in_progress`. The
//! recovery scan runs once at startup, before any claiming begins, and
//! resets each orphan to `pending` with its claim cleared. Orphans are
//! never silently re-claimed.

use crate::db::Database;
use crate::error::DatabaseError;
use crate::queue::types::{Field, WorkItemFilter, WorkItemPatch, WorkItemStatus};

/// Outcome of one recovery scan.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Orphaned items found.
    pub scanned: usize,
    /// Items reset to pending.
    pub recovered: usize,
    /// Items whose reset failed (logged, not fatal).
    pub failed: usize,
}

/// Reset every orphaned `in_progress` item to `pending`.
///
/// A `None` store, or a store whose schema has never been created, makes
/// this a no-op; the check must not create storage as a side effect. Each
/// item recovers independently: one failure never blocks the rest. Safe to
/// run twice — the second pass finds nothing in progress.
pub async fn recover_orphaned_work_items(
    store: Option<&dyn Database>,
) -> Result<RecoveryReport, DatabaseError> {
    let Some(store) = store else {
        tracing::debug!("no work queue store configured, skipping recovery");
        return Ok(RecoveryReport::default());
    };

    if !store.storage_ready().await? {
        tracing::debug!("work queue storage not created yet, skipping recovery");
        return Ok(RecoveryReport::default());
    }

    let orphans = store
        .list_items(&WorkItemFilter::default().with_status(WorkItemStatus::InProgress))
        .await?;

    let mut report = RecoveryReport {
        scanned: orphans.len(),
        ..Default::default()
    };

    for item in orphans {
        let previous = item
            .assigned_to
            .as_ref()
            .map(|a| a.label())
            .unwrap_or_else(|| "unknown".to_string());

        let patch = WorkItemPatch {
            status: Some(WorkItemStatus::Pending),
            status_reason: Field::Set(format!(
                "Recovered after process restart (was assigned to {})",
                previous
            )),
            assigned_to: Field::Clear,
            started_at: Field::Clear,
            ..Default::default()
        };

        match store.update_item(item.id, &patch).await {
            Ok(_) => {
                tracing::info!(item = %item.id, previous = %previous, "recovered orphaned work item");
                report.recovered += 1;
            }
            Err(e) => {
                tracing::error!(item = %item.id, "failed to recover work item: {}", e);
                report.failed += 1;
            }
        }
    }

    if report.scanned > 0 {
        tracing::info!(
            recovered = report.recovered,
            failed = report.failed,
            "work item recovery finished"
        );
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use crate::queue::types::{ClaimOptions, Identity, NewWorkItem, NewWorkQueue};

    #[tokio::test]
    async fn test_recovery_resets_orphans() {
        let store = MemoryStore::new();
        let queue = store
            .create_queue(&NewWorkQueue::new("agent-1", "Agent 1").with_concurrency_limit(2))
            .await
            .unwrap();
        store
            .create_item(&NewWorkItem::new(queue.id, "one"))
            .await
            .unwrap();
        store
            .create_item(&NewWorkItem::new(queue.id, "two"))
            .await
            .unwrap();

        let identity = Identity::for_agent("agent-1").with_session("sess-7");
        store
            .claim_next_item(queue.id, &identity, &ClaimOptions::default())
            .await
            .unwrap()
            .unwrap();
        store
            .claim_next_item(queue.id, &identity, &ClaimOptions::default())
            .await
            .unwrap()
            .unwrap();

        let report = recover_orphaned_work_items(Some(&store as &dyn Database)).await.unwrap();
        assert_eq!(report, RecoveryReport { scanned: 2, recovered: 2, failed: 0 });

        let pending = store
            .list_items(&WorkItemFilter::for_queue(queue.id).with_status(WorkItemStatus::Pending))
            .await
            .unwrap();
        assert_eq!(pending.len(), 2);
        for item in &pending {
            assert!(item.assigned_to.is_none());
            assert!(item.started_at.is_none());
            assert!(item
                .status_reason
                .as_deref()
                .unwrap()
                .contains("sess-7"));
        }
    }

    #[tokio::test]
    async fn test_recovery_is_idempotent() {
        let store = MemoryStore::new();
        let queue = store
            .create_queue(&NewWorkQueue::new("agent-1", "Agent 1"))
            .await
            .unwrap();
        store
            .create_item(&NewWorkItem::new(queue.id, "one"))
            .await
            .unwrap();
        store
            .claim_next_item(queue.id, &Identity::for_agent("agent-1"), &ClaimOptions::default())
            .await
            .unwrap()
            .unwrap();

        let first = recover_orphaned_work_items(Some(&store as &dyn Database)).await.unwrap();
        assert_eq!(first.recovered, 1);

        // Second pass finds nothing to touch.
        let second = recover_orphaned_work_items(Some(&store as &dyn Database)).await.unwrap();
        assert_eq!(second, RecoveryReport::default());
    }

    #[tokio::test]
    async fn test_recovery_noop_without_store() {
        let report = recover_orphaned_work_items(None).await.unwrap();
        assert_eq!(report, RecoveryReport::default());
    }

    #[tokio::test]
    async fn test_recovery_noop_on_untouched_storage() {
        let store = MemoryStore::new();
        let report = recover_orphaned_work_items(Some(&store as &dyn Database)).await.unwrap();
        assert_eq!(report, RecoveryReport::default());
        assert!(!store.storage_ready().await.unwrap());
    }
}
