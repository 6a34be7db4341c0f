//! Overseer continuation bridge.
//!
//! A bus subscriber that maps completion events onto the durable
//! assignment ledger: audit entries, activity timestamps, retry counters,
//! and immediate application of structured self-reports. Registered ahead
//! of the continuation manager so durable state is current before
//! default-priority consumers run, and it never returns a decision, so it
//! cannot interfere with continuation routing.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::completion::bus::{
    CompletionBus, CompletionHandler, ContinuationDecision, RegisterOptions, RegistrationId,
};
use crate::completion::event::{
    CompletionEvent, QueueCompletion, RunCompletion, TurnCompletion,
};
use crate::db::Database;
use crate::error::DatabaseError;
use crate::overseer::ledger::{Assignment, AssignmentStatus, NewOverseerEvent};

/// Bus priority the bridge registers at: before the continuation manager.
pub const BRIDGE_PRIORITY: i32 = 25;
/// Handler id the bridge registers under.
pub const BRIDGE_HANDLER_ID: &str = "overseer-bridge";

/// Why a scheduling tick was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickReason {
    RunCompleted,
    QueueDrained,
    NeedsRecovery,
}

/// An out-of-band request to re-evaluate scheduling state now instead of
/// waiting for the next poll.
#[derive(Debug, Clone)]
pub struct SchedulerTick {
    pub assignment_id: Option<Uuid>,
    pub reason: TickReason,
}

/// Lifecycle hooks invoked as the bridge observes assignment activity.
#[derive(Clone, Default)]
pub struct OverseerHooks {
    /// Called when a turn surfaced a problem (tool error), with a short
    /// issue label.
    pub on_turn_issue: Option<Arc<dyn Fn(&Assignment, &str) + Send + Sync>>,
    /// Called whenever assignment activity is observed.
    pub on_assignment_activity: Option<Arc<dyn Fn(&Assignment) + Send + Sync>>,
}

/// Configuration for the bridge.
#[derive(Clone)]
pub struct OverseerBridgeConfig {
    /// The assignment ledger.
    pub store: Arc<dyn Database>,
    /// Whether run/queue completions request scheduling ticks.
    pub auto_tick: bool,
    /// Where tick requests are sent; dropped silently when absent.
    pub tick_tx: Option<mpsc::Sender<SchedulerTick>>,
    pub hooks: OverseerHooks,
}

impl OverseerBridgeConfig {
    pub fn new(store: Arc<dyn Database>) -> Self {
        Self {
            store,
            auto_tick: true,
            tick_tx: None,
            hooks: OverseerHooks::default(),
        }
    }

    pub fn with_tick_channel(mut self, tick_tx: mpsc::Sender<SchedulerTick>) -> Self {
        self.tick_tx = Some(tick_tx);
        self
    }

    pub fn without_auto_tick(mut self) -> Self {
        self.auto_tick = false;
        self
    }
}

/// The bridge itself; register it on a bus via [`OverseerBridge::start`].
pub struct OverseerBridge {
    config: OverseerBridgeConfig,
}

/// Handle for a started bridge; unregisters on [`stop`](BridgeHandle::stop).
pub struct BridgeHandle {
    bus: Arc<CompletionBus>,
    registration: RegistrationId,
}

impl BridgeHandle {
    pub async fn stop(self) -> bool {
        self.bus.unregister(self.registration).await
    }
}

impl OverseerBridge {
    pub fn new(config: OverseerBridgeConfig) -> Arc<Self> {
        Arc::new(Self { config })
    }

    /// Register the bridge on a bus at priority 25.
    pub async fn start(self: Arc<Self>, bus: &Arc<CompletionBus>) -> BridgeHandle {
        let registration = bus
            .register(
                self as Arc<dyn CompletionHandler>,
                RegisterOptions::with_id(BRIDGE_HANDLER_ID).priority(BRIDGE_PRIORITY),
            )
            .await;
        BridgeHandle {
            bus: Arc::clone(bus),
            registration,
        }
    }

    fn store(&self) -> &Arc<dyn Database> {
        &self.config.store
    }

    /// Locate the tracked assignment for an event: session key first, then
    /// run id. `None` means the event is not for a tracked assignment.
    async fn locate(
        &self,
        session_key: Option<&str>,
        run_id: Option<Uuid>,
    ) -> Result<Option<Assignment>, DatabaseError> {
        if let Some(session_key) = session_key {
            if let Some(assignment) = self
                .store()
                .find_assignment_by_session_key(session_key)
                .await?
            {
                return Ok(Some(assignment));
            }
        }
        if let Some(run_id) = run_id {
            if let Some(assignment) = self.store().find_assignment_by_run_id(run_id).await? {
                return Ok(Some(assignment));
            }
        }
        Ok(None)
    }

    async fn request_tick(&self, assignment_id: Option<Uuid>, reason: TickReason) {
        if !self.config.auto_tick {
            return;
        }
        let Some(tx) = &self.config.tick_tx else {
            return;
        };
        if tx
            .send(SchedulerTick {
                assignment_id,
                reason,
            })
            .await
            .is_err()
        {
            tracing::debug!("tick receiver dropped, scheduling tick lost");
        }
    }

    fn notify_activity(&self, assignment: &Assignment) {
        if let Some(hook) = &self.config.hooks.on_assignment_activity {
            hook(assignment);
        }
    }

    async fn handle_turn(&self, turn: &TurnCompletion) -> Result<(), DatabaseError> {
        let Some(assignment) = self
            .locate(Some(&turn.session_key), Some(turn.run_id))
            .await?
        else {
            return Ok(());
        };

        let had_tool_error = turn.last_tool_error.is_some();
        let silent = turn.assistant_texts.is_empty() && !turn.sent_via_messaging_tool;
        let report = turn.report.clone();
        let now = Utc::now();

        // One read-modify-write covers every ledger mutation for this turn.
        let report_for_mutation = report.clone();
        let updated = self
            .store()
            .with_assignment(
                assignment.assignment_id,
                Box::new(move |a| {
                    if had_tool_error {
                        a.retry_count += 1;
                        a.last_retry_at = Some(now);
                    }
                    a.last_observed_activity_at = Some(now);
                    if a.status == AssignmentStatus::Stalled {
                        a.status = AssignmentStatus::Active;
                    }
                    if let Some(report) = &report_for_mutation {
                        a.apply_report(report);
                    }
                }),
            )
            .await?;
        let Some(updated) = updated else {
            return Ok(());
        };

        if let Some(tool_error) = &turn.last_tool_error {
            self.store()
                .append_overseer_event(
                    &NewOverseerEvent::new("continuation.turn.tool_error", &updated).with_data(
                        serde_json::json!({
                            "tool": tool_error.tool_name,
                            "error": tool_error.error,
                            "retry_count": updated.retry_count,
                        }),
                    ),
                )
                .await?;
            if let Some(hook) = &self.config.hooks.on_turn_issue {
                hook(&updated, "tool_error");
            }
        }

        if silent {
            self.store()
                .append_overseer_event(&NewOverseerEvent::new(
                    "continuation.turn.silent",
                    &updated,
                ))
                .await?;
        }

        if let Some(report) = &report {
            self.store()
                .append_overseer_event(
                    &NewOverseerEvent::new("continuation.turn.self_report", &updated).with_data(
                        serde_json::json!({
                            "status": report.status,
                            "summary": report.summary,
                            "blockers": report.blockers,
                        }),
                    ),
                )
                .await?;
        }

        self.notify_activity(&updated);
        Ok(())
    }

    async fn handle_run(&self, run: &RunCompletion) -> Result<(), DatabaseError> {
        let Some(assignment) = self
            .locate(Some(&run.session_key), Some(run.run_id))
            .await?
        else {
            return Ok(());
        };

        let run_id = run.run_id;
        let now = Utc::now();
        let updated = self
            .store()
            .with_assignment(
                assignment.assignment_id,
                Box::new(move |a| {
                    a.run_id = Some(run_id);
                    a.last_observed_activity_at = Some(now);
                    if matches!(
                        a.status,
                        AssignmentStatus::Stalled | AssignmentStatus::Dispatched
                    ) {
                        a.status = AssignmentStatus::Active;
                    }
                }),
            )
            .await?;
        let Some(updated) = updated else {
            return Ok(());
        };

        self.store()
            .append_overseer_event(
                &NewOverseerEvent::new("continuation.run.completed", &updated).with_data(
                    serde_json::json!({
                        "model": run.model,
                        "provider": run.provider,
                        "auto_compacted": run.auto_compacted,
                        "payload_count": run.payload_count,
                    }),
                ),
            )
            .await?;

        self.notify_activity(&updated);
        self.request_tick(Some(updated.assignment_id), TickReason::RunCompleted)
            .await;
        Ok(())
    }

    async fn handle_queue(&self, queue: &QueueCompletion) -> Result<(), DatabaseError> {
        let Some(assignment) = self.locate(queue.session_key.as_deref(), None).await? else {
            return Ok(());
        };

        let now = Utc::now();
        let updated = self
            .store()
            .with_assignment(
                assignment.assignment_id,
                Box::new(move |a| {
                    a.last_observed_activity_at = Some(now);
                }),
            )
            .await?;
        let Some(updated) = updated else {
            return Ok(());
        };

        self.store()
            .append_overseer_event(
                &NewOverseerEvent::new("continuation.queue.drained", &updated).with_data(
                    serde_json::json!({
                        "queue": queue.queue_key,
                        "items_processed": queue.items_processed,
                        "queue_empty": queue.queue_empty,
                    }),
                ),
            )
            .await?;

        self.notify_activity(&updated);
        if queue.queue_empty {
            self.request_tick(Some(updated.assignment_id), TickReason::QueueDrained)
                .await;
        }
        Ok(())
    }
}

#[async_trait]
impl CompletionHandler for OverseerBridge {
    async fn on_completion(
        &self,
        event: &CompletionEvent,
    ) -> anyhow::Result<Option<ContinuationDecision>> {
        // Ledger faults are logged per level and never propagate to the
        // bus; the bridge never returns a decision.
        match event {
            CompletionEvent::Turn(turn) => {
                if let Err(e) = self.handle_turn(turn).await {
                    tracing::error!(session = %turn.session_key, "overseer turn handling failed: {}", e);
                }
            }
            CompletionEvent::Run(run) => {
                if let Err(e) = self.handle_run(run).await {
                    tracing::error!(session = %run.session_key, "overseer run handling failed: {}", e);
                }
            }
            CompletionEvent::Queue(queue) => {
                if let Err(e) = self.handle_queue(queue).await {
                    tracing::error!(queue = %queue.queue_key, "overseer queue handling failed: {}", e);
                }
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::event::{ReportedStatus, StructuredReport};
    use crate::db::MemoryStore;
    use crate::overseer::ledger::NewAssignment;

    async fn setup() -> (Arc<MemoryStore>, Assignment) {
        let store = Arc::new(MemoryStore::new());
        let assignment = store
            .create_assignment(&NewAssignment::new("s1").with_run_id(Uuid::new_v4()))
            .await
            .unwrap();
        (store, assignment)
    }

    fn bridge(store: Arc<MemoryStore>) -> Arc<OverseerBridge> {
        OverseerBridge::new(OverseerBridgeConfig::new(store))
    }

    #[tokio::test]
    async fn test_tool_error_bumps_retry_and_logs() {
        let (store, assignment) = setup().await;
        let b = bridge(Arc::clone(&store));

        let turn = TurnCompletion::new("s1", Uuid::new_v4())
            .with_texts(vec!["trying again".into()])
            .with_tool_error("shell", "exit status 1");
        b.handle_turn(&turn).await.unwrap();

        let updated = store
            .get_assignment(assignment.assignment_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.retry_count, 1);
        assert!(updated.last_retry_at.is_some());
        assert!(updated.last_observed_activity_at.is_some());

        let events = store
            .list_overseer_events(assignment.assignment_id, 10)
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "continuation.turn.tool_error");
    }

    #[tokio::test]
    async fn test_silent_turn_logged() {
        let (store, assignment) = setup().await;
        let b = bridge(Arc::clone(&store));

        b.handle_turn(&TurnCompletion::new("s1", Uuid::new_v4()))
            .await
            .unwrap();

        let events = store
            .list_overseer_events(assignment.assignment_id, 10)
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "continuation.turn.silent");
    }

    #[tokio::test]
    async fn test_self_report_applied_immediately() {
        let (store, assignment) = setup().await;
        let b = bridge(Arc::clone(&store));

        let turn = TurnCompletion::new("s1", Uuid::new_v4())
            .with_texts(vec!["stuck".into()])
            .with_report(StructuredReport {
                status: Some(ReportedStatus::Blocked),
                summary: Some("waiting on access".into()),
                blockers: vec!["no credentials".into()],
            });
        b.handle_turn(&turn).await.unwrap();

        let updated = store
            .get_assignment(assignment.assignment_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.status, AssignmentStatus::Blocked);
        assert_eq!(updated.blocked_reason.as_deref(), Some("no credentials"));

        let events = store
            .list_overseer_events(assignment.assignment_id, 10)
            .await
            .unwrap();
        assert!(events
            .iter()
            .any(|e| e.event_type == "continuation.turn.self_report"));
    }

    #[tokio::test]
    async fn test_stalled_flips_back_to_active_on_turn() {
        let (store, assignment) = setup().await;
        store
            .with_assignment(
                assignment.assignment_id,
                Box::new(|a| a.status = AssignmentStatus::Stalled),
            )
            .await
            .unwrap();

        let b = bridge(Arc::clone(&store));
        let turn = TurnCompletion::new("s1", Uuid::new_v4()).with_texts(vec!["back".into()]);
        b.handle_turn(&turn).await.unwrap();

        let updated = store
            .get_assignment(assignment.assignment_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.status, AssignmentStatus::Active);
    }

    #[tokio::test]
    async fn test_run_promotes_dispatched_and_ticks() {
        let (store, assignment) = setup().await;
        let (tick_tx, mut tick_rx) = mpsc::channel(4);
        let b = OverseerBridge::new(
            OverseerBridgeConfig::new(Arc::clone(&store) as Arc<dyn Database>)
                .with_tick_channel(tick_tx),
        );

        let run_id = Uuid::new_v4();
        let run = RunCompletion::new("s1", run_id);
        b.handle_run(&run).await.unwrap();

        let updated = store
            .get_assignment(assignment.assignment_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.status, AssignmentStatus::Active);
        assert_eq!(updated.run_id, Some(run_id));

        let tick = tick_rx.recv().await.unwrap();
        assert_eq!(tick.reason, TickReason::RunCompleted);
        assert_eq!(tick.assignment_id, Some(assignment.assignment_id));
    }

    #[tokio::test]
    async fn test_queue_drain_ticks_only_when_empty() {
        let (store, _assignment) = setup().await;
        let (tick_tx, mut tick_rx) = mpsc::channel(4);
        let b = OverseerBridge::new(
            OverseerBridgeConfig::new(Arc::clone(&store) as Arc<dyn Database>)
                .with_tick_channel(tick_tx),
        );

        let mut completion = QueueCompletion::new("agent-1");
        completion.session_key = Some("s1".into());
        completion.items_processed = 3;
        b.handle_queue(&completion).await.unwrap();
        assert!(tick_rx.try_recv().is_err());

        completion.queue_empty = true;
        b.handle_queue(&completion).await.unwrap();
        let tick = tick_rx.recv().await.unwrap();
        assert_eq!(tick.reason, TickReason::QueueDrained);
    }

    #[tokio::test]
    async fn test_untracked_session_is_ignored() {
        let (store, assignment) = setup().await;
        let b = bridge(Arc::clone(&store));

        let turn =
            TurnCompletion::new("someone-else", Uuid::new_v4()).with_tool_error("shell", "boom");
        b.handle_turn(&turn).await.unwrap();

        let untouched = store
            .get_assignment(assignment.assignment_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(untouched.retry_count, 0);
        assert!(store
            .list_overseer_events(assignment.assignment_id, 10)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_bridge_never_returns_decision() {
        let (store, _assignment) = setup().await;
        let b = bridge(store);

        let event = CompletionEvent::Turn(
            TurnCompletion::new("s1", Uuid::new_v4()).with_tool_error("shell", "boom"),
        );
        let decision = b.on_completion(&event).await.unwrap();
        assert!(decision.is_none());
    }

    #[tokio::test]
    async fn test_activity_hook_fires() {
        let (store, _assignment) = setup().await;
        let seen = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let seen_clone = Arc::clone(&seen);

        let mut config = OverseerBridgeConfig::new(Arc::clone(&store) as Arc<dyn Database>);
        config.hooks.on_assignment_activity = Some(Arc::new(move |_assignment: &Assignment| {
            seen_clone.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }));
        let b = OverseerBridge::new(config);

        let turn = TurnCompletion::new("s1", Uuid::new_v4()).with_texts(vec!["hi".into()]);
        b.handle_turn(&turn).await.unwrap();
        assert_eq!(seen.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
