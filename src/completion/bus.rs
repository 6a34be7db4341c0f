//! Completion event bus.
//!
//! An ordered registry of handlers. Dispatch walks registrations in
//! ascending priority (stable on insertion order for equal priority) and
//! stops at the first handler that produces an actionable outcome. The bus
//! holds no domain state beyond its registration list; a misbehaving
//! handler is logged and skipped, never allowed to block the others.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::completion::event::{CompletionEvent, CompletionLevel};
use crate::completion::manager::GoalPatch;

/// Default priority for handlers that don't specify one.
pub const DEFAULT_HANDLER_PRIORITY: i32 = 100;

/// What the caller should do after a completion event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionAction {
    /// Enqueue a follow-up prompt for the agent.
    Enqueue,
    /// Nothing to do.
    None,
}

/// The outcome of dispatching a completion event.
#[derive(Debug, Clone, PartialEq)]
pub struct ContinuationDecision {
    pub action: DecisionAction,
    /// Prompt to enqueue when `action` is `Enqueue`.
    pub next_prompt: Option<String>,
    pub reason: Option<String>,
    /// Patch for the caller to apply to the authoritative goal record.
    pub goal_update: Option<GoalPatch>,
}

impl ContinuationDecision {
    /// A decision carrying no action and no side information.
    pub fn none() -> Self {
        Self {
            action: DecisionAction::None,
            next_prompt: None,
            reason: None,
            goal_update: None,
        }
    }

    pub fn enqueue(next_prompt: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            action: DecisionAction::Enqueue,
            next_prompt: Some(next_prompt.into()),
            reason: Some(reason.into()),
            goal_update: None,
        }
    }

    pub fn with_goal_update(mut self, patch: GoalPatch) -> Self {
        self.goal_update = Some(patch);
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// A "none" decision is still actionable when it carries side
    /// information the caller must see.
    pub fn is_actionable(&self) -> bool {
        self.action != DecisionAction::None || self.reason.is_some() || self.goal_update.is_some()
    }
}

/// A handler registered on the bus.
#[async_trait]
pub trait CompletionHandler: Send + Sync {
    /// Inspect a completion event and optionally produce a decision.
    ///
    /// Errors are isolated by the bus: they are logged and dispatch moves
    /// on to the next handler.
    async fn on_completion(
        &self,
        event: &CompletionEvent,
    ) -> anyhow::Result<Option<ContinuationDecision>>;
}

/// Opaque token returned by [`CompletionBus::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegistrationId(Uuid);

/// Options for registering a handler.
#[derive(Debug, Clone, Default)]
pub struct RegisterOptions {
    /// Human-readable identifier used in logs and defaulted reasons.
    pub id: Option<String>,
    /// Ascending priority; lower runs earlier. Defaults to 100.
    pub priority: Option<i32>,
    /// Event levels this handler accepts; `None` accepts all.
    pub levels: Option<Vec<CompletionLevel>>,
}

impl RegisterOptions {
    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            ..Default::default()
        }
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn levels(mut self, levels: Vec<CompletionLevel>) -> Self {
        self.levels = Some(levels);
        self
    }
}

struct Registration {
    token: RegistrationId,
    id: String,
    priority: i32,
    seq: u64,
    levels: Option<Vec<CompletionLevel>>,
    handler: Arc<dyn CompletionHandler>,
}

/// Priority-ordered registry of completion handlers.
pub struct CompletionBus {
    registrations: RwLock<Vec<Registration>>,
    next_seq: AtomicU64,
}

impl CompletionBus {
    pub fn new() -> Self {
        Self {
            registrations: RwLock::new(Vec::new()),
            next_seq: AtomicU64::new(0),
        }
    }

    /// Register a handler; returns a token for [`unregister`](Self::unregister).
    pub async fn register(
        &self,
        handler: Arc<dyn CompletionHandler>,
        opts: RegisterOptions,
    ) -> RegistrationId {
        let token = RegistrationId(Uuid::new_v4());
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let registration = Registration {
            token,
            id: opts.id.unwrap_or_else(|| format!("handler-{}", seq)),
            priority: opts.priority.unwrap_or(DEFAULT_HANDLER_PRIORITY),
            seq,
            levels: opts.levels,
            handler,
        };

        let mut registrations = self.registrations.write().await;
        registrations.push(registration);
        // Stable ordering on (priority, insertion sequence) is part of the
        // observable contract.
        registrations.sort_by_key(|r| (r.priority, r.seq));
        token
    }

    /// Remove a registration. Returns false if it was already gone.
    pub async fn unregister(&self, token: RegistrationId) -> bool {
        let mut registrations = self.registrations.write().await;
        let before = registrations.len();
        registrations.retain(|r| r.token != token);
        registrations.len() < before
    }

    pub async fn handler_count(&self) -> usize {
        self.registrations.read().await.len()
    }

    /// Dispatch an event to handlers in priority order.
    ///
    /// Returns the first actionable decision, or a bare "none" decision if
    /// every handler passed.
    pub async fn dispatch(&self, event: &CompletionEvent) -> ContinuationDecision {
        // Snapshot so handlers can register/unregister during dispatch.
        let snapshot: Vec<(String, Option<Vec<CompletionLevel>>, Arc<dyn CompletionHandler>)> = {
            let registrations = self.registrations.read().await;
            registrations
                .iter()
                .map(|r| (r.id.clone(), r.levels.clone(), Arc::clone(&r.handler)))
                .collect()
        };

        for (id, levels, handler) in snapshot {
            if let Some(levels) = &levels {
                if !levels.contains(&event.level()) {
                    continue;
                }
            }

            match handler.on_completion(event).await {
                Err(e) => {
                    tracing::warn!(handler = %id, "completion handler failed: {e:#}");
                }
                Ok(None) => {}
                Ok(Some(mut decision)) => {
                    if decision.is_actionable() {
                        if decision.reason.is_none() {
                            decision.reason = Some(format!("decided by {}", id));
                        }
                        return decision;
                    }
                    // A bare "none" lets later handlers have a say.
                }
            }
        }

        ContinuationDecision::none()
    }
}

impl Default for CompletionBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::event::TurnCompletion;
    use crate::completion::manager::GoalStatus;
    use std::sync::Mutex;

    struct RecordingHandler {
        name: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
        decision: Option<ContinuationDecision>,
    }

    #[async_trait]
    impl CompletionHandler for RecordingHandler {
        async fn on_completion(
            &self,
            _event: &CompletionEvent,
        ) -> anyhow::Result<Option<ContinuationDecision>> {
            self.log.lock().unwrap().push(self.name);
            Ok(self.decision.clone())
        }
    }

    struct FailingHandler;

    #[async_trait]
    impl CompletionHandler for FailingHandler {
        async fn on_completion(
            &self,
            _event: &CompletionEvent,
        ) -> anyhow::Result<Option<ContinuationDecision>> {
            anyhow::bail!("boom")
        }
    }

    fn turn_event() -> CompletionEvent {
        CompletionEvent::Turn(TurnCompletion::new("s1", Uuid::new_v4()))
    }

    fn recorder(
        name: &'static str,
        log: &Arc<Mutex<Vec<&'static str>>>,
        decision: Option<ContinuationDecision>,
    ) -> Arc<dyn CompletionHandler> {
        Arc::new(RecordingHandler {
            name,
            log: Arc::clone(log),
            decision,
        })
    }

    #[tokio::test]
    async fn test_priority_ordering() {
        let bus = CompletionBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        // Registered out of order on purpose.
        bus.register(
            recorder("p100", &log, None),
            RegisterOptions::with_id("a").priority(100),
        )
        .await;
        bus.register(
            recorder("p25", &log, None),
            RegisterOptions::with_id("b").priority(25),
        )
        .await;
        bus.register(
            recorder("p50", &log, None),
            RegisterOptions::with_id("c").priority(50),
        )
        .await;

        bus.dispatch(&turn_event()).await;
        assert_eq!(*log.lock().unwrap(), vec!["p25", "p50", "p100"]);
    }

    #[tokio::test]
    async fn test_equal_priority_keeps_insertion_order() {
        let bus = CompletionBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        bus.register(recorder("first", &log, None), RegisterOptions::default())
            .await;
        bus.register(recorder("second", &log, None), RegisterOptions::default())
            .await;

        bus.dispatch(&turn_event()).await;
        assert_eq!(*log.lock().unwrap(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_short_circuit_on_enqueue() {
        let bus = CompletionBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        bus.register(
            recorder(
                "decider",
                &log,
                Some(ContinuationDecision::enqueue("go on", "tool failed")),
            ),
            RegisterOptions::with_id("decider").priority(10),
        )
        .await;
        bus.register(
            recorder("later", &log, None),
            RegisterOptions::with_id("later").priority(20),
        )
        .await;

        let decision = bus.dispatch(&turn_event()).await;
        assert_eq!(decision.action, DecisionAction::Enqueue);
        assert_eq!(decision.next_prompt.as_deref(), Some("go on"));
        // The later handler never ran.
        assert_eq!(*log.lock().unwrap(), vec!["decider"]);
    }

    #[tokio::test]
    async fn test_bare_none_does_not_short_circuit() {
        let bus = CompletionBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        bus.register(
            recorder("quiet", &log, Some(ContinuationDecision::none())),
            RegisterOptions::with_id("quiet").priority(10),
        )
        .await;
        bus.register(
            recorder("later", &log, None),
            RegisterOptions::with_id("later").priority(20),
        )
        .await;

        let decision = bus.dispatch(&turn_event()).await;
        assert_eq!(decision, ContinuationDecision::none());
        assert_eq!(*log.lock().unwrap(), vec!["quiet", "later"]);
    }

    #[tokio::test]
    async fn test_none_with_goal_update_short_circuits() {
        let bus = CompletionBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let side_info = ContinuationDecision::none().with_goal_update(GoalPatch {
            status: Some(GoalStatus::Paused),
            ..Default::default()
        });
        bus.register(
            recorder("limiter", &log, Some(side_info)),
            RegisterOptions::with_id("limiter").priority(10),
        )
        .await;
        bus.register(
            recorder("later", &log, None),
            RegisterOptions::with_id("later").priority(20),
        )
        .await;

        let decision = bus.dispatch(&turn_event()).await;
        assert_eq!(decision.action, DecisionAction::None);
        assert!(decision.goal_update.is_some());
        // Side information still carries a defaulted reason.
        assert_eq!(decision.reason.as_deref(), Some("decided by limiter"));
        assert_eq!(*log.lock().unwrap(), vec!["limiter"]);
    }

    #[tokio::test]
    async fn test_failing_handler_is_isolated() {
        let bus = CompletionBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        bus.register(
            Arc::new(FailingHandler),
            RegisterOptions::with_id("broken").priority(10),
        )
        .await;
        bus.register(
            recorder(
                "survivor",
                &log,
                Some(ContinuationDecision::enqueue("next", "still here")),
            ),
            RegisterOptions::with_id("survivor").priority(20),
        )
        .await;

        let decision = bus.dispatch(&turn_event()).await;
        assert_eq!(decision.action, DecisionAction::Enqueue);
        assert_eq!(*log.lock().unwrap(), vec!["survivor"]);
    }

    #[tokio::test]
    async fn test_level_filter() {
        let bus = CompletionBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        bus.register(
            recorder("queue-only", &log, None),
            RegisterOptions::with_id("queue-only").levels(vec![CompletionLevel::Queue]),
        )
        .await;

        bus.dispatch(&turn_event()).await;
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unregister() {
        let bus = CompletionBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let token = bus
            .register(recorder("gone", &log, None), RegisterOptions::default())
            .await;
        assert!(bus.unregister(token).await);
        assert!(!bus.unregister(token).await);

        bus.dispatch(&turn_event()).await;
        assert!(log.lock().unwrap().is_empty());
    }
}
