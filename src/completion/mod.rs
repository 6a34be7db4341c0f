//! Completion-decision pipeline.
//!
//! After each unit of agent work finishes, the caller emits a completion
//! event here. The bus dispatches it to registered handlers (the overseer
//! bridge, the continuation manager, custom handlers) in priority order and
//! the resulting decision tells the caller whether to enqueue a follow-up
//! prompt.
//!
//! The pipeline is an explicitly-owned registry object: construct one per
//! host process, no process-wide singletons.

pub mod bus;
pub mod event;
pub mod manager;
pub mod signal;

use std::sync::Arc;

use tokio::sync::Mutex;

pub use bus::{
    CompletionBus, CompletionHandler, ContinuationDecision, DecisionAction, RegisterOptions,
    RegistrationId, DEFAULT_HANDLER_PRIORITY,
};
pub use event::{
    CompletionEvent, CompletionLevel, QueueCompletion, ReportedStatus, RunCompletion,
    StructuredReport, ToolErrorInfo, TurnCompletion,
};
pub use manager::{
    ContinuationManager, Goal, GoalPatch, GoalStatus, ManagedSession, MANAGER_HANDLER_ID,
    MANAGER_PRIORITY,
};
pub use signal::{ContinuationSignal, DetectorId, DetectorRegistry, SignalDetector};

/// Owns the bus, the detector registry, and the continuation manager.
pub struct CompletionPipeline {
    bus: Arc<CompletionBus>,
    detectors: Arc<DetectorRegistry>,
    manager: Arc<ContinuationManager>,
    manager_registration: Mutex<Option<RegistrationId>>,
}

impl CompletionPipeline {
    /// Create a pipeline with the built-in detectors and an unregistered
    /// manager. Call [`init_continuation_manager`](Self::init_continuation_manager)
    /// to start routing decisions.
    pub fn new() -> Self {
        let detectors = Arc::new(DetectorRegistry::with_builtins());
        Self {
            bus: Arc::new(CompletionBus::new()),
            manager: Arc::new(ContinuationManager::new(Arc::clone(&detectors))),
            detectors,
            manager_registration: Mutex::new(None),
        }
    }

    pub fn bus(&self) -> &Arc<CompletionBus> {
        &self.bus
    }

    pub fn manager(&self) -> &Arc<ContinuationManager> {
        &self.manager
    }

    /// Register the continuation manager on the bus. Idempotent.
    pub async fn init_continuation_manager(&self) -> RegistrationId {
        let mut registration = self.manager_registration.lock().await;
        if let Some(token) = *registration {
            return token;
        }

        let token = self
            .bus
            .register(
                Arc::clone(&self.manager) as Arc<dyn CompletionHandler>,
                RegisterOptions::with_id(MANAGER_HANDLER_ID).priority(MANAGER_PRIORITY),
            )
            .await;
        *registration = Some(token);
        token
    }

    /// Unregister the continuation manager. Returns false if it wasn't
    /// registered.
    pub async fn stop_continuation_manager(&self) -> bool {
        let mut registration = self.manager_registration.lock().await;
        match registration.take() {
            Some(token) => self.bus.unregister(token).await,
            None => false,
        }
    }

    pub async fn is_manager_initialized(&self) -> bool {
        self.manager_registration.lock().await.is_some()
    }

    /// Emit a turn completion without waiting for the decision.
    ///
    /// Dispatch runs on a background task; the decision is logged and
    /// dropped. Callers that need the decision use the run- or queue-level
    /// emitters.
    pub fn emit_turn_completion(&self, completion: TurnCompletion) {
        let bus = Arc::clone(&self.bus);
        tokio::spawn(async move {
            let session_key = completion.session_key.clone();
            let decision = bus.dispatch(&CompletionEvent::Turn(completion)).await;
            tracing::debug!(
                session = %session_key,
                action = ?decision.action,
                reason = decision.reason.as_deref().unwrap_or(""),
                "turn completion dispatched"
            );
        });
    }

    /// Emit a run completion and return the decision.
    pub async fn emit_run_completion(&self, completion: RunCompletion) -> ContinuationDecision {
        self.bus.dispatch(&CompletionEvent::Run(completion)).await
    }

    /// Emit a queue completion and return the decision.
    pub async fn emit_queue_completion(&self, completion: QueueCompletion) -> ContinuationDecision {
        self.bus.dispatch(&CompletionEvent::Queue(completion)).await
    }

    /// Add a custom signal detector.
    pub async fn register_signal_detector(&self, detector: SignalDetector) -> DetectorId {
        self.detectors.register(detector).await
    }

    pub async fn unregister_signal_detector(&self, id: DetectorId) -> bool {
        self.detectors.unregister(id).await
    }

    /// Restore the built-in detector set.
    pub async fn reset_signal_detectors(&self) {
        self.detectors.reset().await;
    }
}

impl Default for CompletionPipeline {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_manager_init_is_idempotent() {
        let pipeline = CompletionPipeline::new();
        assert!(!pipeline.is_manager_initialized().await);

        let first = pipeline.init_continuation_manager().await;
        let second = pipeline.init_continuation_manager().await;
        assert_eq!(first, second);
        assert_eq!(pipeline.bus().handler_count().await, 1);

        assert!(pipeline.stop_continuation_manager().await);
        assert!(!pipeline.is_manager_initialized().await);
        assert!(!pipeline.stop_continuation_manager().await);
    }

    #[tokio::test]
    async fn test_run_emission_returns_decision() {
        let pipeline = CompletionPipeline::new();
        pipeline.init_continuation_manager().await;

        let decision = pipeline
            .emit_run_completion(RunCompletion::new("s1", Uuid::new_v4()))
            .await;
        assert_eq!(decision.action, DecisionAction::None);
    }

    #[tokio::test]
    async fn test_fire_and_forget_turn_emission() {
        let pipeline = Arc::new(CompletionPipeline::new());
        pipeline.init_continuation_manager().await;

        pipeline.emit_turn_completion(TurnCompletion::new("s1", Uuid::new_v4()));

        // The spawned dispatch lands shortly after.
        for _ in 0..50 {
            if pipeline.manager().managed_session("s1").await.is_some() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        let session = pipeline.manager().managed_session("s1").await.unwrap();
        assert_eq!(session.turn_count, 1);
    }
}
