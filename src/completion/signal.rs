//! Continuation signal detectors.
//!
//! A detector is a pure function over one completion event that may emit a
//! confidence-scored hypothesis about whether the agent should continue.
//! Detectors live in an ordered, mutable registry so operators can add
//! custom ones at runtime; `reset` restores exactly the built-ins.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::completion::event::{CompletionEvent, CompletionLevel};

/// Confidence assigned to a tool-error signal.
pub const TOOL_ERROR_CONFIDENCE: f64 = 0.6;
/// Confidence assigned to a silent-completion signal.
pub const SILENT_COMPLETION_CONFIDENCE: f64 = 0.3;

/// A confidence-scored continuation hypothesis. Never mutated once emitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContinuationSignal {
    pub level: CompletionLevel,
    pub reason: String,
    /// In `[0, 1]`.
    pub confidence: f64,
    pub suggested_prompt: String,
}

/// A pure detector function.
pub type SignalDetector =
    Arc<dyn Fn(&CompletionEvent) -> Option<ContinuationSignal> + Send + Sync>;

/// Token returned by [`DetectorRegistry::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DetectorId(Uuid);

/// Ordered, mutable list of detectors.
pub struct DetectorRegistry {
    detectors: RwLock<Vec<(DetectorId, SignalDetector)>>,
}

impl DetectorRegistry {
    /// Create a registry holding the three built-in detectors.
    pub fn with_builtins() -> Self {
        Self {
            detectors: RwLock::new(builtin_detectors()),
        }
    }

    /// Create an empty registry.
    pub fn empty() -> Self {
        Self {
            detectors: RwLock::new(Vec::new()),
        }
    }

    /// Append a detector; returns a token for [`unregister`](Self::unregister).
    pub async fn register(&self, detector: SignalDetector) -> DetectorId {
        let id = DetectorId(Uuid::new_v4());
        self.detectors.write().await.push((id, detector));
        id
    }

    /// Remove a detector. Returns false if it was already gone.
    pub async fn unregister(&self, id: DetectorId) -> bool {
        let mut detectors = self.detectors.write().await;
        let before = detectors.len();
        detectors.retain(|(d, _)| *d != id);
        detectors.len() < before
    }

    /// Restore exactly the built-in detectors, dropping custom ones.
    pub async fn reset(&self) {
        *self.detectors.write().await = builtin_detectors();
    }

    pub async fn len(&self) -> usize {
        self.detectors.read().await.len()
    }

    /// Run every detector against one event, in registration order.
    pub async fn run_all(&self, event: &CompletionEvent) -> Vec<ContinuationSignal> {
        let detectors: Vec<SignalDetector> = {
            let guard = self.detectors.read().await;
            guard.iter().map(|(_, d)| Arc::clone(d)).collect()
        };

        detectors.iter().filter_map(|d| d(event)).collect()
    }
}

fn builtin_detectors() -> Vec<(DetectorId, SignalDetector)> {
    let builtins: Vec<SignalDetector> = vec![
        Arc::new(detect_tool_error),
        Arc::new(detect_silent_completion),
        Arc::new(detect_queue_drained),
    ];
    builtins
        .into_iter()
        .map(|d| (DetectorId(Uuid::new_v4()), d))
        .collect()
}

/// Fires on turn events that carry a tool error.
pub fn detect_tool_error(event: &CompletionEvent) -> Option<ContinuationSignal> {
    let CompletionEvent::Turn(turn) = event else {
        return None;
    };
    let tool_error = turn.last_tool_error.as_ref()?;

    Some(ContinuationSignal {
        level: CompletionLevel::Turn,
        reason: format!("Tool '{}' failed", tool_error.tool_name),
        confidence: TOOL_ERROR_CONFIDENCE,
        suggested_prompt: format!(
            "The '{}' tool call failed with: {}. Review the error and try an alternative approach.",
            tool_error.tool_name, tool_error.error
        ),
    })
}

/// Fires on turn events where the agent produced nothing and sent nothing.
pub fn detect_silent_completion(event: &CompletionEvent) -> Option<ContinuationSignal> {
    let CompletionEvent::Turn(turn) = event else {
        return None;
    };
    if !turn.assistant_texts.is_empty() || turn.sent_via_messaging_tool {
        return None;
    }

    Some(ContinuationSignal {
        level: CompletionLevel::Turn,
        reason: "Turn completed with no output".to_string(),
        confidence: SILENT_COMPLETION_CONFIDENCE,
        suggested_prompt:
            "The last turn produced no visible output. Provide a brief status update on the current task."
                .to_string(),
    })
}

/// Queue-drained detector.
///
/// Not yet wired to goal state; always returns `None` for now. Kept
/// registered so the detector ordering is stable once the wiring lands.
pub fn detect_queue_drained(event: &CompletionEvent) -> Option<ContinuationSignal> {
    let CompletionEvent::Queue(_queue) = event else {
        return None;
    };
    None
}
