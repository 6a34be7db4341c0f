//! Continuation manager: per-session state and the continuation decision.
//!
//! Owns a process-local table of managed sessions (turn counters, active
//! goal, signal history) and turns completion events plus detector signals
//! into continuation decisions. The session table is not safe to share
//! across processes; durable state lives in the overseer ledger instead.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::completion::bus::{CompletionHandler, ContinuationDecision};
use crate::completion::event::CompletionEvent;
use crate::completion::signal::{ContinuationSignal, DetectorRegistry};

/// Bus priority the manager registers at: after infrastructure handlers,
/// before default-priority custom handlers.
pub const MANAGER_PRIORITY: i32 = 50;
/// Handler id the manager registers under.
pub const MANAGER_HANDLER_ID: &str = "continuation-manager";

/// Minimum signal confidence for an enqueue decision.
const ENQUEUE_CONFIDENCE_THRESHOLD: f64 = 0.7;
/// Signal history is trimmed once it exceeds this many entries...
const SIGNAL_HISTORY_SOFT_CAP: usize = 100;
/// ...down to the most recent this many.
const SIGNAL_HISTORY_TRIM_TO: usize = 50;

/// Lifecycle status of a session goal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GoalStatus {
    Active,
    Paused,
    Blocked,
    Done,
}

/// A per-session continuation policy. Owned exclusively by the session
/// that declared it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Goal {
    pub max_turns: Option<u32>,
    pub status: GoalStatus,
    pub turns_used: u32,
}

impl Goal {
    pub fn active() -> Self {
        Self {
            max_turns: None,
            status: GoalStatus::Active,
            turns_used: 0,
        }
    }

    pub fn with_max_turns(mut self, max_turns: u32) -> Self {
        self.max_turns = Some(max_turns);
        self
    }

    /// Apply a partial update in place.
    pub fn apply(&mut self, patch: &GoalPatch) {
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(max_turns) = patch.max_turns {
            self.max_turns = Some(max_turns);
        }
        if let Some(turns_used) = patch.turns_used {
            self.turns_used = turns_used;
        }
    }
}

/// Partial goal update carried by a continuation decision.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GoalPatch {
    pub status: Option<GoalStatus>,
    pub max_turns: Option<u32>,
    pub turns_used: Option<u32>,
}

/// State tracked for one session.
#[derive(Debug, Clone)]
pub struct ManagedSession {
    pub session_key: String,
    /// Incremented only on turn-level events.
    pub turn_count: u32,
    pub last_turn_at: Option<DateTime<Utc>>,
    pub goal: Option<Goal>,
    /// Bounded history of detector signals, most recent last.
    pub signals: Vec<ContinuationSignal>,
}

impl ManagedSession {
    fn new(session_key: &str) -> Self {
        Self {
            session_key: session_key.to_string(),
            turn_count: 0,
            last_turn_at: None,
            goal: None,
            signals: Vec::new(),
        }
    }

    fn push_signal(&mut self, signal: ContinuationSignal) {
        self.signals.push(signal);
        if self.signals.len() > SIGNAL_HISTORY_SOFT_CAP {
            let excess = self.signals.len() - SIGNAL_HISTORY_TRIM_TO;
            self.signals.drain(..excess);
        }
    }
}

/// Turns completion events and detector signals into continuation decisions.
pub struct ContinuationManager {
    sessions: RwLock<HashMap<String, ManagedSession>>,
    detectors: Arc<DetectorRegistry>,
}

impl ContinuationManager {
    pub fn new(detectors: Arc<DetectorRegistry>) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            detectors,
        }
    }

    /// Evaluate one completion event against the session it belongs to.
    pub async fn evaluate(&self, event: &CompletionEvent) -> Option<ContinuationDecision> {
        let session_key = event.session_key()?.to_string();

        let mut sessions = self.sessions.write().await;
        let session = sessions
            .entry(session_key.clone())
            .or_insert_with(|| ManagedSession::new(&session_key));

        // Turn bookkeeping lands before any limit check, so the check sees
        // the post-increment count.
        if let CompletionEvent::Turn(turn) = event {
            session.turn_count += 1;
            session.last_turn_at = Some(turn.timestamp);
        }

        if let Some(goal) = &session.goal {
            if goal.status == GoalStatus::Active {
                if let Some(max_turns) = goal.max_turns {
                    // The turn that exceeds the budget short-circuits: a
                    // session with max_turns = N gets its N turns, and the
                    // next one pauses the goal.
                    if session.turn_count > max_turns {
                        // Skip signal evaluation entirely for this event.
                        tracing::debug!(
                            session = %session_key,
                            turn_count = session.turn_count,
                            max_turns,
                            "turn limit reached, pausing goal"
                        );
                        return Some(
                            ContinuationDecision::none()
                                .with_reason(format!("Max turns ({}) reached", max_turns))
                                .with_goal_update(GoalPatch {
                                    status: Some(GoalStatus::Paused),
                                    ..Default::default()
                                }),
                        );
                    }
                }
            }
        }

        let signals = self.detectors.run_all(event).await;
        if signals.is_empty() {
            return None;
        }

        for signal in &signals {
            session.push_signal(signal.clone());
        }

        // Strictly highest confidence wins; ties keep the first encountered.
        let best = signals
            .iter()
            .reduce(|best, s| if s.confidence > best.confidence { s } else { best })?;

        let goal_active = session
            .goal
            .as_ref()
            .is_some_and(|g| g.status == GoalStatus::Active);
        if goal_active && best.confidence >= ENQUEUE_CONFIDENCE_THRESHOLD {
            return Some(
                ContinuationDecision::enqueue(best.suggested_prompt.clone(), best.reason.clone())
                    .with_goal_update(GoalPatch {
                        turns_used: Some(session.turn_count),
                        ..Default::default()
                    }),
            );
        }

        None
    }

    /// Set (or replace) the goal for a session, creating the session record
    /// if needed.
    pub async fn set_session_goal(&self, session_key: &str, goal: Goal) {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .entry(session_key.to_string())
            .or_insert_with(|| ManagedSession::new(session_key));
        session.goal = Some(goal);
    }

    /// Clear a session's goal.
    ///
    /// Deletes the whole session record only when no turns have been
    /// counted yet; otherwise the record persists with its turn history.
    pub async fn clear_session_goal(&self, session_key: &str) {
        let mut sessions = self.sessions.write().await;
        let never_turned = match sessions.get(session_key) {
            Some(session) => session.turn_count == 0,
            None => return,
        };
        if never_turned {
            sessions.remove(session_key);
        } else if let Some(session) = sessions.get_mut(session_key) {
            session.goal = None;
        }
    }

    /// Apply a decision's goal patch to the authoritative session record.
    pub async fn apply_goal_update(&self, session_key: &str, patch: &GoalPatch) {
        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get_mut(session_key) {
            if let Some(goal) = session.goal.as_mut() {
                goal.apply(patch);
            }
        }
    }

    /// Snapshot of one session's state.
    pub async fn managed_session(&self, session_key: &str) -> Option<ManagedSession> {
        self.sessions.read().await.get(session_key).cloned()
    }

    /// Snapshot of one session's signal history.
    pub async fn session_signals(&self, session_key: &str) -> Vec<ContinuationSignal> {
        self.sessions
            .read()
            .await
            .get(session_key)
            .map(|s| s.signals.clone())
            .unwrap_or_default()
    }

    /// Drop all session state. Test and operational use only.
    pub async fn reset(&self) {
        self.sessions.write().await.clear();
    }
}

#[async_trait]
impl CompletionHandler for ContinuationManager {
    async fn on_completion(
        &self,
        event: &CompletionEvent,
    ) -> anyhow::Result<Option<ContinuationDecision>> {
        Ok(self.evaluate(event).await)
    }
}
