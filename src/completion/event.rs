//! Completion events emitted when a unit of agent work finishes.
//!
//! Three shapes exist: a single agent turn, a whole run, and a queue drain.
//! The level of an event is fixed at construction; consumers switch
//! exhaustively on the enum.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Which kind of completion an event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionLevel {
    Turn,
    Run,
    Queue,
}

impl CompletionLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompletionLevel::Turn => "turn",
            CompletionLevel::Run => "run",
            CompletionLevel::Queue => "queue",
        }
    }
}

/// The last tool error observed during a turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolErrorInfo {
    pub tool_name: String,
    pub error: String,
}

/// Status an agent reports about itself in a structured self-report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportedStatus {
    Working,
    Blocked,
    Done,
}

/// A structured self-report an agent may attach to a turn completion.
///
/// Applied to the assignment ledger immediately so progress is visible
/// without waiting for the next poll cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StructuredReport {
    pub status: Option<ReportedStatus>,
    pub summary: Option<String>,
    #[serde(default)]
    pub blockers: Vec<String>,
}

/// A single agent turn finished.
#[derive(Debug, Clone)]
pub struct TurnCompletion {
    pub session_key: String,
    pub run_id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// Assistant-produced texts from this turn.
    pub assistant_texts: Vec<String>,
    /// Whether the agent sent output through a messaging tool instead.
    pub sent_via_messaging_tool: bool,
    pub last_tool_error: Option<ToolErrorInfo>,
    pub report: Option<StructuredReport>,
}

impl TurnCompletion {
    pub fn new(session_key: impl Into<String>, run_id: Uuid) -> Self {
        Self {
            session_key: session_key.into(),
            run_id,
            timestamp: Utc::now(),
            assistant_texts: Vec::new(),
            sent_via_messaging_tool: false,
            last_tool_error: None,
            report: None,
        }
    }

    pub fn with_texts(mut self, texts: Vec<String>) -> Self {
        self.assistant_texts = texts;
        self
    }

    pub fn with_tool_error(mut self, tool_name: impl Into<String>, error: impl Into<String>) -> Self {
        self.last_tool_error = Some(ToolErrorInfo {
            tool_name: tool_name.into(),
            error: error.into(),
        });
        self
    }

    pub fn with_report(mut self, report: StructuredReport) -> Self {
        self.report = Some(report);
        self
    }
}

/// A whole agent run finished.
#[derive(Debug, Clone)]
pub struct RunCompletion {
    pub session_key: String,
    pub run_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub model: String,
    pub provider: String,
    /// Whether auto-compaction ran during this run.
    pub auto_compacted: bool,
    /// Number of payloads the run produced.
    pub payload_count: u32,
}

impl RunCompletion {
    pub fn new(session_key: impl Into<String>, run_id: Uuid) -> Self {
        Self {
            session_key: session_key.into(),
            run_id,
            timestamp: Utc::now(),
            model: String::new(),
            provider: String::new(),
            auto_compacted: false,
            payload_count: 0,
        }
    }
}

/// A queue drain pass finished.
#[derive(Debug, Clone)]
pub struct QueueCompletion {
    pub session_key: Option<String>,
    pub queue_key: String,
    pub timestamp: DateTime<Utc>,
    pub items_processed: u32,
    /// Whether the queue became empty during this pass.
    pub queue_empty: bool,
}

impl QueueCompletion {
    pub fn new(queue_key: impl Into<String>) -> Self {
        Self {
            session_key: None,
            queue_key: queue_key.into(),
            timestamp: Utc::now(),
            items_processed: 0,
            queue_empty: false,
        }
    }
}

/// A completion event, tagged by level.
#[derive(Debug, Clone)]
pub enum CompletionEvent {
    Turn(TurnCompletion),
    Run(RunCompletion),
    Queue(QueueCompletion),
}

impl CompletionEvent {
    pub fn level(&self) -> CompletionLevel {
        match self {
            CompletionEvent::Turn(_) => CompletionLevel::Turn,
            CompletionEvent::Run(_) => CompletionLevel::Run,
            CompletionEvent::Queue(_) => CompletionLevel::Queue,
        }
    }

    /// The session this event belongs to, when it carries one.
    pub fn session_key(&self) -> Option<&str> {
        match self {
            CompletionEvent::Turn(t) => Some(&t.session_key),
            CompletionEvent::Run(r) => Some(&r.session_key),
            CompletionEvent::Queue(q) => q.session_key.as_deref(),
        }
    }

    pub fn run_id(&self) -> Option<Uuid> {
        match self {
            CompletionEvent::Turn(t) => Some(t.run_id),
            CompletionEvent::Run(r) => Some(r.run_id),
            CompletionEvent::Queue(_) => None,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            CompletionEvent::Turn(t) => t.timestamp,
            CompletionEvent::Run(r) => r.timestamp,
            CompletionEvent::Queue(q) => q.timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_tagging() {
        let turn = CompletionEvent::Turn(TurnCompletion::new("s1", Uuid::new_v4()));
        assert_eq!(turn.level(), CompletionLevel::Turn);
        assert_eq!(turn.session_key(), Some("s1"));

        let queue = CompletionEvent::Queue(QueueCompletion::new("agent-1"));
        assert_eq!(queue.level(), CompletionLevel::Queue);
        assert_eq!(queue.session_key(), None);
        assert_eq!(queue.run_id(), None);
    }
}
