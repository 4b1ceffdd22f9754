//! Core data model for the planner event stream.
//!
//! `StreamEvent` is the immutable, wire-derived unit of the log.
//! `SubagentState` and `StreamSummary` are derived state, mutated only by
//! the projector's fold (see [`crate::projection`]).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Kind of a planner stream event.
///
/// Unrecognized type strings are carried through as [`EventKind::Other`]
/// rather than rejected, so new backend event types degrade gracefully.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventKind {
    StepStarted,
    SubagentResult,
    PlanStepCompleted,
    Other(String),
}

impl EventKind {
    /// Returns the wire name of this event kind.
    pub fn as_str(&self) -> &str {
        match self {
            EventKind::StepStarted => "step_started",
            EventKind::SubagentResult => "subagent_result",
            EventKind::PlanStepCompleted => "plan_step_completed",
            EventKind::Other(s) => s,
        }
    }
}

impl From<&str> for EventKind {
    fn from(s: &str) -> Self {
        match s {
            "step_started" => EventKind::StepStarted,
            "subagent_result" => EventKind::SubagentResult,
            "plan_step_completed" => EventKind::PlanStepCompleted,
            other => EventKind::Other(other.to_string()),
        }
    }
}

impl From<String> for EventKind {
    fn from(s: String) -> Self {
        EventKind::from(s.as_str())
    }
}

impl From<EventKind> for String {
    fn from(kind: EventKind) -> Self {
        kind.as_str().to_string()
    }
}

/// One validated event from the planner feed.
///
/// `sequence` is the sole ordering and deduplication key: the server
/// assigns it strictly increasing per `(session_id, plan_step_id)`, and
/// re-applying an already-seen sequence never changes projected state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    pub session_id: String,
    pub plan_step_id: String,
    pub sequence: u64,
    pub kind: EventKind,
    /// Server-reported creation time, or local receipt time when the wire
    /// value was absent or unparseable.
    pub timestamp: DateTime<Utc>,
    /// Opaque structured payload; shape depends on `kind`.
    #[serde(default)]
    pub content: Value,
    /// Opaque telemetry, passed through and never interpreted.
    #[serde(default)]
    pub telemetry: Value,
}

/// A stage the backend announced ahead of time via `step_started`, or that
/// a caller supplies for hydration before the feed catches up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpectedStage {
    pub key: String,
    #[serde(default, alias = "resultKey")]
    pub result_key: Option<String>,
}

/// Live state of one stage (subagent) within a plan step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubagentState {
    pub key: String,
    /// Free-form status string; starts at `"pending"`.
    pub status: String,
    /// Secondary identifier for the stage's output artifact.
    pub result_key: Option<String>,
    /// Latest known result content for this stage.
    pub payload: Option<Value>,
    /// When present, a higher revision is never overwritten by a lower one.
    pub revision: Option<i64>,
    pub last_updated: DateTime<Utc>,
    pub telemetry: Option<Value>,
}

impl SubagentState {
    /// Create a fresh stage entry in `pending` status.
    pub fn pending(key: String, now: DateTime<Utc>) -> Self {
        Self {
            key,
            status: "pending".to_string(),
            result_key: None,
            payload: None,
            revision: None,
            last_updated: now,
            telemetry: None,
        }
    }
}

/// The full projection of one subscription's event log.
///
/// Exclusively owned and mutated by the projector; everyone else reads
/// snapshots. The prior summary is never mutated in place, so a reader
/// holding an old reference always sees a consistent view.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StreamSummary {
    /// Deduplicated event log, ascending by sequence.
    pub events: Vec<StreamEvent>,
    pub subagents_by_key: HashMap<String, SubagentState>,
    /// Insertion-stable ordering of stage keys.
    pub subagent_order: Vec<String>,
    /// Set from the first `step_started` carrying one. `Some(Value::Null)`
    /// means the backend explicitly cleared it.
    pub planner_context: Option<Value>,
    /// Last-seen top-level status string.
    pub step_status: Option<String>,
    /// Terminal result payload from `plan_step_completed`.
    pub completed_payload: Option<Value>,
    /// Highest sequence folded in so far; seeds the resumption cursor.
    pub last_sequence: Option<u64>,
}

impl StreamSummary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether an event with this sequence has already been applied.
    pub fn contains_sequence(&self, sequence: u64) -> bool {
        self.events
            .binary_search_by_key(&sequence, |e| e.sequence)
            .is_ok()
    }

    /// Look up a stage by key.
    pub fn stage(&self, key: &str) -> Option<&SubagentState> {
        self.subagents_by_key.get(key)
    }

    /// Iterate stages in insertion order.
    pub fn stages(&self) -> impl Iterator<Item = &SubagentState> {
        self.subagent_order
            .iter()
            .filter_map(|k| self.subagents_by_key.get(k))
    }
}
