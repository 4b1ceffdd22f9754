//! Frame payload validation and conversion into canonical events.
//!
//! Sits between the frame parser and the projector: classifies each frame
//! by event name and, for `planner_stream` batches, validates every
//! element individually. Invalid elements are dropped without failing the
//! batch. No ordering or deduplication happens here.

use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use tracing::{debug, warn};

use crate::models::{EventKind, StreamEvent};
use crate::sse::frames::RawFrame;

/// A normalized message derived from one protocol frame.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamMessage {
    /// Liveness signal. Also marks the initial replay window as complete.
    Heartbeat,
    /// Server-reported stream-level error; projected data is untouched.
    Error(String),
    /// Zero or more validated planner events.
    Events(Vec<StreamEvent>),
    /// Frame with an unrecognized event name; skipped.
    Ignored,
}

/// Normalize one frame into a [`StreamMessage`].
pub fn normalize_frame(frame: &RawFrame) -> StreamMessage {
    match frame.event.as_deref() {
        Some("heartbeat") => StreamMessage::Heartbeat,
        Some("error") => StreamMessage::Error(error_message(frame.data.as_deref())),
        Some("planner_stream") => normalize_planner_payload(frame.data.as_deref()),
        Some(other) => {
            debug!("Ignoring frame with unrecognized event name: {}", other);
            StreamMessage::Ignored
        }
        None => StreamMessage::Ignored,
    }
}

/// Extract a readable message from an `error` frame payload, which may be
/// a plain string, a JSON string, or `{"message": ...}`.
fn error_message(data: Option<&str>) -> String {
    let Some(raw) = data else {
        return "stream error".to_string();
    };

    match serde_json::from_str::<Value>(raw) {
        Ok(Value::String(s)) => s,
        Ok(Value::Object(map)) => map
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| raw.to_string()),
        _ => raw.to_string(),
    }
}

fn normalize_planner_payload(data: Option<&str>) -> StreamMessage {
    let Some(raw) = data else {
        return StreamMessage::Ignored;
    };

    let payload: Value = match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(e) => {
            warn!("Dropping unparseable planner_stream payload: {}", e);
            return StreamMessage::Ignored;
        }
    };

    if payload.get("type").and_then(Value::as_str) != Some("event_batch") {
        return StreamMessage::Ignored;
    }

    let Some(elements) = payload.get("events").and_then(Value::as_array) else {
        return StreamMessage::Events(Vec::new());
    };

    let received_at = Utc::now();
    let events = elements
        .iter()
        .filter_map(|element| match validate_event(element, received_at) {
            Some(event) => Some(event),
            None => {
                warn!("Dropping invalid event in batch: {}", element);
                None
            }
        })
        .collect();

    StreamMessage::Events(events)
}

/// Validate one batch element. Requires a finite numeric `sequence` and a
/// non-empty `plan_step_id`; everything else has a tolerant default.
fn validate_event(element: &Value, received_at: DateTime<Utc>) -> Option<StreamEvent> {
    let sequence = field(element, &["sequence"]).and_then(as_sequence)?;

    let plan_step_id = field(element, &["plan_step_id", "planStepId"])
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())?
        .to_string();

    let session_id = field(element, &["session_id", "sessionId"])
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let kind = element
        .get("type")
        .and_then(Value::as_str)
        .map(EventKind::from)
        .unwrap_or_else(|| EventKind::Other(String::new()));

    let timestamp = field(element, &["timestamp"])
        .and_then(parse_timestamp)
        .unwrap_or(received_at);

    Some(StreamEvent {
        session_id,
        plan_step_id,
        sequence,
        kind,
        timestamp,
        content: element.get("content").cloned().unwrap_or(Value::Null),
        telemetry: element.get("telemetry").cloned().unwrap_or(Value::Null),
    })
}

/// First present field among snake_case/camelCase aliases.
fn field<'a>(element: &'a Value, names: &[&str]) -> Option<&'a Value> {
    names.iter().find_map(|name| element.get(*name))
}

/// Accept integer sequences directly and finite non-negative floats by
/// truncation; reject everything else.
fn as_sequence(value: &Value) -> Option<u64> {
    if let Some(n) = value.as_u64() {
        return Some(n);
    }
    value
        .as_f64()
        .filter(|f| f.is_finite() && *f >= 0.0)
        .map(|f| f as u64)
}

/// Parse an RFC 3339 string or epoch-millisecond timestamp.
fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        Value::Number(_) => value
            .as_i64()
            .and_then(|millis| Utc.timestamp_millis_opt(millis).single()),
        _ => None,
    }
}
