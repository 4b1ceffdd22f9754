//! Event log merging and live-status projection.
//!
//! `apply` is a pure fold: it never mutates the prior summary, so readers
//! holding an old snapshot stay consistent while a new one is built.
//! Deduplication is strictly by sequence equality; ordering authority is
//! append order after the incoming batch is sequence-sorted, so a
//! later-sequence event always wins for a stage even when its status
//! looks "less advanced".

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::models::{EventKind, ExpectedStage, StreamEvent, StreamSummary, SubagentState};

/// Fold a batch of events into a new summary.
///
/// Idempotent and order-insensitive with respect to already-applied
/// sequences: any event whose sequence is already in the log is a no-op.
pub fn apply(prior: &StreamSummary, batch: &[StreamEvent]) -> StreamSummary {
    let mut next = prior.clone();

    let mut fresh: Vec<&StreamEvent> = Vec::new();
    for event in batch {
        if next.contains_sequence(event.sequence)
            || fresh.iter().any(|e| e.sequence == event.sequence)
        {
            continue;
        }
        fresh.push(event);
    }
    fresh.sort_by_key(|e| e.sequence);

    for event in fresh {
        let pos = next
            .events
            .binary_search_by_key(&event.sequence, |e| e.sequence)
            .unwrap_err();
        next.events.insert(pos, event.clone());
        apply_one(&mut next, event);
    }

    next.last_sequence = next.events.last().map(|e| e.sequence);
    next
}

/// Merge caller-supplied expected stages and planner context into an
/// existing summary without discarding already-applied event data.
pub fn seed_expected_stages(
    prior: &StreamSummary,
    stages: &[ExpectedStage],
    planner_context: Option<&Value>,
) -> StreamSummary {
    let mut next = prior.clone();
    let now = Utc::now();

    for stage in stages {
        if stage.key.is_empty() {
            continue;
        }
        upsert_pending(&mut next, &stage.key, stage.result_key.as_deref(), now);
    }

    if next.planner_context.is_none() {
        if let Some(ctx) = planner_context {
            next.planner_context = Some(ctx.clone());
        }
    }

    next
}

fn apply_one(summary: &mut StreamSummary, event: &StreamEvent) {
    match &event.kind {
        EventKind::StepStarted => apply_step_started(summary, event),
        EventKind::SubagentResult => apply_subagent_result(summary, event),
        EventKind::PlanStepCompleted => {
            if let Some(status) = content_str(&event.content, &["status"]) {
                summary.step_status = Some(status.to_string());
            }
            if let Some(payload) = event.content.get("payload").filter(|p| p.is_object()) {
                summary.completed_payload = Some(payload.clone());
            }
        }
        EventKind::Other(_) => {
            if let Some(status) = content_str(&event.content, &["status"]) {
                summary.step_status = Some(status.to_string());
            }
        }
    }
}

fn apply_step_started(summary: &mut StreamSummary, event: &StreamEvent) {
    if let Some(expected) = event
        .content
        .get("expected_subagents")
        .and_then(Value::as_array)
    {
        for entry in expected {
            let Some(key) = entry.get("key").and_then(Value::as_str).filter(|k| !k.is_empty())
            else {
                continue;
            };
            let result_key = content_str(entry, &["result_key", "resultKey"]);
            upsert_pending(summary, key, result_key, event.timestamp);
        }
    }

    // Explicit null is meaningful: the backend cleared the context.
    if let Some(ctx) = event.content.get("planner_context") {
        summary.planner_context = Some(ctx.clone());
    }

    if let Some(status) = content_str(&event.content, &["status"]) {
        summary.step_status = Some(status.to_string());
    }
}

fn apply_subagent_result(summary: &mut StreamSummary, event: &StreamEvent) {
    let Some(key) = content_str(&event.content, &["stage", "subagent", "key"]) else {
        // No stage key anywhere; nothing to attribute the result to.
        return;
    };
    let key = key.to_string();

    if !summary.subagents_by_key.contains_key(&key) {
        summary.subagent_order.push(key.clone());
        summary.subagents_by_key.insert(
            key.clone(),
            SubagentState::pending(key.clone(), event.timestamp),
        );
    }
    let entry = summary
        .subagents_by_key
        .get_mut(&key)
        .expect("stage entry just ensured");

    if let Some(status) = content_str(&event.content, &["status"]) {
        entry.status = status.to_string();
    }
    if let Some(result_key) = content_str(&event.content, &["resultKey", "result_key"]) {
        entry.result_key = Some(result_key.to_string());
    }

    let incoming_revision = event.content.get("revision").and_then(as_revision);
    let stale_revision = matches!(
        (entry.revision, incoming_revision),
        (Some(existing), Some(incoming)) if incoming < existing
    );
    if !stale_revision {
        if let Some(payload) = event.content.get("payload").filter(|p| p.is_object()) {
            entry.payload = Some(payload.clone());
        }
        if incoming_revision.is_some() {
            entry.revision = incoming_revision;
        }
    }

    if telemetry_is_meaningful(&event.telemetry) {
        entry.telemetry = Some(event.telemetry.clone());
    }
    entry.last_updated = event.timestamp;

    // overall_status takes precedence over status for the step-level view.
    if let Some(status) = content_str(&event.content, &["overall_status", "status"]) {
        summary.step_status = Some(status.to_string());
    }
}

/// Create a pending entry for a newly named stage, or preserve-and-update
/// an existing one. Hydration never regresses state a later-processed
/// event already advanced: status, payload, and revision stay untouched,
/// and the result key is only filled in when missing.
fn upsert_pending(
    summary: &mut StreamSummary,
    key: &str,
    result_key: Option<&str>,
    timestamp: DateTime<Utc>,
) {
    if let Some(existing) = summary.subagents_by_key.get_mut(key) {
        if existing.result_key.is_none() {
            existing.result_key = result_key.map(str::to_string);
        }
        return;
    }

    let mut state = SubagentState::pending(key.to_string(), timestamp);
    state.result_key = result_key.map(str::to_string);
    summary.subagent_order.push(key.to_string());
    summary.subagents_by_key.insert(key.to_string(), state);
}

/// First present non-empty string field among aliases.
fn content_str<'a>(content: &'a Value, names: &[&str]) -> Option<&'a str> {
    names
        .iter()
        .find_map(|name| content.get(*name))
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
}

fn as_revision(value: &Value) -> Option<i64> {
    if let Some(n) = value.as_i64() {
        return Some(n);
    }
    value
        .as_f64()
        .filter(|f| f.is_finite())
        .map(|f| f as i64)
}

fn telemetry_is_meaningful(telemetry: &Value) -> bool {
    match telemetry {
        Value::Null => false,
        Value::Object(map) => !map.is_empty(),
        _ => true,
    }
}
