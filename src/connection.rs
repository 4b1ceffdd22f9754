//! Connection lifecycle for one stream subscription.
//!
//! Owns the network read loop: connect, read frames, detect heartbeats
//! and errors, and reconnect with exponential backoff while carrying the
//! resumption cursor. All projected state is published through `watch`
//! channels; a generation token bound at spawn time makes any publish
//! from a superseded worker a silent no-op, so a stale read loop can
//! never double-apply frames after the controller resets or stops.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::client::{ConnectError, PlannerApiClient};
use crate::config::StreamConfig;
use crate::error::StreamError;
use crate::models::{ExpectedStage, StreamEvent, StreamSummary};
use crate::projection;
use crate::sse::{normalize_frame, FrameParser, RawFrame, StreamMessage};

/// Connection lifecycle states for one subscription.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No active subscription (missing identifiers or disabled).
    #[default]
    Idle,
    /// A network attempt is in flight.
    Connecting,
    /// Actively reading frames.
    Open,
    /// A backoff timer is pending before the next attempt.
    Reconnecting { attempt: u32 },
    /// Deliberately stopped; no further reconnection.
    Closed,
    /// A connection attempt failed, or the retry budget ran out. Transient
    /// while reconnection remains enabled.
    Error,
}

impl ConnectionState {
    /// Whether a read loop or backoff timer is live.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting
                | ConnectionState::Open
                | ConnectionState::Reconnecting { .. }
        )
    }

    /// Whether no further transitions will happen without a restart.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Idle | ConnectionState::Closed)
    }
}

/// Stream liveness signals derived from heartbeat frames.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Liveness {
    pub last_heartbeat: Option<DateTime<Utc>>,
    /// Set on the first heartbeat: the server has finished replaying the
    /// backlog and the projection is caught up.
    pub replay_complete: bool,
}

/// Completion callback with a once-per-subscription guard.
#[derive(Clone)]
pub(crate) struct CompletionSignal {
    fired: Arc<AtomicBool>,
    callback: Option<Arc<dyn Fn(&str, Option<&Value>) + Send + Sync>>,
}

impl CompletionSignal {
    pub(crate) fn new(
        fired: Arc<AtomicBool>,
        callback: Option<Arc<dyn Fn(&str, Option<&Value>) + Send + Sync>>,
    ) -> Self {
        Self { fired, callback }
    }

    /// Invoke the callback if it has not fired for this subscription yet.
    pub(crate) fn fire_once(&self, status: &str, payload: Option<&Value>) -> bool {
        if self.fired.swap(true, Ordering::SeqCst) {
            return false;
        }
        if let Some(callback) = &self.callback {
            callback(status, payload);
        }
        true
    }
}

/// State shared between the controller and its worker task.
///
/// Every worker-side publish is gated on the generation it was spawned
/// with; the controller bumps the generation on reset/stop, which turns
/// any late publish from the old worker into a no-op.
pub(crate) struct Shared {
    generation: AtomicU64,
    summary_tx: watch::Sender<Arc<StreamSummary>>,
    state_tx: watch::Sender<ConnectionState>,
    error_tx: watch::Sender<Option<StreamError>>,
    liveness_tx: watch::Sender<Liveness>,
}

impl Shared {
    pub(crate) fn new(
        summary_tx: watch::Sender<Arc<StreamSummary>>,
        state_tx: watch::Sender<ConnectionState>,
        error_tx: watch::Sender<Option<StreamError>>,
        liveness_tx: watch::Sender<Liveness>,
    ) -> Self {
        Self {
            generation: AtomicU64::new(0),
            summary_tx,
            state_tx,
            error_tx,
            liveness_tx,
        }
    }

    /// Invalidate all outstanding workers and return the new generation.
    pub(crate) fn bump_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    pub(crate) fn current_summary(&self) -> Arc<StreamSummary> {
        self.summary_tx.borrow().clone()
    }

    /// Fold a batch into the live summary. The read-modify-write runs
    /// under the watch sender's lock, so it cannot interleave with a
    /// controller-side merge; the generation is re-checked under the same
    /// lock. Returns the new summary, or `None` when superseded.
    pub(crate) fn fold_events(
        &self,
        generation: u64,
        events: &[StreamEvent],
    ) -> Option<Arc<StreamSummary>> {
        let mut folded = None;
        self.summary_tx.send_if_modified(|summary| {
            if self.generation.load(Ordering::SeqCst) != generation {
                return false;
            }
            let next = Arc::new(projection::apply(summary, events));
            *summary = next.clone();
            folded = Some(next);
            true
        });
        folded
    }

    pub(crate) fn set_state(&self, generation: u64, state: ConnectionState) {
        if self.is_current(generation) {
            let _ = self.state_tx.send(state);
        }
    }

    pub(crate) fn set_error(&self, generation: u64, error: StreamError) {
        if self.is_current(generation) {
            let _ = self.error_tx.send(Some(error));
        }
    }

    pub(crate) fn clear_error(&self, generation: u64) {
        if self.is_current(generation) {
            let _ = self.error_tx.send(None);
        }
    }

    pub(crate) fn mark_heartbeat(&self, generation: u64) {
        if self.is_current(generation) {
            let _ = self.liveness_tx.send(Liveness {
                last_heartbeat: Some(Utc::now()),
                replay_complete: true,
            });
        }
    }

    // Controller-side mutations; the controller is the generation
    // authority, so these are not gated.

    pub(crate) fn replace_summary(&self, summary: Arc<StreamSummary>) {
        let _ = self.summary_tx.send(summary);
    }

    /// Merge late-supplied expected stages and planner context into the
    /// live summary, serialized against worker folds by the sender lock
    /// so neither side's fold result is lost.
    pub(crate) fn merge_summary(&self, stages: &[ExpectedStage], context: Option<&Value>) {
        self.summary_tx.send_modify(|summary| {
            *summary = Arc::new(projection::seed_expected_stages(summary, stages, context));
        });
    }

    pub(crate) fn force_state(&self, state: ConnectionState) {
        let _ = self.state_tx.send(state);
    }

    pub(crate) fn reset_runtime(&self) {
        let _ = self.error_tx.send(None);
        let _ = self.liveness_tx.send(Liveness::default());
    }
}

enum FrameOutcome {
    Continue,
    /// Terminal step status with stop-on-completion: close the stream.
    Stop,
}

/// Drive one subscription's connect/read/reconnect cycle until shutdown,
/// a terminal step status (with stop-on-completion), or an exhausted
/// retry budget.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn run_stream_loop(
    client: Arc<PlannerApiClient>,
    config: StreamConfig,
    session_id: String,
    plan_step_id: String,
    initial_cursor: Option<u64>,
    shared: Arc<Shared>,
    generation: u64,
    mut shutdown_rx: watch::Receiver<bool>,
    completion: CompletionSignal,
) {
    let mut attempt: u32 = 0;

    loop {
        if *shutdown_rx.borrow() {
            shared.set_state(generation, ConnectionState::Closed);
            return;
        }

        shared.set_state(generation, ConnectionState::Connecting);
        let cursor = shared.current_summary().last_sequence.or(initial_cursor);

        let connect = tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    shared.set_state(generation, ConnectionState::Closed);
                    return;
                }
                continue;
            }
            result = client.open_stream(&session_id, &plan_step_id, cursor) => result,
        };

        match connect {
            Ok(mut stream) => {
                info!(
                    "Planner stream open for session {} step {} (cursor: {:?})",
                    session_id, plan_step_id, cursor
                );
                attempt = 0;
                shared.clear_error(generation);
                shared.set_state(generation, ConnectionState::Open);

                let mut parser = FrameParser::new();
                let disconnect = 'read: loop {
                    tokio::select! {
                        changed = shutdown_rx.changed() => {
                            if changed.is_err() || *shutdown_rx.borrow() {
                                debug!("Shutdown requested, closing stream");
                                shared.set_state(generation, ConnectionState::Closed);
                                return;
                            }
                        }
                        chunk = stream.next() => match chunk {
                            Some(Ok(bytes)) => {
                                for frame in parser.feed(&bytes) {
                                    if let FrameOutcome::Stop =
                                        handle_frame(&frame, &config, &shared, generation, &completion)
                                    {
                                        return;
                                    }
                                }
                            }
                            Some(Err(e)) => {
                                break 'read StreamError::ConnectionLost { message: e.to_string() };
                            }
                            None => {
                                // Clean end of body; flush a trailing frame
                                // the server may have cut short.
                                if let Some(frame) = parser.finish() {
                                    if let FrameOutcome::Stop =
                                        handle_frame(&frame, &config, &shared, generation, &completion)
                                    {
                                        return;
                                    }
                                }
                                break 'read StreamError::ServerClosed { reason: None };
                            }
                        }
                    }
                };

                warn!("Planner stream dropped: {}", disconnect);
                let retryable = disconnect.is_retryable();
                shared.set_error(generation, disconnect);
                if !retryable {
                    shared.set_state(generation, ConnectionState::Error);
                    return;
                }
            }
            Err(e) => {
                let err = match e {
                    ConnectError::Http(e) => StreamError::ConnectionFailed {
                        message: e.to_string(),
                    },
                    ConnectError::Status { status, message } => {
                        StreamError::HttpStatus { status, message }
                    }
                };
                error!("Planner stream connect failed: {}", err);
                let retryable = err.is_retryable();
                shared.set_error(generation, err);
                shared.set_state(generation, ConnectionState::Error);
                if !retryable {
                    return;
                }
            }
        }

        attempt += 1;
        if let Some(max) = config.max_attempts {
            if attempt > max {
                error!("Giving up on planner stream after {} attempts", max);
                shared.set_error(generation, StreamError::RetriesExhausted { attempts: max });
                shared.set_state(generation, ConnectionState::Error);
                return;
            }
        }

        let delay = config.backoff_delay(attempt);
        info!("Reconnecting to planner stream in {:?} (attempt {})", delay, attempt);
        shared.set_state(generation, ConnectionState::Reconnecting { attempt });

        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    shared.set_state(generation, ConnectionState::Closed);
                    return;
                }
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

fn handle_frame(
    frame: &RawFrame,
    config: &StreamConfig,
    shared: &Shared,
    generation: u64,
    completion: &CompletionSignal,
) -> FrameOutcome {
    match normalize_frame(frame) {
        StreamMessage::Heartbeat => {
            shared.mark_heartbeat(generation);
        }
        StreamMessage::Error(message) => {
            warn!("Backend reported stream error: {}", message);
            shared.set_error(generation, StreamError::Backend { message });
        }
        StreamMessage::Events(events) if !events.is_empty() => {
            let Some(next) = shared.fold_events(generation, &events) else {
                // Superseded mid-frame; drop the batch.
                return FrameOutcome::Continue;
            };

            if let Some(status) = next.step_status.as_deref() {
                if config.is_terminal_status(status) {
                    if shared.is_current(generation) {
                        completion.fire_once(status, next.completed_payload.as_ref());
                    }
                    if config.stop_on_completion {
                        info!("Plan step reached terminal status '{}', closing stream", status);
                        shared.set_state(generation, ConnectionState::Closed);
                        return FrameOutcome::Stop;
                    }
                }
            }
        }
        StreamMessage::Events(_) | StreamMessage::Ignored => {}
    }
    FrameOutcome::Continue
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EventKind;
    use std::sync::Mutex;

    fn tick(sequence: u64) -> StreamEvent {
        StreamEvent {
            session_id: "s".to_string(),
            plan_step_id: "p".to_string(),
            sequence,
            kind: EventKind::Other("tick".to_string()),
            timestamp: Utc::now(),
            content: Value::Null,
            telemetry: Value::Null,
        }
    }

    fn test_shared() -> (
        Arc<Shared>,
        watch::Receiver<Arc<StreamSummary>>,
        watch::Receiver<ConnectionState>,
    ) {
        let (summary_tx, summary_rx) = watch::channel(Arc::new(StreamSummary::new()));
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);
        let (error_tx, _error_rx) = watch::channel(None);
        let (liveness_tx, _liveness_rx) = watch::channel(Liveness::default());
        (
            Arc::new(Shared::new(summary_tx, state_tx, error_tx, liveness_tx)),
            summary_rx,
            state_rx,
        )
    }

    #[test]
    fn test_connection_state_helpers() {
        assert!(ConnectionState::Open.is_active());
        assert!(ConnectionState::Connecting.is_active());
        assert!(ConnectionState::Reconnecting { attempt: 2 }.is_active());
        assert!(!ConnectionState::Idle.is_active());
        assert!(!ConnectionState::Closed.is_active());
        assert!(!ConnectionState::Error.is_active());

        assert!(ConnectionState::Idle.is_terminal());
        assert!(ConnectionState::Closed.is_terminal());
        assert!(!ConnectionState::Error.is_terminal());
        assert!(!ConnectionState::Open.is_terminal());
    }

    #[test]
    fn test_completion_signal_fires_once() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let calls_clone = calls.clone();
        let signal = CompletionSignal::new(
            Arc::new(AtomicBool::new(false)),
            Some(Arc::new(move |status: &str, _payload: Option<&Value>| {
                calls_clone.lock().unwrap().push(status.to_string());
            })),
        );

        assert!(signal.fire_once("success", None));
        assert!(!signal.fire_once("success", None));
        assert!(!signal.fire_once("failed", None));
        assert_eq!(*calls.lock().unwrap(), vec!["success".to_string()]);
    }

    #[test]
    fn test_completion_signal_without_callback() {
        let signal = CompletionSignal::new(Arc::new(AtomicBool::new(false)), None);
        assert!(signal.fire_once("success", None));
        assert!(!signal.fire_once("success", None));
    }

    #[test]
    fn test_stale_generation_fold_discarded() {
        let (shared, summary_rx, state_rx) = test_shared();
        let stale = shared.bump_generation();
        let current = shared.bump_generation();

        shared.set_state(stale, ConnectionState::Open);
        assert_eq!(*state_rx.borrow(), ConnectionState::Idle);

        shared.set_state(current, ConnectionState::Open);
        assert_eq!(*state_rx.borrow(), ConnectionState::Open);

        assert!(shared.fold_events(stale, &[tick(1)]).is_none());
        assert!(summary_rx.borrow().events.is_empty());

        assert!(shared.fold_events(current, &[tick(1)]).is_some());
        assert_eq!(summary_rx.borrow().events.len(), 1);
    }

    #[test]
    fn test_merge_keeps_folded_events() {
        let (shared, summary_rx, _state_rx) = test_shared();
        let generation = shared.bump_generation();

        shared.fold_events(generation, &[tick(3)]);
        shared.merge_summary(
            &[ExpectedStage {
                key: "row_selection".to_string(),
                result_key: None,
            }],
            None,
        );

        let summary = summary_rx.borrow().clone();
        assert_eq!(summary.events.len(), 1);
        assert_eq!(summary.stage("row_selection").unwrap().status, "pending");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_merge_and_fold_lose_nothing() {
        let (shared, summary_rx, _state_rx) = test_shared();
        let generation = shared.bump_generation();

        let folder = {
            let shared = shared.clone();
            tokio::task::spawn_blocking(move || {
                for sequence in 1..=50 {
                    shared.fold_events(generation, &[tick(sequence)]);
                }
            })
        };
        let merger = {
            let shared = shared.clone();
            tokio::task::spawn_blocking(move || {
                for i in 0..50 {
                    shared.merge_summary(
                        &[ExpectedStage {
                            key: format!("stage-{}", i),
                            result_key: None,
                        }],
                        None,
                    );
                }
            })
        };
        folder.await.unwrap();
        merger.await.unwrap();

        // Neither writer's read-modify-write may clobber the other's.
        let summary = summary_rx.borrow().clone();
        assert_eq!(summary.events.len(), 50);
        assert_eq!(summary.subagent_order.len(), 50);
    }

    #[test]
    fn test_force_state_ignores_generation() {
        let (shared, _summary_rx, state_rx) = test_shared();
        shared.bump_generation();
        shared.force_state(ConnectionState::Closed);
        assert_eq!(*state_rx.borrow(), ConnectionState::Closed);
    }

    #[test]
    fn test_handle_frame_terminal_with_stop_on_completion() {
        let (shared, summary_rx, state_rx) = test_shared();
        let generation = shared.bump_generation();
        let config = StreamConfig::new("http://localhost:8000");
        let signal = CompletionSignal::new(Arc::new(AtomicBool::new(false)), None);

        let frame = RawFrame {
            id: None,
            event: Some("planner_stream".to_string()),
            data: Some(
                r#"{"type":"event_batch","events":[{"plan_step_id":"p","sequence":1,"type":"plan_step_completed","content":{"status":"success","payload":{"ok":true}}}]}"#
                    .to_string(),
            ),
        };

        let outcome = handle_frame(&frame, &config, &shared, generation, &signal);
        assert!(matches!(outcome, FrameOutcome::Stop));
        assert_eq!(*state_rx.borrow(), ConnectionState::Closed);
        let summary = summary_rx.borrow().clone();
        assert_eq!(summary.step_status.as_deref(), Some("success"));
        assert_eq!(summary.completed_payload, Some(serde_json::json!({"ok": true})));
    }

    #[test]
    fn test_handle_frame_heartbeat_marks_liveness() {
        let (summary_tx, _summary_rx) = watch::channel(Arc::new(StreamSummary::new()));
        let (state_tx, _state_rx) = watch::channel(ConnectionState::Idle);
        let (error_tx, _error_rx) = watch::channel(None);
        let (liveness_tx, liveness_rx) = watch::channel(Liveness::default());
        let shared = Arc::new(Shared::new(summary_tx, state_tx, error_tx, liveness_tx));
        let generation = shared.bump_generation();
        let config = StreamConfig::new("http://localhost:8000");
        let signal = CompletionSignal::new(Arc::new(AtomicBool::new(false)), None);

        let frame = RawFrame {
            id: None,
            event: Some("heartbeat".to_string()),
            data: None,
        };
        handle_frame(&frame, &config, &shared, generation, &signal);

        let liveness = liveness_rx.borrow().clone();
        assert!(liveness.replay_complete);
        assert!(liveness.last_heartbeat.is_some());
    }
}
