//! Public-facing coordinator for one planner stream subscription.
//!
//! Owns a single `(session_id, plan_step_id)` subscription at a time:
//! identity changes reset the projection and re-seed the cursor, while
//! late-arriving expected stages or planner context merge into the
//! existing summary. The controller is the generation authority; a
//! superseded worker's publishes are discarded, so `stop()` always wins
//! over in-flight frames.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::client::PlannerApiClient;
use crate::config::StreamConfig;
use crate::connection::{
    run_stream_loop, CompletionSignal, ConnectionState, Liveness, Shared,
};
use crate::error::StreamError;
use crate::models::{ExpectedStage, StreamSummary};
use crate::projection;

/// Identity of one subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionKey {
    pub session_id: String,
    pub plan_step_id: String,
}

/// Caller-supplied subscription parameters.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionParams {
    pub session_id: String,
    pub plan_step_id: String,
    /// When false, any live connection is torn down and the controller
    /// goes idle.
    pub enabled: bool,
    /// Starting cursor used until the feed advances past it.
    pub initial_cursor: Option<u64>,
    /// Stages known ahead of the feed; hydrated as `pending`.
    pub expected_stages: Option<Vec<ExpectedStage>>,
    pub planner_context: Option<Value>,
}

type CompletionCallback = Arc<dyn Fn(&str, Option<&Value>) + Send + Sync>;

/// Coordinator owning one stream subscription and its worker task.
pub struct StreamSessionController {
    config: StreamConfig,
    client: Arc<PlannerApiClient>,
    shared: Arc<Shared>,
    summary_rx: watch::Receiver<Arc<StreamSummary>>,
    state_rx: watch::Receiver<ConnectionState>,
    error_rx: watch::Receiver<Option<StreamError>>,
    liveness_rx: watch::Receiver<Liveness>,
    shutdown_tx: Option<watch::Sender<bool>>,
    worker: Option<JoinHandle<()>>,
    current: Option<SubscriptionKey>,
    params: Option<SubscriptionParams>,
    completion_fired: Arc<AtomicBool>,
    on_complete: Option<CompletionCallback>,
}

impl StreamSessionController {
    pub fn new(config: StreamConfig) -> Self {
        let client = Arc::new(PlannerApiClient::new(&config));
        let (summary_tx, summary_rx) = watch::channel(Arc::new(StreamSummary::new()));
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);
        let (error_tx, error_rx) = watch::channel(None);
        let (liveness_tx, liveness_rx) = watch::channel(Liveness::default());

        Self {
            config,
            client,
            shared: Arc::new(Shared::new(summary_tx, state_tx, error_tx, liveness_tx)),
            summary_rx,
            state_rx,
            error_rx,
            liveness_rx,
            shutdown_tx: None,
            worker: None,
            current: None,
            params: None,
            completion_fired: Arc::new(AtomicBool::new(false)),
            on_complete: None,
        }
    }

    /// Register the completion callback, invoked exactly once per
    /// subscription lifetime when the step first reaches terminal status.
    pub fn on_completion(
        mut self,
        callback: impl Fn(&str, Option<&Value>) + Send + Sync + 'static,
    ) -> Self {
        self.on_complete = Some(Arc::new(callback));
        self
    }

    /// Apply new subscription parameters.
    ///
    /// An identity change (different session or plan step) fully resets
    /// the projection and re-seeds the cursor. When the identity is
    /// unchanged, late-supplied expected stages and planner context merge
    /// into the live summary without discarding applied events.
    pub fn update(&mut self, params: SubscriptionParams) {
        let key = SubscriptionKey {
            session_id: params.session_id.clone(),
            plan_step_id: params.plan_step_id.clone(),
        };
        let identity_changed = self.current.as_ref() != Some(&key);

        if identity_changed {
            info!(
                "Subscription identity changed to session {} step {}",
                key.session_id, key.plan_step_id
            );
            self.teardown();
            self.shared.reset_runtime();
            self.completion_fired.store(false, Ordering::SeqCst);
            self.current = Some(key);

            let mut summary = StreamSummary::new();
            if params.expected_stages.is_some() || params.planner_context.is_some() {
                summary = projection::seed_expected_stages(
                    &summary,
                    params.expected_stages.as_deref().unwrap_or(&[]),
                    params.planner_context.as_ref(),
                );
            }
            self.shared.replace_summary(Arc::new(summary));
        } else if params.expected_stages.is_some() || params.planner_context.is_some() {
            // Serialized against the worker's folds inside the sender, so
            // a racing event batch cannot drop the merge (or vice versa).
            self.shared.merge_summary(
                params.expected_stages.as_deref().unwrap_or(&[]),
                params.planner_context.as_ref(),
            );
        }

        let has_identity =
            !params.session_id.is_empty() && !params.plan_step_id.is_empty();

        if params.enabled && has_identity {
            if self.worker.is_none() {
                self.spawn_worker(&params);
            }
        } else {
            self.teardown();
            self.shared.force_state(ConnectionState::Idle);
        }

        self.params = Some(params);
    }

    /// Cancel the in-flight read and any pending backoff, and move to
    /// `Closed`. The completion callback cannot fire afterward, even if a
    /// late frame is still in flight.
    pub fn stop(&mut self) {
        self.teardown();
        self.shared.force_state(ConnectionState::Closed);
    }

    /// Tear down any live connection and start a fresh one with the last
    /// known parameters. Does not reset the projection or the
    /// once-per-subscription completion guard.
    pub fn restart(&mut self) {
        let Some(params) = self.params.clone() else {
            debug!("Restart requested without a prior subscription");
            return;
        };
        self.teardown();
        if params.enabled {
            self.spawn_worker(&params);
        }
    }

    /// Snapshot of the live projection.
    pub fn summary(&self) -> Arc<StreamSummary> {
        self.summary_rx.borrow().clone()
    }

    /// Watch the projection for changes.
    pub fn summary_receiver(&self) -> watch::Receiver<Arc<StreamSummary>> {
        self.summary_rx.clone()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state_rx.borrow().clone()
    }

    /// Watch connection state transitions.
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    pub fn last_error(&self) -> Option<StreamError> {
        self.error_rx.borrow().clone()
    }

    pub fn liveness(&self) -> Liveness {
        self.liveness_rx.borrow().clone()
    }

    fn spawn_worker(&mut self, params: &SubscriptionParams) {
        let generation = self.shared.bump_generation();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        self.shutdown_tx = Some(shutdown_tx);

        let completion =
            CompletionSignal::new(self.completion_fired.clone(), self.on_complete.clone());

        self.worker = Some(tokio::spawn(run_stream_loop(
            self.client.clone(),
            self.config.clone(),
            params.session_id.clone(),
            params.plan_step_id.clone(),
            params.initial_cursor,
            self.shared.clone(),
            generation,
            shutdown_rx,
            completion,
        )));
    }

    /// Invalidate the current worker: bump the generation so its pending
    /// publishes are discarded, then signal cooperative shutdown. The
    /// worker exits at its next read boundary; no partial frame is ever
    /// projected.
    fn teardown(&mut self) {
        self.shared.bump_generation();
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(true);
        }
        self.worker = None;
    }
}

impl Drop for StreamSessionController {
    fn drop(&mut self) {
        self.teardown();
    }
}
