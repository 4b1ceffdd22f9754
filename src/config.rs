//! Stream client configuration.
//!
//! Builder-style, following the crate's other configuration types: start
//! from `StreamConfig::new(base_url)` and chain `with_*` calls.

use std::time::Duration;

/// Status values that mean the plan step will emit no further meaningful
/// transitions. Matched case-insensitively.
pub const DEFAULT_TERMINAL_STATUSES: &[&str] = &[
    "success",
    "completed",
    "complete",
    "done",
    "error",
    "failed",
    "failure",
    "cancelled",
    "canceled",
    "timeout",
];

/// Configuration for the planner stream client and its reconnect policy.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Base URL of the planner backend.
    pub base_url: String,
    /// Custom request headers (auth/device/timezone context). Opaque to
    /// this subsystem; forwarded on every (re)connect.
    pub headers: Vec<(String, String)>,
    /// First backoff delay; doubles per consecutive failed attempt.
    pub backoff_base: Duration,
    /// Ceiling on the backoff delay.
    pub backoff_cap: Duration,
    /// Reconnect attempt cap. `None` retries forever with capped backoff.
    pub max_attempts: Option<u32>,
    /// Close the connection once the step reaches a terminal status.
    pub stop_on_completion: bool,
    /// Terminal-status vocabulary; case-insensitive.
    pub terminal_statuses: Vec<String>,
}

impl StreamConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            headers: Vec::new(),
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(30),
            max_attempts: None,
            stop_on_completion: true,
            terminal_statuses: DEFAULT_TERMINAL_STATUSES
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }

    /// Add a custom request header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Set the backoff base delay and cap.
    pub fn with_backoff(mut self, base: Duration, cap: Duration) -> Self {
        self.backoff_base = base;
        self.backoff_cap = cap;
        self
    }

    /// Cap the number of consecutive reconnect attempts.
    pub fn with_max_attempts(mut self, max_attempts: Option<u32>) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Set whether the connection closes on terminal step status.
    pub fn with_stop_on_completion(mut self, stop: bool) -> Self {
        self.stop_on_completion = stop;
        self
    }

    /// Replace the terminal-status vocabulary.
    pub fn with_terminal_statuses<I, S>(mut self, statuses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.terminal_statuses = statuses.into_iter().map(Into::into).collect();
        self
    }

    /// Whether a step status counts as terminal.
    pub fn is_terminal_status(&self, status: &str) -> bool {
        self.terminal_statuses
            .iter()
            .any(|t| t.eq_ignore_ascii_case(status))
    }

    /// Backoff delay before reconnect attempt `attempt` (1-based):
    /// `base * 2^(attempt-1)`, capped.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let delay = self.backoff_base.saturating_mul(1u32 << exponent);
        std::cmp::min(delay, self.backoff_cap)
    }
}
