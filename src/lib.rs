//! Planstream - resumable planner event-stream client
//!
//! Attaches to the backend's long-lived planner step feed, rebuilds an
//! ordered, deduplicated event log from possibly reordered or replayed
//! frames, and projects it into a live `StreamSummary` (per-stage state,
//! overall step status, completion payload). Reconnects with exponential
//! backoff and resumes from the last acknowledged sequence.

pub mod client;
pub mod config;
pub mod connection;
pub mod controller;
pub mod error;
pub mod models;
pub mod projection;
pub mod sse;
