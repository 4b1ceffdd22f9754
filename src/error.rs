//! Stream-level error types.
//!
//! These errors are surfaced to the caller as readable state, never
//! thrown through the projection: a stream error leaves already-projected
//! data untouched.

use std::fmt;

/// Errors visible on the planner event stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    /// Establishing the stream connection failed.
    ConnectionFailed { message: String },

    /// An established stream dropped mid-read.
    ConnectionLost { message: String },

    /// The server ended the response body.
    ServerClosed { reason: Option<String> },

    /// The server rejected the stream request with an HTTP error status.
    HttpStatus { status: u16, message: String },

    /// The backend reported an error via an `error` frame.
    Backend { message: String },

    /// The reconnect budget was exhausted (only with a configured cap).
    RetriesExhausted { attempts: u32 },
}

impl StreamError {
    /// Whether the connection manager schedules a backoff reconnect for
    /// this error. Every transport-level failure is retried, including
    /// HTTP error statuses; backend-reported errors are informational and
    /// never reach the reconnect path, and an exhausted retry budget ends
    /// it.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StreamError::ConnectionFailed { .. }
                | StreamError::ConnectionLost { .. }
                | StreamError::ServerClosed { .. }
                | StreamError::HttpStatus { .. }
        )
    }

    /// Short error code for logging.
    pub fn error_code(&self) -> &'static str {
        match self {
            StreamError::ConnectionFailed { .. } => "E_STREAM_CONNECT",
            StreamError::ConnectionLost { .. } => "E_STREAM_LOST",
            StreamError::ServerClosed { .. } => "E_STREAM_CLOSED",
            StreamError::HttpStatus { .. } => "E_STREAM_HTTP",
            StreamError::Backend { .. } => "E_STREAM_BACKEND",
            StreamError::RetriesExhausted { .. } => "E_STREAM_RETRIES",
        }
    }

    /// User-facing description.
    pub fn user_message(&self) -> String {
        match self {
            StreamError::ConnectionFailed { .. } | StreamError::ConnectionLost { .. } => {
                "Connection to the planner feed was lost. Reconnecting...".to_string()
            }
            StreamError::ServerClosed { reason } => match reason {
                Some(r) => format!("Server closed the stream: {}", r),
                None => "Server closed the stream.".to_string(),
            },
            StreamError::HttpStatus { status, .. } => {
                format!("Server refused the stream request ({}).", status)
            }
            StreamError::Backend { message } => format!("Planner error: {}", message),
            StreamError::RetriesExhausted { attempts } => {
                format!("Gave up reconnecting after {} attempts.", attempts)
            }
        }
    }
}

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamError::ConnectionFailed { message } => {
                write!(f, "Stream connection failed: {}", message)
            }
            StreamError::ConnectionLost { message } => {
                write!(f, "Stream connection lost: {}", message)
            }
            StreamError::ServerClosed { reason } => match reason {
                Some(r) => write!(f, "Server closed stream: {}", r),
                None => write!(f, "Server closed stream"),
            },
            StreamError::HttpStatus { status, message } => {
                write!(f, "Server error ({}): {}", status, message)
            }
            StreamError::Backend { message } => write!(f, "Backend error: {}", message),
            StreamError::RetriesExhausted { attempts } => {
                write!(f, "Reconnect retries exhausted after {} attempts", attempts)
            }
        }
    }
}

impl std::error::Error for StreamError {}
