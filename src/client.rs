//! HTTP client for the planner backend's event-stream endpoint.
//!
//! Opens the persistent `text/event-stream` response body that the
//! connection manager reads frames from. Resumption is requested through
//! the standard `Last-Event-ID` header carrying the last folded sequence.

use bytes::Bytes;
use futures_util::Stream;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT};
use reqwest::Client;
use std::pin::Pin;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::StreamConfig;

/// Errors opening the event stream.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// The HTTP request itself failed.
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    /// The server answered with a non-success status.
    #[error("server returned {status}: {message}")]
    Status { status: u16, message: String },
}

/// A boxed byte stream over the persistent response body.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send>>;

/// Client for the planner event-stream endpoint.
pub struct PlannerApiClient {
    base_url: String,
    headers: HeaderMap,
    client: Client,
}

impl PlannerApiClient {
    /// Build a client from the stream configuration. Header pairs that are
    /// not valid HTTP headers are skipped with a warning.
    pub fn new(config: &StreamConfig) -> Self {
        let mut headers = HeaderMap::new();
        for (name, value) in &config.headers {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    headers.insert(name, value);
                }
                _ => warn!("Skipping invalid custom header: {}", name),
            }
        }

        Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            headers,
            client: Client::new(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Open the event stream for one `(session, plan step)` subscription.
    ///
    /// When `cursor` is set, the server replays only events after that
    /// sequence; the client tolerates duplicates and reordering anyway.
    pub async fn open_stream(
        &self,
        session_id: &str,
        plan_step_id: &str,
        cursor: Option<u64>,
    ) -> Result<ByteStream, ConnectError> {
        let url = format!(
            "{}/v1/sessions/{}/plan-steps/{}/events",
            self.base_url, session_id, plan_step_id
        );
        debug!("Opening planner stream: {} (cursor: {:?})", url, cursor);

        let mut request = self
            .client
            .get(&url)
            .headers(self.headers.clone())
            .header(ACCEPT, "text/event-stream");
        if let Some(cursor) = cursor {
            request = request.header("Last-Event-ID", cursor.to_string());
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(ConnectError::Status { status, message });
        }

        Ok(Box::pin(response.bytes_stream()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let config = StreamConfig::new("http://localhost:8000/");
        let client = PlannerApiClient::new(&config);
        assert_eq!(client.base_url(), "http://localhost:8000");
    }

    #[test]
    fn test_custom_headers_built() {
        let config = StreamConfig::new("http://localhost:8000")
            .with_header("Authorization", "Bearer abc")
            .with_header("X-Timezone", "Europe/Berlin");
        let client = PlannerApiClient::new(&config);
        assert_eq!(client.headers.len(), 2);
        assert_eq!(
            client.headers.get("authorization").unwrap(),
            "Bearer abc"
        );
    }

    #[test]
    fn test_invalid_header_skipped() {
        let config = StreamConfig::new("http://localhost:8000")
            .with_header("bad header name", "x")
            .with_header("X-Ok", "y");
        let client = PlannerApiClient::new(&config);
        assert_eq!(client.headers.len(), 1);
    }

    #[tokio::test]
    async fn test_open_stream_with_unreachable_server() {
        let config = StreamConfig::new("http://127.0.0.1:1");
        let client = PlannerApiClient::new(&config);
        let result = client.open_stream("sess", "step", None).await;
        assert!(matches!(result, Err(ConnectError::Http(_))));
    }
}
