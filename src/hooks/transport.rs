//! Outbound HTTP for webhook deliveries.
//!
//! The dispatcher only needs "POST this body with these headers and tell me
//! what came back". [`HookTransport`] is that seam; [`ReqwestTransport`] is
//! the production implementation.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;

/// A fully prepared outbound request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
    /// Bytes of the answer body worth reading; the rest is never fetched.
    pub response_limit: usize,
}

/// What the endpoint answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookResponse {
    pub status: u16,
    pub body: String,
}

impl HookResponse {
    /// Any 2xx acknowledges the delivery.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// The request never produced a response.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct TransportError(pub String);

/// Sends prepared webhook requests.
pub trait HookTransport: Send + Sync + 'static {
    fn post(
        &self,
        request: HookRequest,
    ) -> impl Future<Output = Result<HookResponse, TransportError>> + Send;
}

/// Settings for the HTTP client.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub timeout: Duration,
    pub user_agent: String,
}

/// `reqwest`-backed transport.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(config: &TransportConfig) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| TransportError(format!("failed to build HTTP client: {e}")))?;
        Ok(ReqwestTransport { client })
    }
}

impl HookTransport for ReqwestTransport {
    async fn post(&self, request: HookRequest) -> Result<HookResponse, TransportError> {
        let mut builder = self
            .client
            .post(&request.url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(request.body);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let mut response = builder
            .send()
            .await
            .map_err(|e| TransportError(e.to_string()))?;
        let status = response.status().as_u16();

        // The status is the acknowledgement; a body that breaks off is kept as read.
        let mut body = Vec::new();
        while let Ok(Some(chunk)) = response.chunk().await {
            if take_capped(&mut body, &chunk, request.response_limit) {
                break;
            }
        }
        Ok(HookResponse {
            status,
            body: String::from_utf8_lossy(&body).into_owned(),
        })
    }
}

/// Appends what fits of `chunk` under `limit` and reports whether `buf` is full.
fn take_capped(buf: &mut Vec<u8>, chunk: &[u8], limit: usize) -> bool {
    let room = limit.saturating_sub(buf.len());
    buf.extend_from_slice(&chunk[..chunk.len().min(room)]);
    buf.len() >= limit
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_2xx_is_success() {
        let response = |status| HookResponse {
            status,
            body: String::new(),
        };
        assert!(response(200).is_success());
        assert!(response(204).is_success());
        assert!(!response(301).is_success());
        assert!(!response(404).is_success());
        assert!(!response(500).is_success());
    }

    #[test]
    fn body_reading_stops_at_the_limit() {
        let mut buf = Vec::new();
        assert!(!take_capped(&mut buf, b"abc", 8));
        assert!(take_capped(&mut buf, b"defghijk", 8));
        assert_eq!(buf, b"abcdefgh");

        assert!(take_capped(&mut buf, b"more", 8));
        assert_eq!(buf.len(), 8);
    }

    #[test]
    fn zero_limit_keeps_nothing() {
        let mut buf = Vec::new();
        assert!(take_capped(&mut buf, b"ignored", 0));
        assert!(buf.is_empty());
    }

    #[test]
    fn client_builds_from_config() {
        let config = TransportConfig {
            timeout: Duration::from_secs(5),
            user_agent: "stackpilot-test".to_string(),
        };
        assert!(ReqwestTransport::new(&config).is_ok());
    }
}
