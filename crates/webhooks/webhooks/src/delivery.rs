//! HTTP delivery collaborator and delivery records.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::error::WebhookResult;

/// Per-request options passed to a [`WebhookSender`].
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// Extra request headers.
    pub headers: HashMap<String, String>,
    /// Caller-supplied webhook identifier, sent as `X-Webhook-Id`.
    pub webhook_id: Option<String>,
}

/// Outcome of one delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryResult {
    pub success: bool,
    pub status_code: Option<u16>,
    pub response_time_ms: Option<u64>,
    pub error: Option<String>,
    /// Whether a later attempt might succeed.
    pub retryable: bool,
}

impl DeliveryResult {
    /// A successful attempt.
    pub fn success(status_code: u16, response_time_ms: u64) -> Self {
        Self {
            success: true,
            status_code: Some(status_code),
            response_time_ms: Some(response_time_ms),
            error: None,
            retryable: false,
        }
    }

    /// A failed attempt.
    pub fn failure(error: impl Into<String>, status_code: Option<u16>, retryable: bool) -> Self {
        Self {
            success: false,
            status_code,
            response_time_ms: None,
            error: Some(error.into()),
            retryable,
        }
    }

    /// Sets the response time.
    pub fn with_response_time(mut self, ms: u64) -> Self {
        self.response_time_ms = Some(ms);
        self
    }
}

/// Performs one HTTP delivery attempt.
///
/// Implementations classify failures as retryable or not; an `Err` is an
/// unexpected failure and is never retried.
#[async_trait]
pub trait WebhookSender: Send + Sync {
    async fn send(&self, url: &str, payload: &Value, options: &SendOptions) -> WebhookResult<DeliveryResult>;
}

/// Whether an HTTP status is worth retrying.
pub fn is_retryable_status(status: u16) -> bool {
    status == 408 || status == 429 || (500..600).contains(&status)
}

/// Delivery log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookDelivery {
    /// Queue entry id.
    pub queued_id: String,
    /// Caller-supplied webhook id.
    pub webhook_id: Option<String>,
    pub url: String,
    pub event_type: Option<String>,
    /// 1-based attempt number.
    pub attempt: u32,
    pub success: bool,
    pub status_code: Option<u16>,
    pub response_time_ms: Option<u64>,
    pub error: Option<String>,
    /// Whether this was the last attempt for the entry.
    pub is_final: bool,
    pub timestamp: DateTime<Utc>,
}

#[cfg(feature = "http-client")]
pub use http::ReqwestSender;

#[cfg(feature = "http-client")]
mod http {
    use super::*;
    use std::time::{Duration, Instant};

    /// Default request timeout.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

    /// [`WebhookSender`] backed by `reqwest`.
    pub struct ReqwestSender {
        client: reqwest::Client,
    }

    impl ReqwestSender {
        /// Creates a sender with the default 10 second timeout.
        pub fn new() -> WebhookResult<Self> {
            Self::with_timeout(DEFAULT_TIMEOUT)
        }

        /// Creates a sender with a custom timeout.
        pub fn with_timeout(timeout: Duration) -> WebhookResult<Self> {
            let client = reqwest::Client::builder()
                .timeout(timeout)
                .user_agent(concat!("dxp-webhooks/", env!("CARGO_PKG_VERSION")))
                .build()?;
            Ok(Self { client })
        }
    }

    #[async_trait]
    impl WebhookSender for ReqwestSender {
        async fn send(&self, url: &str, payload: &Value, options: &SendOptions) -> WebhookResult<DeliveryResult> {
            let body = serde_json::to_vec(payload)?;
            let mut request = self
                .client
                .post(url)
                .header("Content-Type", "application/json")
                .body(body);
            if let Some(id) = &options.webhook_id {
                request = request.header("X-Webhook-Id", id);
            }
            for (name, value) in &options.headers {
                request = request.header(name, value);
            }

            let start = Instant::now();
            let result = request.send().await;
            let elapsed = start.elapsed().as_millis() as u64;

            Ok(match result {
                Ok(response) => {
                    let status = response.status().as_u16();
                    if response.status().is_success() {
                        DeliveryResult::success(status, elapsed)
                    } else {
                        let body = response.text().await.unwrap_or_default();
                        let snippet: String = body.chars().take(200).collect();
                        DeliveryResult::failure(
                            format!("HTTP {}: {}", status, snippet),
                            Some(status),
                            is_retryable_status(status),
                        )
                        .with_response_time(elapsed)
                    }
                }
                Err(e) => {
                    let retryable = e.is_timeout() || e.is_connect();
                    DeliveryResult::failure(e.to_string(), None, retryable).with_response_time(elapsed)
                }
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_statuses() {
        for status in [408, 429, 500, 502, 503, 599] {
            assert!(is_retryable_status(status), "{}", status);
        }
        for status in [200, 301, 400, 401, 404, 410, 422] {
            assert!(!is_retryable_status(status), "{}", status);
        }
    }

    #[test]
    fn test_result_constructors() {
        let ok = DeliveryResult::success(204, 12);
        assert!(ok.success && !ok.retryable);
        let failed = DeliveryResult::failure("HTTP 503", Some(503), true).with_response_time(40);
        assert_eq!(failed.response_time_ms, Some(40));
        assert_eq!(failed.error.as_deref(), Some("HTTP 503"));
    }
}
