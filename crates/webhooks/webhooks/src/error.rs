//! Webhook error types.

use dxp_events::EventError;
use thiserror::Error;

/// Result type for webhook operations.
pub type WebhookResult<T> = Result<T, WebhookError>;

/// Error type for webhook operations.
#[derive(Debug, Error)]
pub enum WebhookError {
    /// Target URL rejected by policy.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Custom headers rejected.
    #[error("Invalid headers: {0}")]
    InvalidHeaders(String),

    /// Invalid payload.
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// The retry queue is at capacity.
    #[error("Queue full: {0} webhooks pending")]
    QueueFull(usize),

    /// HTTP error.
    #[error("HTTP error: {0}")]
    HttpError(String),

    /// Timeout.
    #[error("Request timeout")]
    Timeout,

    /// Signing failed.
    #[error("Signature error: {0}")]
    Signature(String),

    /// Event system error.
    #[error(transparent)]
    Event(#[from] EventError),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for WebhookError {
    fn from(err: serde_json::Error) -> Self {
        WebhookError::InvalidPayload(err.to_string())
    }
}

#[cfg(feature = "http-client")]
impl From<reqwest::Error> for WebhookError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            WebhookError::Timeout
        } else {
            WebhookError::HttpError(err.to_string())
        }
    }
}
