//! Resource error types.

use dxp_events::EventError;
use thiserror::Error;

/// Result type for resource operations.
pub type ResourceResult<T> = Result<T, ResourceError>;

/// Error type for the resource manager.
#[derive(Debug, Error)]
pub enum ResourceError {
    /// No resource exists under the URI.
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// The event cannot be projected into a resource.
    #[error("Invalid event: {0}")]
    InvalidEvent(#[from] EventError),

    /// A notifier call failed.
    #[error("Notification failed: {0}")]
    Notification(String),
}
