//! Event error types.

use thiserror::Error;

/// Result type for event operations.
pub type EventResult<T> = Result<T, EventError>;

/// Error type for the event system.
#[derive(Debug, Error)]
pub enum EventError {
    /// Event failed schema validation.
    #[error("Schema error: {0}")]
    Schema(String),

    /// Event type has no resource-type prefix.
    #[error("Cannot map event type to a resource type: {0}")]
    UnmappableEventType(String),

    /// Topic name could not be built.
    #[error("Invalid topic: {0}")]
    InvalidTopic(String),

    /// Configured bus backend is not recognized.
    #[error("Unknown bus type: {0}")]
    UnknownBusType(String),

    /// The shared store could not be reached or dropped the connection.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Operation attempted on a bus that is not initialized or already closed.
    #[error("Bus not ready: {0}")]
    NotReady(String),

    /// Handler execution failed.
    #[error("Handler failed: {0}")]
    HandlerFailed(String),

    /// Event serialization/deserialization error.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for EventError {
    fn from(err: serde_json::Error) -> Self {
        EventError::SerializationError(err.to_string())
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for EventError {
    fn from(err: redis::RedisError) -> Self {
        EventError::Connection(err.to_string())
    }
}
