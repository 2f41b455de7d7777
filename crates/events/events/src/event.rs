//! Event types and structures.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use crate::error::{EventError, EventResult};

/// Version of the closed event-type enumeration.
pub const SCHEMA_VERSION: &str = "1.0";

/// Event type that resets an operation without a success or failure outcome.
pub const RESET_EVENT_TYPE: &str = "deployment.reset";

const TERMINAL_SUFFIXES: [&str; 3] = [".succeeded", ".failed", ".cancelled"];

/// The kind of logical operation an event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    /// A code or content deployment between environments.
    Deployment,
    /// A database export.
    Export,
    /// A download of an exported artifact.
    Download,
}

impl OperationKind {
    /// Returns the resource-type prefix (e.g., "deployment").
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deployment => "deployment",
            Self::Export => "export",
            Self::Download => "download",
        }
    }

    /// Returns the resource-specific identifier key used in flat payloads.
    pub fn id_key(&self) -> &'static str {
        match self {
            Self::Deployment => "deploymentId",
            Self::Export => "exportId",
            Self::Download => "downloadId",
        }
    }

    /// Parses a resource-type prefix.
    pub fn from_prefix(prefix: &str) -> Option<Self> {
        match prefix {
            "deployment" => Some(Self::Deployment),
            "export" => Some(Self::Export),
            "download" => Some(Self::Download),
            _ => None,
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The closed enumeration of lifecycle event types.
///
/// This is the tag of the event union: every published event carries
/// exactly one of these, and unknown strings are rejected at the boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "deployment.started")]
    DeploymentStarted,
    #[serde(rename = "deployment.in_progress")]
    DeploymentInProgress,
    #[serde(rename = "deployment.awaiting_verification")]
    DeploymentAwaitingVerification,
    #[serde(rename = "deployment.completing")]
    DeploymentCompleting,
    #[serde(rename = "deployment.succeeded")]
    DeploymentSucceeded,
    #[serde(rename = "deployment.failed")]
    DeploymentFailed,
    #[serde(rename = "deployment.cancelled")]
    DeploymentCancelled,
    #[serde(rename = "deployment.reset")]
    DeploymentReset,
    #[serde(rename = "export.started")]
    ExportStarted,
    #[serde(rename = "export.in_progress")]
    ExportInProgress,
    #[serde(rename = "export.succeeded")]
    ExportSucceeded,
    #[serde(rename = "export.failed")]
    ExportFailed,
    #[serde(rename = "export.cancelled")]
    ExportCancelled,
    #[serde(rename = "download.started")]
    DownloadStarted,
    #[serde(rename = "download.in_progress")]
    DownloadInProgress,
    #[serde(rename = "download.succeeded")]
    DownloadSucceeded,
    #[serde(rename = "download.failed")]
    DownloadFailed,
    #[serde(rename = "download.cancelled")]
    DownloadCancelled,
}

impl EventType {
    /// Every known event type, in declaration order.
    pub const ALL: [EventType; 18] = [
        Self::DeploymentStarted,
        Self::DeploymentInProgress,
        Self::DeploymentAwaitingVerification,
        Self::DeploymentCompleting,
        Self::DeploymentSucceeded,
        Self::DeploymentFailed,
        Self::DeploymentCancelled,
        Self::DeploymentReset,
        Self::ExportStarted,
        Self::ExportInProgress,
        Self::ExportSucceeded,
        Self::ExportFailed,
        Self::ExportCancelled,
        Self::DownloadStarted,
        Self::DownloadInProgress,
        Self::DownloadSucceeded,
        Self::DownloadFailed,
        Self::DownloadCancelled,
    ];

    /// Returns the dot-namespaced string form (e.g., "deployment.started").
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DeploymentStarted => "deployment.started",
            Self::DeploymentInProgress => "deployment.in_progress",
            Self::DeploymentAwaitingVerification => "deployment.awaiting_verification",
            Self::DeploymentCompleting => "deployment.completing",
            Self::DeploymentSucceeded => "deployment.succeeded",
            Self::DeploymentFailed => "deployment.failed",
            Self::DeploymentCancelled => "deployment.cancelled",
            Self::DeploymentReset => "deployment.reset",
            Self::ExportStarted => "export.started",
            Self::ExportInProgress => "export.in_progress",
            Self::ExportSucceeded => "export.succeeded",
            Self::ExportFailed => "export.failed",
            Self::ExportCancelled => "export.cancelled",
            Self::DownloadStarted => "download.started",
            Self::DownloadInProgress => "download.in_progress",
            Self::DownloadSucceeded => "download.succeeded",
            Self::DownloadFailed => "download.failed",
            Self::DownloadCancelled => "download.cancelled",
        }
    }

    /// Returns the operation kind this event type belongs to.
    pub fn kind(&self) -> OperationKind {
        match self {
            Self::DeploymentStarted
            | Self::DeploymentInProgress
            | Self::DeploymentAwaitingVerification
            | Self::DeploymentCompleting
            | Self::DeploymentSucceeded
            | Self::DeploymentFailed
            | Self::DeploymentCancelled
            | Self::DeploymentReset => OperationKind::Deployment,
            Self::ExportStarted
            | Self::ExportInProgress
            | Self::ExportSucceeded
            | Self::ExportFailed
            | Self::ExportCancelled => OperationKind::Export,
            Self::DownloadStarted
            | Self::DownloadInProgress
            | Self::DownloadSucceeded
            | Self::DownloadFailed
            | Self::DownloadCancelled => OperationKind::Download,
        }
    }

    /// Checks whether this event type closes an operation's lifecycle.
    pub fn is_terminal(&self) -> bool {
        is_terminal(self.as_str())
    }

    /// Checks if this event type matches a subscription pattern.
    pub fn matches(&self, pattern: &str) -> bool {
        crate::pattern::matches(pattern, self.as_str())
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|et| et.as_str() == s)
            .ok_or_else(|| EventError::Schema(format!("unknown event type '{}'", s)))
    }
}

/// Checks whether an event type string is terminal.
///
/// Terminal types end in `.succeeded`, `.failed` or `.cancelled`, or are the
/// explicit reset type.
pub fn is_terminal(event_type: &str) -> bool {
    event_type == RESET_EVENT_TYPE || TERMINAL_SUFFIXES.iter().any(|s| event_type.ends_with(s))
}

/// Returns the resource type of an event type: the prefix before the first dot.
pub fn resource_type_of(event_type: &str) -> EventResult<&str> {
    match event_type.split_once('.') {
        Some((prefix, _)) if !prefix.is_empty() => Ok(prefix),
        _ => Err(EventError::UnmappableEventType(event_type.to_string())),
    }
}

/// A lifecycle event for one logical operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Event {
    /// The event type.
    pub event_type: EventType,
    /// When the event happened.
    pub timestamp: DateTime<Utc>,
    /// Stable identifier for the operation's entire lifecycle.
    pub operation_id: String,
    /// Operation-specific payload (object).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Free-form context (object).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    /// Project the operation runs in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    /// Environment the operation targets.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
}

impl Event {
    /// Creates a new event stamped with the current time.
    pub fn new(event_type: EventType, operation_id: impl Into<String>) -> Self {
        Self {
            event_type,
            timestamp: Utc::now(),
            operation_id: operation_id.into(),
            data: None,
            metadata: None,
            project: None,
            environment: None,
        }
    }

    /// Sets the timestamp.
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Sets the data payload.
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Sets the metadata.
    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Sets the project.
    pub fn with_project(mut self, project: impl Into<String>) -> Self {
        self.project = Some(project.into());
        self
    }

    /// Sets the environment.
    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = Some(environment.into());
        self
    }

    /// Returns the operation kind.
    pub fn kind(&self) -> OperationKind {
        self.event_type.kind()
    }

    /// Checks whether this event closes its operation's lifecycle.
    pub fn is_terminal(&self) -> bool {
        self.event_type.is_terminal()
    }

    /// Returns the resource URI (e.g., "deployment://dep-1").
    pub fn resource_uri(&self) -> String {
        format!("{}://{}", self.kind(), self.operation_id)
    }

    /// Returns the timestamp in epoch milliseconds.
    pub fn timestamp_millis(&self) -> i64 {
        self.timestamp.timestamp_millis()
    }

    /// Checks the invariants serde cannot enforce.
    pub fn validate(&self) -> EventResult<()> {
        crate::schema::validate_event(self)
    }

    /// Returns a string field from `data`, if present.
    pub fn data_str(&self, key: &str) -> Option<&str> {
        self.data.as_ref()?.get(key)?.as_str()
    }

    /// Returns a string field from `metadata`, falling back to the top-level
    /// field for `project` and `environment`.
    pub fn context_str(&self, key: &str) -> Option<&str> {
        let from_metadata = self.metadata.as_ref().and_then(|m| m.get(key)).and_then(Value::as_str);
        from_metadata.or(match key {
            "project" => self.project.as_deref(),
            "environment" => self.environment.as_deref(),
            _ => None,
        })
    }
}
