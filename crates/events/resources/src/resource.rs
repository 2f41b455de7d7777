//! Resource types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

use dxp_events::Event;

/// MIME type of every resource body.
pub const RESOURCE_MIME_TYPE: &str = "application/json";

/// An addressable projection of one operation's events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
    /// `{resourceType}://{operationId}`.
    pub uri: String,
    pub name: String,
    pub description: String,
    pub mime_type: String,
    /// Accumulated event data plus `eventType` and `lastUpdated`.
    pub state: Value,
    pub metadata: ResourceMetadata,
}

/// Bookkeeping attached to a resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceMetadata {
    pub resource_type: String,
    pub project: Option<String>,
    pub environment: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub is_terminal: bool,
    /// Set once, when the first terminal event arrives.
    pub completed_at: Option<DateTime<Utc>>,
}

impl Resource {
    /// Builds a resource from its first event.
    pub(crate) fn from_event(uri: String, resource_type: &str, event: &Event, now: DateTime<Utc>) -> Self {
        let mut resource = Self {
            uri,
            name: format!("{} {}", title_case(resource_type), event.operation_id),
            description: String::new(),
            mime_type: RESOURCE_MIME_TYPE.to_string(),
            state: Value::Object(Map::new()),
            metadata: ResourceMetadata {
                resource_type: resource_type.to_string(),
                project: None,
                environment: None,
                created_at: now,
                updated_at: now,
                is_terminal: false,
                completed_at: None,
            },
        };
        resource.apply(event, now);
        resource
    }

    /// Merges a later event into the resource.
    pub(crate) fn apply(&mut self, event: &Event, now: DateTime<Utc>) {
        let mut state = match std::mem::take(&mut self.state) {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        if let Some(Value::Object(data)) = &event.data {
            for (key, value) in data {
                state.insert(key.clone(), value.clone());
            }
        }
        state.insert("eventType".into(), Value::String(event.event_type.to_string()));
        state.insert("lastUpdated".into(), Value::String(event.timestamp.to_rfc3339()));
        self.state = Value::Object(state);

        self.description = format!(
            "{} operation {} ({})",
            self.metadata.resource_type, event.operation_id, event.event_type
        );

        let meta = &mut self.metadata;
        if let Some(project) = event.context_str("project") {
            meta.project = Some(project.to_string());
        }
        if let Some(environment) = event.context_str("environment") {
            meta.environment = Some(environment.to_string());
        }
        meta.updated_at = now;
        if event.is_terminal() {
            meta.is_terminal = true;
            meta.completed_at.get_or_insert(now);
        }
    }

    /// Whether a terminal resource has outlived `ttl` at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>, ttl: chrono::Duration) -> bool {
        self.metadata.is_terminal
            && self
                .metadata
                .completed_at
                .is_some_and(|completed| now - completed > ttl)
    }
}

fn title_case(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Filter for [`ResourceManager::list_resources`](crate::ResourceManager::list_resources).
#[derive(Debug, Clone, Default)]
pub struct ResourceFilter {
    pub resource_type: Option<String>,
    pub terminal: Option<bool>,
    pub project: Option<String>,
}

impl ResourceFilter {
    /// Creates an empty filter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Only resources of this type.
    pub fn resource_type(mut self, resource_type: impl Into<String>) -> Self {
        self.resource_type = Some(resource_type.into());
        self
    }

    /// Only terminal (or only non-terminal) resources.
    pub fn terminal(mut self, terminal: bool) -> Self {
        self.terminal = Some(terminal);
        self
    }

    /// Only resources of this project.
    pub fn project(mut self, project: impl Into<String>) -> Self {
        self.project = Some(project.into());
        self
    }

    /// Checks whether a resource passes the filter.
    pub fn accepts(&self, resource: &Resource) -> bool {
        let meta = &resource.metadata;
        self.resource_type.as_ref().is_none_or(|t| *t == meta.resource_type)
            && self.terminal.is_none_or(|t| t == meta.is_terminal)
            && self
                .project
                .as_ref()
                .is_none_or(|p| meta.project.as_ref() == Some(p))
    }
}

/// Resource manager statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceStats {
    pub total_resources: usize,
    pub active_resources: usize,
    pub terminal_resources: usize,
    pub by_type: HashMap<String, usize>,
    /// Resources with at least one subscriber.
    pub subscribed_resources: usize,
    pub total_subscribers: usize,
}
