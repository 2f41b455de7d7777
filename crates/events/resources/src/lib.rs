//! # DXP Resources
//!
//! Turns the lifecycle event stream into addressable resources:
//! - One resource per operation, at `{resourceType}://{operationId}`
//! - Accumulated state from every event's `data`
//! - Per-resource client subscriptions with change notifications
//! - TTL-based removal of completed operations
//!
//! The manager is an [`EventHandler`](dxp_events::EventHandler), so it can be
//! subscribed to the bus directly:
//!
//! ```rust,ignore
//! let resources = ResourceManager::start_default();
//! events.subscribe("*", resources.clone()).await?;
//! ```

mod config;
mod error;
mod manager;
mod notifier;
mod resource;

pub use config::ResourceConfig;
pub use error::{ResourceError, ResourceResult};
pub use manager::{DEFAULT_CLIENT, ResourceManager};
pub use notifier::{NoopNotifier, ResourceNotifier};
pub use resource::{RESOURCE_MIME_TYPE, Resource, ResourceFilter, ResourceMetadata, ResourceStats};
