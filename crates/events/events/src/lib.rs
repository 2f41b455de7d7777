//! # DXP Events
//!
//! Lifecycle event routing for deployments, exports and downloads:
//! - Closed, versioned event schema with terminal classification
//! - Pub/sub bus contract with an in-process and a shared-store backend
//! - Reconnection state machine with a circuit breaker for the shared store
//! - Backend selection with fallback, and a start-once façade
//!
//! ## Example
//!
//! ```rust,ignore
//! use dxp_events::{BusConfig, Event, EventFacade, EventType};
//!
//! let events = EventFacade::new(BusConfig::from_env()?);
//!
//! events.on("deployment.*", |event| async move {
//!     println!("{} {}", event.event_type, event.operation_id);
//!     Ok(())
//! }).await?;
//!
//! events.emit_event(Event::new(EventType::DeploymentStarted, "dep-1")).await;
//! ```

mod bus;
mod config;
mod error;
mod event;
mod facade;
mod factory;
mod handler;
mod memory;
pub mod pattern;
pub mod schema;
mod shared;
pub mod store;

pub use bus::{BusHealth, BusStats, EventBus, HistoryQuery, SubscriptionId};
pub use config::{
    BusBackend, BusConfig, ENV_BUS_TYPE, ENV_FALLBACK, ENV_PROJECT_ID, ENV_REDIS_URL,
    ENV_REDIS_URL_FALLBACK,
};
pub use error::{EventError, EventResult};
pub use event::{
    Event, EventType, OperationKind, RESET_EVENT_TYPE, SCHEMA_VERSION, is_terminal,
    resource_type_of,
};
pub use facade::EventFacade;
pub use factory::{BusFactory, SharedBus, create_bus};
pub use handler::{EventHandler, FnHandler, SharedHandler};
pub use memory::{ActiveOperation, MemoryEventBus};
pub use shared::{
    HISTORY_KEY, MAX_RECONNECT_DELAY, ReconnectionState, SharedStoreBus, create_topic_name,
    normalize_project_id,
};
