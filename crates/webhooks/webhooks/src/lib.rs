//! # DXP Webhooks
//!
//! Outbound webhook delivery for lifecycle events:
//! - Target, header and payload validation
//! - Flattening of events into delivery payloads
//! - Per-destination retry queue with a fixed delay schedule
//! - Optional HMAC signing of delivery bodies
//! - A manager binding each operation to its registered target
//!
//! ## Example
//!
//! ```rust,ignore
//! use dxp_events::{BusConfig, EventFacade};
//! use dxp_webhooks::{RegisterOptions, WebhookConfig, WebhookManager};
//! use std::sync::Arc;
//!
//! let events = EventFacade::new(BusConfig::from_env()?);
//! let webhooks = Arc::new(WebhookManager::with_http(WebhookConfig::from_env())?);
//! webhooks.initialize(&events).await?;
//!
//! webhooks
//!     .register("dep-1", "https://ci.example.com/hooks/deploy", RegisterOptions::default())
//!     .await?;
//! ```

mod delivery;
mod error;
mod manager;
mod queue;
mod retry;
mod signature;
pub mod transform;
pub mod validation;

#[cfg(feature = "http-client")]
pub use delivery::ReqwestSender;
pub use delivery::{DeliveryResult, SendOptions, WebhookDelivery, WebhookSender, is_retryable_status};
pub use error::{WebhookError, WebhookResult};
pub use manager::{RegisterOptions, WebhookConfig, WebhookManager, WebhookRegistration, WebhookStats};
pub use queue::{DeliveryFailure, EnqueueOptions, QueueConfig, QueueStats, QueuedWebhook, RetryQueue};
pub use retry::{DEFAULT_RETRY_DELAYS_MS, RetrySchedule};
pub use signature::{SIGNATURE_HEADER, WebhookSigner};
pub use transform::{transform, transform_event};
pub use validation::{UrlPolicy, ValidationResult, validate_headers, validate_payload, validate_url};
