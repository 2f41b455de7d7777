//! # DXP Server
//!
//! Owns the process-wide event façade, resource manager and webhook manager.
//! [`AppContext::init`] builds and wires them once; [`AppContext::shutdown`]
//! tears them down in reverse order.

mod config;

pub use config::{AppConfig, ConfigError, ServerConfig, load_config};

use async_trait::async_trait;
use std::sync::Arc;

use dxp_events::{EventError, EventFacade, SubscriptionId};
use dxp_resources::{ResourceManager, ResourceNotifier, ResourceResult};
use dxp_webhooks::{WebhookError, WebhookManager, WebhookSender};

/// Error raised while starting the application.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Event(#[from] EventError),
    #[error(transparent)]
    Webhook(#[from] WebhookError),
}

/// Notifier that writes resource changes to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingNotifier;

#[async_trait]
impl ResourceNotifier for LoggingNotifier {
    async fn resource_updated(&self, uri: &str) -> ResourceResult<()> {
        tracing::info!(uri, "Resource updated");
        Ok(())
    }

    async fn resource_list_changed(&self) -> ResourceResult<()> {
        tracing::info!("Resource list changed");
        Ok(())
    }
}

/// The running application.
pub struct AppContext {
    config: AppConfig,
    events: Arc<EventFacade>,
    resources: Arc<ResourceManager>,
    webhooks: Arc<WebhookManager>,
    resource_subscription: SubscriptionId,
}

impl AppContext {
    /// Creates the bus, starts the resource sweep and subscribes both
    /// managers to every event.
    pub async fn init(
        config: AppConfig,
        sender: Arc<dyn WebhookSender>,
        notifier: Arc<dyn ResourceNotifier>,
    ) -> Result<Self, ServerError> {
        let events = Arc::new(EventFacade::new(config.bus.clone()));
        let bus = events.bus().await?;

        let resources = ResourceManager::start(config.resources.clone(), notifier);
        let resource_subscription = events.subscribe("*", resources.clone()).await?;

        let webhooks = Arc::new(WebhookManager::new(config.webhooks.clone(), sender));
        webhooks.initialize(&events).await?;

        tracing::info!(
            backend = %bus.backend(),
            project_id = %config.bus.project_id,
            "Application started"
        );

        Ok(Self {
            config,
            events,
            resources,
            webhooks,
            resource_subscription,
        })
    }

    /// Starts with HTTP delivery and log-only resource notifications.
    pub async fn init_http(config: AppConfig) -> Result<Self, ServerError> {
        let sender = Arc::new(dxp_webhooks::ReqwestSender::new()?);
        Self::init(config, sender, Arc::new(LoggingNotifier)).await
    }

    /// Returns the configuration.
    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Returns the event façade.
    pub fn events(&self) -> &Arc<EventFacade> {
        &self.events
    }

    /// Returns the resource manager.
    pub fn resources(&self) -> &Arc<ResourceManager> {
        &self.resources
    }

    /// Returns the webhook manager.
    pub fn webhooks(&self) -> &Arc<WebhookManager> {
        &self.webhooks
    }

    /// Stops background work and closes the bus.
    pub async fn shutdown(self) {
        self.webhooks.shutdown(&self.events).await;
        self.events.unsubscribe(&self.resource_subscription).await;
        self.resources.stop().await;
        self.events.reset().await;
        tracing::info!("Application stopped");
    }
}
