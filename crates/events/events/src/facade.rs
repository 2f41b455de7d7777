//! Producer/consumer entry point.

use serde_json::Value;
use std::future::Future;

use crate::bus::{BusHealth, BusStats, HistoryQuery, SubscriptionId};
use crate::config::{BusBackend, BusConfig};
use crate::error::{EventError, EventResult};
use crate::event::Event;
use crate::factory::{BusFactory, SharedBus};
use crate::handler::{FnHandler, SharedHandler};
use crate::schema;

/// Stable API over the active bus.
///
/// The bus is created lazily on first use and at most once, however many
/// callers race for it. Emitting never fails loudly: invalid events and
/// transport errors are logged and reported as `false`.
pub struct EventFacade {
    factory: BusFactory,
}

impl EventFacade {
    /// Creates a façade for a configuration.
    pub fn new(config: BusConfig) -> Self {
        Self::with_factory(BusFactory::new(config))
    }

    /// Creates a façade from environment configuration.
    pub fn from_env() -> EventResult<Self> {
        Ok(Self::new(BusConfig::from_env()?))
    }

    /// Creates a façade over an existing factory.
    pub fn with_factory(factory: BusFactory) -> Self {
        Self { factory }
    }

    /// Returns the bus, initializing it on first call.
    pub async fn bus(&self) -> EventResult<SharedBus> {
        self.factory.instance().await
    }

    /// Validates and publishes an event.
    pub async fn emit_event(&self, event: Event) -> bool {
        if let Err(e) = event.validate() {
            tracing::warn!(
                event_type = %event.event_type,
                operation_id = %event.operation_id,
                "Dropping invalid event: {}", e
            );
            return false;
        }
        let bus = match self.bus().await {
            Ok(bus) => bus,
            Err(e) => {
                tracing::error!(event_type = %event.event_type, "Event bus unavailable: {}", e);
                return false;
            }
        };
        let event_type = event.event_type;
        let published = bus.publish(event).await;
        if !published {
            tracing::warn!(event_type = %event_type, "Event was not published");
        }
        published
    }

    /// Validates an untyped event and publishes it.
    pub async fn emit_raw(&self, raw: Value) -> bool {
        match schema::validate(&raw) {
            Ok(event) => self.emit_event(event).await,
            Err(e) => {
                tracing::warn!("Dropping invalid event: {}", e);
                false
            }
        }
    }

    /// Subscribes a handler to a pattern.
    pub async fn subscribe(&self, pattern: &str, handler: SharedHandler) -> EventResult<SubscriptionId> {
        Ok(self.bus().await?.subscribe(pattern, handler).await)
    }

    /// Subscribes a closure to a pattern.
    pub async fn on<F, Fut>(&self, pattern: &str, handler: F) -> EventResult<SubscriptionId>
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), EventError>> + Send + 'static,
    {
        self.subscribe(pattern, FnHandler::shared(pattern, handler)).await
    }

    /// Removes a subscription.
    pub async fn unsubscribe(&self, id: &str) -> bool {
        match self.factory.current().await {
            Some(bus) => bus.unsubscribe(id).await,
            None => false,
        }
    }

    /// Returns past events.
    pub async fn history(&self, query: HistoryQuery) -> EventResult<Vec<Event>> {
        self.bus().await?.history(query).await
    }

    /// Reports bus health. A bus that cannot be created is unhealthy.
    pub async fn health(&self) -> BusHealth {
        match self.bus().await {
            Ok(bus) => bus.health().await,
            Err(e) => BusHealth {
                healthy: false,
                backend: self.factory.config().backend,
                details: serde_json::json!({ "error": e.to_string() }),
            },
        }
    }

    /// Reports bus counters.
    pub async fn stats(&self) -> EventResult<BusStats> {
        Ok(self.bus().await?.stats().await)
    }

    /// Returns the configured backend.
    pub fn configured_backend(&self) -> BusBackend {
        self.factory.config().backend
    }

    /// Closes the bus. The next call creates a fresh one.
    pub async fn reset(&self) {
        self.factory.reset().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventType;
    use serde_json::json;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_emit_and_receive() {
        let facade = EventFacade::new(BusConfig::default());
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        facade
            .on("deployment.*", move |_event| {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await
            .unwrap();

        assert!(facade.emit_event(Event::new(EventType::DeploymentStarted, "d1")).await);
        assert!(facade.emit_event(Event::new(EventType::ExportStarted, "e1")).await);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_emit_raw_rejects_invalid() {
        let facade = EventFacade::new(BusConfig::default());
        assert!(!facade.emit_raw(json!({"eventType": "deployment.exploded"})).await);
        assert!(!facade.emit_raw(json!("not an object")).await);
        assert!(
            facade
                .emit_raw(json!({
                    "eventType": "export.started",
                    "timestamp": chrono::Utc::now().to_rfc3339(),
                    "operationId": "exp-9",
                }))
                .await
        );

        let history = facade.history(HistoryQuery::new()).await.unwrap();
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn test_reset_clears_subscriptions() {
        let facade = EventFacade::new(BusConfig::default());
        let id = facade.on("*", |_e| async { Ok(()) }).await.unwrap();
        facade.reset().await;
        assert!(!facade.unsubscribe(&id).await);
        assert_eq!(facade.stats().await.unwrap().subscriptions, 0);
    }
}
