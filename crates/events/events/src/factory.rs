//! Backend selection and the single bus instance.

use std::sync::Arc;
use tokio::sync::{OnceCell, RwLock};

use crate::bus::EventBus;
use crate::config::{BusBackend, BusConfig};
use crate::error::{EventError, EventResult};
use crate::memory::MemoryEventBus;
use crate::shared::SharedStoreBus;
use crate::store::SharedStore;

/// A shared event bus.
pub type SharedBus = Arc<dyn EventBus>;

/// Creates buses from configuration and owns the process's bus instance.
///
/// `instance()` initializes the bus exactly once even when called
/// concurrently; `reset()` closes it so the next `instance()` starts over.
pub struct BusFactory {
    config: BusConfig,
    store: Option<Arc<dyn SharedStore>>,
    cell: RwLock<Arc<OnceCell<SharedBus>>>,
}

impl BusFactory {
    /// Creates a factory that connects to the store named in `config`.
    pub fn new(config: BusConfig) -> Self {
        Self {
            config,
            store: None,
            cell: RwLock::new(Arc::new(OnceCell::new())),
        }
    }

    /// Creates a factory that uses the given store for the shared backend
    /// instead of opening one from the connection string.
    pub fn with_store(config: BusConfig, store: Arc<dyn SharedStore>) -> Self {
        Self {
            store: Some(store),
            ..Self::new(config)
        }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    /// Returns the initialized bus, creating it on first use.
    pub async fn instance(&self) -> EventResult<SharedBus> {
        let cell = self.cell.read().await.clone();
        cell.get_or_try_init(|| self.create_bus()).await.cloned()
    }

    /// Returns the bus if it has already been created.
    pub async fn current(&self) -> Option<SharedBus> {
        self.cell.read().await.get().cloned()
    }

    /// Closes and discards the current bus.
    pub async fn reset(&self) {
        let previous = {
            let mut cell = self.cell.write().await;
            std::mem::replace(&mut *cell, Arc::new(OnceCell::new()))
        };
        if let Some(bus) = previous.get() {
            bus.close().await;
            tracing::info!(backend = %bus.backend(), "Event bus reset");
        }
    }

    /// Creates and initializes a new bus according to the configuration.
    ///
    /// A shared backend that is not configured or fails to initialize is
    /// replaced by the in-process bus when `fallback_to_memory` is set.
    pub async fn create_bus(&self) -> EventResult<SharedBus> {
        match self.config.backend {
            BusBackend::Memory => self.create_memory_bus().await,
            BusBackend::Redis => match self.create_shared_bus().await {
                Ok(bus) => Ok(bus),
                Err(e) if self.config.fallback_to_memory => {
                    tracing::warn!(
                        requested = %self.config.backend,
                        "Shared event bus unavailable, falling back to in-process bus: {}", e
                    );
                    self.create_memory_bus().await
                }
                Err(e) => Err(e),
            },
        }
    }

    async fn create_memory_bus(&self) -> EventResult<SharedBus> {
        let bus = MemoryEventBus::with_config(&self.config);
        bus.initialize().await?;
        Ok(Arc::new(bus))
    }

    async fn create_shared_bus(&self) -> EventResult<SharedBus> {
        let store = self.open_store()?;
        let bus = SharedStoreBus::new(store, &self.config);
        bus.initialize().await?;
        Ok(Arc::new(bus))
    }

    fn open_store(&self) -> EventResult<Arc<dyn SharedStore>> {
        if let Some(store) = &self.store {
            return Ok(store.clone());
        }
        let url = self
            .config
            .redis_url
            .as_deref()
            .ok_or_else(|| EventError::Connection("no shared-store connection string configured".into()))?;
        open_redis(url)
    }
}

#[cfg(feature = "redis")]
fn open_redis(url: &str) -> EventResult<Arc<dyn SharedStore>> {
    Ok(Arc::new(crate::store::RedisStore::new(url)?))
}

#[cfg(not(feature = "redis"))]
fn open_redis(_url: &str) -> EventResult<Arc<dyn SharedStore>> {
    Err(EventError::Connection(
        "redis support is not compiled in (enable the `redis` feature)".into(),
    ))
}

/// Creates and initializes a bus in one call.
pub async fn create_bus(config: BusConfig) -> EventResult<SharedBus> {
    BusFactory::new(config).create_bus().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemorySharedStore;

    #[tokio::test]
    async fn test_memory_backend() {
        let bus = create_bus(BusConfig::default()).await.unwrap();
        assert_eq!(bus.backend(), BusBackend::Memory);
    }

    #[tokio::test]
    async fn test_falls_back_without_connection_string() {
        let bus = create_bus(BusConfig::default().backend(BusBackend::Redis))
            .await
            .unwrap();
        assert_eq!(bus.backend(), BusBackend::Memory);
    }

    #[tokio::test]
    async fn test_no_fallback_propagates() {
        let config = BusConfig::default()
            .backend(BusBackend::Redis)
            .fallback_to_memory(false);
        let result = create_bus(config).await;
        assert!(matches!(result, Err(EventError::Connection(_))));
    }

    #[tokio::test]
    async fn test_unreachable_store_falls_back() {
        let factory = BusFactory::with_store(
            BusConfig::default().backend(BusBackend::Redis),
            Arc::new(MemorySharedStore::unreachable()),
        );
        let bus = factory.create_bus().await.unwrap();
        assert_eq!(bus.backend(), BusBackend::Memory);
    }

    #[tokio::test]
    async fn test_reachable_store_is_used() {
        let factory = BusFactory::with_store(
            BusConfig::default().backend(BusBackend::Redis),
            Arc::new(MemorySharedStore::new()),
        );
        let bus = factory.instance().await.unwrap();
        assert_eq!(bus.backend(), BusBackend::Redis);
    }

    #[tokio::test]
    async fn test_instance_is_reused_until_reset() {
        let factory = BusFactory::new(BusConfig::default());
        let a = factory.instance().await.unwrap();
        let b = factory.instance().await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        factory.reset().await;
        assert!(factory.current().await.is_none());
        assert!(!a.health().await.healthy);

        let c = factory.instance().await.unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
    }
}
