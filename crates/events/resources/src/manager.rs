//! Resource lifecycle manager.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

use dxp_events::{Event, EventError, EventHandler, resource_type_of};

use crate::config::ResourceConfig;
use crate::error::{ResourceError, ResourceResult};
use crate::notifier::{NoopNotifier, ResourceNotifier};
use crate::resource::{Resource, ResourceFilter, ResourceStats};

/// Default client id for subscriptions.
pub const DEFAULT_CLIENT: &str = "default";

/// Projects lifecycle events into resources.
///
/// Each operation becomes one resource keyed by URI. Terminal resources are
/// removed by a periodic sweep once their TTL has passed.
pub struct ResourceManager {
    config: ResourceConfig,
    resources: RwLock<HashMap<String, Resource>>,
    subscriptions: RwLock<HashMap<String, HashSet<String>>>,
    notifier: Arc<dyn ResourceNotifier>,
    cleanup: Mutex<Option<JoinHandle<()>>>,
}

impl ResourceManager {
    /// Creates a manager without starting the cleanup sweep.
    pub fn new(config: ResourceConfig, notifier: Arc<dyn ResourceNotifier>) -> Self {
        Self {
            config,
            resources: RwLock::new(HashMap::new()),
            subscriptions: RwLock::new(HashMap::new()),
            notifier,
            cleanup: Mutex::new(None),
        }
    }

    /// Creates a manager and starts its cleanup sweep.
    ///
    /// The sweep holds a weak reference and ends once the manager is dropped.
    pub fn start(config: ResourceConfig, notifier: Arc<dyn ResourceNotifier>) -> Arc<Self> {
        let manager = Arc::new(Self::new(config, notifier));
        let handle = tokio::spawn(cleanup_loop(Arc::downgrade(&manager), manager.config.interval()));
        if let Ok(mut slot) = manager.cleanup.try_lock() {
            *slot = Some(handle);
        }
        tracing::info!(
            ttl_secs = manager.config.cleanup_ttl_secs,
            interval_secs = manager.config.cleanup_interval_secs,
            "Resource manager started"
        );
        manager
    }

    /// Creates a manager with defaults and no notifier, and starts it.
    pub fn start_default() -> Arc<Self> {
        Self::start(ResourceConfig::default(), Arc::new(NoopNotifier))
    }

    /// Returns the configuration.
    pub fn config(&self) -> &ResourceConfig {
        &self.config
    }

    /// Creates or updates the resource for an event's operation.
    pub async fn register_or_update_resource(&self, event: &Event) -> ResourceResult<String> {
        let resource_type = resource_type_of(event.event_type.as_str())?;
        let uri = format!("{}://{}", resource_type, event.operation_id);
        let now = Utc::now();

        let created = {
            let mut resources = self.resources.write().await;
            match resources.get_mut(&uri) {
                Some(resource) => {
                    resource.apply(event, now);
                    false
                }
                None => {
                    resources.insert(uri.clone(), Resource::from_event(uri.clone(), resource_type, event, now));
                    true
                }
            }
        };

        if created {
            tracing::debug!(uri = %uri, event_type = %event.event_type, "Resource created");
            self.notify_list_changed();
        } else {
            tracing::debug!(uri = %uri, event_type = %event.event_type, "Resource updated");
            if self.has_subscribers(&uri).await {
                self.notify_updated(&uri);
            }
        }
        Ok(uri)
    }

    /// Subscribes a client to a resource. Returns `false` if it does not exist.
    pub async fn subscribe(&self, uri: &str, client_id: &str) -> bool {
        // Held until the insert so a concurrent removal cannot orphan the set.
        let resources = self.resources.read().await;
        if !resources.contains_key(uri) {
            return false;
        }
        self.subscriptions
            .write()
            .await
            .entry(uri.to_string())
            .or_default()
            .insert(client_id.to_string());
        drop(resources);
        tracing::debug!(uri, client_id, "Resource subscribed");
        true
    }

    /// Removes a client's subscription. Returns `false` if it was not subscribed.
    pub async fn unsubscribe(&self, uri: &str, client_id: &str) -> bool {
        let mut subscriptions = self.subscriptions.write().await;
        let Some(clients) = subscriptions.get_mut(uri) else {
            return false;
        };
        let removed = clients.remove(client_id);
        if clients.is_empty() {
            subscriptions.remove(uri);
        }
        removed
    }

    /// Returns the clients subscribed to a resource.
    pub async fn subscribers(&self, uri: &str) -> Vec<String> {
        self.subscriptions
            .read()
            .await
            .get(uri)
            .map(|clients| clients.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Lists resources matching a filter, oldest first.
    pub async fn list_resources(&self, filter: &ResourceFilter) -> Vec<Resource> {
        let resources = self.resources.read().await;
        let mut matched: Vec<Resource> = resources
            .values()
            .filter(|r| filter.accepts(r))
            .cloned()
            .collect();
        matched.sort_by(|a, b| {
            a.metadata
                .created_at
                .cmp(&b.metadata.created_at)
                .then_with(|| a.uri.cmp(&b.uri))
        });
        matched
    }

    /// Reads a resource.
    pub async fn read_resource(&self, uri: &str) -> ResourceResult<Resource> {
        self.resources
            .read()
            .await
            .get(uri)
            .cloned()
            .ok_or_else(|| ResourceError::NotFound(uri.to_string()))
    }

    /// Removes a resource and its subscriptions.
    pub async fn remove_resource(&self, uri: &str) -> bool {
        let removed = self.resources.write().await.remove(uri).is_some();
        if removed {
            self.subscriptions.write().await.remove(uri);
            tracing::debug!(uri, "Resource removed");
            self.notify_list_changed();
        }
        removed
    }

    /// Removes terminal resources whose TTL has passed.
    pub async fn cleanup_expired_resources(&self) -> usize {
        self.cleanup_expired_resources_at(Utc::now()).await
    }

    /// Removes terminal resources whose TTL has passed at `now`.
    pub async fn cleanup_expired_resources_at(&self, now: DateTime<Utc>) -> usize {
        let ttl = chrono::Duration::from_std(self.config.ttl())
            .unwrap_or_else(|_| chrono::Duration::minutes(5));

        let expired: Vec<String> = {
            let mut resources = self.resources.write().await;
            let expired: Vec<String> = resources
                .values()
                .filter(|r| r.is_expired(now, ttl))
                .map(|r| r.uri.clone())
                .collect();
            for uri in &expired {
                resources.remove(uri);
            }
            expired
        };

        if !expired.is_empty() {
            let mut subscriptions = self.subscriptions.write().await;
            for uri in &expired {
                subscriptions.remove(uri);
            }
            drop(subscriptions);
            tracing::info!(removed = expired.len(), "Cleaned up expired resources");
            self.notify_list_changed();
        }
        expired.len()
    }

    /// Returns resource counts.
    pub async fn stats(&self) -> ResourceStats {
        let resources = self.resources.read().await;
        let subscriptions = self.subscriptions.read().await;

        let mut stats = ResourceStats {
            total_resources: resources.len(),
            subscribed_resources: subscriptions.len(),
            total_subscribers: subscriptions.values().map(HashSet::len).sum(),
            ..Default::default()
        };
        for resource in resources.values() {
            if resource.metadata.is_terminal {
                stats.terminal_resources += 1;
            } else {
                stats.active_resources += 1;
            }
            *stats
                .by_type
                .entry(resource.metadata.resource_type.clone())
                .or_default() += 1;
        }
        stats
    }

    /// Stops the cleanup sweep.
    pub async fn stop(&self) {
        if let Some(handle) = self.cleanup.lock().await.take() {
            handle.abort();
            tracing::info!("Resource manager stopped");
        }
    }

    /// Drops every resource and subscription.
    pub async fn clear(&self) {
        self.resources.write().await.clear();
        self.subscriptions.write().await.clear();
    }

    async fn has_subscribers(&self, uri: &str) -> bool {
        self.subscriptions
            .read()
            .await
            .get(uri)
            .is_some_and(|clients| !clients.is_empty())
    }

    fn notify_updated(&self, uri: &str) {
        let notifier = self.notifier.clone();
        let uri = uri.to_string();
        tokio::spawn(async move {
            if let Err(e) = notifier.resource_updated(&uri).await {
                tracing::warn!(uri = %uri, "Resource update notification failed: {}", e);
            }
        });
    }

    fn notify_list_changed(&self) {
        let notifier = self.notifier.clone();
        tokio::spawn(async move {
            if let Err(e) = notifier.resource_list_changed().await {
                tracing::warn!("Resource list notification failed: {}", e);
            }
        });
    }
}

async fn cleanup_loop(manager: Weak<ResourceManager>, every: std::time::Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(manager) = manager.upgrade() else {
            break;
        };
        manager.cleanup_expired_resources().await;
    }
}

#[async_trait]
impl EventHandler for ResourceManager {
    fn id(&self) -> &str {
        "resource-manager"
    }

    async fn handle(&self, event: &Event) -> Result<(), EventError> {
        self.register_or_update_resource(event)
            .await
            .map(|_| ())
            .map_err(|e| EventError::HandlerFailed(e.to_string()))
    }
}
