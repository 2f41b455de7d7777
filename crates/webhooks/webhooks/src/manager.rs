//! Binds the event stream to registered webhook targets.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

use dxp_events::{Event, EventError, EventFacade, EventHandler, SubscriptionId};

use crate::delivery::{WebhookDelivery, WebhookSender};
use crate::error::{WebhookError, WebhookResult};
use crate::queue::{EnqueueOptions, QueueConfig, QueueStats, RetryQueue};
use crate::signature::{SIGNATURE_HEADER, WebhookSigner};
use crate::transform::transform;
use crate::validation::{UrlPolicy, validate_headers, validate_payload, validate_url};

/// Webhook manager configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WebhookConfig {
    /// Retry queue settings.
    pub queue: QueueConfig,
    /// Which targets are accepted.
    pub url_policy: UrlPolicy,
    /// Delay between a terminal event and removal of its registration.
    pub unregister_grace_ms: u64,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            queue: QueueConfig::default(),
            url_policy: UrlPolicy::strict(),
            unregister_grace_ms: 5000,
        }
    }
}

impl WebhookConfig {
    /// Defaults with the URL policy read from the environment.
    pub fn from_env() -> Self {
        Self {
            url_policy: UrlPolicy::from_env(),
            ..Self::default()
        }
    }

    /// Sets the queue configuration.
    pub fn queue(mut self, queue: QueueConfig) -> Self {
        self.queue = queue;
        self
    }

    /// Sets the URL policy.
    pub fn url_policy(mut self, policy: UrlPolicy) -> Self {
        self.url_policy = policy;
        self
    }

    /// Sets the grace period before unregistering finished operations.
    pub fn unregister_grace_ms(mut self, ms: u64) -> Self {
        self.unregister_grace_ms = ms;
        self
    }
}

/// Options for [`WebhookManager::register`].
#[derive(Debug, Clone, Default)]
pub struct RegisterOptions {
    /// Extra request headers, as a JSON object of strings.
    pub headers: Option<Value>,
    pub project: Option<String>,
    pub environment: Option<String>,
    /// Signing secret. Deliveries carry an `X-DXP-Signature` header when set.
    pub secret: Option<String>,
}

/// A webhook target bound to one operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookRegistration {
    pub operation_id: String,
    pub url: String,
    pub headers: HashMap<String, String>,
    pub project: Option<String>,
    pub environment: Option<String>,
    #[serde(skip)]
    pub secret: Option<String>,
    pub registered_at: DateTime<Utc>,
}

/// Manager counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookStats {
    pub active_webhooks: usize,
    /// Registrations waiting out their grace period.
    pub pending_unregistrations: usize,
    /// Events that matched a registration but could not be queued.
    pub errors: u64,
    pub queue: QueueStats,
}

type Registrations = Arc<RwLock<HashMap<String, WebhookRegistration>>>;
type GraceTimers = Arc<Mutex<HashMap<String, JoinHandle<()>>>>;

/// Routes lifecycle events to the webhook registered for their operation.
pub struct WebhookManager {
    config: WebhookConfig,
    registrations: Registrations,
    grace_timers: GraceTimers,
    queue: RetryQueue,
    subscription: Mutex<Option<SubscriptionId>>,
    errors: AtomicU64,
}

impl WebhookManager {
    /// Creates a manager delivering through `sender`.
    pub fn new(config: WebhookConfig, sender: Arc<dyn WebhookSender>) -> Self {
        let queue = RetryQueue::new(config.queue.clone(), sender);
        Self {
            config,
            registrations: Arc::new(RwLock::new(HashMap::new())),
            grace_timers: Arc::new(Mutex::new(HashMap::new())),
            queue,
            subscription: Mutex::new(None),
            errors: AtomicU64::new(0),
        }
    }

    /// Creates a manager delivering over HTTP.
    #[cfg(feature = "http-client")]
    pub fn with_http(config: WebhookConfig) -> WebhookResult<Self> {
        let sender = crate::delivery::ReqwestSender::new()?;
        Ok(Self::new(config, Arc::new(sender)))
    }

    /// Returns the configuration.
    pub fn config(&self) -> &WebhookConfig {
        &self.config
    }

    /// Returns the retry queue.
    pub fn queue(&self) -> &RetryQueue {
        &self.queue
    }

    /// Subscribes to every event on the façade. Later calls are no-ops.
    pub async fn initialize(self: &Arc<Self>, events: &EventFacade) -> WebhookResult<()> {
        let mut subscription = self.subscription.lock().await;
        if subscription.is_some() {
            return Ok(());
        }
        let id = events.subscribe("*", self.clone()).await?;
        *subscription = Some(id);
        tracing::info!("Webhook manager subscribed to events");
        Ok(())
    }

    /// Unsubscribes, cancels grace timers and drops queued deliveries.
    pub async fn shutdown(&self, events: &EventFacade) {
        if let Some(id) = self.subscription.lock().await.take() {
            events.unsubscribe(&id).await;
        }
        {
            let mut timers = self.grace_timers.lock().await;
            for (_, handle) in timers.drain() {
                handle.abort();
            }
        }
        let dropped = self.queue.clear().await;
        tracing::info!(dropped, "Webhook manager shut down");
    }

    /// Registers a target for an operation, replacing any previous one.
    pub async fn register(
        &self,
        operation_id: &str,
        url: &str,
        options: RegisterOptions,
    ) -> WebhookResult<WebhookRegistration> {
        validate_url(url, &self.config.url_policy).into_result(WebhookError::InvalidUrl)?;

        let mut headers = HashMap::new();
        if let Some(raw) = &options.headers {
            validate_headers(raw).into_result(WebhookError::InvalidHeaders)?;
            if let Some(map) = raw.as_object() {
                for (name, value) in map {
                    if let Some(value) = value.as_str() {
                        headers.insert(name.clone(), value.to_string());
                    }
                }
            }
        }

        let registration = WebhookRegistration {
            operation_id: operation_id.to_string(),
            url: url.to_string(),
            headers,
            project: options.project,
            environment: options.environment,
            secret: options.secret,
            registered_at: Utc::now(),
        };

        if let Some(timer) = self.grace_timers.lock().await.remove(operation_id) {
            timer.abort();
        }
        let replaced = self
            .registrations
            .write()
            .await
            .insert(operation_id.to_string(), registration.clone())
            .is_some();

        tracing::info!(operation_id, url, replaced, "Webhook registered");
        Ok(registration)
    }

    /// Removes a registration. Returns `false` if there was none.
    pub async fn unregister(&self, operation_id: &str) -> bool {
        if let Some(timer) = self.grace_timers.lock().await.remove(operation_id) {
            timer.abort();
        }
        let removed = self.registrations.write().await.remove(operation_id).is_some();
        if removed {
            tracing::info!(operation_id, "Webhook unregistered");
        }
        removed
    }

    /// Returns the registration for an operation.
    pub async fn registration(&self, operation_id: &str) -> Option<WebhookRegistration> {
        self.registrations.read().await.get(operation_id).cloned()
    }

    /// Returns every registration, oldest first.
    pub async fn active_webhooks(&self) -> Vec<WebhookRegistration> {
        let mut all: Vec<_> = self.registrations.read().await.values().cloned().collect();
        all.sort_by_key(|r| r.registered_at);
        all
    }

    /// Returns manager and queue counters.
    pub async fn stats(&self) -> WebhookStats {
        WebhookStats {
            active_webhooks: self.registrations.read().await.len(),
            pending_unregistrations: self.grace_timers.lock().await.len(),
            errors: self.errors.load(Ordering::Relaxed),
            queue: self.queue.stats().await,
        }
    }

    /// Returns the most recent delivery records, newest first.
    pub async fn recent_deliveries(&self, limit: usize) -> Vec<WebhookDelivery> {
        self.queue.recent_deliveries(limit).await
    }

    /// Queues a delivery for an event if its operation has a registration.
    ///
    /// Returns the queue entry id, or `None` when nothing is registered.
    /// Terminal events schedule removal of the registration after the grace
    /// period whether or not the delivery could be queued.
    pub async fn handle_event(&self, event: &Event) -> WebhookResult<Option<String>> {
        let Some(registration) = self.registration(&event.operation_id).await else {
            tracing::debug!(
                operation_id = %event.operation_id,
                event_type = %event.event_type,
                "No webhook registered"
            );
            return Ok(None);
        };

        let queued = self.deliver(event, &registration).await;
        if let Err(e) = &queued {
            self.errors.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                operation_id = %event.operation_id,
                event_type = %event.event_type,
                "Webhook not queued: {}", e
            );
        }
        if event.is_terminal() {
            self.schedule_unregister(&event.operation_id).await;
        }
        queued.map(Some)
    }

    async fn deliver(&self, event: &Event, registration: &WebhookRegistration) -> WebhookResult<String> {
        let mut payload = serde_json::to_value(event)?;
        validate_payload(&payload).into_result(WebhookError::InvalidPayload)?;
        merge_context(&mut payload, registration);
        let payload = transform(&payload);

        let mut headers = registration.headers.clone();
        if let Some(secret) = &registration.secret {
            let body = serde_json::to_vec(&payload)?;
            let signature = WebhookSigner::new(secret.as_str()).sign_header(Utc::now().timestamp(), &body)?;
            headers.insert(SIGNATURE_HEADER.to_string(), signature);
        }

        let options = EnqueueOptions {
            webhook_id: Some(format!("{}-{}", registration.operation_id, uuid::Uuid::new_v4().simple())),
            headers,
        };
        let id = self
            .queue
            .enqueue(&registration.url, payload, options)
            .await
            .ok_or(WebhookError::QueueFull(self.config.queue.max_queue_size))?;

        tracing::debug!(
            operation_id = %event.operation_id,
            event_type = %event.event_type,
            queued_id = %id,
            "Webhook queued for event"
        );
        Ok(id)
    }

    async fn schedule_unregister(&self, operation_id: &str) {
        let grace = Duration::from_millis(self.config.unregister_grace_ms);
        let registrations = self.registrations.clone();
        let timers = self.grace_timers.clone();
        let key = operation_id.to_string();

        let mut pending = self.grace_timers.lock().await;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            timers.lock().await.remove(&key);
            if registrations.write().await.remove(&key).is_some() {
                tracing::info!(operation_id = %key, "Webhook unregistered after terminal event");
            }
        });
        if let Some(previous) = pending.insert(operation_id.to_string(), handle) {
            previous.abort();
        }
        tracing::debug!(
            operation_id,
            grace_ms = self.config.unregister_grace_ms,
            "Webhook unregistration scheduled"
        );
    }
}

/// Writes the registration's project and environment into `metadata`.
fn merge_context(payload: &mut Value, registration: &WebhookRegistration) {
    let Some(object) = payload.as_object_mut() else {
        return;
    };
    let metadata = object
        .entry("metadata")
        .or_insert_with(|| Value::Object(Map::new()));
    if !metadata.is_object() {
        *metadata = Value::Object(Map::new());
    }
    if let Some(metadata) = metadata.as_object_mut() {
        if let Some(project) = &registration.project {
            metadata.insert("project".into(), Value::String(project.clone()));
        }
        if let Some(environment) = &registration.environment {
            metadata.insert("environment".into(), Value::String(environment.clone()));
        }
    }
}

#[async_trait]
impl EventHandler for WebhookManager {
    fn id(&self) -> &str {
        "webhook-manager"
    }

    async fn handle(&self, event: &Event) -> Result<(), EventError> {
        self.handle_event(event)
            .await
            .map(|_| ())
            .map_err(|e| EventError::HandlerFailed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::{DeliveryResult, SendOptions};
    use crate::validation::MAX_PAYLOAD_BYTES;
    use dxp_events::EventType;
    use serde_json::json;

    /// Records every request and answers 200.
    #[derive(Default)]
    struct RecordingSender {
        requests: Mutex<Vec<(String, Value, SendOptions)>>,
    }

    #[async_trait]
    impl WebhookSender for RecordingSender {
        async fn send(&self, url: &str, payload: &Value, options: &SendOptions) -> WebhookResult<DeliveryResult> {
            self.requests
                .lock()
                .await
                .push((url.to_string(), payload.clone(), options.clone()));
            Ok(DeliveryResult::success(200, 1))
        }
    }

    fn manager() -> (WebhookManager, Arc<RecordingSender>) {
        let sender = Arc::new(RecordingSender::default());
        (WebhookManager::new(WebhookConfig::default(), sender.clone()), sender)
    }

    #[tokio::test]
    async fn test_register_validates_url_and_headers() {
        let (manager, _) = manager();

        let err = manager
            .register("dep-1", "http://hooks.example.com", RegisterOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, WebhookError::InvalidUrl(_)));

        let err = manager
            .register(
                "dep-1",
                "https://hooks.example.com",
                RegisterOptions {
                    headers: Some(json!({"Host": "elsewhere"})),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, WebhookError::InvalidHeaders(_)));
        assert!(manager.active_webhooks().await.is_empty());

        manager
            .register(
                "dep-1",
                "https://hooks.example.com",
                RegisterOptions {
                    headers: Some(json!({"Authorization": "Bearer t"})),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let active = manager.active_webhooks().await;
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].headers["Authorization"], "Bearer t");
    }

    #[tokio::test]
    async fn test_unregistered_operation_is_ignored() {
        let (manager, sender) = manager();
        let queued = manager
            .handle_event(&Event::new(EventType::DeploymentStarted, "dep-9"))
            .await
            .unwrap();
        assert!(queued.is_none());
        tokio::task::yield_now().await;
        assert!(sender.requests.lock().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_event_delivered_flat_with_context() {
        let (manager, sender) = manager();
        manager
            .register(
                "dep-1",
                "https://hooks.example.com/deploy",
                RegisterOptions {
                    headers: Some(json!({"X-Team": "web"})),
                    project: Some("acme".into()),
                    environment: Some("Preproduction".into()),
                    secret: None,
                },
            )
            .await
            .unwrap();

        let event = Event::new(EventType::DeploymentInProgress, "dep-1")
            .with_data(json!({"progress": 30, "status": "InProgress"}));
        let queued_id = manager.handle_event(&event).await.unwrap().unwrap();
        assert!(queued_id.starts_with("dep-1-"));
        tokio::time::sleep(Duration::from_millis(10)).await;

        let requests = sender.requests.lock().await;
        assert_eq!(requests.len(), 1);
        let (url, payload, options) = &requests[0];
        assert_eq!(url, "https://hooks.example.com/deploy");
        assert_eq!(payload["deploymentId"], "dep-1");
        assert_eq!(payload["progress"], 30);
        assert_eq!(payload["project"], "acme");
        assert_eq!(payload["environment"], "Preproduction");
        assert!(payload.get("metadata").is_none());
        assert_eq!(options.webhook_id.as_deref(), Some(queued_id.as_str()));
        assert_eq!(options.headers["X-Team"], "web");
        assert!(!options.headers.contains_key(SIGNATURE_HEADER));
    }

    #[tokio::test(start_paused = true)]
    async fn test_each_event_gets_its_own_delivery() {
        let (manager, sender) = manager();
        manager
            .register("exp-2", "https://hooks.example.com", RegisterOptions::default())
            .await
            .unwrap();

        let first = manager
            .handle_event(&Event::new(EventType::ExportStarted, "exp-2"))
            .await
            .unwrap();
        let second = manager
            .handle_event(&Event::new(EventType::ExportInProgress, "exp-2"))
            .await
            .unwrap();
        assert_ne!(first, second);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(sender.requests.lock().await.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_payload_is_not_queued() {
        let (manager, sender) = manager();
        manager
            .register("dep-3", "https://hooks.example.com", RegisterOptions::default())
            .await
            .unwrap();

        let event = Event::new(EventType::DeploymentInProgress, "dep-3")
            .with_data(json!({"log": "x".repeat(MAX_PAYLOAD_BYTES)}));
        let err = manager.handle_event(&event).await.unwrap_err();
        assert!(matches!(err, WebhookError::InvalidPayload(_)));
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(sender.requests.lock().await.is_empty());
        let stats = manager.stats().await;
        assert_eq!(stats.errors, 1);
        assert_eq!(stats.queue.queued, 0);
        assert_eq!(stats.active_webhooks, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_queue_counts_error() {
        let sender = Arc::new(RecordingSender::default());
        let config = WebhookConfig::default().queue(QueueConfig::default().max_queue_size(0));
        let manager = WebhookManager::new(config, sender.clone());
        manager
            .register("dl-2", "https://hooks.example.com", RegisterOptions::default())
            .await
            .unwrap();

        let err = manager
            .handle_event(&Event::new(EventType::DownloadStarted, "dl-2"))
            .await
            .unwrap_err();
        assert!(matches!(err, WebhookError::QueueFull(0)));
        assert_eq!(manager.stats().await.errors, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_signed_delivery() {
        let (manager, sender) = manager();
        manager
            .register(
                "exp-1",
                "https://hooks.example.com",
                RegisterOptions {
                    secret: Some("whsec".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        manager
            .handle_event(&Event::new(EventType::ExportStarted, "exp-1"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let requests = sender.requests.lock().await;
        let (_, payload, options) = &requests[0];
        let header = &options.headers[SIGNATURE_HEADER];
        let body = serde_json::to_vec(payload).unwrap();
        assert!(WebhookSigner::new("whsec").verify_header(header, &body, 300).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_event_unregisters_after_grace() {
        let (manager, _) = manager();
        manager
            .register("dl-1", "https://hooks.example.com", RegisterOptions::default())
            .await
            .unwrap();

        manager
            .handle_event(&Event::new(EventType::DownloadSucceeded, "dl-1"))
            .await
            .unwrap();
        assert_eq!(manager.stats().await.pending_unregistrations, 1);

        tokio::time::sleep(Duration::from_millis(4900)).await;
        assert!(manager.registration("dl-1").await.is_some());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(manager.registration("dl-1").await.is_none());
        assert_eq!(manager.stats().await.pending_unregistrations, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reregister_cancels_grace_timer() {
        let (manager, _) = manager();
        manager
            .register("dep-2", "https://hooks.example.com", RegisterOptions::default())
            .await
            .unwrap();
        manager
            .handle_event(&Event::new(EventType::DeploymentFailed, "dep-2"))
            .await
            .unwrap();
        manager
            .register("dep-2", "https://hooks.example.com/v2", RegisterOptions::default())
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(10)).await;
        let registration = manager.registration("dep-2").await.unwrap();
        assert_eq!(registration.url, "https://hooks.example.com/v2");
    }

    #[test]
    fn test_secret_not_serialized() {
        let registration = WebhookRegistration {
            operation_id: "dep-1".into(),
            url: "https://hooks.example.com".into(),
            headers: HashMap::new(),
            project: None,
            environment: None,
            secret: Some("whsec".into()),
            registered_at: Utc::now(),
        };
        let json = serde_json::to_value(&registration).unwrap();
        assert!(json.get("secret").is_none());
        assert_eq!(json["operationId"], "dep-1");
    }
}
