//! Cross-process bus over a [`SharedStore`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio::task::JoinHandle;

use crate::bus::{
    BusCounters, BusHealth, BusStats, EventBus, HistoryQuery, SubscriptionId,
    SubscriptionRegistry,
};
use crate::config::{BusBackend, BusConfig};
use crate::error::{EventError, EventResult};
use crate::event::Event;
use crate::handler::SharedHandler;
use crate::schema;
use crate::store::{ConnectionEvent, ConnectionRole, SharedStore, StoreMessage};

/// Sorted-set key holding the shared event history.
pub const HISTORY_KEY: &str = "dxp:events:history";

/// Upper bound of the informational reconnect delay.
pub const MAX_RECONNECT_DELAY: Duration = Duration::from_millis(2000);

/// Builds the channel name an event is published on.
///
/// The project id is upper-cased and stripped of everything outside
/// `[A-Z0-9]` so tenants cannot inject glob characters into each other's
/// subscriptions.
pub fn create_topic_name(project_id: &str, event_type: &str) -> EventResult<String> {
    if project_id.trim().is_empty() {
        return Err(EventError::InvalidTopic("project id is empty".into()));
    }
    if event_type.trim().is_empty() {
        return Err(EventError::InvalidTopic("event type is empty".into()));
    }
    Ok(format!("dxp.{}.{}", normalize_project_id(project_id), event_type))
}

/// Upper-cases a project id and keeps only ASCII letters and digits.
pub fn normalize_project_id(project_id: &str) -> String {
    project_id
        .to_ascii_uppercase()
        .chars()
        .filter(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
        .collect()
}

/// Connection bookkeeping of the shared-store bus.
///
/// Transitions: connected → disconnected → reconnecting → connected, or
/// circuit open once `max_attempts` reconnects have been used up. An open
/// circuit only closes when both connections report ready again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconnectionState {
    pub is_reconnecting: bool,
    pub attempts: u32,
    pub max_attempts: u32,
    /// Base backoff in milliseconds.
    pub backoff_delay: u64,
    pub circuit_open: bool,
    pub last_disconnect: Option<DateTime<Utc>>,
    pub connected: bool,
    pub publisher_ready: bool,
    pub subscriber_ready: bool,
}

impl ReconnectionState {
    /// Creates a disconnected state.
    pub fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            is_reconnecting: false,
            attempts: 0,
            max_attempts,
            backoff_delay: backoff.as_millis() as u64,
            circuit_open: false,
            last_disconnect: None,
            connected: false,
            publisher_ready: false,
            subscriber_ready: false,
        }
    }

    /// Clears the retry bookkeeping.
    pub fn reset(&mut self) {
        self.attempts = 0;
        self.circuit_open = false;
        self.last_disconnect = None;
        self.is_reconnecting = false;
    }

    /// Whether the bus can deliver events.
    pub fn is_healthy(&self) -> bool {
        self.connected && self.publisher_ready && self.subscriber_ready && !self.circuit_open
    }

    /// Delay the store is expected to wait before the current attempt.
    pub fn current_delay(&self) -> Duration {
        Duration::from_millis(self.backoff_delay.saturating_mul(self.attempts as u64))
            .min(MAX_RECONNECT_DELAY)
    }

    /// Applies a connection notification.
    pub fn apply(&mut self, role: ConnectionRole, event: &ConnectionEvent, now: DateTime<Utc>) {
        match event {
            ConnectionEvent::Ready => {
                match role {
                    ConnectionRole::Publisher => self.publisher_ready = true,
                    ConnectionRole::Subscriber => self.subscriber_ready = true,
                }
                if self.publisher_ready && self.subscriber_ready {
                    if self.attempts > 0 || self.circuit_open {
                        tracing::info!(attempts = self.attempts, "Shared store reconnected");
                    }
                    self.connected = true;
                    self.reset();
                }
            }
            ConnectionEvent::Disconnected(reason) => {
                match role {
                    ConnectionRole::Publisher => self.publisher_ready = false,
                    ConnectionRole::Subscriber => self.subscriber_ready = false,
                }
                self.connected = false;

                if self.circuit_open {
                    tracing::debug!(%role, reason, "Disconnect ignored, circuit is open");
                } else if self.attempts >= self.max_attempts {
                    self.open_circuit();
                } else {
                    self.is_reconnecting = true;
                    self.last_disconnect = Some(now);
                    tracing::warn!(%role, reason, attempts = self.attempts, "Shared store disconnected");
                }
            }
            ConnectionEvent::Reconnecting => {
                if self.circuit_open {
                    return;
                }
                self.attempts += 1;
                tracing::info!(
                    %role,
                    attempt = self.attempts,
                    max_attempts = self.max_attempts,
                    delay_ms = self.current_delay().as_millis() as u64,
                    "Reconnecting to shared store"
                );
                if self.attempts >= self.max_attempts {
                    self.open_circuit();
                }
            }
        }
    }

    fn open_circuit(&mut self) {
        self.circuit_open = true;
        self.is_reconnecting = false;
        tracing::error!(
            attempts = self.attempts,
            "Reconnect attempts exhausted, circuit open"
        );
    }
}

/// Bus backed by a shared pub/sub + sorted-set store.
///
/// Every instance publishing under the same project id sees every other
/// instance's events. Local subscribers are fed from the store subscription,
/// so delivery is asynchronous even for events published by this instance.
pub struct SharedStoreBus {
    store: Arc<dyn SharedStore>,
    backend: BusBackend,
    project_id: String,
    history_max_age: Duration,
    subscriptions: Arc<SubscriptionRegistry>,
    counters: Arc<BusCounters>,
    state: Arc<RwLock<ReconnectionState>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    initialized: AtomicBool,
}

impl SharedStoreBus {
    /// Creates a bus over a store. Nothing connects until `initialize`.
    pub fn new(store: Arc<dyn SharedStore>, config: &BusConfig) -> Self {
        Self {
            store,
            backend: config.backend,
            project_id: config.project_id.clone(),
            history_max_age: config.history_max_age(),
            subscriptions: Arc::new(SubscriptionRegistry::default()),
            counters: Arc::new(BusCounters::default()),
            state: Arc::new(RwLock::new(ReconnectionState::new(
                config.max_reconnect_attempts,
                config.reconnect_backoff(),
            ))),
            tasks: Mutex::new(Vec::new()),
            initialized: AtomicBool::new(false),
        }
    }

    /// Returns the project id used in topic names.
    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    /// Returns a snapshot of the reconnection state.
    pub async fn reconnection_state(&self) -> ReconnectionState {
        self.state.read().await.clone()
    }

    /// Applies a connection notification immediately.
    ///
    /// Store notifications normally arrive through a background task; this
    /// entry point makes the state machine drivable without one.
    pub async fn handle_connection_event(&self, role: ConnectionRole, event: ConnectionEvent) {
        self.state.write().await.apply(role, &event, Utc::now());
    }

    fn subscription_pattern(&self) -> String {
        format!("dxp.{}.*", normalize_project_id(&self.project_id))
    }

    fn history_cutoff(&self) -> i64 {
        let max_age = chrono::Duration::from_std(self.history_max_age)
            .unwrap_or_else(|_| chrono::Duration::hours(24));
        (Utc::now() - max_age).timestamp_millis()
    }

    async fn write_history(&self, payload: &str, score: i64) -> EventResult<()> {
        self.store.zadd(HISTORY_KEY, payload, score).await?;
        let removed = self.store.zremrange_below(HISTORY_KEY, self.history_cutoff()).await?;
        if removed > 0 {
            tracing::debug!(removed, "Pruned shared event history");
        }
        self.store.expire(HISTORY_KEY, self.history_max_age).await
    }

    async fn read_history(&self, since_millis: i64) -> EventResult<Vec<Event>> {
        let raw = self.store.zrange_from(HISTORY_KEY, since_millis).await?;
        Ok(raw
            .iter()
            .filter_map(|entry| match decode(entry) {
                Ok(event) => Some(event),
                Err(e) => {
                    tracing::warn!("Skipping malformed history entry: {}", e);
                    None
                }
            })
            .collect())
    }
}

fn decode(payload: &str) -> EventResult<Event> {
    let raw: serde_json::Value = serde_json::from_str(payload)?;
    schema::validate(&raw)
}

async fn receive_loop(
    mut rx: mpsc::UnboundedReceiver<StoreMessage>,
    subscriptions: Arc<SubscriptionRegistry>,
    counters: Arc<BusCounters>,
) {
    while let Some(msg) = rx.recv().await {
        match decode(&msg.payload) {
            Ok(event) => {
                tracing::debug!(channel = %msg.channel, event_type = %event.event_type, "Received event");
                subscriptions.dispatch(&event, &counters).await;
            }
            Err(e) => tracing::warn!(channel = %msg.channel, "Dropping malformed message: {}", e),
        }
    }
}

async fn connection_loop(
    mut rx: mpsc::UnboundedReceiver<(ConnectionRole, ConnectionEvent)>,
    state: Arc<RwLock<ReconnectionState>>,
) {
    while let Some((role, event)) = rx.recv().await {
        state.write().await.apply(role, &event, Utc::now());
    }
}

#[async_trait]
impl EventBus for SharedStoreBus {
    fn backend(&self) -> BusBackend {
        self.backend
    }

    async fn initialize(&self) -> EventResult<()> {
        let mut tasks = self.tasks.lock().await;
        if self.initialized.load(Ordering::SeqCst) {
            return Ok(());
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        self.store.connect(events_tx).await?;
        let messages = self.store.psubscribe(&self.subscription_pattern()).await?;

        self.state.write().await.reset();
        tasks.push(tokio::spawn(connection_loop(events_rx, self.state.clone())));
        tasks.push(tokio::spawn(receive_loop(
            messages,
            self.subscriptions.clone(),
            self.counters.clone(),
        )));
        self.initialized.store(true, Ordering::SeqCst);

        tracing::info!(
            project_id = %self.project_id,
            pattern = %self.subscription_pattern(),
            "Shared-store event bus initialized"
        );
        Ok(())
    }

    async fn publish(&self, event: Event) -> bool {
        if !self.initialized.load(Ordering::SeqCst) {
            tracing::warn!(event_type = %event.event_type, "Publish on uninitialized shared bus");
            self.counters.publish_failures.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        if let Err(e) = event.validate() {
            tracing::warn!(event_type = %event.event_type, "Rejected invalid event: {}", e);
            self.counters.publish_failures.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        let result: EventResult<()> = async {
            let topic = create_topic_name(&self.project_id, event.event_type.as_str())?;
            let payload = serde_json::to_string(&event)?;
            self.store.publish(&topic, &payload).await?;
            self.write_history(&payload, event.timestamp_millis()).await
        }
        .await;

        match result {
            Ok(()) => {
                self.counters.published.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(e) => {
                tracing::error!(
                    event_type = %event.event_type,
                    operation_id = %event.operation_id,
                    "Shared-store publish failed: {}", e
                );
                self.counters.publish_failures.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    async fn subscribe(&self, pattern: &str, handler: SharedHandler) -> SubscriptionId {
        let id = self.subscriptions.add(pattern, handler).await;
        tracing::debug!(pattern, subscription_id = %id, "Subscribed");
        id
    }

    async fn unsubscribe(&self, id: &str) -> bool {
        self.subscriptions.remove(id).await
    }

    async fn history(&self, query: HistoryQuery) -> EventResult<Vec<Event>> {
        let cutoff = self.history_cutoff();
        let since = query
            .since
            .map(|s| s.timestamp_millis().max(cutoff))
            .unwrap_or(cutoff);
        let events = self.read_history(since).await?;
        Ok(query.apply(events.iter()))
    }

    async fn health(&self) -> BusHealth {
        let state = self.state.read().await.clone();
        BusHealth {
            healthy: self.initialized.load(Ordering::SeqCst) && state.is_healthy(),
            backend: self.backend,
            details: serde_json::json!({
                "projectId": self.project_id,
                "reconnection": state,
                "subscriptions": self.subscriptions.len().await,
            }),
        }
    }

    async fn stats(&self) -> BusStats {
        let history_size = match self.store.zrange_from(HISTORY_KEY, self.history_cutoff()).await {
            Ok(entries) => entries.len(),
            Err(_) => 0,
        };
        let mut stats = BusStats {
            backend: self.backend,
            subscriptions: self.subscriptions.len().await,
            history_size,
            ..Default::default()
        };
        self.counters.fill(&mut stats);
        stats
    }

    async fn close(&self) {
        let mut tasks = self.tasks.lock().await;
        for handle in tasks.drain(..) {
            handle.abort();
        }
        self.store.disconnect().await;
        self.subscriptions.clear().await;
        {
            let mut state = self.state.write().await;
            state.connected = false;
            state.publisher_ready = false;
            state.subscriber_ready = false;
        }
        self.initialized.store(false, Ordering::SeqCst);
        tracing::info!(project_id = %self.project_id, "Shared-store event bus closed");
    }
}
