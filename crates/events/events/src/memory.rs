//! In-process event bus.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::bus::{
    BusCounters, BusHealth, BusStats, EventBus, HistoryQuery, SubscriptionId,
    SubscriptionRegistry,
};
use crate::config::{BusBackend, BusConfig};
use crate::error::EventResult;
use crate::event::{Event, OperationKind};
use crate::handler::SharedHandler;

/// An operation that has started but not yet reached a terminal event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveOperation {
    /// Operation identifier.
    pub operation_id: String,
    /// Operation kind.
    pub kind: OperationKind,
    /// When the first event for this operation was seen.
    pub started_at: DateTime<Utc>,
    /// The most recent event.
    pub last_event: Event,
}

type History = Arc<RwLock<VecDeque<Event>>>;

/// Single-process bus with bounded history.
///
/// Fan-out is sequential and finishes before `publish` returns, so matching
/// subscribers observe events in publish order.
pub struct MemoryEventBus {
    max_events: usize,
    max_age: chrono::Duration,
    sweep_interval: std::time::Duration,
    subscriptions: SubscriptionRegistry,
    history: History,
    active: RwLock<HashMap<String, ActiveOperation>>,
    counters: BusCounters,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl MemoryEventBus {
    /// Creates a bus with default limits.
    pub fn new() -> Self {
        Self::with_config(&BusConfig::default())
    }

    /// Creates a bus using the history settings of a configuration.
    pub fn with_config(config: &BusConfig) -> Self {
        Self {
            max_events: config.history_max_events,
            max_age: chrono::Duration::from_std(config.history_max_age())
                .unwrap_or_else(|_| chrono::Duration::hours(24)),
            sweep_interval: config.history_sweep_interval(),
            subscriptions: SubscriptionRegistry::default(),
            history: Arc::new(RwLock::new(VecDeque::new())),
            active: RwLock::new(HashMap::new()),
            counters: BusCounters::default(),
            sweeper: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// Returns the operations currently in flight.
    pub async fn active_operations(&self) -> Vec<ActiveOperation> {
        self.active.read().await.values().cloned().collect()
    }

    /// Returns a single in-flight operation.
    pub async fn active_operation(&self, operation_id: &str) -> Option<ActiveOperation> {
        self.active.read().await.get(operation_id).cloned()
    }

    /// Drops history entries beyond the count and age limits.
    pub async fn prune_history(&self) -> usize {
        prune(&self.history, self.max_events, self.max_age).await
    }

    async fn track_operation(&self, event: &Event) {
        let mut active = self.active.write().await;
        if event.is_terminal() {
            if active.remove(&event.operation_id).is_some() {
                tracing::debug!(operation_id = %event.operation_id, "Operation completed");
            }
            return;
        }

        active
            .entry(event.operation_id.clone())
            .and_modify(|op| op.last_event = event.clone())
            .or_insert_with(|| ActiveOperation {
                operation_id: event.operation_id.clone(),
                kind: event.kind(),
                started_at: Utc::now(),
                last_event: event.clone(),
            });
    }

    async fn store_in_history(&self, event: Event) {
        let cutoff = Utc::now() - self.max_age;
        let mut history = self.history.write().await;
        history.push_back(event);
        while history.len() > self.max_events {
            history.pop_front();
        }
        history.retain(|e| e.timestamp >= cutoff);
    }
}

impl Default for MemoryEventBus {
    fn default() -> Self {
        Self::new()
    }
}

async fn prune(history: &History, max_events: usize, max_age: chrono::Duration) -> usize {
    let cutoff = Utc::now() - max_age;
    let mut history = history.write().await;
    let before = history.len();
    history.retain(|e| e.timestamp >= cutoff);
    while history.len() > max_events {
        history.pop_front();
    }
    before - history.len()
}

#[async_trait]
impl EventBus for MemoryEventBus {
    fn backend(&self) -> BusBackend {
        BusBackend::Memory
    }

    async fn initialize(&self) -> EventResult<()> {
        self.closed.store(false, Ordering::SeqCst);

        let mut sweeper = self.sweeper.lock().await;
        if sweeper.is_none() {
            let history = self.history.clone();
            let (max_events, max_age, every) = (self.max_events, self.max_age, self.sweep_interval);
            *sweeper = Some(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(every);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    let removed = prune(&history, max_events, max_age).await;
                    if removed > 0 {
                        tracing::debug!(removed, "Pruned event history");
                    }
                }
            }));
        }

        tracing::info!(
            max_events = self.max_events,
            max_age_secs = self.max_age.num_seconds(),
            "In-process event bus initialized"
        );
        Ok(())
    }

    async fn publish(&self, event: Event) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            tracing::warn!(event_type = %event.event_type, "Publish on closed bus");
            self.counters.publish_failures.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        if let Err(e) = event.validate() {
            tracing::warn!(event_type = %event.event_type, "Rejected invalid event: {}", e);
            self.counters.publish_failures.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        self.track_operation(&event).await;
        self.store_in_history(event.clone()).await;
        self.counters.published.fetch_add(1, Ordering::Relaxed);

        self.subscriptions.dispatch(&event, &self.counters).await;
        true
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
        let history = self.history.read().await;
        Ok(query.apply(history.iter()))
    }

    async fn health(&self) -> BusHealth {
        let closed = self.closed.load(Ordering::SeqCst);
        BusHealth {
            healthy: !closed,
            backend: BusBackend::Memory,
            details: serde_json::json!({
                "closed": closed,
                "historySize": self.history.read().await.len(),
                "subscriptions": self.subscriptions.len().await,
                "activeOperations": self.active.read().await.len(),
            }),
        }
    }

    async fn stats(&self) -> BusStats {
        let mut stats = BusStats {
            backend: BusBackend::Memory,
            subscriptions: self.subscriptions.len().await,
            history_size: self.history.read().await.len(),
            active_operations: self.active.read().await.len(),
            ..Default::default()
        };
        self.counters.fill(&mut stats);
        stats
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(handle) = self.sweeper.lock().await.take() {
            handle.abort();
        }
        self.subscriptions.clear().await;
        self.history.write().await.clear();
        self.active.write().await.clear();
        tracing::info!("In-process event bus closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EventError;
    use crate::event::EventType;
    use crate::handler::FnHandler;
    use std::time::Duration;

    fn collector(sink: Arc<Mutex<Vec<String>>>) -> SharedHandler {
        FnHandler::shared("collector", move |event: Event| {
            let sink = sink.clone();
            async move {
                sink.lock().await.push(format!("{}:{}", event.event_type, event.operation_id));
                Ok(())
            }
        })
    }

    #[tokio::test]
    async fn test_subscriber_receives_in_publish_order() {
        let bus = MemoryEventBus::new();
        bus.initialize().await.unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe("deployment.*", collector(seen.clone())).await;

        assert!(bus.publish(Event::new(EventType::DeploymentStarted, "d1")).await);
        assert!(bus.publish(Event::new(EventType::ExportStarted, "e1")).await);
        assert!(bus.publish(Event::new(EventType::DeploymentSucceeded, "d1")).await);

        // Fan-out is synchronous: no waiting needed.
        let seen = seen.lock().await;
        assert_eq!(
            *seen,
            vec!["deployment.started:d1", "deployment.succeeded:d1"]
        );
    }

    #[tokio::test]
    async fn test_failing_handler_does_not_block_others() {
        let bus = MemoryEventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe(
            "*",
            FnHandler::shared("broken", |_e: Event| async {
                Err(EventError::HandlerFailed("boom".into()))
            }),
        )
        .await;
        bus.subscribe("*", collector(seen.clone())).await;

        assert!(bus.publish(Event::new(EventType::DownloadStarted, "x")).await);
        assert_eq!(seen.lock().await.len(), 1);

        let stats = bus.stats().await;
        assert_eq!(stats.handler_errors, 1);
        assert_eq!(stats.delivered, 1);
        assert_eq!(stats.published, 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let bus = MemoryEventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let id = bus.subscribe("*", collector(seen.clone())).await;

        bus.publish(Event::new(EventType::ExportStarted, "e1")).await;
        assert!(bus.unsubscribe(&id).await);
        bus.publish(Event::new(EventType::ExportSucceeded, "e1")).await;

        assert_eq!(seen.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn test_active_operation_lifecycle() {
        let bus = MemoryEventBus::new();

        bus.publish(Event::new(EventType::DeploymentStarted, "dep-1")).await;
        bus.publish(Event::new(EventType::DeploymentInProgress, "dep-1")).await;
        let op = bus.active_operation("dep-1").await.unwrap();
        assert_eq!(op.kind, OperationKind::Deployment);
        assert_eq!(op.last_event.event_type, EventType::DeploymentInProgress);
        assert_eq!(bus.active_operations().await.len(), 1);

        bus.publish(Event::new(EventType::DeploymentReset, "dep-1")).await;
        assert!(bus.active_operation("dep-1").await.is_none());
    }

    #[tokio::test]
    async fn test_history_bounded_by_count() {
        let config = BusConfig::default().history_limits(10, Duration::from_secs(3600));
        let bus = MemoryEventBus::with_config(&config);

        for i in 0..15 {
            bus.publish(Event::new(EventType::ExportInProgress, format!("e{}", i))).await;
        }

        let all = bus.history(HistoryQuery::new()).await.unwrap();
        assert_eq!(all.len(), 10);
        assert_eq!(all[0].operation_id, "e5");

        let recent = bus.history(HistoryQuery::new().limit(3)).await.unwrap();
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[2].operation_id, "e14");
    }

    #[tokio::test]
    async fn test_history_bounded_by_age() {
        let config = BusConfig::default().history_limits(100, Duration::from_secs(60));
        let bus = MemoryEventBus::with_config(&config);

        let stale = Event::new(EventType::ExportStarted, "old")
            .with_timestamp(Utc::now() - chrono::Duration::minutes(5));
        bus.publish(stale).await;
        bus.publish(Event::new(EventType::ExportStarted, "new")).await;

        let all = bus.history(HistoryQuery::new()).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].operation_id, "new");
    }

    #[tokio::test]
    async fn test_stale_event_behind_fresh_one_is_pruned() {
        let config = BusConfig::default().history_limits(100, Duration::from_secs(60));
        let bus = MemoryEventBus::with_config(&config);

        bus.publish(Event::new(EventType::ExportStarted, "new")).await;
        let stale = Event::new(EventType::ExportStarted, "old")
            .with_timestamp(Utc::now() - chrono::Duration::minutes(5));
        bus.publish(stale).await;

        let ids: Vec<String> = bus
            .history(HistoryQuery::new())
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.operation_id)
            .collect();
        assert_eq!(ids, vec!["new".to_string()]);
    }

    #[tokio::test]
    async fn test_rejects_invalid_event() {
        let bus = MemoryEventBus::new();
        assert!(!bus.publish(Event::new(EventType::ExportStarted, "")).await);
        assert_eq!(bus.stats().await.publish_failures, 1);
    }

    #[tokio::test]
    async fn test_close_marks_unhealthy() {
        let bus = MemoryEventBus::new();
        bus.initialize().await.unwrap();
        assert!(bus.health().await.healthy);

        bus.close().await;
        assert!(!bus.health().await.healthy);
        assert!(!bus.publish(Event::new(EventType::ExportStarted, "e")).await);
    }
}
