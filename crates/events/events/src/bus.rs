//! Event bus contract shared by every backend.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;

use crate::config::BusBackend;
use crate::error::EventResult;
use crate::event::Event;
use crate::handler::{self, SharedHandler};
use crate::pattern;

/// Identifier returned by [`EventBus::subscribe`].
pub type SubscriptionId = String;

/// The publish/subscribe contract.
///
/// Patterns follow [`pattern::matches`]. Implementations catch and log
/// handler failures; `publish` reports only whether the event was accepted
/// by the transport.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Returns which backend this bus runs on.
    fn backend(&self) -> BusBackend;

    /// Connects the transport and starts background maintenance.
    async fn initialize(&self) -> EventResult<()>;

    /// Publishes an event. Returns `false` if the transport rejected it.
    async fn publish(&self, event: Event) -> bool;

    /// Subscribes a handler to a pattern.
    async fn subscribe(&self, pattern: &str, handler: SharedHandler) -> SubscriptionId;

    /// Removes a subscription. Returns `false` if it did not exist.
    async fn unsubscribe(&self, id: &str) -> bool;

    /// Returns past events matching the query, oldest first.
    async fn history(&self, query: HistoryQuery) -> EventResult<Vec<Event>>;

    /// Reports transport health.
    async fn health(&self) -> BusHealth;

    /// Reports counters.
    async fn stats(&self) -> BusStats;

    /// Stops background work and releases the transport.
    async fn close(&self);
}

/// Query parameters for event history.
#[derive(Debug, Clone, Default)]
pub struct HistoryQuery {
    /// Only events whose type matches this pattern.
    pub pattern: Option<String>,
    /// Maximum number of (most recent) events to return.
    pub limit: Option<usize>,
    /// Only events at or after this time.
    pub since: Option<DateTime<Utc>>,
}

impl HistoryQuery {
    /// Creates an unfiltered query.
    pub fn new() -> Self {
        Self::default()
    }

    /// Filters by pattern.
    pub fn pattern(mut self, pattern: impl Into<String>) -> Self {
        self.pattern = Some(pattern.into());
        self
    }

    /// Limits the result to the most recent `limit` events.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Filters out events older than `since`.
    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    /// Checks whether a single event passes the pattern and time filters.
    pub fn accepts(&self, event: &Event) -> bool {
        if let Some(since) = self.since {
            if event.timestamp < since {
                return false;
            }
        }
        match &self.pattern {
            Some(p) => pattern::matches(p, event.event_type.as_str()),
            None => true,
        }
    }

    /// Filters chronologically ordered events and keeps the most recent `limit`.
    pub fn apply<'a>(&self, events: impl IntoIterator<Item = &'a Event>) -> Vec<Event> {
        let mut matched: Vec<Event> = events
            .into_iter()
            .filter(|e| self.accepts(e))
            .cloned()
            .collect();
        if let Some(limit) = self.limit {
            if matched.len() > limit {
                matched.drain(..matched.len() - limit);
            }
        }
        matched
    }
}

/// Health report of a bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusHealth {
    /// Whether the bus can currently deliver events.
    pub healthy: bool,
    /// Backend in use.
    pub backend: BusBackend,
    /// Backend-specific details.
    pub details: Value,
}

/// Counters reported by a bus.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BusStats {
    /// Backend in use.
    pub backend: BusBackend,
    /// Events accepted by `publish`.
    pub published: u64,
    /// Events rejected by `publish`.
    pub publish_failures: u64,
    /// Handler invocations that succeeded.
    pub delivered: u64,
    /// Handler invocations that returned an error.
    pub handler_errors: u64,
    /// Live subscriptions.
    pub subscriptions: usize,
    /// Events currently retained in history.
    pub history_size: usize,
    /// Operations that have started but not reached a terminal event.
    pub active_operations: usize,
}

struct Subscription {
    id: SubscriptionId,
    pattern: String,
    handler: SharedHandler,
}

/// Pattern-keyed subscriber list used by both backends.
///
/// Every publish is matched against every live subscription; subscription
/// counts are expected to stay in the tens.
#[derive(Default)]
pub(crate) struct SubscriptionRegistry {
    subs: RwLock<Vec<Subscription>>,
}

impl SubscriptionRegistry {
    pub(crate) async fn add(&self, pattern: &str, handler: SharedHandler) -> SubscriptionId {
        let id = uuid::Uuid::new_v4().to_string();
        let mut subs = self.subs.write().await;
        subs.push(Subscription {
            id: id.clone(),
            pattern: pattern.to_string(),
            handler,
        });
        id
    }

    pub(crate) async fn remove(&self, id: &str) -> bool {
        let mut subs = self.subs.write().await;
        let before = subs.len();
        subs.retain(|s| s.id != id);
        subs.len() != before
    }

    pub(crate) async fn len(&self) -> usize {
        self.subs.read().await.len()
    }

    pub(crate) async fn clear(&self) {
        self.subs.write().await.clear();
    }

    /// Collects matching handlers in subscription order.
    ///
    /// The lock is released before handlers run so a handler may subscribe
    /// or unsubscribe without deadlocking.
    pub(crate) async fn matching(&self, event_type: &str) -> Vec<SharedHandler> {
        let subs = self.subs.read().await;
        subs.iter()
            .filter(|s| pattern::matches(&s.pattern, event_type))
            .map(|s| s.handler.clone())
            .collect()
    }

    /// Delivers an event to every matching handler, sequentially.
    pub(crate) async fn dispatch(&self, event: &Event, counters: &BusCounters) {
        for h in self.matching(event.event_type.as_str()).await {
            if handler::dispatch(h.as_ref(), event).await {
                counters.delivered.fetch_add(1, Ordering::Relaxed);
            } else {
                counters.handler_errors.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

#[derive(Default)]
pub(crate) struct BusCounters {
    pub(crate) published: AtomicU64,
    pub(crate) publish_failures: AtomicU64,
    pub(crate) delivered: AtomicU64,
    pub(crate) handler_errors: AtomicU64,
}

impl BusCounters {
    pub(crate) fn fill(&self, stats: &mut BusStats) {
        stats.published = self.published.load(Ordering::Relaxed);
        stats.publish_failures = self.publish_failures.load(Ordering::Relaxed);
        stats.delivered = self.delivered.load(Ordering::Relaxed);
        stats.handler_errors = self.handler_errors.load(Ordering::Relaxed);
    }
}
