use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::EventResult;

/// Which of the two store connections a notification concerns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionRole {
    /// Connection used for PUBLISH and sorted-set commands.
    Publisher,
    /// Connection dedicated to pattern subscriptions.
    Subscriber,
}

impl std::fmt::Display for ConnectionRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Publisher => f.write_str("publisher"),
            Self::Subscriber => f.write_str("subscriber"),
        }
    }
}

/// Connection state change reported by a store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The connection is usable.
    Ready,
    /// The connection dropped.
    Disconnected(String),
    /// The connection library is attempting to reconnect.
    Reconnecting,
}

/// Channel on which a store reports connection state changes.
pub type ConnectionEventSender = mpsc::UnboundedSender<(ConnectionRole, ConnectionEvent)>;

/// A message received on a pattern subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreMessage {
    /// Channel the message was published on.
    pub channel: String,
    /// Raw payload.
    pub payload: String,
}

/// A shared pub/sub + sorted-set store.
///
/// Implementations keep two independent connections: pattern subscriptions
/// cannot be multiplexed with imperative commands on one link.
#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Opens both connections. State changes are reported on `events`.
    async fn connect(&self, events: ConnectionEventSender) -> EventResult<()>;

    /// Publishes a payload on a channel.
    async fn publish(&self, channel: &str, payload: &str) -> EventResult<()>;

    /// Subscribes to a glob pattern of channels.
    async fn psubscribe(&self, pattern: &str) -> EventResult<mpsc::UnboundedReceiver<StoreMessage>>;

    /// Adds a member to a sorted set.
    async fn zadd(&self, key: &str, member: &str, score: i64) -> EventResult<()>;

    /// Removes sorted-set members with a score strictly below `min_score`.
    async fn zremrange_below(&self, key: &str, min_score: i64) -> EventResult<u64>;

    /// Returns sorted-set members with a score of at least `min_score`, ascending.
    async fn zrange_from(&self, key: &str, min_score: i64) -> EventResult<Vec<String>>;

    /// Sets a key's time to live.
    async fn expire(&self, key: &str, ttl: Duration) -> EventResult<()>;

    /// Closes both connections.
    async fn disconnect(&self);
}

/// Redis-style glob match supporting `*` and `?`.
pub fn glob_matches(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            backtrack = Some((pi, ti));
            pi += 1;
        } else if let Some((star, matched)) = backtrack {
            pi = star + 1;
            ti = matched + 1;
            backtrack = Some((star, matched + 1));
        } else {
            return false;
        }
    }
    p[pi..].iter().all(|c| *c == '*')
}
