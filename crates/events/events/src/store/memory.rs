use super::trait_def::*;
use crate::{EventError, EventResult};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};

/// In-memory implementation of [`SharedStore`].
///
/// Behaves like a single shared server: every bus connected to the same
/// instance sees every other bus's publishes. Useful for tests and local
/// development; data is lost when the process exits.
pub struct MemorySharedStore {
    inner: Mutex<Inner>,
    reachable: AtomicBool,
}

#[derive(Default)]
struct Inner {
    sorted_sets: HashMap<String, Vec<(i64, String)>>,
    ttls: HashMap<String, Duration>,
    subscribers: Vec<(String, mpsc::UnboundedSender<StoreMessage>)>,
    listeners: Vec<ConnectionEventSender>,
}

impl MemorySharedStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            reachable: AtomicBool::new(true),
        }
    }

    /// Creates a store whose `connect` always fails.
    pub fn unreachable() -> Self {
        let store = Self::new();
        store.reachable.store(false, Ordering::SeqCst);
        store
    }

    /// Makes subsequent `connect` calls succeed or fail.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Reports a connection state change to every connected bus.
    pub async fn notify(&self, role: ConnectionRole, event: ConnectionEvent) {
        let inner = self.inner.lock().await;
        for listener in &inner.listeners {
            let _ = listener.send((role, event.clone()));
        }
    }

    /// Returns the TTL last set on a key.
    pub async fn ttl(&self, key: &str) -> Option<Duration> {
        self.inner.lock().await.ttls.get(key).copied()
    }

    /// Returns the number of members in a sorted set.
    pub async fn zcard(&self, key: &str) -> usize {
        self.inner
            .lock()
            .await
            .sorted_sets
            .get(key)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

impl Default for MemorySharedStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SharedStore for MemorySharedStore {
    async fn connect(&self, events: ConnectionEventSender) -> EventResult<()> {
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(EventError::Connection("memory store is unreachable".into()));
        }
        let _ = events.send((ConnectionRole::Publisher, ConnectionEvent::Ready));
        let _ = events.send((ConnectionRole::Subscriber, ConnectionEvent::Ready));
        self.inner.lock().await.listeners.push(events);
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &str) -> EventResult<()> {
        let mut inner = self.inner.lock().await;
        inner.subscribers.retain(|(_, tx)| !tx.is_closed());
        for (pattern, tx) in &inner.subscribers {
            if glob_matches(pattern, channel) {
                let _ = tx.send(StoreMessage {
                    channel: channel.to_string(),
                    payload: payload.to_string(),
                });
            }
        }
        Ok(())
    }

    async fn psubscribe(&self, pattern: &str) -> EventResult<mpsc::UnboundedReceiver<StoreMessage>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.lock().await.subscribers.push((pattern.to_string(), tx));
        Ok(rx)
    }

    async fn zadd(&self, key: &str, member: &str, score: i64) -> EventResult<()> {
        let mut inner = self.inner.lock().await;
        let set = inner.sorted_sets.entry(key.to_string()).or_default();
        set.retain(|(_, m)| m != member);
        let idx = set.partition_point(|(s, _)| *s <= score);
        set.insert(idx, (score, member.to_string()));
        Ok(())
    }

    async fn zremrange_below(&self, key: &str, min_score: i64) -> EventResult<u64> {
        let mut inner = self.inner.lock().await;
        let Some(set) = inner.sorted_sets.get_mut(key) else {
            return Ok(0);
        };
        let before = set.len();
        set.retain(|(s, _)| *s >= min_score);
        Ok((before - set.len()) as u64)
    }

    async fn zrange_from(&self, key: &str, min_score: i64) -> EventResult<Vec<String>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .sorted_sets
            .get(key)
            .map(|set| {
                set.iter()
                    .filter(|(s, _)| *s >= min_score)
                    .map(|(_, m)| m.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> EventResult<()> {
        self.inner.lock().await.ttls.insert(key.to_string(), ttl);
        Ok(())
    }

    async fn disconnect(&self) {
        let mut inner = self.inner.lock().await;
        inner.subscribers.clear();
        inner.listeners.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pattern_publish() {
        let store = MemorySharedStore::new();
        let mut rx = store.psubscribe("dxp.ACME.*").await.unwrap();

        store.publish("dxp.ACME.export.started", "one").await.unwrap();
        store.publish("dxp.OTHER.export.started", "two").await.unwrap();

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.payload, "one");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_sorted_set() {
        let store = MemorySharedStore::new();
        store.zadd("k", "c", 30).await.unwrap();
        store.zadd("k", "a", 10).await.unwrap();
        store.zadd("k", "b", 20).await.unwrap();

        assert_eq!(store.zrange_from("k", 15).await.unwrap(), vec!["b", "c"]);
        assert_eq!(store.zremrange_below("k", 20).await.unwrap(), 1);
        assert_eq!(store.zcard("k").await, 2);
    }

    #[tokio::test]
    async fn test_unreachable_connect_fails() {
        let store = MemorySharedStore::unreachable();
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(store.connect(tx).await.is_err());
    }
}
