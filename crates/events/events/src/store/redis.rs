use super::trait_def::*;
use crate::{EventError, EventResult};
use async_trait::async_trait;
use futures::StreamExt;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, Notify, RwLock, mpsc};
use tokio::task::JoinHandle;

type PatternSenders = Arc<Mutex<Vec<(String, mpsc::UnboundedSender<StoreMessage>)>>>;

/// Redis implementation of [`SharedStore`].
///
/// Commands go through a [`ConnectionManager`], which reconnects on its own;
/// pattern subscriptions run on a dedicated pub/sub connection owned by a
/// background task that re-subscribes after every reconnect.
pub struct RedisStore {
    client: redis::Client,
    publisher: RwLock<Option<ConnectionManager>>,
    publisher_failed: AtomicBool,
    patterns: PatternSenders,
    patterns_changed: Arc<Notify>,
    events: RwLock<Option<ConnectionEventSender>>,
    subscriber_task: Mutex<Option<JoinHandle<()>>>,
    resubscribe_delay: Duration,
}

impl RedisStore {
    /// Creates a store for a `redis://` connection string. No I/O happens
    /// until [`SharedStore::connect`].
    pub fn new(url: &str) -> EventResult<Self> {
        let client = redis::Client::open(url)?;
        Ok(Self {
            client,
            publisher: RwLock::new(None),
            publisher_failed: AtomicBool::new(false),
            patterns: Arc::new(Mutex::new(Vec::new())),
            patterns_changed: Arc::new(Notify::new()),
            events: RwLock::new(None),
            subscriber_task: Mutex::new(None),
            resubscribe_delay: Duration::from_millis(500),
        })
    }

    async fn connection(&self) -> EventResult<ConnectionManager> {
        self.publisher
            .read()
            .await
            .clone()
            .ok_or_else(|| EventError::NotReady("redis publisher not connected".into()))
    }

    async fn report(&self, event: ConnectionEvent) {
        if let Some(tx) = self.events.read().await.as_ref() {
            let _ = tx.send((ConnectionRole::Publisher, event));
        }
    }

    /// Tracks publisher health from command outcomes; the connection manager
    /// reconnects transparently, so failures and recoveries are inferred.
    async fn observe<T>(&self, result: redis::RedisResult<T>) -> EventResult<T> {
        match result {
            Ok(value) => {
                if self.publisher_failed.swap(false, Ordering::SeqCst) {
                    self.report(ConnectionEvent::Ready).await;
                }
                Ok(value)
            }
            Err(e) => {
                if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() {
                    self.publisher_failed.store(true, Ordering::SeqCst);
                    self.report(ConnectionEvent::Disconnected(e.to_string())).await;
                    self.report(ConnectionEvent::Reconnecting).await;
                }
                Err(e.into())
            }
        }
    }
}

async fn run_subscriber(
    client: redis::Client,
    patterns: PatternSenders,
    changed: Arc<Notify>,
    events: ConnectionEventSender,
    delay: Duration,
) {
    loop {
        match client.get_async_pubsub().await {
            Ok(mut pubsub) => {
                let mut subscribed: Vec<String> = Vec::new();
                let reason = 'session: loop {
                    let wanted: Vec<String> = {
                        let senders = patterns.lock().await;
                        senders.iter().map(|(p, _)| p.clone()).collect()
                    };
                    for pattern in wanted {
                        if subscribed.contains(&pattern) {
                            continue;
                        }
                        if let Err(e) = pubsub.psubscribe(&pattern).await {
                            break 'session e.to_string();
                        }
                        subscribed.push(pattern);
                    }
                    let _ = events.send((ConnectionRole::Subscriber, ConnectionEvent::Ready));

                    let mut stream = std::pin::pin!(pubsub.on_message());
                    loop {
                        tokio::select! {
                            msg = stream.next() => {
                                let Some(msg) = msg else {
                                    break 'session "subscription stream ended".to_string();
                                };
                                let payload: String = match msg.get_payload() {
                                    Ok(p) => p,
                                    Err(e) => {
                                        tracing::warn!("Dropping undecodable pub/sub payload: {}", e);
                                        continue;
                                    }
                                };
                                let pattern: Option<String> = msg.get_pattern().ok();
                                let channel = msg.get_channel_name().to_string();
                                let mut senders = patterns.lock().await;
                                senders.retain(|(_, tx)| !tx.is_closed());
                                for (p, tx) in senders.iter() {
                                    if pattern.as_deref().map_or(true, |m| m == p) {
                                        let _ = tx.send(StoreMessage {
                                            channel: channel.clone(),
                                            payload: payload.clone(),
                                        });
                                    }
                                }
                            }
                            _ = changed.notified() => break,
                        }
                    }
                };
                let _ = events.send((ConnectionRole::Subscriber, ConnectionEvent::Disconnected(reason)));
            }
            Err(e) => {
                let _ = events.send((
                    ConnectionRole::Subscriber,
                    ConnectionEvent::Disconnected(e.to_string()),
                ));
            }
        }
        let _ = events.send((ConnectionRole::Subscriber, ConnectionEvent::Reconnecting));
        tokio::time::sleep(delay).await;
    }
}

#[async_trait]
impl SharedStore for RedisStore {
    async fn connect(&self, events: ConnectionEventSender) -> EventResult<()> {
        let manager = ConnectionManager::new(self.client.clone()).await?;
        *self.publisher.write().await = Some(manager);
        *self.events.write().await = Some(events.clone());
        let _ = events.send((ConnectionRole::Publisher, ConnectionEvent::Ready));

        let mut task = self.subscriber_task.lock().await;
        if task.is_none() {
            *task = Some(tokio::spawn(run_subscriber(
                self.client.clone(),
                self.patterns.clone(),
                self.patterns_changed.clone(),
                events,
                self.resubscribe_delay,
            )));
        }
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &str) -> EventResult<()> {
        let mut conn = self.connection().await?;
        let result: redis::RedisResult<i64> = conn.publish(channel, payload).await;
        self.observe(result).await.map(|_| ())
    }

    async fn psubscribe(&self, pattern: &str) -> EventResult<mpsc::UnboundedReceiver<StoreMessage>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.patterns.lock().await.push((pattern.to_string(), tx));
        self.patterns_changed.notify_one();
        Ok(rx)
    }

    async fn zadd(&self, key: &str, member: &str, score: i64) -> EventResult<()> {
        let mut conn = self.connection().await?;
        let result: redis::RedisResult<i64> = conn.zadd(key, member, score).await;
        self.observe(result).await.map(|_| ())
    }

    async fn zremrange_below(&self, key: &str, min_score: i64) -> EventResult<u64> {
        let mut conn = self.connection().await?;
        let result: redis::RedisResult<u64> =
            conn.zrembyscore(key, "-inf", format!("({}", min_score)).await;
        self.observe(result).await
    }

    async fn zrange_from(&self, key: &str, min_score: i64) -> EventResult<Vec<String>> {
        let mut conn = self.connection().await?;
        let result: redis::RedisResult<Vec<String>> =
            conn.zrangebyscore(key, min_score, "+inf").await;
        self.observe(result).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> EventResult<()> {
        let mut conn = self.connection().await?;
        let result: redis::RedisResult<bool> = conn.expire(key, ttl.as_secs() as i64).await;
        self.observe(result).await.map(|_| ())
    }

    async fn disconnect(&self) {
        if let Some(handle) = self.subscriber_task.lock().await.take() {
            handle.abort();
        }
        self.patterns.lock().await.clear();
        *self.publisher.write().await = None;
        *self.events.write().await = None;
    }
}
