//! Per-destination retry queue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::delivery::{DeliveryResult, SendOptions, WebhookDelivery, WebhookSender};
use crate::retry::{DEFAULT_RETRY_DELAYS_MS, RetrySchedule};

/// Retry queue configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QueueConfig {
    /// Maximum webhooks pending across all destinations.
    pub max_queue_size: usize,
    /// Attempts per webhook, including the first.
    pub max_retries: u32,
    /// Delays between attempts, in milliseconds.
    pub retry_delays_ms: Vec<u64>,
    /// Entries kept in the delivery log.
    pub delivery_log_size: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 1000,
            max_retries: 3,
            retry_delays_ms: DEFAULT_RETRY_DELAYS_MS.to_vec(),
            delivery_log_size: 100,
        }
    }
}

impl QueueConfig {
    /// Sets the capacity.
    pub fn max_queue_size(mut self, size: usize) -> Self {
        self.max_queue_size = size;
        self
    }

    /// Sets the attempts per webhook.
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Sets the retry delays.
    pub fn retry_delays_ms(mut self, delays: impl Into<Vec<u64>>) -> Self {
        self.retry_delays_ms = delays.into();
        self
    }

    /// Returns the retry schedule.
    pub fn schedule(&self) -> RetrySchedule {
        RetrySchedule::new(self.retry_delays_ms.clone())
    }
}

/// Options for [`RetryQueue::enqueue`].
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    /// Entry id. A fresh UUID is used when absent.
    pub webhook_id: Option<String>,
    pub headers: HashMap<String, String>,
}

/// A failed attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryFailure {
    pub attempt: u32,
    pub error: String,
    pub status_code: Option<u16>,
    pub timestamp: DateTime<Utc>,
}

/// A webhook waiting for (re)delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedWebhook {
    pub id: String,
    pub webhook_id: Option<String>,
    pub url: String,
    pub payload: Value,
    pub headers: HashMap<String, String>,
    pub attempts: u32,
    pub max_retries: u32,
    pub queued_at: DateTime<Utc>,
    pub last_attempt: Option<DateTime<Utc>>,
    /// Epoch milliseconds of the next scheduled attempt.
    pub next_retry: Option<i64>,
    pub failures: Vec<DeliveryFailure>,
}

/// Queue counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    /// Webhooks accepted by `enqueue`.
    pub queued: u64,
    /// Webhooks delivered.
    pub sent: u64,
    /// Webhooks given up on.
    pub failed: u64,
    /// Retries scheduled.
    pub retrying: u64,
    /// Webhooks currently pending.
    pub queue_depth: usize,
    /// Destinations with pending webhooks.
    pub destinations: usize,
}

/// Bounded retry queue with one FIFO per destination URL.
///
/// Every accepted webhook is attempted right away on a spawned task. Failed
/// retryable attempts are rescheduled from the [`RetrySchedule`] until
/// `max_retries` attempts have been made. Cloning shares the queue.
#[derive(Clone)]
pub struct RetryQueue {
    inner: Arc<Inner>,
}

struct Inner {
    config: QueueConfig,
    retry_schedule: RetrySchedule,
    sender: Arc<dyn WebhookSender>,
    queues: Mutex<HashMap<String, VecDeque<QueuedWebhook>>>,
    in_flight: Mutex<HashSet<String>>,
    timers: StdMutex<HashMap<String, JoinHandle<()>>>,
    log: Mutex<VecDeque<WebhookDelivery>>,
    queued: AtomicU64,
    sent: AtomicU64,
    failed: AtomicU64,
    retrying: AtomicU64,
}

impl RetryQueue {
    /// Creates a queue.
    pub fn new(config: QueueConfig, sender: Arc<dyn WebhookSender>) -> Self {
        Self {
            inner: Arc::new(Inner {
                retry_schedule: config.schedule(),
                config,
                sender,
                queues: Mutex::new(HashMap::new()),
                in_flight: Mutex::new(HashSet::new()),
                timers: StdMutex::new(HashMap::new()),
                log: Mutex::new(VecDeque::new()),
                queued: AtomicU64::new(0),
                sent: AtomicU64::new(0),
                failed: AtomicU64::new(0),
                retrying: AtomicU64::new(0),
            }),
        }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    /// Queues a payload for delivery and returns its id.
    ///
    /// Returns `None` when the queue is full or an entry with the same id is
    /// still pending.
    pub async fn enqueue(&self, url: &str, payload: Value, options: EnqueueOptions) -> Option<String> {
        let id = options
            .webhook_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        {
            let mut queues = self.inner.queues.lock().await;
            let depth: usize = queues.values().map(VecDeque::len).sum();
            if depth >= self.inner.config.max_queue_size {
                tracing::warn!(url, depth, "Webhook queue full, dropping delivery");
                return None;
            }
            if queues.values().flatten().any(|w| w.id == id) {
                tracing::warn!(url, queued_id = %id, "Webhook already pending, dropping delivery");
                return None;
            }
            queues.entry(url.to_string()).or_default().push_back(QueuedWebhook {
                id: id.clone(),
                webhook_id: options.webhook_id,
                url: url.to_string(),
                payload,
                headers: options.headers,
                attempts: 0,
                max_retries: self.inner.config.max_retries,
                queued_at: Utc::now(),
                last_attempt: None,
                next_retry: None,
                failures: Vec::new(),
            });
        }
        self.inner.queued.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(url, queued_id = %id, "Webhook queued");

        self.inner.clone().schedule(url.to_string(), id.clone(), Duration::ZERO);
        Some(id)
    }

    /// Returns pending webhooks, grouped by destination.
    pub async fn pending(&self) -> Vec<QueuedWebhook> {
        let queues = self.inner.queues.lock().await;
        queues.values().flat_map(|q| q.iter().cloned()).collect()
    }

    /// Returns the most recent delivery records, newest first.
    pub async fn recent_deliveries(&self, limit: usize) -> Vec<WebhookDelivery> {
        let log = self.inner.log.lock().await;
        log.iter().rev().take(limit).cloned().collect()
    }

    /// Returns queue counters.
    pub async fn stats(&self) -> QueueStats {
        let queues = self.inner.queues.lock().await;
        QueueStats {
            queued: self.inner.queued.load(Ordering::Relaxed),
            sent: self.inner.sent.load(Ordering::Relaxed),
            failed: self.inner.failed.load(Ordering::Relaxed),
            retrying: self.inner.retrying.load(Ordering::Relaxed),
            queue_depth: queues.values().map(VecDeque::len).sum(),
            destinations: queues.values().filter(|q| !q.is_empty()).count(),
        }
    }

    /// Cancels pending timers and drops every queued webhook.
    ///
    /// Attempts already in flight run to completion. Returns the number of
    /// webhooks dropped.
    pub async fn clear(&self) -> usize {
        for (_, handle) in self.inner.lock_timers().drain() {
            handle.abort();
        }
        let mut queues = self.inner.queues.lock().await;
        let dropped = queues.values().map(VecDeque::len).sum();
        queues.clear();
        if dropped > 0 {
            tracing::info!(dropped, "Webhook queue cleared");
        }
        dropped
    }
}

impl Inner {
    fn lock_timers(&self) -> std::sync::MutexGuard<'_, HashMap<String, JoinHandle<()>>> {
        self.timers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawns an attempt after `delay`. The timer lock is held across the
    /// spawn so the task cannot observe the map before its own entry exists.
    fn schedule(self: Arc<Self>, url: String, id: String, delay: Duration) {
        let mut timers = self.lock_timers();
        let inner = self.clone();
        let task_id = id.clone();
        let handle = tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            inner.lock_timers().remove(&task_id);
            inner.attempt(&url, &task_id).await;
        });
        timers.insert(id, handle);
    }

    async fn attempt(self: &Arc<Self>, url: &str, id: &str) {
        if !self.in_flight.lock().await.insert(id.to_string()) {
            tracing::debug!(queued_id = id, "Delivery already in flight");
            return;
        }

        let Some(webhook) = self.begin_attempt(url, id).await else {
            self.in_flight.lock().await.remove(id);
            return;
        };

        let options = SendOptions {
            headers: webhook.headers.clone(),
            webhook_id: webhook.webhook_id.clone(),
        };
        let outcome = self.sender.send(url, &webhook.payload, &options).await;
        self.in_flight.lock().await.remove(id);

        match outcome {
            Ok(result) if result.success => self.complete(&webhook, &result).await,
            Ok(result) => self.fail(webhook, result).await,
            Err(e) => {
                let result = DeliveryResult::failure(format!("unexpected delivery error: {}", e), None, false);
                self.fail(webhook, result).await
            }
        }
    }

    async fn begin_attempt(&self, url: &str, id: &str) -> Option<QueuedWebhook> {
        let mut queues = self.queues.lock().await;
        let entry = queues.get_mut(url)?.iter_mut().find(|w| w.id == id)?;
        entry.attempts += 1;
        entry.last_attempt = Some(Utc::now());
        entry.next_retry = None;
        Some(entry.clone())
    }

    async fn complete(&self, webhook: &QueuedWebhook, result: &DeliveryResult) {
        self.remove(&webhook.url, &webhook.id).await;
        self.sent.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            url = %webhook.url,
            queued_id = %webhook.id,
            attempt = webhook.attempts,
            status = result.status_code,
            "Webhook delivered"
        );
        self.record(webhook, result, true).await;
    }

    async fn fail(self: &Arc<Self>, mut webhook: QueuedWebhook, result: DeliveryResult) {
        let failure = DeliveryFailure {
            attempt: webhook.attempts,
            error: result.error.clone().unwrap_or_else(|| "unknown error".into()),
            status_code: result.status_code,
            timestamp: Utc::now(),
        };
        webhook.failures.push(failure.clone());

        let retry = result.retryable && webhook.attempts < webhook.max_retries;
        if retry {
            let delay = self.retry_schedule.delay_for(webhook.attempts);
            let next_retry = Utc::now().timestamp_millis() + delay.as_millis() as i64;
            let still_queued = {
                let mut queues = self.queues.lock().await;
                match queues
                    .get_mut(&webhook.url)
                    .and_then(|q| q.iter_mut().find(|w| w.id == webhook.id))
                {
                    Some(entry) => {
                        entry.failures.push(failure);
                        entry.next_retry = Some(next_retry);
                        true
                    }
                    None => false,
                }
            };
            self.record(&webhook, &result, false).await;
            if !still_queued {
                return;
            }
            self.retrying.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                url = %webhook.url,
                queued_id = %webhook.id,
                attempt = webhook.attempts,
                max_retries = webhook.max_retries,
                delay_ms = delay.as_millis() as u64,
                "Webhook delivery failed, retrying: {}", failure_message(&result)
            );
            self.clone().schedule(webhook.url.clone(), webhook.id.clone(), delay);
        } else {
            self.remove(&webhook.url, &webhook.id).await;
            self.failed.fetch_add(1, Ordering::Relaxed);
            tracing::error!(
                url = %webhook.url,
                queued_id = %webhook.id,
                attempts = webhook.attempts,
                retryable = result.retryable,
                "Webhook delivery failed permanently: {}", failure_message(&result)
            );
            self.record(&webhook, &result, true).await;
        }
    }

    async fn remove(&self, url: &str, id: &str) {
        let mut queues = self.queues.lock().await;
        if let Some(queue) = queues.get_mut(url) {
            queue.retain(|w| w.id != id);
            if queue.is_empty() {
                queues.remove(url);
            }
        }
    }

    async fn record(&self, webhook: &QueuedWebhook, result: &DeliveryResult, is_final: bool) {
        let mut log = self.log.lock().await;
        log.push_back(WebhookDelivery {
            queued_id: webhook.id.clone(),
            webhook_id: webhook.webhook_id.clone(),
            url: webhook.url.clone(),
            event_type: webhook
                .payload
                .get("eventType")
                .and_then(Value::as_str)
                .map(str::to_string),
            attempt: webhook.attempts,
            success: result.success,
            status_code: result.status_code,
            response_time_ms: result.response_time_ms,
            error: result.error.clone(),
            is_final,
            timestamp: Utc::now(),
        });
        while log.len() > self.config.delivery_log_size {
            log.pop_front();
        }
    }
}

fn failure_message(result: &DeliveryResult) -> &str {
    result.error.as_deref().unwrap_or("unknown error")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{WebhookError, WebhookResult};
    use async_trait::async_trait;
    use serde_json::json;
    use tokio::time::Instant;

    /// Sender that replays a fixed outcome and records attempt times.
    struct ScriptedSender {
        outcome: DeliveryResult,
        attempts: Mutex<Vec<Instant>>,
    }

    impl ScriptedSender {
        fn new(outcome: DeliveryResult) -> Arc<Self> {
            Arc::new(Self {
                outcome,
                attempts: Mutex::new(Vec::new()),
            })
        }

        async fn gaps_ms(&self) -> Vec<u128> {
            let attempts = self.attempts.lock().await;
            attempts.windows(2).map(|w| (w[1] - w[0]).as_millis()).collect()
        }
    }

    #[async_trait]
    impl WebhookSender for ScriptedSender {
        async fn send(&self, _url: &str, _payload: &Value, _options: &SendOptions) -> WebhookResult<DeliveryResult> {
            self.attempts.lock().await.push(Instant::now());
            Ok(self.outcome.clone())
        }
    }

    struct BrokenSender;

    #[async_trait]
    impl WebhookSender for BrokenSender {
        async fn send(&self, _url: &str, _payload: &Value, _options: &SendOptions) -> WebhookResult<DeliveryResult> {
            Err(WebhookError::Internal("socket pool poisoned".into()))
        }
    }

    fn payload() -> Value {
        json!({"eventType": "export.succeeded", "exportId": "exp-1"})
    }

    #[tokio::test(start_paused = true)]
    async fn test_retryable_failure_exhausts_schedule() {
        let sender = ScriptedSender::new(DeliveryResult::failure("HTTP 503", Some(503), true));
        let queue = RetryQueue::new(QueueConfig::default(), sender.clone());

        let id = queue
            .enqueue("https://hooks.example.com/a", payload(), EnqueueOptions::default())
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(500)).await;
        let pending = queue.pending().await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, id);
        assert_eq!(pending[0].attempts, 1);
        assert!(pending[0].next_retry.is_some());

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(sender.attempts.lock().await.len(), 3);
        assert_eq!(sender.gaps_ms().await, vec![1000, 2000]);

        let stats = queue.stats().await;
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.retrying, 2);
        assert_eq!(stats.queue_depth, 0);

        let log = queue.recent_deliveries(10).await;
        assert_eq!(log.len(), 3);
        assert!(log[0].is_final);
        assert_eq!(log[0].attempt, 3);
        assert_eq!(log[0].event_type.as_deref(), Some("export.succeeded"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_longer_schedule_reaches_last_delay() {
        let sender = ScriptedSender::new(DeliveryResult::failure("timeout", None, true));
        let config = QueueConfig::default().max_retries(5);
        let queue = RetryQueue::new(config, sender.clone());

        queue
            .enqueue("https://hooks.example.com/a", payload(), EnqueueOptions::default())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert_eq!(sender.gaps_ms().await, vec![1000, 2000, 4000, 4000]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_failure_is_final() {
        let sender = ScriptedSender::new(DeliveryResult::failure("HTTP 404", Some(404), false));
        let queue = RetryQueue::new(QueueConfig::default(), sender.clone());

        queue
            .enqueue("https://hooks.example.com/a", payload(), EnqueueOptions::default())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(sender.attempts.lock().await.len(), 1);
        let stats = queue.stats().await;
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.retrying, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sender_error_is_final() {
        let queue = RetryQueue::new(QueueConfig::default(), Arc::new(BrokenSender));
        queue
            .enqueue("https://hooks.example.com/a", payload(), EnqueueOptions::default())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(queue.stats().await.failed, 1);
        let log = queue.recent_deliveries(1).await;
        assert!(log[0].error.as_deref().unwrap().contains("socket pool poisoned"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_removes_entry() {
        let sender = ScriptedSender::new(DeliveryResult::success(200, 5));
        let queue = RetryQueue::new(QueueConfig::default(), sender.clone());

        let id = queue
            .enqueue(
                "https://hooks.example.com/a",
                payload(),
                EnqueueOptions {
                    webhook_id: Some("exp-1".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(id, "exp-1");
        tokio::time::sleep(Duration::from_millis(10)).await;

        let stats = queue.stats().await;
        assert_eq!(stats.sent, 1);
        assert_eq!(stats.queue_depth, 0);
        assert_eq!(stats.destinations, 0);
        assert_eq!(queue.recent_deliveries(5).await[0].webhook_id.as_deref(), Some("exp-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_id_not_queued_twice() {
        let sender = ScriptedSender::new(DeliveryResult::failure("HTTP 503", Some(503), true));
        let queue = RetryQueue::new(QueueConfig::default(), sender.clone());
        let options = EnqueueOptions {
            webhook_id: Some("dep-1-a".into()),
            ..Default::default()
        };

        assert_eq!(
            queue.enqueue("https://hooks.example.com/a", payload(), options.clone()).await.as_deref(),
            Some("dep-1-a")
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(queue.enqueue("https://hooks.example.com/b", payload(), options).await.is_none());

        let pending = queue.pending().await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, "dep-1-a");
        assert_eq!(queue.stats().await.queued, 1);
        assert_eq!(sender.attempts.lock().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_limit() {
        let sender = ScriptedSender::new(DeliveryResult::failure("HTTP 500", Some(500), true));
        let queue = RetryQueue::new(QueueConfig::default().max_queue_size(2), sender);

        assert!(queue.enqueue("https://a.example.com", payload(), EnqueueOptions::default()).await.is_some());
        assert!(queue.enqueue("https://b.example.com", payload(), EnqueueOptions::default()).await.is_some());
        assert!(queue.enqueue("https://c.example.com", payload(), EnqueueOptions::default()).await.is_none());

        let stats = queue.stats().await;
        assert_eq!(stats.queued, 2);
        assert_eq!(stats.destinations, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_cancels_retries() {
        let sender = ScriptedSender::new(DeliveryResult::failure("HTTP 502", Some(502), true));
        let queue = RetryQueue::new(QueueConfig::default(), sender.clone());

        queue
            .enqueue("https://hooks.example.com/a", payload(), EnqueueOptions::default())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(queue.clear().await, 1);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(sender.attempts.lock().await.len(), 1);
        assert_eq!(queue.stats().await.queue_depth, 0);
    }
}
