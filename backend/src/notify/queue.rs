// Notification queue: four priority bands, one cooperative worker,
// exponential retry, dead-lettering

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{ChannelSink, SourceRateLimiter};
use crate::config::QueueConfig;
use crate::error::{CoreError, CoreResult};
use crate::events::{ChangeAction, ChangeEvent, EventBus, NOTIFICATION_STREAM};
use snowbridge_shared::{DeliveryChannel, Notification, NotificationPriority};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedNotification {
    pub notification: Notification,
    pub channels: Vec<DeliveryChannel>,
    pub retry_count: u32,
    pub enqueued_at: DateTime<Utc>,
}

/// Durable mirror of the CRITICAL and HIGH bands so a restart loses
/// nothing from the top of the queue.
#[async_trait]
pub trait QueueJournal: Send + Sync {
    async fn persist(&self, item: &QueuedNotification) -> CoreResult<()>;
    async fn remove(&self, id: Uuid) -> CoreResult<()>;
    async fn load(&self) -> CoreResult<Vec<QueuedNotification>>;
}

pub struct PgQueueJournal {
    pool: PgPool,
}

impl PgQueueJournal {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl QueueJournal for PgQueueJournal {
    async fn persist(&self, item: &QueuedNotification) -> CoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO notification_queue (id, band, payload, channels, enqueued_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(item.notification.id)
        .bind(item.notification.band.as_str())
        .bind(serde_json::to_value(&item.notification)?)
        .bind(serde_json::to_value(&item.channels)?)
        .bind(item.enqueued_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remove(&self, id: Uuid) -> CoreResult<()> {
        sqlx::query("DELETE FROM notification_queue WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn load(&self) -> CoreResult<Vec<QueuedNotification>> {
        let rows = sqlx::query(
            "SELECT payload, channels, enqueued_at FROM notification_queue ORDER BY enqueued_at",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut items = Vec::new();
        for row in rows {
            let payload: serde_json::Value = row.try_get("payload")?;
            let channels: serde_json::Value = row.try_get("channels")?;
            items.push(QueuedNotification {
                notification: serde_json::from_value(payload)?,
                channels: serde_json::from_value(channels)?,
                retry_count: 0,
                enqueued_at: row.try_get("enqueued_at")?,
            });
        }
        Ok(items)
    }
}

#[derive(Default)]
struct Bands {
    critical: VecDeque<QueuedNotification>,
    high: VecDeque<QueuedNotification>,
    medium: VecDeque<QueuedNotification>,
    low: VecDeque<QueuedNotification>,
}

impl Bands {
    fn band_mut(&mut self, band: NotificationPriority) -> &mut VecDeque<QueuedNotification> {
        match band {
            NotificationPriority::Critical => &mut self.critical,
            NotificationPriority::High => &mut self.high,
            NotificationPriority::Medium => &mut self.medium,
            NotificationPriority::Low => &mut self.low,
        }
    }

    /// Next item in strict band priority order.
    fn pop_next(&mut self) -> Option<QueuedNotification> {
        for band in NotificationPriority::BANDS {
            if let Some(item) = self.band_mut(band).pop_front() {
                return Some(item);
            }
        }
        None
    }
}

pub struct NotificationQueue {
    config: QueueConfig,
    bands: Mutex<Bands>,
    retries: Mutex<Vec<(Instant, QueuedNotification)>>,
    dead_letter: Mutex<Vec<QueuedNotification>>,
    limiter: SourceRateLimiter,
    sinks: RwLock<HashMap<DeliveryChannel, Arc<dyn ChannelSink>>>,
    bus: Arc<dyn EventBus>,
    journal: Option<Arc<dyn QueueJournal>>,
    size: AtomicUsize,
    worker: Mutex<Option<CancellationToken>>,
}

impl NotificationQueue {
    pub fn new(
        config: QueueConfig,
        limiter: SourceRateLimiter,
        bus: Arc<dyn EventBus>,
        journal: Option<Arc<dyn QueueJournal>>,
    ) -> Self {
        Self {
            config,
            bands: Mutex::new(Bands::default()),
            retries: Mutex::new(Vec::new()),
            dead_letter: Mutex::new(Vec::new()),
            limiter,
            sinks: RwLock::new(HashMap::new()),
            bus,
            journal,
            size: AtomicUsize::new(0),
            worker: Mutex::new(None),
        }
    }

    pub async fn register_sink(&self, sink: Arc<dyn ChannelSink>) {
        self.sinks.write().await.insert(sink.channel(), sink);
    }

    pub fn depth(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    pub async fn dead_letter_count(&self) -> usize {
        self.dead_letter.lock().await.len()
    }

    pub async fn dead_letters(&self) -> Vec<QueuedNotification> {
        self.dead_letter.lock().await.clone()
    }

    pub async fn trim_dead_letters(&self, keep: usize) -> usize {
        let mut dead = self.dead_letter.lock().await;
        let trimmed = dead.len().saturating_sub(keep);
        if trimmed > 0 {
            dead.drain(0..trimmed);
        }
        trimmed
    }

    /// Admit a notification: per-source rate limit first, then the total
    /// size cap. CRITICAL and HIGH jump to the front of their band.
    pub async fn enqueue(
        &self,
        notification: Notification,
        channels: Vec<DeliveryChannel>,
    ) -> CoreResult<Uuid> {
        self.limiter.check(&notification.source)?;

        let current = self.size.load(Ordering::Relaxed);
        if current >= self.config.max_size {
            return Err(CoreError::QueueFull {
                capacity: self.config.max_size,
            });
        }

        let id = notification.id;
        let band = notification.band;
        let item = QueuedNotification {
            notification,
            channels,
            retry_count: 0,
            enqueued_at: Utc::now(),
        };

        if matches!(
            band,
            NotificationPriority::Critical | NotificationPriority::High
        ) {
            if let Some(journal) = &self.journal {
                if let Err(e) = journal.persist(&item).await {
                    warn!(id = %id, error = %e, "queue journal persist failed");
                }
            }
        }

        let mut bands = self.bands.lock().await;
        match band {
            NotificationPriority::Critical | NotificationPriority::High => {
                bands.band_mut(band).push_front(item)
            }
            _ => bands.band_mut(band).push_back(item),
        }
        drop(bands);

        self.size.fetch_add(1, Ordering::Relaxed);
        debug!(id = %id, band = band.as_str(), "notification enqueued");
        Ok(id)
    }

    /// Reload journaled CRITICAL/HIGH items after a restart.
    pub async fn restore(&self) -> CoreResult<usize> {
        let Some(journal) = &self.journal else {
            return Ok(0);
        };
        let items = journal.load().await?;
        let count = items.len();

        let mut bands = self.bands.lock().await;
        for item in items {
            let band = item.notification.band;
            bands.band_mut(band).push_back(item);
            self.size.fetch_add(1, Ordering::Relaxed);
        }
        if count > 0 {
            info!(count, "restored journaled notifications");
        }
        Ok(count)
    }

    /// Start the single cooperative worker. Idempotent.
    pub async fn start(self: &Arc<Self>) {
        let mut worker = self.worker.lock().await;
        if worker.is_some() {
            return;
        }
        let cancel = CancellationToken::new();
        *worker = Some(cancel.clone());

        let queue = Arc::clone(self);
        tokio::spawn(async move {
            info!("notification queue worker started");
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("notification queue worker stopped");
                        return;
                    }
                    _ = tokio::time::sleep(Duration::from_millis(100)) => {
                        queue.process_available().await;
                    }
                }
            }
        });
    }

    pub async fn stop(&self) {
        if let Some(cancel) = self.worker.lock().await.take() {
            cancel.cancel();
        }
    }

    /// One worker pass: requeue due retries, then drain up to a batch in
    /// strict band order, dispatching each item's channels in parallel.
    pub async fn process_available(&self) -> usize {
        self.requeue_due_retries().await;

        let mut processed = 0;
        for _ in 0..self.config.batch_size {
            let item = self.bands.lock().await.pop_next();
            let Some(item) = item else { break };
            self.dispatch(item).await;
            processed += 1;
        }
        processed
    }

    async fn requeue_due_retries(&self) {
        let now = Instant::now();
        let mut retries = self.retries.lock().await;
        let due: Vec<QueuedNotification> = {
            let mut due = Vec::new();
            retries.retain(|(at, item)| {
                if *at <= now {
                    due.push(item.clone());
                    false
                } else {
                    true
                }
            });
            due
        };
        drop(retries);

        if !due.is_empty() {
            let mut bands = self.bands.lock().await;
            for item in due {
                let band = item.notification.band;
                bands.band_mut(band).push_back(item);
            }
        }
    }

    async fn dispatch(&self, mut item: QueuedNotification) {
        // Snapshot the sinks so no lock is held across the delivery awaits.
        let targets: Vec<(DeliveryChannel, Option<Arc<dyn ChannelSink>>)> = {
            let sinks = self.sinks.read().await;
            item.channels
                .iter()
                .map(|channel| (*channel, sinks.get(channel).cloned()))
                .collect()
        };

        let deliveries = targets.into_iter().map(|(channel, sink)| {
            let notification = item.notification.clone();
            async move {
                match sink {
                    Some(sink) => (channel, sink.deliver(&notification).await),
                    None => (
                        channel,
                        Err(CoreError::Delivery {
                            channel: channel.as_str().to_string(),
                            message: "no sink registered".to_string(),
                        }),
                    ),
                }
            }
        });
        let results = futures::future::join_all(deliveries).await;

        let failures: Vec<String> = results
            .iter()
            .filter_map(|(channel, result)| {
                result
                    .as_ref()
                    .err()
                    .map(|e| format!("{}: {}", channel.as_str(), e))
            })
            .collect();

        if failures.is_empty() {
            self.finish(item, ChangeAction::NotificationDelivered, None)
                .await;
            return;
        }

        if item.retry_count < self.config.max_retries {
            let delay_index = (item.retry_count as usize).min(
                self.config
                    .retry_delays_secs
                    .len()
                    .saturating_sub(1),
            );
            let delay = Duration::from_secs(self.config.retry_delays_secs[delay_index]);
            item.retry_count += 1;
            debug!(
                id = %item.notification.id,
                retry = item.retry_count,
                delay_secs = delay.as_secs(),
                "notification delivery failed, scheduling retry"
            );
            self.retries
                .lock()
                .await
                .push((Instant::now() + delay, item));
        } else {
            warn!(
                id = %item.notification.id,
                failures = ?failures,
                "notification retries exhausted, dead-lettering"
            );
            self.finish(item, ChangeAction::NotificationFailed, Some(failures))
                .await;
        }
    }

    async fn finish(
        &self,
        item: QueuedNotification,
        action: ChangeAction,
        failures: Option<Vec<String>>,
    ) {
        if let Some(journal) = &self.journal {
            if matches!(
                item.notification.band,
                NotificationPriority::Critical | NotificationPriority::High
            ) {
                if let Err(e) = journal.remove(item.notification.id).await {
                    warn!(id = %item.notification.id, error = %e, "queue journal remove failed");
                }
            }
        }

        let event = ChangeEvent::new(
            "notification",
            action,
            item.notification.id.to_string(),
            serde_json::json!({
                "notification_type": item.notification.notification_type,
                "band": item.notification.band,
                "retry_count": item.retry_count,
                "failures": failures,
            }),
        );
        if let Err(e) = self.bus.publish(NOTIFICATION_STREAM, &event).await {
            warn!(id = %item.notification.id, error = %e, "delivery event publish failed");
        }

        if action == ChangeAction::NotificationFailed {
            self.dead_letter.lock().await.push(item);
        }
        self.size.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RateLimitConfig;
    use crate::events::MemoryEventBus;
    use std::sync::atomic::AtomicBool;

    struct RecordingSink {
        channel: DeliveryChannel,
        delivered: Mutex<Vec<Uuid>>,
        fail: AtomicBool,
    }

    impl RecordingSink {
        fn new(channel: DeliveryChannel) -> Arc<Self> {
            Arc::new(Self {
                channel,
                delivered: Mutex::new(Vec::new()),
                fail: AtomicBool::new(false),
            })
        }

        fn failing(channel: DeliveryChannel) -> Arc<Self> {
            let sink = Self::new(channel);
            sink.fail.store(true, Ordering::Relaxed);
            sink
        }

        async fn count(&self) -> usize {
            self.delivered.lock().await.len()
        }
    }

    #[async_trait]
    impl ChannelSink for RecordingSink {
        fn channel(&self) -> DeliveryChannel {
            self.channel
        }

        async fn deliver(&self, notification: &Notification) -> CoreResult<()> {
            if self.fail.load(Ordering::Relaxed) {
                return Err(CoreError::Delivery {
                    channel: self.channel.as_str().to_string(),
                    message: "induced failure".to_string(),
                });
            }
            self.delivered.lock().await.push(notification.id);
            Ok(())
        }
    }

    fn queue_config(max_size: usize, max_retries: u32) -> QueueConfig {
        QueueConfig {
            max_size,
            batch_size: 10,
            max_retries,
            retry_delays_secs: vec![1, 5, 15, 60],
            enable_persistence: false,
        }
    }

    fn open_limits() -> SourceRateLimiter {
        SourceRateLimiter::new(RateLimitConfig {
            per_minute: 10_000,
            per_hour: 100_000,
            burst_size: 10_000,
        })
    }

    fn make(config: QueueConfig) -> (Arc<NotificationQueue>, Arc<MemoryEventBus>) {
        let bus = Arc::new(MemoryEventBus::new());
        let queue = Arc::new(NotificationQueue::new(
            config,
            open_limits(),
            bus.clone(),
            None,
        ));
        (queue, bus)
    }

    fn notification(band: NotificationPriority, tag: &str) -> Notification {
        Notification::new("TASK_UPDATED", band, "test", tag, serde_json::json!({}))
    }

    #[tokio::test]
    async fn test_band_priority_order() {
        let (queue, _) = make(queue_config(100, 0));
        let sink = RecordingSink::new(DeliveryChannel::SocketSubscription);
        queue.register_sink(sink.clone()).await;

        let low = queue
            .enqueue(notification(NotificationPriority::Low, "low"), vec![DeliveryChannel::SocketSubscription])
            .await
            .unwrap();
        let critical = queue
            .enqueue(notification(NotificationPriority::Critical, "crit"), vec![DeliveryChannel::SocketSubscription])
            .await
            .unwrap();
        let medium = queue
            .enqueue(notification(NotificationPriority::Medium, "med"), vec![DeliveryChannel::SocketSubscription])
            .await
            .unwrap();

        queue.process_available().await;

        let order = sink.delivered.lock().await.clone();
        assert_eq!(order, vec![critical, medium, low]);
    }

    #[tokio::test]
    async fn test_critical_front_insertion() {
        let (queue, _) = make(queue_config(100, 0));
        let sink = RecordingSink::new(DeliveryChannel::SocketSubscription);
        queue.register_sink(sink.clone()).await;

        let first = queue
            .enqueue(notification(NotificationPriority::Critical, "c1"), vec![DeliveryChannel::SocketSubscription])
            .await
            .unwrap();
        let second = queue
            .enqueue(notification(NotificationPriority::Critical, "c2"), vec![DeliveryChannel::SocketSubscription])
            .await
            .unwrap();

        queue.process_available().await;

        // Later CRITICAL overtakes earlier one: front insertion.
        let order = sink.delivered.lock().await.clone();
        assert_eq!(order, vec![second, first]);
    }

    #[tokio::test]
    async fn test_medium_preserves_enqueue_order() {
        let (queue, _) = make(queue_config(100, 0));
        let sink = RecordingSink::new(DeliveryChannel::SocketSubscription);
        queue.register_sink(sink.clone()).await;

        let first = queue
            .enqueue(notification(NotificationPriority::Medium, "m1"), vec![DeliveryChannel::SocketSubscription])
            .await
            .unwrap();
        let second = queue
            .enqueue(notification(NotificationPriority::Medium, "m2"), vec![DeliveryChannel::SocketSubscription])
            .await
            .unwrap();

        queue.process_available().await;
        let order = sink.delivered.lock().await.clone();
        assert_eq!(order, vec![first, second]);
    }

    #[tokio::test]
    async fn test_capacity_rejection() {
        let (queue, _) = make(queue_config(2, 0));
        queue
            .enqueue(notification(NotificationPriority::Low, "1"), vec![])
            .await
            .unwrap();
        queue
            .enqueue(notification(NotificationPriority::Low, "2"), vec![])
            .await
            .unwrap();

        let err = queue
            .enqueue(notification(NotificationPriority::Low, "3"), vec![])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "QUEUE_FULL");
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_then_dead_letter() {
        let (queue, bus) = make(queue_config(100, 2));
        let sink = RecordingSink::failing(DeliveryChannel::Webhook);
        queue.register_sink(sink).await;

        queue
            .enqueue(
                notification(NotificationPriority::High, "doomed"),
                vec![DeliveryChannel::Webhook],
            )
            .await
            .unwrap();

        // Initial attempt plus two retries.
        queue.process_available().await;
        assert_eq!(queue.dead_letter_count().await, 0);

        tokio::time::advance(Duration::from_secs(2)).await;
        queue.process_available().await;

        tokio::time::advance(Duration::from_secs(6)).await;
        queue.process_available().await;

        assert_eq!(queue.dead_letter_count().await, 1);
        let dead = queue.dead_letters().await;
        assert_eq!(dead[0].retry_count, 2);
        assert!(dead[0].retry_count <= 2);

        let outcomes = bus.published(NOTIFICATION_STREAM).await;
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].action, ChangeAction::NotificationFailed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_channel_failure_retries_whole_item() {
        let (queue, _) = make(queue_config(100, 1));
        let good = RecordingSink::new(DeliveryChannel::SocketSubscription);
        let bad = RecordingSink::failing(DeliveryChannel::Webhook);
        queue.register_sink(good.clone()).await;
        queue.register_sink(bad.clone()).await;

        queue
            .enqueue(
                notification(NotificationPriority::Medium, "partial"),
                vec![DeliveryChannel::SocketSubscription, DeliveryChannel::Webhook],
            )
            .await
            .unwrap();

        queue.process_available().await;
        assert_eq!(good.count().await, 1);
        assert_eq!(queue.dead_letter_count().await, 0);

        // Recover the failing channel; the retry should deliver.
        bad.fail.store(false, Ordering::Relaxed);
        tokio::time::sleep(Duration::from_secs(2)).await;
        queue.process_available().await;

        assert_eq!(bad.count().await, 1);
        assert_eq!(queue.dead_letter_count().await, 0);
        assert_eq!(queue.depth(), 0);
    }

    #[tokio::test]
    async fn test_delivered_event_published() {
        let (queue, bus) = make(queue_config(100, 0));
        let sink = RecordingSink::new(DeliveryChannel::SocketSubscription);
        queue.register_sink(sink).await;

        queue
            .enqueue(
                notification(NotificationPriority::Low, "ok"),
                vec![DeliveryChannel::SocketSubscription],
            )
            .await
            .unwrap();
        queue.process_available().await;

        let outcomes = bus.published(NOTIFICATION_STREAM).await;
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].action, ChangeAction::NotificationDelivered);
        assert_eq!(queue.depth(), 0);
    }

    struct MemoryJournal {
        items: Mutex<HashMap<Uuid, QueuedNotification>>,
    }

    #[async_trait]
    impl QueueJournal for MemoryJournal {
        async fn persist(&self, item: &QueuedNotification) -> CoreResult<()> {
            self.items
                .lock()
                .await
                .insert(item.notification.id, item.clone());
            Ok(())
        }

        async fn remove(&self, id: Uuid) -> CoreResult<()> {
            self.items.lock().await.remove(&id);
            Ok(())
        }

        async fn load(&self) -> CoreResult<Vec<QueuedNotification>> {
            Ok(self.items.lock().await.values().cloned().collect())
        }
    }

    #[tokio::test]
    async fn test_restart_keeps_critical_and_high() {
        let journal = Arc::new(MemoryJournal {
            items: Mutex::new(HashMap::new()),
        });
        let bus = Arc::new(MemoryEventBus::new());
        let queue = NotificationQueue::new(
            queue_config(100, 0),
            open_limits(),
            bus.clone(),
            Some(journal.clone()),
        );

        queue
            .enqueue(notification(NotificationPriority::Critical, "c"), vec![DeliveryChannel::SocketSubscription])
            .await
            .unwrap();
        queue
            .enqueue(notification(NotificationPriority::High, "h"), vec![DeliveryChannel::SocketSubscription])
            .await
            .unwrap();
        queue
            .enqueue(notification(NotificationPriority::Low, "l"), vec![DeliveryChannel::SocketSubscription])
            .await
            .unwrap();

        // Simulated restart: a fresh queue over the same journal.
        let restarted = NotificationQueue::new(
            queue_config(100, 0),
            open_limits(),
            bus,
            Some(journal),
        );
        let restored = restarted.restore().await.unwrap();
        assert_eq!(restored, 2);
        assert_eq!(restarted.depth(), 2);
    }
}
