use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{ChangeAction, ChangeEvent, EventBus};
use crate::notify::NotificationQueue;
use snowbridge_shared::{DeliveryChannel, Notification, NotificationPriority, TicketTable};

/// Front-end of the notification queue: a consumer group over the ticket
/// change streams that turns change events into real-time notifications.
pub struct ChangeEventConsumer {
    bus: Arc<dyn EventBus>,
    queue: Arc<NotificationQueue>,
    streams: Vec<&'static str>,
    group: String,
    consumer: String,
}

impl ChangeEventConsumer {
    pub fn new(
        bus: Arc<dyn EventBus>,
        queue: Arc<NotificationQueue>,
        tables: &[TicketTable],
    ) -> Self {
        Self {
            bus,
            queue,
            streams: tables.iter().map(|t| t.stream_key()).collect(),
            group: "notification-queue".to_string(),
            consumer: "queue-front".to_string(),
        }
    }

    pub fn spawn(self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move { self.run(cancel).await })
    }

    async fn run(self, cancel: CancellationToken) {
        for stream in &self.streams {
            if let Err(e) = self.bus.ensure_group(stream, &self.group).await {
                warn!(stream, error = %e, "could not create consumer group");
            }
        }

        loop {
            if cancel.is_cancelled() {
                return;
            }

            let mut saw_any = false;
            for stream in &self.streams {
                let batch = match self
                    .bus
                    .read_group(stream, &self.group, &self.consumer, 32, 250)
                    .await
                {
                    Ok(batch) => batch,
                    Err(e) => {
                        warn!(stream, error = %e, "change stream read failed");
                        continue;
                    }
                };

                for (entry_id, event) in batch {
                    saw_any = true;
                    if let Some((notification, channels)) = notification_for(&event) {
                        // An enqueue rejection (rate limit, full queue) is
                        // final for this entry; redelivering would repeat
                        // the same rejection.
                        if let Err(e) = self.queue.enqueue(notification, channels).await {
                            warn!(stream, sys_id = %event.sys_id, error = %e, "notification enqueue rejected");
                        }
                    }
                    if let Err(e) = self.bus.ack(stream, &self.group, &entry_id).await {
                        warn!(stream, entry_id = %entry_id, error = %e, "ack failed");
                    }
                }
            }

            if !saw_any {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(Duration::from_millis(500)) => {}
                }
            }
        }
    }
}

/// Map a change event to the notification it fans out as, if any.
/// Delivery-outcome events are never mapped back into the queue.
pub fn notification_for(event: &ChangeEvent) -> Option<(Notification, Vec<DeliveryChannel>)> {
    let notification_type = match event.action {
        ChangeAction::Created => "TASK_CREATED",
        ChangeAction::Updated => "TASK_UPDATED",
        ChangeAction::Deleted => "TASK_DELETED",
        ChangeAction::SlaBreach => "SLA_BREACH",
        ChangeAction::NotificationDelivered | ChangeAction::NotificationFailed => return None,
    };

    let ticket_priority = event
        .data
        .get("priority")
        .and_then(|p| match p {
            serde_json::Value::Number(n) => n.as_u64().map(|n| n as u8),
            serde_json::Value::String(s) => s.parse().ok(),
            _ => None,
        })
        .filter(|p| (1..=5).contains(p));

    let band = if event.action == ChangeAction::SlaBreach {
        NotificationPriority::Critical
    } else {
        ticket_priority
            .map(NotificationPriority::from_ticket_priority)
            .unwrap_or(NotificationPriority::Medium)
    };

    let title = event
        .data
        .get("short_description")
        .and_then(|v| v.as_str())
        .map(String::from)
        .unwrap_or_else(|| format!("{} {}", event.event_type, notification_type));

    let mut notification = Notification::new(
        notification_type,
        band,
        event.event_type.clone(),
        title,
        serde_json::json!({
            "sys_id": event.sys_id,
            "table": event.event_type,
            "data": event.data,
            "timestamp": event.timestamp,
        }),
    );
    if let Some(p) = ticket_priority {
        notification = notification.with_ticket_priority(p);
    }

    debug!(sys_id = %event.sys_id, kind = notification_type, "mapped change event");
    Some((
        notification,
        vec![DeliveryChannel::SocketSubscription, DeliveryChannel::EventStream],
    ))
}
