// Event Bus - durable append-only change streams with consumer groups

mod consumer;
mod redis_bus;

pub use consumer::ChangeEventConsumer;
pub use redis_bus::RedisEventBus;

use crate::error::CoreResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::Mutex;

/// What happened to the record carried by a change event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeAction {
    Created,
    Updated,
    Deleted,
    SlaBreach,
    NotificationDelivered,
    NotificationFailed,
}

/// One record on a change stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Change-type discriminator, usually the upstream table name.
    #[serde(rename = "type")]
    pub event_type: String,
    pub action: ChangeAction,
    pub sys_id: String,
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl ChangeEvent {
    pub fn new(
        event_type: impl Into<String>,
        action: ChangeAction,
        sys_id: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            action,
            sys_id: sys_id.into(),
            data,
            timestamp: Utc::now(),
        }
    }
}

/// Stream notification delivery outcomes are appended to.
pub const NOTIFICATION_STREAM: &str = "changes:notifications";

/// Append-only stream seam. Ordering holds per stream only; consumer
/// groups get at-least-once delivery with per-group acknowledgment.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Append an event; returns the assigned entry id.
    async fn publish(&self, stream: &str, event: &ChangeEvent) -> CoreResult<String>;

    /// Create the consumer group if it does not exist yet.
    async fn ensure_group(&self, stream: &str, group: &str) -> CoreResult<()>;

    /// Read up to `count` unacknowledged events for `consumer`, blocking at
    /// most `block_ms`.
    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block_ms: u64,
    ) -> CoreResult<Vec<(String, ChangeEvent)>>;

    async fn ack(&self, stream: &str, group: &str, entry_id: &str) -> CoreResult<()>;
}

/// In-memory bus used by tests and scenario fixtures. Entries are retained
/// so assertions can inspect everything that was published.
#[derive(Default)]
pub struct MemoryEventBus {
    inner: Mutex<MemoryBusInner>,
}

#[derive(Default)]
struct MemoryBusInner {
    streams: HashMap<String, Vec<(String, ChangeEvent)>>,
    // (stream, group) -> index of the next entry to hand out
    cursors: HashMap<(String, String), usize>,
    next_id: u64,
}

impl MemoryEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn published(&self, stream: &str) -> Vec<ChangeEvent> {
        self.inner
            .lock()
            .await
            .streams
            .get(stream)
            .map(|entries| entries.iter().map(|(_, e)| e.clone()).collect())
            .unwrap_or_default()
    }

    pub async fn total_published(&self) -> usize {
        self.inner
            .lock()
            .await
            .streams
            .values()
            .map(Vec::len)
            .sum()
    }
}

#[async_trait]
impl EventBus for MemoryEventBus {
    async fn publish(&self, stream: &str, event: &ChangeEvent) -> CoreResult<String> {
        let mut inner = self.inner.lock().await;
        inner.next_id += 1;
        let id = format!("{}-0", inner.next_id);
        inner
            .streams
            .entry(stream.to_string())
            .or_default()
            .push((id.clone(), event.clone()));
        Ok(id)
    }

    async fn ensure_group(&self, stream: &str, group: &str) -> CoreResult<()> {
        let mut inner = self.inner.lock().await;
        inner
            .cursors
            .entry((stream.to_string(), group.to_string()))
            .or_insert(0);
        Ok(())
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        _consumer: &str,
        count: usize,
        _block_ms: u64,
    ) -> CoreResult<Vec<(String, ChangeEvent)>> {
        let mut inner = self.inner.lock().await;
        let cursor_key = (stream.to_string(), group.to_string());
        let cursor = *inner.cursors.get(&cursor_key).unwrap_or(&0);
        let entries = inner.streams.get(stream).cloned().unwrap_or_default();

        let batch: Vec<(String, ChangeEvent)> =
            entries.iter().skip(cursor).take(count).cloned().collect();
        inner.cursors.insert(cursor_key, cursor + batch.len());
        Ok(batch)
    }

    async fn ack(&self, _stream: &str, _group: &str, _entry_id: &str) -> CoreResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_memory_bus_per_stream_ordering() {
        let bus = MemoryEventBus::new();
        for i in 0..3 {
            bus.publish(
                "changes:incidents",
                &ChangeEvent::new("incident", ChangeAction::Updated, format!("id{}", i), json!({})),
            )
            .await
            .unwrap();
        }

        let events = bus.published("changes:incidents").await;
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].sys_id, "id0");
        assert_eq!(events[2].sys_id, "id2");
    }

    #[tokio::test]
    async fn test_memory_bus_group_cursor() {
        let bus = MemoryEventBus::new();
        bus.ensure_group("s", "g").await.unwrap();
        bus.publish("s", &ChangeEvent::new("incident", ChangeAction::Created, "a", json!({})))
            .await
            .unwrap();
        bus.publish("s", &ChangeEvent::new("incident", ChangeAction::Updated, "b", json!({})))
            .await
            .unwrap();

        let first = bus.read_group("s", "g", "c1", 1, 0).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].1.sys_id, "a");

        let second = bus.read_group("s", "g", "c1", 10, 0).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].1.sys_id, "b");

        // A different group starts from the beginning.
        bus.ensure_group("s", "other").await.unwrap();
        let other = bus.read_group("s", "other", "c1", 10, 0).await.unwrap();
        assert_eq!(other.len(), 2);
    }

    #[test]
    fn test_change_event_serde() {
        let event = ChangeEvent::new("incident", ChangeAction::SlaBreach, "abc", json!({"p": 1}));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "incident");
        assert_eq!(json["action"], "sla_breach");
        let back: ChangeEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back.action, ChangeAction::SlaBreach);
    }
}
