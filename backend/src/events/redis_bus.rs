use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;

use super::{ChangeEvent, EventBus};
use crate::error::{CoreError, CoreResult};

/// Redis Streams implementation of the event bus. Each change-type gets
/// its own stream; events are stored as a single JSON `payload` field.
pub struct RedisEventBus {
    conn: ConnectionManager,
}

impl RedisEventBus {
    /// Connect at startup. Unreachable Redis is fatal: the bridge cannot
    /// honor its fan-out contract without the bus.
    pub async fn connect(redis_url: &str) -> CoreResult<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| CoreError::Fatal(format!("invalid redis url: {}", e)))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| CoreError::Fatal(format!("event bus unreachable: {}", e)))?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl EventBus for RedisEventBus {
    async fn publish(&self, stream: &str, event: &ChangeEvent) -> CoreResult<String> {
        let payload = serde_json::to_string(event)?;
        let mut conn = self.conn.clone();
        let entry_id: String = conn.xadd(stream, "*", &[("payload", payload)]).await?;
        Ok(entry_id)
    }

    async fn ensure_group(&self, stream: &str, group: &str) -> CoreResult<()> {
        let mut conn = self.conn.clone();
        let result: redis::RedisResult<()> = conn.xgroup_create_mkstream(stream, group, "$").await;
        match result {
            Ok(()) => Ok(()),
            // Group already exists; nothing to do.
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block_ms: u64,
    ) -> CoreResult<Vec<(String, ChangeEvent)>> {
        let mut conn = self.conn.clone();
        let options = StreamReadOptions::default()
            .group(group, consumer)
            .count(count)
            .block(block_ms as usize);

        let reply: StreamReadReply = conn.xread_options(&[stream], &[">"], &options).await?;

        let mut events = Vec::new();
        for key in reply.keys {
            for entry in key.ids {
                let payload: Option<String> = entry.get("payload");
                let Some(payload) = payload else {
                    tracing::warn!(stream, entry_id = %entry.id, "stream entry without payload, acking");
                    self.ack(stream, group, &entry.id).await?;
                    continue;
                };
                match serde_json::from_str::<ChangeEvent>(&payload) {
                    Ok(event) => events.push((entry.id.clone(), event)),
                    Err(e) => {
                        tracing::warn!(stream, entry_id = %entry.id, error = %e, "undecodable stream entry, acking");
                        self.ack(stream, group, &entry.id).await?;
                    }
                }
            }
        }
        Ok(events)
    }

    async fn ack(&self, stream: &str, group: &str, entry_id: &str) -> CoreResult<()> {
        let mut conn = self.conn.clone();
        let _acked: i64 = conn.xack(stream, group, &[entry_id]).await?;
        Ok(())
    }
}
