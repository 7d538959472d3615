// Stream Transport - one-way event streams with per-IP caps and heartbeats

use axum::{
    extract::{ConnectInfo, Query, State},
    response::sse::{Event, KeepAlive, Sse},
};
use futures::{Stream, StreamExt};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::topics::{self, SubscriptionFilter};
use crate::config::TransportLimits;
use crate::error::{CoreError, CoreResult};
use crate::AppState;
use snowbridge_shared::Notification;

struct StreamClient {
    topics: HashSet<String>,
    filter: SubscriptionFilter,
    sender: mpsc::Sender<Event>,
    ip: IpAddr,
}

pub struct StreamManager {
    clients: RwLock<HashMap<Uuid, StreamClient>>,
    per_ip: RwLock<HashMap<IpAddr, usize>>,
    limits: TransportLimits,
}

impl StreamManager {
    pub fn new(limits: TransportLimits) -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            per_ip: RwLock::new(HashMap::new()),
            limits,
        }
    }

    pub async fn connection_count(&self) -> usize {
        self.clients.read().await.len()
    }

    pub async fn register(
        &self,
        ip: IpAddr,
        topics: HashSet<String>,
        filter: SubscriptionFilter,
    ) -> CoreResult<(Uuid, mpsc::Receiver<Event>)> {
        {
            let per_ip = self.per_ip.read().await;
            if per_ip.get(&ip).copied().unwrap_or(0) >= self.limits.connections_per_ip {
                return Err(CoreError::TransportFull {
                    transport: "stream (per-ip)",
                    limit: self.limits.connections_per_ip,
                });
            }
        }

        let mut clients = self.clients.write().await;
        if clients.len() >= self.limits.max_connections {
            return Err(CoreError::TransportFull {
                transport: "stream",
                limit: self.limits.max_connections,
            });
        }

        for topic in &topics {
            if !topics::is_known_topic(topic) {
                return Err(CoreError::validation(
                    "topic",
                    format!("'{}' is not an available topic", topic),
                ));
            }
        }

        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(64);
        clients.insert(
            id,
            StreamClient {
                topics,
                filter,
                sender: tx,
                ip,
            },
        );
        *self.per_ip.write().await.entry(ip).or_insert(0) += 1;

        info!(client_id = %id, %ip, "stream client connected");
        Ok((id, rx))
    }

    async fn drop_clients(&self, ids: &[Uuid]) {
        if ids.is_empty() {
            return;
        }
        let mut clients = self.clients.write().await;
        let mut per_ip = self.per_ip.write().await;
        for id in ids {
            if let Some(client) = clients.remove(id) {
                if let Some(count) = per_ip.get_mut(&client.ip) {
                    *count = count.saturating_sub(1);
                    if *count == 0 {
                        per_ip.remove(&client.ip);
                    }
                }
            }
        }
    }

    /// Fan a notification out to matching stream clients. Events over the
    /// byte cap are dropped with a log; dead clients are pruned.
    pub async fn broadcast(&self, notification: &Notification) -> usize {
        let target_topics = topics::topics_for(notification);

        let payload = match serde_json::to_string(notification) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "notification not serializable for stream");
                return 0;
            }
        };
        if payload.len() > self.limits.max_message_size {
            warn!(
                bytes = payload.len(),
                cap = self.limits.max_message_size,
                "stream event over byte cap, dropped"
            );
            return 0;
        }

        let event = Event::default()
            .id(notification.id.to_string())
            .event(notification.notification_type.clone())
            .retry(Duration::from_millis(self.limits.stream_retry_ms))
            .data(payload);

        let recipients: Vec<(Uuid, mpsc::Sender<Event>)> = {
            let clients = self.clients.read().await;
            clients
                .iter()
                .filter(|(_, client)| {
                    client
                        .topics
                        .iter()
                        .any(|s| target_topics.contains(&s.as_str()))
                        && client.filter.matches(notification)
                })
                .map(|(id, client)| (*id, client.sender.clone()))
                .collect()
        };

        let mut sent = 0;
        let mut dead = Vec::new();
        for (id, sender) in recipients {
            match sender.try_send(event.clone()) {
                Ok(()) => sent += 1,
                Err(mpsc::error::TrySendError::Closed(_)) => dead.push(id),
                Err(mpsc::error::TrySendError::Full(_)) => {
                    debug!(client_id = %id, "stream client backlogged, event dropped");
                }
            }
        }
        self.drop_clients(&dead).await;
        sent
    }

    /// Heartbeat events keep intermediaries from timing the stream out and
    /// flush dead connections.
    pub async fn heartbeat_pass(&self) -> usize {
        let event = Event::default()
            .event("heartbeat")
            .retry(Duration::from_millis(self.limits.stream_retry_ms))
            .data(chrono::Utc::now().to_rfc3339());

        let recipients: Vec<(Uuid, mpsc::Sender<Event>)> = {
            let clients = self.clients.read().await;
            clients
                .iter()
                .map(|(id, client)| (*id, client.sender.clone()))
                .collect()
        };

        let mut dead = Vec::new();
        let mut sent = 0;
        for (id, sender) in recipients {
            match sender.try_send(event.clone()) {
                Ok(()) => sent += 1,
                Err(mpsc::error::TrySendError::Closed(_)) => dead.push(id),
                Err(mpsc::error::TrySendError::Full(_)) => {}
            }
        }
        self.drop_clients(&dead).await;
        sent
    }

    pub fn spawn_heartbeat(self: Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let interval = Duration::from_secs(self.limits.heartbeat_interval_secs);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {
                        self.heartbeat_pass().await;
                    }
                }
            }
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    /// Comma-separated topic names; defaults to servicenow.all.
    topics: Option<String>,
    priorities: Option<String>,
    types: Option<String>,
    sources: Option<String>,
}

impl StreamQuery {
    fn topic_set(&self) -> HashSet<String> {
        match &self.topics {
            Some(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect(),
            None => HashSet::from([topics::SERVICENOW_ALL.to_string()]),
        }
    }

    fn filter(&self) -> SubscriptionFilter {
        SubscriptionFilter {
            priorities: self.priorities.as_ref().map(|raw| {
                raw.split(',')
                    .filter_map(|p| p.trim().parse().ok())
                    .collect()
            }),
            types: self.types.as_ref().map(|raw| {
                raw.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            }),
            sources: self.sources.as_ref().map(|raw| {
                raw.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            }),
        }
    }
}

pub async fn sse_handler(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(query): Query<StreamQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, CoreError> {
    let (_, rx) = state
        .stream_manager
        .register(addr.ip(), query.topic_set(), query.filter())
        .await?;

    let stream = ReceiverStream::new(rx).map(Ok);
    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(
                state.stream_manager.limits.heartbeat_interval_secs,
            ))
            .text("keep-alive"),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use snowbridge_shared::NotificationPriority;

    fn limits() -> TransportLimits {
        TransportLimits {
            max_connections: 8,
            max_message_size: 64 * 1024,
            heartbeat_interval_secs: 30,
            idle_timeout_secs: 120,
            subscriptions_per_client: 16,
            connections_per_ip: 2,
            messages_per_minute: 120,
            stream_retry_ms: 5000,
        }
    }

    fn ip(last: u8) -> IpAddr {
        IpAddr::from([127, 0, 0, last])
    }

    fn notification(priority: u8) -> Notification {
        Notification::new(
            "TASK_UPDATED",
            NotificationPriority::from_ticket_priority(priority),
            "sync",
            "updated",
            serde_json::json!({"detail": "x"}),
        )
        .with_ticket_priority(priority)
    }

    #[tokio::test]
    async fn test_per_ip_cap() {
        let manager = StreamManager::new(limits());
        let topics = HashSet::from(["tasks.all".to_string()]);

        let _a = manager
            .register(ip(1), topics.clone(), SubscriptionFilter::default())
            .await
            .unwrap();
        let _b = manager
            .register(ip(1), topics.clone(), SubscriptionFilter::default())
            .await
            .unwrap();

        let err = manager
            .register(ip(1), topics.clone(), SubscriptionFilter::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "TRANSPORT_FULL");

        // A different IP still gets in.
        assert!(manager
            .register(ip(2), topics, SubscriptionFilter::default())
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_broadcast_respects_topics_and_filter() {
        let manager = StreamManager::new(limits());

        let (_, mut matching_rx) = manager
            .register(
                ip(1),
                HashSet::from(["tasks.all".to_string()]),
                SubscriptionFilter::default(),
            )
            .await
            .unwrap();
        let (_, mut filtered_rx) = manager
            .register(
                ip(2),
                HashSet::from(["tasks.all".to_string()]),
                SubscriptionFilter {
                    priorities: Some(vec![1]),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let (_, mut other_topic_rx) = manager
            .register(
                ip(3),
                HashSet::from(["system.health".to_string()]),
                SubscriptionFilter::default(),
            )
            .await
            .unwrap();

        let sent = manager.broadcast(&notification(3)).await;
        assert_eq!(sent, 1);
        assert!(matching_rx.recv().await.is_some());
        assert!(filtered_rx.try_recv().is_err());
        assert!(other_topic_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_oversized_event_dropped() {
        let manager = StreamManager::new(TransportLimits {
            max_message_size: 64,
            ..limits()
        });
        let (_, mut rx) = manager
            .register(
                ip(1),
                HashSet::from(["tasks.all".to_string()]),
                SubscriptionFilter::default(),
            )
            .await
            .unwrap();

        let sent = manager.broadcast(&notification(3)).await;
        assert_eq!(sent, 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_dead_clients_pruned() {
        let manager = StreamManager::new(limits());
        let (_, rx) = manager
            .register(
                ip(1),
                HashSet::from(["tasks.all".to_string()]),
                SubscriptionFilter::default(),
            )
            .await
            .unwrap();
        drop(rx);

        manager.broadcast(&notification(3)).await;
        assert_eq!(manager.connection_count().await, 0);

        // The per-IP slot is released too.
        assert!(manager
            .register(
                ip(1),
                HashSet::from(["tasks.all".to_string()]),
                SubscriptionFilter::default()
            )
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_unknown_topic_rejected() {
        let manager = StreamManager::new(limits());
        let err = manager
            .register(
                ip(1),
                HashSet::from(["bogus.topic".to_string()]),
                SubscriptionFilter::default(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "VALIDATION_ERROR");
    }
}
