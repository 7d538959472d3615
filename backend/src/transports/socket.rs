// Socket Transport - bidirectional subscription channels over WebSocket

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::{IntoResponse, Response},
};
use futures::{sink::SinkExt, stream::StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::topics::{self, SubscriptionFilter};
use crate::config::TransportLimits;
use crate::error::{CoreError, CoreResult};
use crate::AppState;
use snowbridge_shared::Notification;

#[derive(Debug, Clone, Serialize)]
pub struct SocketMessage {
    pub event: String,
    pub payload: serde_json::Value,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl SocketMessage {
    fn new(event: &str, payload: serde_json::Value) -> Self {
        Self {
            event: event.to_string(),
            payload,
            timestamp: chrono::Utc::now(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ClientCommand {
    command: String,
    #[serde(default)]
    topics: Vec<String>,
    #[serde(default)]
    filter: Option<SubscriptionFilter>,
}

struct SocketClient {
    sender: mpsc::Sender<SocketMessage>,
    subscriptions: HashSet<String>,
    filter: SubscriptionFilter,
    window_start: Instant,
    window_count: u32,
    last_activity: Instant,
}

pub struct SocketManager {
    clients: RwLock<HashMap<Uuid, SocketClient>>,
    limits: TransportLimits,
}

impl SocketManager {
    pub fn new(limits: TransportLimits) -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            limits,
        }
    }

    pub async fn connection_count(&self) -> usize {
        self.clients.read().await.len()
    }

    async fn register(&self) -> CoreResult<(Uuid, mpsc::Receiver<SocketMessage>)> {
        let mut clients = self.clients.write().await;
        if clients.len() >= self.limits.max_connections {
            return Err(CoreError::TransportFull {
                transport: "socket",
                limit: self.limits.max_connections,
            });
        }

        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(64);
        clients.insert(
            id,
            SocketClient {
                sender: tx,
                subscriptions: HashSet::new(),
                filter: SubscriptionFilter::default(),
                window_start: Instant::now(),
                window_count: 0,
                last_activity: Instant::now(),
            },
        );
        Ok((id, rx))
    }

    async fn unregister(&self, id: Uuid) {
        self.clients.write().await.remove(&id);
    }

    async fn subscribe(&self, id: Uuid, requested: &[String]) -> CoreResult<Vec<String>> {
        let mut clients = self.clients.write().await;
        let client = clients
            .get_mut(&id)
            .ok_or_else(|| CoreError::not_found("socket client"))?;

        for topic in requested {
            if !topics::is_known_topic(topic) {
                return Err(CoreError::validation(
                    "topic",
                    format!("'{}' is not an available topic", topic),
                ));
            }
            if client.subscriptions.len() >= self.limits.subscriptions_per_client
                && !client.subscriptions.contains(topic)
            {
                return Err(CoreError::TransportFull {
                    transport: "socket subscriptions",
                    limit: self.limits.subscriptions_per_client,
                });
            }
            client.subscriptions.insert(topic.clone());
        }
        Ok(client.subscriptions.iter().cloned().collect())
    }

    async fn unsubscribe(&self, id: Uuid, requested: &[String]) {
        let mut clients = self.clients.write().await;
        if let Some(client) = clients.get_mut(&id) {
            for topic in requested {
                client.subscriptions.remove(topic);
            }
        }
    }

    async fn set_filter(&self, id: Uuid, filter: SubscriptionFilter) {
        let mut clients = self.clients.write().await;
        if let Some(client) = clients.get_mut(&id) {
            client.filter = filter;
        }
    }

    /// Record one inbound message; false when the client blew through its
    /// messages-per-minute budget.
    async fn record_inbound(&self, id: Uuid) -> bool {
        let mut clients = self.clients.write().await;
        let Some(client) = clients.get_mut(&id) else {
            return false;
        };
        let now = Instant::now();
        client.last_activity = now;
        if now.duration_since(client.window_start).as_secs() >= 60 {
            client.window_start = now;
            client.window_count = 0;
        }
        client.window_count += 1;
        client.window_count <= self.limits.messages_per_minute
    }

    /// Union-broadcast: for every topic the notification maps to, collect
    /// subscribed clients, filter, and send exactly once per client.
    /// Senders are collected under the lock and used after releasing it.
    pub async fn broadcast(&self, notification: &Notification) -> usize {
        let target_topics = topics::topics_for(notification);
        let message = SocketMessage::new(
            "notification",
            serde_json::to_value(notification).unwrap_or_default(),
        );

        let recipients: Vec<mpsc::Sender<SocketMessage>> = {
            let clients = self.clients.read().await;
            clients
                .values()
                .filter(|client| {
                    client
                        .subscriptions
                        .iter()
                        .any(|s| target_topics.contains(&s.as_str()))
                        && client.filter.matches(notification)
                })
                .map(|client| client.sender.clone())
                .collect()
        };

        let mut sent = 0;
        for sender in recipients {
            if sender.try_send(message.clone()).is_ok() {
                sent += 1;
            }
        }
        debug!(kind = %notification.notification_type, sent, "socket broadcast");
        sent
    }

    /// One heartbeat sweep: drop idle clients, ping the rest.
    pub async fn heartbeat_pass(&self) -> (usize, usize) {
        let now = Instant::now();
        let idle_cutoff = std::time::Duration::from_secs(self.limits.idle_timeout_secs);

        let mut clients = self.clients.write().await;
        let before = clients.len();
        // Dropping the sender ends the client's forwarding task, which
        // closes the connection with a normal (1000) close frame.
        clients.retain(|_, client| now.duration_since(client.last_activity) < idle_cutoff);
        let closed = before - clients.len();

        let senders: Vec<mpsc::Sender<SocketMessage>> =
            clients.values().map(|c| c.sender.clone()).collect();
        drop(clients);

        let ping = SocketMessage::new("ping", serde_json::json!({}));
        let mut pinged = 0;
        for sender in senders {
            if sender.try_send(ping.clone()).is_ok() {
                pinged += 1;
            }
        }
        (pinged, closed)
    }

    pub fn spawn_heartbeat(self: Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let interval = std::time::Duration::from_secs(self.limits.heartbeat_interval_secs);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {
                        let (pinged, closed) = self.heartbeat_pass().await;
                        if closed > 0 {
                            info!(pinged, closed, "socket heartbeat closed idle clients");
                        }
                    }
                }
            }
        })
    }
}

pub async fn websocket_handler(
    State(state): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
) -> Response {
    let max_size = state.socket_manager.limits.max_message_size;
    ws.max_message_size(max_size)
        .on_upgrade(move |socket| handle_socket(socket, state.socket_manager.clone()))
        .into_response()
}

async fn handle_socket(socket: WebSocket, manager: Arc<SocketManager>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let (client_id, mut rx) = match manager.register().await {
        Ok(registered) => registered,
        Err(e) => {
            let _ = ws_sender
                .send(Message::Text(
                    serde_json::json!({
                        "event": "error",
                        "payload": {"code": e.kind(), "message": e.to_string()}
                    })
                    .to_string(),
                ))
                .await;
            let _ = ws_sender
                .send(Message::Close(Some(CloseFrame {
                    code: 1013, // try again later
                    reason: "connection limit reached".into(),
                })))
                .await;
            return;
        }
    };

    info!(client_id = %client_id, "socket client connected");

    let welcome = SocketMessage::new(
        "welcome",
        serde_json::json!({
            "client_id": client_id,
            "topics": topics::available_topics(),
        }),
    );
    if let Ok(text) = serde_json::to_string(&welcome) {
        let _ = ws_sender.send(Message::Text(text)).await;
    }

    let mut send_task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let Ok(text) = serde_json::to_string(&message) else {
                continue;
            };
            if ws_sender.send(Message::Text(text)).await.is_err() {
                return;
            }
        }
        // Manager dropped us (idle timeout or shutdown): normal close.
        let _ = ws_sender
            .send(Message::Close(Some(CloseFrame {
                code: 1000,
                reason: "idle timeout".into(),
            })))
            .await;
    });

    let recv_manager = manager.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(message)) = ws_receiver.next().await {
            match message {
                Message::Text(text) => {
                    if !recv_manager.record_inbound(client_id).await {
                        warn!(client_id = %client_id, "socket client over message rate, closing");
                        return;
                    }
                    handle_command(&recv_manager, client_id, &text).await;
                }
                Message::Ping(_) | Message::Pong(_) => {
                    recv_manager.record_inbound(client_id).await;
                }
                Message::Close(_) => return,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = (&mut send_task) => recv_task.abort(),
        _ = (&mut recv_task) => send_task.abort(),
    }

    manager.unregister(client_id).await;
    info!(client_id = %client_id, "socket client disconnected");
}

async fn handle_command(manager: &SocketManager, client_id: Uuid, text: &str) {
    let reply = |event: &str, payload: serde_json::Value| SocketMessage::new(event, payload);

    let command: ClientCommand = match serde_json::from_str(text) {
        Ok(command) => command,
        Err(e) => {
            manager
                .send_to(client_id, reply("error", serde_json::json!({"message": format!("bad command: {}", e)})))
                .await;
            return;
        }
    };

    match command.command.as_str() {
        "subscribe" => match manager.subscribe(client_id, &command.topics).await {
            Ok(subscriptions) => {
                manager
                    .send_to(
                        client_id,
                        reply("subscribed", serde_json::json!({"topics": subscriptions})),
                    )
                    .await;
            }
            Err(e) => {
                manager
                    .send_to(
                        client_id,
                        reply(
                            "error",
                            serde_json::json!({"code": e.kind(), "message": e.to_string()}),
                        ),
                    )
                    .await;
            }
        },
        "unsubscribe" => {
            manager.unsubscribe(client_id, &command.topics).await;
            manager
                .send_to(client_id, reply("unsubscribed", serde_json::json!({"topics": command.topics})))
                .await;
        }
        "filter" => {
            manager
                .set_filter(client_id, command.filter.unwrap_or_default())
                .await;
            manager
                .send_to(client_id, reply("filter_set", serde_json::json!({})))
                .await;
        }
        "ping" => {
            manager
                .send_to(client_id, reply("pong", serde_json::json!({})))
                .await;
        }
        other => {
            warn!(client_id = %client_id, command = other, "unknown socket command");
        }
    }
}

impl SocketManager {
    async fn send_to(&self, id: Uuid, message: SocketMessage) {
        let sender = {
            let clients = self.clients.read().await;
            clients.get(&id).map(|c| c.sender.clone())
        };
        if let Some(sender) = sender {
            let _ = sender.try_send(message);
        }
    }

    #[cfg(test)]
    pub(crate) async fn test_client(
        &self,
        topics: &[&str],
        filter: SubscriptionFilter,
    ) -> (Uuid, mpsc::Receiver<SocketMessage>) {
        let (id, rx) = self.register().await.expect("register");
        let topics: Vec<String> = topics.iter().map(|s| s.to_string()).collect();
        self.subscribe(id, &topics).await.expect("subscribe");
        self.set_filter(id, filter).await;
        (id, rx)
    }
}
