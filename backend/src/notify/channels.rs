// Delivery channel sinks - transports and side-channels the queue fans
// out to

use async_trait::async_trait;
use lettre::{
    message::header::ContentType,
    transport::smtp::{authentication::Credentials, PoolConfig},
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::config::EmailConfig;
use crate::error::{CoreError, CoreResult};
use crate::transports::{SocketManager, StreamManager};
use snowbridge_shared::{DeliveryChannel, Notification};

/// One delivery target of the notification queue. The queue collects a
/// per-channel success/failure from each sink; it never talks to the
/// transports directly.
#[async_trait]
pub trait ChannelSink: Send + Sync {
    fn channel(&self) -> DeliveryChannel;

    async fn deliver(&self, notification: &Notification) -> CoreResult<()>;
}

pub struct SocketSink {
    manager: Arc<SocketManager>,
}

impl SocketSink {
    pub fn new(manager: Arc<SocketManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl ChannelSink for SocketSink {
    fn channel(&self) -> DeliveryChannel {
        DeliveryChannel::SocketSubscription
    }

    async fn deliver(&self, notification: &Notification) -> CoreResult<()> {
        let sent = self.manager.broadcast(notification).await;
        debug!(id = %notification.id, sent, "socket delivery");
        Ok(())
    }
}

pub struct StreamSink {
    manager: Arc<StreamManager>,
}

impl StreamSink {
    pub fn new(manager: Arc<StreamManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl ChannelSink for StreamSink {
    fn channel(&self) -> DeliveryChannel {
        DeliveryChannel::EventStream
    }

    async fn deliver(&self, notification: &Notification) -> CoreResult<()> {
        let sent = self.manager.broadcast(notification).await;
        debug!(id = %notification.id, sent, "stream delivery");
        Ok(())
    }
}

pub struct WebhookSink {
    http: reqwest::Client,
    url: String,
}

impl WebhookSink {
    pub fn new(url: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            url,
        }
    }
}

#[async_trait]
impl ChannelSink for WebhookSink {
    fn channel(&self) -> DeliveryChannel {
        DeliveryChannel::Webhook
    }

    async fn deliver(&self, notification: &Notification) -> CoreResult<()> {
        let response = self
            .http
            .post(&self.url)
            .json(notification)
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| CoreError::Delivery {
                channel: "webhook".to_string(),
                message: e.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(CoreError::Delivery {
                channel: "webhook".to_string(),
                message: format!("webhook returned {}", response.status()),
            });
        }
        Ok(())
    }
}

/// Push delivery via an HTTP gateway; payload wraps the notification with
/// the fields push providers key on.
pub struct PushSink {
    http: reqwest::Client,
    gateway_url: String,
}

impl PushSink {
    pub fn new(gateway_url: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            gateway_url,
        }
    }
}

#[async_trait]
impl ChannelSink for PushSink {
    fn channel(&self) -> DeliveryChannel {
        DeliveryChannel::Push
    }

    async fn deliver(&self, notification: &Notification) -> CoreResult<()> {
        let body = serde_json::json!({
            "title": notification.title,
            "priority": notification.band.as_str(),
            "data": notification.payload,
        });
        let response = self
            .http
            .post(&self.gateway_url)
            .json(&body)
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| CoreError::Delivery {
                channel: "push".to_string(),
                message: e.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(CoreError::Delivery {
                channel: "push".to_string(),
                message: format!("push gateway returned {}", response.status()),
            });
        }
        Ok(())
    }
}

pub struct EmailSink {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from_email: String,
    to_emails: Vec<String>,
}

impl EmailSink {
    pub fn new(config: &EmailConfig) -> Self {
        let creds = Credentials::new(config.username.clone(), config.password.clone());
        let transport = AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.host)
            .port(config.port)
            .credentials(creds)
            .pool_config(PoolConfig::new().max_size(10))
            .timeout(Some(Duration::from_secs(10)))
            .build();

        Self {
            transport,
            from_email: config.from_email.clone(),
            to_emails: config.to_emails.clone(),
        }
    }
}

#[async_trait]
impl ChannelSink for EmailSink {
    fn channel(&self) -> DeliveryChannel {
        DeliveryChannel::Email
    }

    async fn deliver(&self, notification: &Notification) -> CoreResult<()> {
        let subject = format!("[{}] {}", notification.band.as_str(), notification.title);
        let body = serde_json::to_string_pretty(&notification.payload)?;

        for to in &self.to_emails {
            let message = Message::builder()
                .from(self.from_email.parse().map_err(|e| CoreError::Delivery {
                    channel: "email".to_string(),
                    message: format!("bad from address: {}", e),
                })?)
                .to(to.parse().map_err(|e| CoreError::Delivery {
                    channel: "email".to_string(),
                    message: format!("bad recipient {}: {}", to, e),
                })?)
                .subject(&subject)
                .header(ContentType::TEXT_PLAIN)
                .body(body.clone())
                .map_err(|e| CoreError::Delivery {
                    channel: "email".to_string(),
                    message: e.to_string(),
                })?;

            self.transport
                .send(message)
                .await
                .map_err(|e| CoreError::Delivery {
                    channel: "email".to_string(),
                    message: e.to_string(),
                })?;
        }
        Ok(())
    }
}

/// Audit trail channel: every delivered notification leaves a row behind.
pub struct AuditSink {
    pool: PgPool,
}

impl AuditSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ChannelSink for AuditSink {
    fn channel(&self) -> DeliveryChannel {
        DeliveryChannel::DatabaseAudit
    }

    async fn deliver(&self, notification: &Notification) -> CoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO notification_audit (id, notification_type, band, source, title, payload)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(notification.id)
        .bind(&notification.notification_type)
        .bind(notification.band.as_str())
        .bind(&notification.source)
        .bind(&notification.title)
        .bind(&notification.payload)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use snowbridge_shared::NotificationPriority;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn notification() -> Notification {
        Notification::new(
            "TASK_UPDATED",
            NotificationPriority::High,
            "sync",
            "update",
            serde_json::json!({"sys_id": "abc"}),
        )
    }

    #[tokio::test]
    async fn test_webhook_sink_posts_notification() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let sink = WebhookSink::new(format!("{}/hook", server.uri()));
        sink.deliver(&notification()).await.unwrap();
    }

    #[tokio::test]
    async fn test_webhook_sink_maps_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let sink = WebhookSink::new(server.uri());
        let err = sink.deliver(&notification()).await.unwrap_err();
        assert_eq!(err.kind(), "DELIVERY_FAILED");
    }

    #[tokio::test]
    async fn test_push_sink_wraps_payload() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/push"))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;

        let sink = PushSink::new(format!("{}/push", server.uri()));
        sink.deliver(&notification()).await.unwrap();
    }
}
