// Notification Queue - priority bands, retries, rate limits, channel fan-out

mod channels;
mod queue;
mod rate_limit;

pub use channels::{
    AuditSink, ChannelSink, EmailSink, PushSink, SocketSink, StreamSink, WebhookSink,
};
pub use queue::{NotificationQueue, PgQueueJournal, QueueJournal, QueuedNotification};
pub use rate_limit::SourceRateLimiter;
