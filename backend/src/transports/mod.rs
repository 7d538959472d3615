// Real-time transports: bidirectional socket channels and one-way event
// streams, sharing one topic and filter model

pub mod socket;
pub mod stream;
pub mod topics;

pub use socket::SocketManager;
pub use stream::StreamManager;
pub use topics::{available_topics, topics_for, SubscriptionFilter};
