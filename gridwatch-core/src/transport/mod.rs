//! Publish/subscribe transport
//!
//! Processes talk to each other only through a [`Transport`]. Messages for
//! the subscriptions of one endpoint arrive on the receiver handed out when
//! the endpoint was created.

pub mod memory;
pub mod mqtt;

use crate::error::TransportError;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;

pub use memory::MemoryBus;
pub use mqtt::{MqttSettings, MqttTransport, TlsFiles};

#[derive(Debug, Clone, PartialEq)]
pub struct Inbound {
    pub topic: String,
    pub payload: Vec<u8>,
}

pub type Inbox = mpsc::UnboundedReceiver<Inbound>;

#[async_trait]
pub trait Transport: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError>;
    async fn subscribe(&self, filter: &str) -> Result<(), TransportError>;
    async fn unsubscribe(&self, filter: &str) -> Result<(), TransportError>;
}

pub type SharedTransport = Arc<dyn Transport>;

/// Serializes `value` to JSON and publishes it.
pub async fn publish_json<T: Serialize + ?Sized>(
    transport: &dyn Transport,
    topic: &str,
    value: &T,
) -> Result<(), TransportError> {
    let payload = serde_json::to_vec(value)?;
    transport.publish(topic, payload).await
}

/// MQTT topic filter matching: `+` matches one level, a trailing `#` any number.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::topic_matches;

    #[test]
    fn wildcard_matching() {
        assert!(topic_matches("gridwatch/lm/1/rpc@v1", "gridwatch/lm/1/rpc@v1"));
        assert!(topic_matches("gridwatch/+/1/rpc@v1", "gridwatch/lm/1/rpc@v1"));
        assert!(topic_matches("gridwatch/#", "gridwatch/lm/1/events/log@v1"));
        assert!(topic_matches("gridwatch/lm/#", "gridwatch/lm"));
        assert!(!topic_matches("gridwatch/+", "gridwatch/lm/1"));
        assert!(!topic_matches("gridwatch/lm/1", "gridwatch/lm"));
        assert!(!topic_matches("gridwatch/nm/#", "gridwatch/lm/1"));
    }
}
