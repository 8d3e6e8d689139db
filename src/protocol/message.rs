//! Application messages
//!
//! A [`Message`] is immutable once published. The dispatch core wraps it in
//! an `Arc` and shares that one allocation across every matched subscriber.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;

use super::QoS;

/// MQTT v5.0 user property (key, value)
pub type UserProperty = (String, String);

/// Wall-clock milliseconds since the unix epoch
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// A published application message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: Arc<str>,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    /// Packet identifier as received from the publisher (QoS > 0)
    pub packet_id: Option<u16>,
    /// Client id of the publisher, used for no-local filtering
    pub publisher: Option<Arc<str>>,
    /// Federation node this message was first published on, if not local
    pub origin_node: Option<Arc<str>>,
    /// Message expiry interval in seconds (MQTT v5.0)
    pub expiry_interval: Option<u32>,
    pub user_properties: Vec<UserProperty>,
    /// Creation time in unix milliseconds
    pub created_at: u64,
}

impl Message {
    pub fn new(topic: impl Into<Arc<str>>, payload: impl Into<Bytes>, qos: QoS) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos,
            retain: false,
            packet_id: None,
            publisher: None,
            origin_node: None,
            expiry_interval: None,
            user_properties: Vec::new(),
            created_at: now_millis(),
        }
    }

    pub fn retained(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }

    pub fn with_packet_id(mut self, packet_id: u16) -> Self {
        self.packet_id = Some(packet_id);
        self
    }

    pub fn with_publisher(mut self, client_id: impl Into<Arc<str>>) -> Self {
        self.publisher = Some(client_id.into());
        self
    }

    pub fn with_origin(mut self, node: impl Into<Arc<str>>) -> Self {
        self.origin_node = Some(node.into());
        self
    }

    pub fn with_expiry(mut self, seconds: u32) -> Self {
        self.expiry_interval = Some(seconds);
        self
    }

    pub fn with_user_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.user_properties.push((key.into(), value.into()));
        self
    }

    pub fn with_created_at(mut self, millis: u64) -> Self {
        self.created_at = millis;
        self
    }

    /// True once the message expiry interval has elapsed at `now` (unix ms)
    pub fn is_expired(&self, now: u64) -> bool {
        match self.expiry_interval {
            Some(secs) => now >= self.created_at.saturating_add(u64::from(secs) * 1000),
            None => false,
        }
    }

    /// Seconds left before expiry, for the forwarded PUBLISH property
    pub fn remaining_expiry(&self, now: u64) -> Option<u32> {
        self.expiry_interval.map(|secs| {
            let deadline = self.created_at.saturating_add(u64::from(secs) * 1000);
            (deadline.saturating_sub(now) / 1000) as u32
        })
    }

    /// A zero-length retained publish clears the retained slot for its topic
    pub fn clears_retained(&self) -> bool {
        self.retain && self.payload.is_empty()
    }
}

/// Last will stored with a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WillMessage {
    pub topic: Arc<str>,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    /// Will delay interval in seconds (MQTT v5.0)
    pub delay_interval: u32,
}

impl WillMessage {
    /// Build the message published when the will fires
    pub fn to_message(&self, client_id: &str) -> Message {
        Message::new(self.topic.clone(), self.payload.clone(), self.qos)
            .retained(self.retain)
            .with_publisher(client_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expiry() {
        let msg = Message::new("a/b", "x", QoS::AtLeastOnce)
            .with_created_at(10_000)
            .with_expiry(5);
        assert!(!msg.is_expired(14_999));
        assert!(msg.is_expired(15_000));
        assert_eq!(msg.remaining_expiry(12_000), Some(3));

        let forever = Message::new("a/b", "x", QoS::AtLeastOnce);
        assert!(!forever.is_expired(u64::MAX));
        assert_eq!(forever.remaining_expiry(0), None);
    }

    #[test]
    fn test_clears_retained() {
        assert!(Message::new("t", "", QoS::AtMostOnce).retained(true).clears_retained());
        assert!(!Message::new("t", "", QoS::AtMostOnce).clears_retained());
        assert!(!Message::new("t", "v", QoS::AtMostOnce).retained(true).clears_retained());
    }
}
