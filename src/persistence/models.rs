//! Serializable data models for persistence.
//!
//! Storage-friendly mirrors of the runtime types, encoded with bincode.
//! Decoding validates enum discriminants and reports bad values as
//! [`PersistenceError::Corruption`].

use std::sync::Arc;

use bincode::{Decode, Encode};

use super::error::{PersistenceError, Result};
use crate::federation::{EventPayload, FederationEvent};
use crate::protocol::{Message, QoS, RetainHandling, SubscriptionOptions, WillMessage};
use crate::queue::{EntryState, QueueEntry};
use crate::session::{Session, UnackRecord, UnackState};
use crate::topic::Subscription;

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct StoredMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: u8,
    pub retain: bool,
    pub publisher: Option<String>,
    pub origin_node: Option<String>,
    pub expiry_interval: Option<u32>,
    pub user_properties: Vec<(String, String)>,
    pub created_at: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct StoredWill {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: u8,
    pub retain: bool,
    pub delay_interval: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct StoredSession {
    pub client_id: String,
    pub username: Option<String>,
    pub clean_start: bool,
    pub expiry_interval: u32,
    pub will: Option<StoredWill>,
    pub created_at: u64,
    pub connected_at: Option<u64>,
    pub disconnected_at: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct StoredSubscription {
    pub client_id: String,
    pub filter: String,
    pub share_group: Option<String>,
    pub qos: u8,
    pub no_local: bool,
    pub retain_as_published: bool,
    pub retain_handling: u8,
    pub subscription_id: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct StoredQueueEntry {
    pub seq: u64,
    pub message: StoredMessage,
    pub qos: u8,
    pub retain: bool,
    pub subscription_ids: Vec<u32>,
    pub packet_id: Option<u16>,
    /// 0 = queued, 1 = inflight, 2 = released
    pub state: u8,
    pub dup: bool,
    pub attempts: u32,
    pub enqueued_at: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub struct StoredUnack {
    pub state: u8,
    pub updated_at: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub enum StoredEventPayload {
    Publish(StoredMessage),
    Subscribe(String),
    Unsubscribe(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct StoredEvent {
    pub id: u64,
    pub epoch: u64,
    pub origin: String,
    pub payload: StoredEventPayload,
}

/// Durable cursor state of one federation log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Encode, Decode)]
pub struct StoredLogMeta {
    /// Incarnation of the log; ids are only comparable within one epoch
    pub epoch: u64,
    /// Highest acknowledged event id (0 = none)
    pub acked: u64,
    /// Id the next appended event receives
    pub next_id: u64,
}

pub(crate) fn encode<T: Encode>(value: &T) -> Result<Vec<u8>> {
    bincode::encode_to_vec(value, bincode::config::standard()).map_err(PersistenceError::from)
}

pub(crate) fn decode<T: Decode<()>>(bytes: &[u8]) -> Result<T> {
    bincode::decode_from_slice(bytes, bincode::config::standard())
        .map(|(value, _)| value)
        .map_err(PersistenceError::from)
}

fn qos(v: u8) -> Result<QoS> {
    QoS::from_u8(v).ok_or_else(|| PersistenceError::Corruption(format!("invalid qos {}", v)))
}

// ============================================================================
// Conversion implementations
// ============================================================================

impl From<&Message> for StoredMessage {
    fn from(msg: &Message) -> Self {
        Self {
            topic: msg.topic.to_string(),
            payload: msg.payload.to_vec(),
            qos: msg.qos as u8,
            retain: msg.retain,
            publisher: msg.publisher.as_deref().map(str::to_string),
            origin_node: msg.origin_node.as_deref().map(str::to_string),
            expiry_interval: msg.expiry_interval,
            user_properties: msg.user_properties.clone(),
            created_at: msg.created_at,
        }
    }
}

impl TryFrom<StoredMessage> for Message {
    type Error = PersistenceError;

    fn try_from(stored: StoredMessage) -> Result<Self> {
        Ok(Self {
            topic: Arc::from(stored.topic),
            payload: stored.payload.into(),
            qos: qos(stored.qos)?,
            retain: stored.retain,
            packet_id: None,
            publisher: stored.publisher.map(Arc::from),
            origin_node: stored.origin_node.map(Arc::from),
            expiry_interval: stored.expiry_interval,
            user_properties: stored.user_properties,
            created_at: stored.created_at,
        })
    }
}

impl From<&Session> for StoredSession {
    fn from(session: &Session) -> Self {
        Self {
            client_id: session.client_id.to_string(),
            username: session.username.as_deref().map(str::to_string),
            clean_start: session.clean_start,
            expiry_interval: session.expiry_interval,
            will: session.will.as_ref().map(|w| StoredWill {
                topic: w.topic.to_string(),
                payload: w.payload.to_vec(),
                qos: w.qos as u8,
                retain: w.retain,
                delay_interval: w.delay_interval,
            }),
            created_at: session.created_at,
            connected_at: session.connected_at,
            disconnected_at: session.disconnected_at,
        }
    }
}

impl TryFrom<StoredSession> for Session {
    type Error = PersistenceError;

    fn try_from(stored: StoredSession) -> Result<Self> {
        let will = match stored.will {
            Some(w) => Some(WillMessage {
                topic: Arc::from(w.topic),
                payload: w.payload.into(),
                qos: qos(w.qos)?,
                retain: w.retain,
                delay_interval: w.delay_interval,
            }),
            None => None,
        };
        Ok(Self {
            client_id: Arc::from(stored.client_id),
            username: stored.username.map(Arc::from),
            clean_start: stored.clean_start,
            expiry_interval: stored.expiry_interval,
            will,
            created_at: stored.created_at,
            connected_at: stored.connected_at,
            disconnected_at: stored.disconnected_at,
        })
    }
}

impl From<&Subscription> for StoredSubscription {
    fn from(sub: &Subscription) -> Self {
        Self {
            client_id: sub.client_id.to_string(),
            filter: sub.filter.to_string(),
            share_group: sub.share_group.as_deref().map(str::to_string),
            qos: sub.options.qos as u8,
            no_local: sub.options.no_local,
            retain_as_published: sub.options.retain_as_published,
            retain_handling: sub.options.retain_handling as u8,
            subscription_id: sub.subscription_id,
        }
    }
}

impl TryFrom<StoredSubscription> for Subscription {
    type Error = PersistenceError;

    fn try_from(stored: StoredSubscription) -> Result<Self> {
        let retain_handling = RetainHandling::from_u8(stored.retain_handling).ok_or_else(|| {
            PersistenceError::Corruption(format!(
                "invalid retain handling {}",
                stored.retain_handling
            ))
        })?;
        Ok(Self {
            client_id: Arc::from(stored.client_id),
            filter: Arc::from(stored.filter),
            share_group: stored.share_group.map(Arc::from),
            options: SubscriptionOptions {
                qos: qos(stored.qos)?,
                no_local: stored.no_local,
                retain_as_published: stored.retain_as_published,
                retain_handling,
            },
            subscription_id: stored.subscription_id,
        })
    }
}

impl From<&QueueEntry> for StoredQueueEntry {
    fn from(entry: &QueueEntry) -> Self {
        Self {
            seq: entry.seq,
            message: StoredMessage::from(entry.message.as_ref()),
            qos: entry.qos as u8,
            retain: entry.retain,
            subscription_ids: entry.subscription_ids.clone(),
            packet_id: entry.packet_id,
            state: match entry.state {
                EntryState::Queued => 0,
                EntryState::Inflight => 1,
                EntryState::Released => 2,
            },
            dup: entry.dup,
            attempts: entry.attempts,
            enqueued_at: entry.enqueued_at,
        }
    }
}

impl TryFrom<StoredQueueEntry> for QueueEntry {
    type Error = PersistenceError;

    fn try_from(stored: StoredQueueEntry) -> Result<Self> {
        let state = match stored.state {
            0 => EntryState::Queued,
            1 => EntryState::Inflight,
            2 => EntryState::Released,
            other => {
                return Err(PersistenceError::Corruption(format!(
                    "invalid queue entry state {}",
                    other
                )))
            }
        };
        Ok(Self {
            seq: stored.seq,
            message: Arc::new(Message::try_from(stored.message)?),
            qos: qos(stored.qos)?,
            retain: stored.retain,
            subscription_ids: stored.subscription_ids,
            packet_id: stored.packet_id,
            state,
            dup: stored.dup,
            attempts: stored.attempts,
            enqueued_at: stored.enqueued_at,
            // Deadlines are re-armed when the session resumes
            deadline: None,
        })
    }
}

impl From<&UnackRecord> for StoredUnack {
    fn from(record: &UnackRecord) -> Self {
        Self {
            state: record.state as u8,
            updated_at: record.updated_at,
        }
    }
}

impl TryFrom<StoredUnack> for UnackRecord {
    type Error = PersistenceError;

    fn try_from(stored: StoredUnack) -> Result<Self> {
        let state = UnackState::from_u8(stored.state).ok_or_else(|| {
            PersistenceError::Corruption(format!("invalid unack state {}", stored.state))
        })?;
        Ok(Self {
            state,
            updated_at: stored.updated_at,
        })
    }
}

impl From<&FederationEvent> for StoredEvent {
    fn from(event: &FederationEvent) -> Self {
        let payload = match &event.payload {
            EventPayload::Publish(msg) => StoredEventPayload::Publish(StoredMessage::from(msg.as_ref())),
            EventPayload::Subscribe(filter) => StoredEventPayload::Subscribe(filter.to_string()),
            EventPayload::Unsubscribe(filter) => StoredEventPayload::Unsubscribe(filter.to_string()),
        };
        Self {
            id: event.id,
            epoch: event.epoch,
            origin: event.origin.to_string(),
            payload,
        }
    }
}

impl TryFrom<StoredEvent> for FederationEvent {
    type Error = PersistenceError;

    fn try_from(stored: StoredEvent) -> Result<Self> {
        let payload = match stored.payload {
            StoredEventPayload::Publish(msg) => EventPayload::Publish(Arc::new(Message::try_from(msg)?)),
            StoredEventPayload::Subscribe(filter) => EventPayload::Subscribe(Arc::from(filter)),
            StoredEventPayload::Unsubscribe(filter) => EventPayload::Unsubscribe(Arc::from(filter)),
        };
        Ok(Self {
            id: stored.id,
            epoch: stored.epoch,
            origin: Arc::from(stored.origin),
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_entry_encoding_keeps_state() {
        let msg = Message::new("a/b", "21.5", QoS::ExactlyOnce)
            .with_publisher("c2")
            .with_expiry(60)
            .with_user_property("unit", "C");
        let mut entry = QueueEntry::new(Arc::new(msg), QoS::AtLeastOnce);
        entry.seq = 9;
        entry.packet_id = Some(4);
        entry.state = EntryState::Released;
        entry.deadline = Some(123);

        let bytes = encode(&StoredQueueEntry::from(&entry)).unwrap();
        let restored = QueueEntry::try_from(decode::<StoredQueueEntry>(&bytes).unwrap()).unwrap();

        assert_eq!(restored.deadline, None);
        entry.deadline = None;
        assert_eq!(restored, entry);
    }

    #[test]
    fn test_invalid_discriminant_is_corruption() {
        let stored = StoredUnack {
            state: 9,
            updated_at: 0,
        };
        assert!(matches!(
            UnackRecord::try_from(stored),
            Err(PersistenceError::Corruption(_))
        ));
    }
}
