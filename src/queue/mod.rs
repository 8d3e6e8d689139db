//! Per-session outbound queue with an inflight window
//!
//! [`OutboundQueue`] is the in-memory state machine shared by every backend:
//! entries move from queued to inflight (packet id assigned) to removed on
//! acknowledgement, or to released for QoS 2 once PUBREC arrives. Backends
//! wrap it and journal the entries that must survive a restart.

mod outbound;

pub use outbound::{Dequeued, EnqueueOutcome, ExpireReport, OutboundQueue};

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::persistence::PersistenceError;
use crate::protocol::{Message, QoS};

/// What happens when a queue at capacity receives another message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FullPolicy {
    /// Evict the oldest entry that is not inflight
    #[default]
    DropOldest,
    /// Refuse the new message
    Reject,
}

/// What happens to an inflight entry whose acknowledgement deadline passed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpiryAction {
    /// Send it again with DUP set
    #[default]
    Redeliver,
    /// Remove it and signal a delivery failure
    Drop,
}

/// Limits applied to one session's queue
#[derive(Debug, Clone)]
pub struct QueueSettings {
    /// Maximum entries held, inflight included (0 = unbounded)
    pub max_queued: usize,
    /// Maximum QoS 1/2 entries awaiting acknowledgement
    pub max_inflight: usize,
    pub inflight_expiry: Duration,
    pub full_policy: FullPolicy,
    pub expiry_action: ExpiryAction,
    /// Transmissions before a redeliverable entry is dropped (0 = unlimited)
    pub max_attempts: u32,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            max_queued: 1000,
            max_inflight: 32,
            inflight_expiry: Duration::from_secs(30),
            full_policy: FullPolicy::DropOldest,
            expiry_action: ExpiryAction::Redeliver,
            max_attempts: 0,
        }
    }
}

/// Lifecycle of a queue entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    /// Waiting for the inflight window
    Queued,
    /// Sent, waiting for PUBACK or PUBREC
    Inflight,
    /// QoS 2: PUBREC received, waiting for PUBCOMP
    Released,
}

/// A message plus its delivery bookkeeping for one session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    /// Position in the queue, assigned on enqueue
    pub seq: u64,
    pub message: Arc<Message>,
    /// Effective delivery QoS (publish QoS capped by the subscription)
    pub qos: QoS,
    /// Retain flag as delivered to this subscriber
    pub retain: bool,
    pub subscription_ids: Vec<u32>,
    pub packet_id: Option<u16>,
    pub state: EntryState,
    pub dup: bool,
    /// Number of transmissions so far
    pub attempts: u32,
    /// Unix ms
    pub enqueued_at: u64,
    /// Unix ms after which an unacknowledged entry is expired
    pub deadline: Option<u64>,
}

impl QueueEntry {
    pub fn new(message: Arc<Message>, qos: QoS) -> Self {
        let retain = message.retain;
        Self {
            seq: 0,
            message,
            qos,
            retain,
            subscription_ids: Vec::new(),
            packet_id: None,
            state: EntryState::Queued,
            dup: false,
            attempts: 0,
            enqueued_at: 0,
            deadline: None,
        }
    }

    pub fn with_retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }

    pub fn with_subscription_ids(mut self, ids: Vec<u32>) -> Self {
        self.subscription_ids = ids;
        self
    }

    /// Whether this entry occupies a slot in the inflight window
    pub fn in_window(&self) -> bool {
        matches!(self.state, EntryState::Inflight | EntryState::Released)
    }
}

/// Why an entry left the queue without being acknowledged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DropReason {
    /// Evicted to make room under the drop-oldest policy
    QueueFull,
    /// Message expiry interval elapsed before delivery
    Expired,
    /// Acknowledgement deadline passed and the expiry action is drop
    InflightExpired,
    /// Redelivery limit reached
    MaxAttempts,
}

impl DropReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::QueueFull => "queue_full",
            DropReason::Expired => "expired",
            DropReason::InflightExpired => "inflight_expired",
            DropReason::MaxAttempts => "max_attempts",
        }
    }
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Receives queue events so the queue never depends on the transport
pub trait QueueNotifier: Send + Sync {
    /// An entry became deliverable for `client_id`
    fn on_ready(&self, client_id: &str);

    /// An entry was removed without acknowledgement
    fn on_dropped(&self, client_id: &str, entry: &QueueEntry, reason: DropReason) {
        tracing::debug!(
            client_id,
            topic = %entry.message.topic,
            packet_id = ?entry.packet_id,
            %reason,
            "queue entry dropped"
        );
    }
}

/// Notifier used when no broker is attached; only logs
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultNotifier;

impl QueueNotifier for DefaultNotifier {
    fn on_ready(&self, client_id: &str) {
        tracing::trace!(client_id, "queue entry ready");
    }
}

/// Queue operation errors
#[derive(Debug)]
pub enum QueueError {
    /// Queue at capacity (reject policy, or nothing evictable)
    Full,
    /// No inflight entry carries this packet id
    NotFound(u16),
    /// Every packet id is held by an unacknowledged entry
    PacketIdsExhausted,
    Store(PersistenceError),
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueError::Full => write!(f, "queue full"),
            QueueError::NotFound(id) => write!(f, "no inflight entry for packet id {}", id),
            QueueError::PacketIdsExhausted => write!(f, "packet identifiers exhausted"),
            QueueError::Store(e) => write!(f, "queue store error: {}", e),
        }
    }
}

impl std::error::Error for QueueError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            QueueError::Store(e) => Some(e),
            _ => None,
        }
    }
}

impl From<PersistenceError> for QueueError {
    fn from(e: PersistenceError) -> Self {
        QueueError::Store(e)
    }
}
