//! Federation replication
//!
//! Each peer broker gets its own ordered, acknowledgeable [`EventLog`].
//! Local publishes that match a peer's advertised interest are appended to
//! that peer's log; a sender task per peer drains the log over a
//! [`PeerLink`] and acknowledges what the peer confirmed. Events are kept
//! until acknowledged, so delivery to a peer is at-least-once; the receiving
//! side drops re-sent events by id. Ordering holds within one peer's log
//! only.

mod log;
mod manager;

pub use log::{EventLog, LocalEventLog};
pub use manager::{Federation, FederationSettings};

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::persistence::PersistenceError;
use crate::protocol::Message;

/// What a federation event carries
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventPayload {
    /// A message published on the origin node
    Publish(Arc<Message>),
    /// The origin node gained its first local subscriber for a filter
    Subscribe(Arc<str>),
    /// The origin node lost its last local subscriber for a filter
    Unsubscribe(Arc<str>),
}

/// An entry in a per-peer replication log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FederationEvent {
    /// Position in the log, strictly increasing from 1
    pub id: u64,
    /// Incarnation of the producing log. A log rebuilt without its stored
    /// state starts a new epoch and numbers its events from 1 again.
    pub epoch: u64,
    /// Node that produced the event
    pub origin: Arc<str>,
    pub payload: EventPayload,
}

impl FederationEvent {
    pub fn kind(&self) -> &'static str {
        match self.payload {
            EventPayload::Publish(_) => "publish",
            EventPayload::Subscribe(_) => "subscribe",
            EventPayload::Unsubscribe(_) => "unsubscribe",
        }
    }
}

/// Federation errors
#[derive(Debug)]
pub enum FederationError {
    /// Log storage failed
    Log(PersistenceError),
    UnknownPeer(String),
    /// Transport to the peer failed; the batch will be resent
    Link(String),
    /// Log or manager is closed
    Closed,
}

impl fmt::Display for FederationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FederationError::Log(e) => write!(f, "federation log error: {}", e),
            FederationError::UnknownPeer(peer) => write!(f, "unknown federation peer '{}'", peer),
            FederationError::Link(msg) => write!(f, "peer link error: {}", msg),
            FederationError::Closed => write!(f, "federation log closed"),
        }
    }
}

impl std::error::Error for FederationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FederationError::Log(e) => Some(e),
            _ => None,
        }
    }
}

impl From<PersistenceError> for FederationError {
    fn from(e: PersistenceError) -> Self {
        match e {
            PersistenceError::Closed => FederationError::Closed,
            other => FederationError::Log(other),
        }
    }
}

/// Transport to one peer broker. The wire protocol lives outside this crate.
#[async_trait]
pub trait PeerLink: Send + Sync {
    fn peer(&self) -> &str;

    /// Deliver a batch in order and return the highest event id the peer
    /// confirmed. Ids above it are sent again.
    async fn send(&self, events: &[FederationEvent]) -> Result<u64, FederationError>;
}
