//! Store contracts every backend satisfies
//!
//! The four delivery stores plus retained messages. Queue and unack stores
//! are scoped to one client; session, subscription and retained stores are
//! shared by the whole broker instance.

use std::sync::Arc;

use async_trait::async_trait;
use smallvec::SmallVec;

use super::error::Result;
use crate::protocol::Message;
use crate::queue::{ExpireReport, QueueEntry, QueueError};
use crate::session::{Session, UnackError, UnackRecord, UnackState};
use crate::topic::Subscription;

/// Client identity and persistent-session flag across reconnects
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Insert or replace the session for its client id
    async fn create(&self, session: Session) -> Result<()>;

    async fn get(&self, client_id: &str) -> Result<Option<Session>>;

    /// Returns false if no session existed
    async fn delete(&self, client_id: &str) -> Result<bool>;

    async fn list(&self) -> Result<Vec<Session>>;
}

/// Topic-filter index plus its durable copy
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    /// Add or replace; returns true if the (client, filter, share) key was new
    async fn subscribe(&self, subscription: Subscription) -> Result<bool>;

    async fn unsubscribe(
        &self,
        client_id: &str,
        filter: &str,
        share_group: Option<&str>,
    ) -> Result<bool>;

    async fn unsubscribe_all(&self, client_id: &str) -> Result<Vec<Subscription>>;

    /// Matching is served from memory and never waits on I/O
    fn matches(&self, topic: &str) -> SmallVec<[Subscription; 16]>;

    async fn client_subscriptions(&self, client_id: &str) -> Result<Vec<Subscription>>;

    fn count(&self) -> usize;
}

/// One client's outbound queue
#[async_trait]
pub trait QueueStore: Send + Sync {
    fn client_id(&self) -> &str;

    /// Prepare for a new connection: a clean start discards everything,
    /// otherwise inflight entries are reset for redelivery.
    async fn init(&self, clean_start: bool) -> std::result::Result<(), QueueError>;

    /// Append an entry; returns its sequence number
    async fn enqueue(&self, entry: QueueEntry) -> std::result::Result<u64, QueueError>;

    /// Next entry to transmit, moving QoS 1/2 entries into the inflight window
    async fn dequeue(&self) -> std::result::Result<Option<QueueEntry>, QueueError>;

    /// Record a transmission of an inflight entry
    async fn mark_inflight(&self, packet_id: u16) -> std::result::Result<QueueEntry, QueueError>;

    /// QoS 2 PUBREC received
    async fn release(&self, packet_id: u16) -> std::result::Result<(), QueueError>;

    /// PUBACK / PUBCOMP received. Unknown ids return `Ok(None)`.
    async fn ack(&self, packet_id: u16) -> std::result::Result<Option<QueueEntry>, QueueError>;

    /// Periodic inflight deadline and message expiry sweep
    async fn expire(&self) -> std::result::Result<ExpireReport, QueueError>;

    /// QoS 2 packet ids awaiting PUBCOMP
    async fn released(&self) -> Vec<u16>;

    async fn clear(&self) -> std::result::Result<(), QueueError>;

    fn len(&self) -> usize;

    fn inflight_len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One client's inbound QoS 2 exchanges
#[async_trait]
pub trait UnackStore: Send + Sync {
    /// A clean start forgets earlier exchanges
    async fn init(&self, clean_start: bool) -> std::result::Result<(), UnackError>;

    /// Returns true if `packet_id` was already tracked (retransmission)
    async fn record(&self, packet_id: u16, state: UnackState) -> std::result::Result<bool, UnackError>;

    async fn advance(&self, packet_id: u16, next: UnackState) -> std::result::Result<(), UnackError>;

    async fn clear(&self, packet_id: u16) -> std::result::Result<bool, UnackError>;

    /// Reclaim every pending exchange, e.g. when the session is deleted
    async fn sweep(&self) -> std::result::Result<Vec<u16>, UnackError>;

    fn get(&self, packet_id: u16) -> Option<UnackRecord>;

    fn len(&self) -> usize;
}

/// Last retained message per topic
#[async_trait]
pub trait RetainedStore: Send + Sync {
    async fn set(&self, message: Arc<Message>) -> Result<()>;

    async fn remove(&self, topic: &str) -> Result<bool>;

    /// Retained messages whose topic matches `filter`
    fn matching(&self, filter: &str) -> Vec<Arc<Message>>;

    fn count(&self) -> usize;
}
