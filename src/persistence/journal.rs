//! Write-through journal beneath the local stores
//!
//! Stores keep their working state in memory and describe every durable
//! change as a [`JournalOp`]. A batch of ops from one store call is applied
//! atomically, so a crash never leaves half of an operation on disk. The
//! in-memory backend uses [`NullJournal`](super::NullJournal), which accepts
//! and forgets.

use std::collections::HashMap;

use super::error::Result;
use super::models::{
    StoredEvent, StoredLogMeta, StoredMessage, StoredQueueEntry, StoredSession,
    StoredSubscription, StoredUnack,
};

/// A single durable change
#[derive(Debug, Clone)]
pub enum JournalOp {
    PutSession {
        session: StoredSession,
    },
    DeleteSession {
        client_id: String,
    },
    PutSubscription {
        subscription: StoredSubscription,
    },
    DeleteSubscription {
        client_id: String,
        filter: String,
        share_group: Option<String>,
    },
    PutQueueEntry {
        client_id: String,
        entry: StoredQueueEntry,
    },
    DeleteQueueEntry {
        client_id: String,
        seq: u64,
    },
    /// Remove every queue entry of one client
    ClearQueue {
        client_id: String,
    },
    PutUnack {
        client_id: String,
        packet_id: u16,
        record: StoredUnack,
    },
    DeleteUnack {
        client_id: String,
        packet_id: u16,
    },
    ClearUnacks {
        client_id: String,
    },
    PutRetained {
        message: StoredMessage,
    },
    DeleteRetained {
        topic: String,
    },
    PutEvent {
        peer: String,
        event: StoredEvent,
    },
    DeleteEvent {
        peer: String,
        id: u64,
    },
    ClearEvents {
        peer: String,
    },
    PutLogMeta {
        peer: String,
        meta: StoredLogMeta,
    },
}

/// Everything a journal holds, read once on open
#[derive(Debug, Default)]
pub struct LoadedState {
    pub sessions: Vec<StoredSession>,
    pub subscriptions: Vec<StoredSubscription>,
    /// client id -> entries (any order)
    pub queues: HashMap<String, Vec<StoredQueueEntry>>,
    /// client id -> (packet id, record)
    pub unacks: HashMap<String, Vec<(u16, StoredUnack)>>,
    pub retained: Vec<StoredMessage>,
    /// peer -> events in id order
    pub events: HashMap<String, Vec<StoredEvent>>,
    pub log_meta: HashMap<String, StoredLogMeta>,
}

/// Durable sink for store changes
pub trait Journal: Send + Sync {
    /// Backend name as registered in the factory
    fn name(&self) -> &'static str;

    /// Acquire the underlying resources
    fn open(&self) -> Result<()>;

    /// Read back all durable state
    fn load(&self) -> Result<LoadedState>;

    /// Apply a batch atomically
    fn apply(&self, ops: Vec<JournalOp>) -> Result<()>;

    /// Make applied batches durable on disk
    fn flush(&self) -> Result<()>;

    /// Flush and release resources. Later calls fail with `Closed`.
    fn close(&self) -> Result<()>;

    /// Whether batches are kept at all. Stores skip building ops when not.
    fn is_durable(&self) -> bool {
        true
    }
}
