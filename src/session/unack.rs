//! Receiver-side QoS 2 exchange tracking
//!
//! One [`UnackTable`] per client. A record is created when an inbound QoS 2
//! PUBLISH arrives and only moves forward until PUBREL clears it, so a
//! retransmitted PUBLISH is recognised and not dispatched twice.

use std::fmt;

use ahash::AHashMap;

use crate::persistence::PersistenceError;

/// Stage of an inbound QoS 2 exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum UnackState {
    /// PUBLISH received and dispatched
    Received = 0,
    /// PUBREC sent, waiting for PUBREL
    PubRecSent = 1,
    /// PUBREL received, PUBCOMP pending
    PubRelReceived = 2,
}

impl UnackState {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(UnackState::Received),
            1 => Some(UnackState::PubRecSent),
            2 => Some(UnackState::PubRelReceived),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnackRecord {
    pub state: UnackState,
    /// Unix ms of the last transition
    pub updated_at: u64,
}

#[derive(Debug)]
pub enum UnackError {
    /// More exchanges awaiting PUBREL than the configured maximum
    Capacity(usize),
    /// Unknown packet id or a backwards move
    InvalidTransition {
        packet_id: u16,
        from: Option<UnackState>,
        to: UnackState,
    },
    Store(PersistenceError),
}

impl fmt::Display for UnackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnackError::Capacity(max) => write!(f, "more than {} QoS 2 exchanges pending", max),
            UnackError::InvalidTransition { packet_id, from, to } => write!(
                f,
                "invalid transition for packet id {}: {:?} -> {:?}",
                packet_id, from, to
            ),
            UnackError::Store(e) => write!(f, "unack store error: {}", e),
        }
    }
}

impl std::error::Error for UnackError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            UnackError::Store(e) => Some(e),
            _ => None,
        }
    }
}

impl From<PersistenceError> for UnackError {
    fn from(e: PersistenceError) -> Self {
        UnackError::Store(e)
    }
}

/// Packet id -> exchange state for one client
#[derive(Debug, Default)]
pub struct UnackTable {
    /// 0 = unlimited
    capacity: usize,
    records: AHashMap<u16, UnackRecord>,
}

impl UnackTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            records: AHashMap::new(),
        }
    }

    pub fn restore(capacity: usize, records: impl IntoIterator<Item = (u16, UnackRecord)>) -> Self {
        Self {
            capacity,
            records: records.into_iter().collect(),
        }
    }

    /// Start tracking `packet_id`. Returns `Ok(true)` when the id is
    /// already tracked, meaning the PUBLISH is a retransmission.
    pub fn record(&mut self, packet_id: u16, state: UnackState, now: u64) -> Result<bool, UnackError> {
        if self.records.contains_key(&packet_id) {
            return Ok(true);
        }
        if self.capacity > 0 && self.records.len() >= self.capacity {
            return Err(UnackError::Capacity(self.capacity));
        }
        self.records.insert(
            packet_id,
            UnackRecord {
                state,
                updated_at: now,
            },
        );
        Ok(false)
    }

    /// Move an exchange forward. Repeating the current state is accepted.
    pub fn advance(&mut self, packet_id: u16, next: UnackState, now: u64) -> Result<UnackRecord, UnackError> {
        let invalid = |from| UnackError::InvalidTransition {
            packet_id,
            from,
            to: next,
        };
        let record = self.records.get_mut(&packet_id).ok_or_else(|| invalid(None))?;
        if next < record.state {
            return Err(invalid(Some(record.state)));
        }
        record.state = next;
        record.updated_at = now;
        Ok(*record)
    }

    /// Finish an exchange. Returns false if the id was not tracked.
    pub fn clear(&mut self, packet_id: u16) -> bool {
        self.records.remove(&packet_id).is_some()
    }

    /// Forget every pending exchange
    pub fn clear_all(&mut self) -> Vec<u16> {
        self.records.drain().map(|(id, _)| id).collect()
    }

    pub fn get(&self, packet_id: u16) -> Option<UnackRecord> {
        self.records.get(&packet_id).copied()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
