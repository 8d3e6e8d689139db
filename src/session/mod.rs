//! Session records and QoS 2 receive bookkeeping
//!
//! A [`Session`] outlives its network connection when its expiry interval
//! is non-zero. The queue and unack state hanging off a session live in the
//! persistence stores, keyed by the same client id.

mod unack;

pub use unack::{UnackError, UnackRecord, UnackState, UnackTable};

use std::sync::Arc;

use crate::protocol::WillMessage;

/// Session expiry interval meaning "never expires"
pub const NEVER_EXPIRE: u32 = u32::MAX;

/// Connection state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    Disconnected,
}

/// Client session record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub client_id: Arc<str>,
    pub username: Option<Arc<str>>,
    /// Clean start requested on the connect that created or resumed it
    pub clean_start: bool,
    /// Seconds the session survives after disconnect (0 = ends with the
    /// connection, [`NEVER_EXPIRE`] = until deleted)
    pub expiry_interval: u32,
    pub will: Option<WillMessage>,
    /// Unix ms
    pub created_at: u64,
    pub connected_at: Option<u64>,
    pub disconnected_at: Option<u64>,
}

impl Session {
    pub fn new(client_id: impl Into<Arc<str>>, clean_start: bool, expiry_interval: u32, now: u64) -> Self {
        Self {
            client_id: client_id.into(),
            username: None,
            clean_start,
            expiry_interval,
            will: None,
            created_at: now,
            connected_at: Some(now),
            disconnected_at: None,
        }
    }

    pub fn state(&self) -> SessionState {
        if self.disconnected_at.is_some() {
            SessionState::Disconnected
        } else {
            SessionState::Connected
        }
    }

    /// Whether the session is kept after its connection closes
    pub fn is_persistent(&self) -> bool {
        self.expiry_interval > 0
    }

    /// A disconnected session whose expiry interval has elapsed at `now`
    pub fn is_expired(&self, now: u64) -> bool {
        let Some(disconnected_at) = self.disconnected_at else {
            return false;
        };
        match self.expiry_interval {
            0 => true,
            NEVER_EXPIRE => false,
            secs => now >= disconnected_at.saturating_add(u64::from(secs) * 1000),
        }
    }

    pub fn mark_connected(&mut self, now: u64) {
        self.connected_at = Some(now);
        self.disconnected_at = None;
    }

    pub fn mark_disconnected(&mut self, now: u64) {
        self.disconnected_at = Some(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expiry() {
        let mut session = Session::new("c1", false, 10, 0);
        assert!(!session.is_expired(u64::MAX));
        assert_eq!(session.state(), SessionState::Connected);

        session.mark_disconnected(1_000);
        assert!(!session.is_expired(10_999));
        assert!(session.is_expired(11_000));

        session.mark_connected(12_000);
        assert!(!session.is_expired(u64::MAX));
    }

    #[test]
    fn test_never_and_zero() {
        let mut forever = Session::new("c1", false, NEVER_EXPIRE, 0);
        forever.mark_disconnected(0);
        assert!(!forever.is_expired(u64::MAX));
        assert!(forever.is_persistent());

        let mut clean = Session::new("c2", true, 0, 0);
        clean.mark_disconnected(5);
        assert!(clean.is_expired(5));
        assert!(!clean.is_persistent());
    }
}
