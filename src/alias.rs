//! Topic alias tables
//!
//! Every connection has two independent alias spaces: aliases the client
//! registers on its PUBLISH packets (inbound) and aliases the broker hands
//! out for topics it delivers (outbound). Both are dropped when the
//! connection closes and never carry over to a reconnect.

use std::fmt;
use std::sync::Arc;

use ahash::AHashMap;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::trace;

/// Broker-assigned identifier of one network connection
pub type ConnectionId = u64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AliasError {
    /// Alias 0 is reserved
    Zero,
    /// Alias above the maximum negotiated for the connection
    ExceedsMax { alias: u16, max: u16 },
    UnknownConnection(ConnectionId),
    /// Every outbound alias is taken
    TableFull,
}

impl fmt::Display for AliasError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Zero => write!(f, "topic alias 0 is not allowed"),
            Self::ExceedsMax { alias, max } => {
                write!(f, "topic alias {} exceeds maximum {}", alias, max)
            }
            Self::UnknownConnection(id) => write!(f, "no alias table for connection {}", id),
            Self::TableFull => write!(f, "topic alias table full"),
        }
    }
}

impl std::error::Error for AliasError {}

/// Result of [`TopicAliasManager::assign`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboundAlias {
    /// First use: send the topic together with the alias
    New(u16),
    /// Already known to the client: send the alias with an empty topic
    Existing(u16),
}

impl OutboundAlias {
    pub fn alias(self) -> u16 {
        match self {
            Self::New(a) | Self::Existing(a) => a,
        }
    }
}

#[derive(Debug)]
struct AliasTable {
    inbound_max: u16,
    inbound: AHashMap<u16, Arc<str>>,
    outbound_max: u16,
    outbound: AHashMap<Arc<str>, u16>,
    next_outbound: u32,
}

impl AliasTable {
    fn new(inbound_max: u16, outbound_max: u16) -> Self {
        Self {
            inbound_max,
            inbound: AHashMap::new(),
            outbound_max,
            outbound: AHashMap::new(),
            next_outbound: 1,
        }
    }
}

/// Per-connection alias tables, locked per connection
#[derive(Default)]
pub struct TopicAliasManager {
    tables: DashMap<ConnectionId, Mutex<AliasTable>>,
}

impl TopicAliasManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a connection. `inbound_max` is the maximum the broker
    /// advertised; `outbound_max` is the client's advertised maximum. An
    /// existing table for the same id is replaced.
    pub fn open(&self, conn: ConnectionId, inbound_max: u16, outbound_max: u16) {
        self.tables
            .insert(conn, Mutex::new(AliasTable::new(inbound_max, outbound_max)));
    }

    /// Discard a connection's aliases. Returns false if none were tracked.
    pub fn close(&self, conn: ConnectionId) -> bool {
        self.tables.remove(&conn).is_some()
    }

    /// Map a client alias to a topic. Re-registering an alias overwrites it.
    pub fn register(
        &self,
        conn: ConnectionId,
        alias: u16,
        topic: impl Into<Arc<str>>,
    ) -> Result<(), AliasError> {
        if alias == 0 {
            return Err(AliasError::Zero);
        }
        let table = self
            .tables
            .get(&conn)
            .ok_or(AliasError::UnknownConnection(conn))?;
        let mut table = table.lock();
        if alias > table.inbound_max {
            return Err(AliasError::ExceedsMax {
                alias,
                max: table.inbound_max,
            });
        }
        let topic = topic.into();
        trace!(conn, alias, topic = %topic, "topic alias registered");
        table.inbound.insert(alias, topic);
        Ok(())
    }

    pub fn resolve(&self, conn: ConnectionId, alias: u16) -> Option<Arc<str>> {
        let table = self.tables.get(&conn)?;
        let table = table.lock();
        table.inbound.get(&alias).cloned()
    }

    /// Alias to use when delivering `topic` on this connection
    pub fn assign(&self, conn: ConnectionId, topic: &str) -> Result<OutboundAlias, AliasError> {
        let table = self
            .tables
            .get(&conn)
            .ok_or(AliasError::UnknownConnection(conn))?;
        let mut table = table.lock();
        if let Some(&alias) = table.outbound.get(topic) {
            return Ok(OutboundAlias::Existing(alias));
        }
        if table.next_outbound > u32::from(table.outbound_max) {
            return Err(AliasError::TableFull);
        }
        let alias = table.next_outbound as u16;
        table.next_outbound += 1;
        table.outbound.insert(Arc::from(topic), alias);
        Ok(OutboundAlias::New(alias))
    }

    /// Number of connections with a table
    pub fn connections(&self) -> usize {
        self.tables.len()
    }
}
