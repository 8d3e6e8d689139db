//! Persistence error types.

use std::fmt;

/// Errors raised by stores and backends.
#[derive(Debug)]
pub enum PersistenceError {
    Io(std::io::Error),
    /// Encoding a record for storage failed
    Serialize(String),
    /// A stored record could not be decoded
    Deserialize(String),
    /// The storage engine reported a failure
    Storage(String),
    /// A stored key or value does not have the expected shape
    Corruption(String),
    /// Backend was closed; no further operations are accepted
    Closed,
    /// Store used before `open()` succeeded
    NotOpen,
}

impl PersistenceError {
    pub(crate) fn bad_key(partition: &str, key: &[u8]) -> Self {
        Self::Corruption(format!(
            "malformed key in '{}': {}",
            partition,
            String::from_utf8_lossy(key)
        ))
    }
}

impl fmt::Display for PersistenceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "IO error: {}", e),
            Self::Serialize(e) => write!(f, "serialization error: {}", e),
            Self::Deserialize(e) => write!(f, "deserialization error: {}", e),
            Self::Storage(e) => write!(f, "storage error: {}", e),
            Self::Corruption(e) => write!(f, "data corruption: {}", e),
            Self::Closed => write!(f, "persistence backend closed"),
            Self::NotOpen => write!(f, "persistence backend not opened"),
        }
    }
}

impl std::error::Error for PersistenceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for PersistenceError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<fjall::Error> for PersistenceError {
    fn from(err: fjall::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<bincode::error::EncodeError> for PersistenceError {
    fn from(err: bincode::error::EncodeError) -> Self {
        Self::Serialize(err.to_string())
    }
}

impl From<bincode::error::DecodeError> for PersistenceError {
    fn from(err: bincode::error::DecodeError) -> Self {
        Self::Deserialize(err.to_string())
    }
}

/// Result type for persistence operations.
pub type Result<T> = std::result::Result<T, PersistenceError>;
