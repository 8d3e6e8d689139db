use std::fmt;

use crate::alias::AliasError;
use crate::config::ConfigError;
use crate::federation::FederationError;
use crate::hooks::HookError;
use crate::persistence::PersistenceError;
use crate::queue::QueueError;
use crate::session::UnackError;
use crate::topic::TopicError;

/// Errors surfaced by the dispatch core
#[derive(Debug)]
pub enum BrokerError {
    Config(ConfigError),
    Persistence(PersistenceError),
    Queue(QueueError),
    Unack(UnackError),
    Alias(AliasError),
    Hook(HookError),
    Federation(FederationError),
    Metrics(prometheus::Error),
    /// The connection handle was already closed
    NotConnected,
    /// Another connection took over this client id
    SessionTakenOver,
    InvalidTopic(TopicError),
    ShuttingDown,
    Timeout,
}

impl fmt::Display for BrokerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BrokerError::Config(e) => write!(f, "configuration error: {}", e),
            BrokerError::Persistence(e) => write!(f, "persistence error: {}", e),
            BrokerError::Queue(e) => write!(f, "{}", e),
            BrokerError::Unack(e) => write!(f, "{}", e),
            BrokerError::Alias(e) => write!(f, "topic alias error: {}", e),
            BrokerError::Hook(e) => write!(f, "hook error: {}", e),
            BrokerError::Federation(e) => write!(f, "{}", e),
            BrokerError::Metrics(e) => write!(f, "metrics error: {}", e),
            BrokerError::NotConnected => write!(f, "connection closed"),
            BrokerError::SessionTakenOver => write!(f, "session taken over"),
            BrokerError::InvalidTopic(e) => write!(f, "invalid topic: {}", e),
            BrokerError::ShuttingDown => write!(f, "broker shutting down"),
            BrokerError::Timeout => write!(f, "operation timed out"),
        }
    }
}

impl std::error::Error for BrokerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BrokerError::Config(e) => Some(e),
            BrokerError::Persistence(e) => Some(e),
            BrokerError::Queue(e) => Some(e),
            BrokerError::Unack(e) => Some(e),
            BrokerError::Alias(e) => Some(e),
            BrokerError::Hook(e) => Some(e),
            BrokerError::Federation(e) => Some(e),
            BrokerError::Metrics(e) => Some(e),
            BrokerError::InvalidTopic(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ConfigError> for BrokerError {
    fn from(e: ConfigError) -> Self {
        BrokerError::Config(e)
    }
}

impl From<PersistenceError> for BrokerError {
    fn from(e: PersistenceError) -> Self {
        BrokerError::Persistence(e)
    }
}

impl From<QueueError> for BrokerError {
    fn from(e: QueueError) -> Self {
        BrokerError::Queue(e)
    }
}

impl From<UnackError> for BrokerError {
    fn from(e: UnackError) -> Self {
        BrokerError::Unack(e)
    }
}

impl From<AliasError> for BrokerError {
    fn from(e: AliasError) -> Self {
        BrokerError::Alias(e)
    }
}

impl From<HookError> for BrokerError {
    fn from(e: HookError) -> Self {
        match e {
            HookError::Timeout => BrokerError::Timeout,
            other => BrokerError::Hook(other),
        }
    }
}

impl From<FederationError> for BrokerError {
    fn from(e: FederationError) -> Self {
        BrokerError::Federation(e)
    }
}

impl From<prometheus::Error> for BrokerError {
    fn from(e: prometheus::Error) -> Self {
        BrokerError::Metrics(e)
    }
}

impl From<TopicError> for BrokerError {
    fn from(e: TopicError) -> Self {
        BrokerError::InvalidTopic(e)
    }
}

pub type Result<T> = std::result::Result<T, BrokerError>;
