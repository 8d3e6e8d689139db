//! meshmq - MQTT message delivery and persistence core
//!
//! Stores, subscription matching, per-session outbound queues, topic
//! aliases, a plugin hook pipeline and per-peer federation logs, driven by
//! a transport layer through [`Broker`] and [`broker::Connection`].

pub mod ack;
pub mod alias;
pub mod broker;
pub mod config;
pub mod federation;
pub mod hooks;
pub mod metrics;
pub mod persistence;
pub mod plugins;
pub mod protocol;
pub mod queue;
pub mod session;
pub mod topic;

pub use alias::TopicAliasManager;
pub use broker::{Broker, BrokerError, ConnectRequest, Connection};
pub use config::Config;
pub use federation::{EventLog, Federation, FederationEvent, PeerLink};
pub use hooks::{HookPipeline, Hooks, Plugin, PluginRegistry};
pub use metrics::Metrics;
pub use persistence::{Persistence, PersistenceRegistry};
pub use protocol::{Message, QoS};
