//! Persistence module for meshmq.
//!
//! Store contracts for sessions, subscriptions, outbound queues, unack
//! tables and retained messages, plus the backends that implement them:
//! - `memory`: process-lifetime state, nothing written
//! - `fjall`: local LSM-tree storage, state reloaded on open
//!
//! Both share the same in-memory stores and differ only in the [`Journal`]
//! beneath them. Other engines plug in by implementing [`Persistence`] and
//! registering with [`PersistenceRegistry`].

mod backend;
mod error;
mod factory;
mod fjall;
mod journal;
mod local;
mod memory;
mod models;
mod store;
mod stores;

pub use backend::Persistence;
pub use error::{PersistenceError, Result};
pub use factory::PersistenceRegistry;
pub use fjall::FjallJournal;
pub use journal::{Journal, JournalOp, LoadedState};
pub use local::{LocalPersistence, StoreSettings};
pub use memory::NullJournal;
#[cfg(test)]
pub(crate) use journal::testing::QueueFaultJournal;
pub use models::{
    StoredEvent, StoredEventPayload, StoredLogMeta, StoredMessage, StoredQueueEntry,
    StoredSession, StoredSubscription, StoredUnack, StoredWill,
};
pub use store::{QueueStore, RetainedStore, SessionStore, SubscriptionStore, UnackStore};
pub use stores::{
    LocalQueueStore, LocalRetainedStore, LocalSessionStore, LocalSubscriptionStore,
    LocalUnackStore,
};
