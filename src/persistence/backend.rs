//! Persistence backend trait.
//!
//! A backend builds every store for one broker instance on a single
//! storage engine. The broker resolves a backend by name through
//! [`PersistenceRegistry`](super::PersistenceRegistry), opens it once at
//! startup and closes it last at shutdown.

use std::sync::Arc;

use async_trait::async_trait;

use super::error::Result;
use super::store::{QueueStore, RetainedStore, SessionStore, SubscriptionStore, UnackStore};
use crate::federation::EventLog;
use crate::queue::QueueNotifier;

/// A storage engine providing the full store set
#[async_trait]
pub trait Persistence: Send + Sync {
    /// Name the backend is registered under
    fn name(&self) -> &'static str;

    /// Acquire resources and load durable state. Must succeed before any
    /// store is handed out.
    async fn open(&self) -> Result<()>;

    fn session_store(&self) -> Result<Arc<dyn SessionStore>>;

    fn subscription_store(&self) -> Result<Arc<dyn SubscriptionStore>>;

    fn retained_store(&self) -> Result<Arc<dyn RetainedStore>>;

    /// The client's queue, created on first use. `notifier` replaces any
    /// earlier listener.
    fn queue_store(
        &self,
        client_id: &str,
        notifier: Arc<dyn QueueNotifier>,
    ) -> Result<Arc<dyn QueueStore>>;

    /// The client's queue, created with `notifier` when missing. An
    /// existing queue keeps its listener.
    fn queue_store_or_create(
        &self,
        client_id: &str,
        notifier: Arc<dyn QueueNotifier>,
    ) -> Result<Arc<dyn QueueStore>>;

    /// The client's queue if one exists, without touching its notifier
    fn existing_queue_store(&self, client_id: &str) -> Result<Option<Arc<dyn QueueStore>>>;

    /// The client's unack table, created on first use
    fn unack_store(&self, client_id: &str) -> Result<Arc<dyn UnackStore>>;

    /// Discard the client's queue and unack state
    async fn remove_client(&self, client_id: &str) -> Result<()>;

    /// Replication log for a federation peer, created on first use
    fn event_log(&self, peer: &str) -> Result<Arc<dyn EventLog>>;

    /// Make all accepted writes durable
    async fn flush(&self) -> Result<()>;

    /// Flush and release resources. Safe to call more than once; stores
    /// handed out earlier fail with `Closed` afterwards where the engine
    /// can no longer serve them.
    async fn close(&self) -> Result<()>;
}
