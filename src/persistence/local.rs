//! Backend engine shared by the memory and fjall backends
//!
//! [`LocalPersistence`] owns the stores and a [`Journal`]. Opening it reads
//! the journal back and rebuilds every store, including per-client queues
//! and unack tables and per-peer federation logs, before any caller can
//! reach them.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, info};

use super::backend::Persistence;
use super::error::{PersistenceError, Result};
use super::journal::{Journal, JournalOp, LoadedState};
use super::store::{QueueStore, RetainedStore, SessionStore, SubscriptionStore, UnackStore};
use super::stores::{
    LocalQueueStore, LocalRetainedStore, LocalSessionStore, LocalSubscriptionStore,
    LocalUnackStore,
};
use crate::config::Config;
use crate::federation::{EventLog, FederationEvent, LocalEventLog};
use crate::protocol::Message;
use crate::queue::{DefaultNotifier, OutboundQueue, QueueEntry, QueueNotifier, QueueSettings};
use crate::session::{Session, UnackRecord, UnackTable};
use crate::topic::Subscription;

const CREATED: u8 = 0;
const OPENING: u8 = 1;
const OPEN: u8 = 2;
const CLOSED: u8 = 3;

/// Limits applied to the per-client stores a backend creates
#[derive(Debug, Clone, Default)]
pub struct StoreSettings {
    pub queue: QueueSettings,
    /// Inbound QoS 2 exchanges allowed per client (0 = unlimited)
    pub max_awaiting_rel: usize,
}

impl StoreSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            queue: config.queue.settings(),
            max_awaiting_rel: config.unack.max_awaiting_rel,
        }
    }
}

struct SharedStores {
    sessions: Arc<LocalSessionStore>,
    subscriptions: Arc<LocalSubscriptionStore>,
    retained: Arc<LocalRetainedStore>,
}

/// Store set over a [`Journal`]
pub struct LocalPersistence {
    journal: Arc<dyn Journal>,
    settings: StoreSettings,
    state: AtomicU8,
    shared: OnceLock<SharedStores>,
    queues: DashMap<Arc<str>, Arc<LocalQueueStore>>,
    unacks: DashMap<Arc<str>, Arc<LocalUnackStore>>,
    logs: DashMap<Arc<str>, Arc<LocalEventLog>>,
}

fn decode_all<S, T>(stored: Vec<S>) -> Result<Vec<T>>
where
    T: TryFrom<S, Error = PersistenceError>,
{
    stored.into_iter().map(T::try_from).collect()
}

impl LocalPersistence {
    pub fn new(journal: Arc<dyn Journal>, settings: StoreSettings) -> Self {
        Self {
            journal,
            settings,
            state: AtomicU8::new(CREATED),
            shared: OnceLock::new(),
            queues: DashMap::new(),
            unacks: DashMap::new(),
            logs: DashMap::new(),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        match self.state.load(Ordering::Acquire) {
            OPEN => Ok(()),
            CLOSED => Err(PersistenceError::Closed),
            _ => Err(PersistenceError::NotOpen),
        }
    }

    fn shared(&self) -> Result<&SharedStores> {
        self.ensure_open()?;
        self.shared.get().ok_or(PersistenceError::NotOpen)
    }

    fn hydrate(&self, loaded: LoadedState) -> Result<()> {
        let sessions: Vec<Session> = decode_all(loaded.sessions)?;
        let subscriptions: Vec<Subscription> = decode_all(loaded.subscriptions)?;
        let retained: Vec<Message> = decode_all(loaded.retained)?;
        let counts = (sessions.len(), subscriptions.len(), retained.len());

        for (client_id, stored) in loaded.queues {
            let entries: Vec<QueueEntry> = decode_all(stored)?;
            let client_id: Arc<str> = Arc::from(client_id);
            let queue = OutboundQueue::restore(self.settings.queue.clone(), entries);
            self.queues.insert(
                client_id.clone(),
                Arc::new(LocalQueueStore::new(
                    client_id,
                    queue,
                    Arc::new(DefaultNotifier),
                    self.journal.clone(),
                )),
            );
        }

        for (client_id, stored) in loaded.unacks {
            let records = stored
                .into_iter()
                .map(|(pid, r)| UnackRecord::try_from(r).map(|r| (pid, r)))
                .collect::<Result<Vec<_>>>()?;
            let client_id: Arc<str> = Arc::from(client_id);
            let table = UnackTable::restore(self.settings.max_awaiting_rel, records);
            self.unacks.insert(
                client_id.clone(),
                Arc::new(LocalUnackStore::new(client_id, table, self.journal.clone())),
            );
        }

        let mut events = loaded.events;
        let peers: HashSet<String> = events
            .keys()
            .chain(loaded.log_meta.keys())
            .cloned()
            .collect();
        for peer in peers {
            let stored = events.remove(&peer).unwrap_or_default();
            let restored: Vec<FederationEvent> = decode_all(stored)?;
            let meta = loaded.log_meta.get(&peer).copied().unwrap_or_default();
            let peer: Arc<str> = Arc::from(peer);
            self.logs.insert(
                peer.clone(),
                Arc::new(LocalEventLog::restore(peer, self.journal.clone(), restored, meta)),
            );
        }

        let shared = SharedStores {
            sessions: Arc::new(LocalSessionStore::new(self.journal.clone(), sessions)),
            subscriptions: Arc::new(LocalSubscriptionStore::new(
                self.journal.clone(),
                subscriptions,
            )),
            retained: Arc::new(LocalRetainedStore::new(self.journal.clone(), retained)),
        };
        // Only one caller gets past the OPENING transition
        let _ = self.shared.set(shared);

        info!(
            backend = self.journal.name(),
            sessions = counts.0,
            subscriptions = counts.1,
            retained = counts.2,
            queues = self.queues.len(),
            federation_logs = self.logs.len(),
            "persistence opened"
        );
        Ok(())
    }
}

#[async_trait]
impl Persistence for LocalPersistence {
    fn name(&self) -> &'static str {
        self.journal.name()
    }

    async fn open(&self) -> Result<()> {
        match self
            .state
            .compare_exchange(CREATED, OPENING, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {}
            Err(OPEN) => return Ok(()),
            Err(CLOSED) => return Err(PersistenceError::Closed),
            Err(_) => {
                return Err(PersistenceError::Storage(
                    "backend is already being opened".to_string(),
                ))
            }
        }

        let opened = self
            .journal
            .open()
            .and_then(|_| self.journal.load())
            .and_then(|loaded| self.hydrate(loaded));
        match opened {
            Ok(()) => {
                self.state.store(OPEN, Ordering::Release);
                Ok(())
            }
            Err(e) => {
                self.queues.clear();
                self.unacks.clear();
                self.logs.clear();
                self.state.store(CREATED, Ordering::Release);
                Err(e)
            }
        }
    }

    fn session_store(&self) -> Result<Arc<dyn SessionStore>> {
        Ok(self.shared()?.sessions.clone())
    }

    fn subscription_store(&self) -> Result<Arc<dyn SubscriptionStore>> {
        Ok(self.shared()?.subscriptions.clone())
    }

    fn retained_store(&self) -> Result<Arc<dyn RetainedStore>> {
        Ok(self.shared()?.retained.clone())
    }

    fn queue_store(
        &self,
        client_id: &str,
        notifier: Arc<dyn QueueNotifier>,
    ) -> Result<Arc<dyn QueueStore>> {
        self.ensure_open()?;
        if let Some(existing) = self.queues.get(client_id) {
            existing.set_notifier(notifier);
            return Ok(existing.clone());
        }
        let store = self
            .queues
            .entry(Arc::from(client_id))
            .or_insert_with(|| {
                Arc::new(LocalQueueStore::new(
                    Arc::from(client_id),
                    OutboundQueue::new(self.settings.queue.clone()),
                    notifier.clone(),
                    self.journal.clone(),
                ))
            })
            .clone();
        store.set_notifier(notifier);
        Ok(store)
    }

    fn queue_store_or_create(
        &self,
        client_id: &str,
        notifier: Arc<dyn QueueNotifier>,
    ) -> Result<Arc<dyn QueueStore>> {
        self.ensure_open()?;
        let store = self
            .queues
            .entry(Arc::from(client_id))
            .or_insert_with(|| {
                Arc::new(LocalQueueStore::new(
                    Arc::from(client_id),
                    OutboundQueue::new(self.settings.queue.clone()),
                    notifier,
                    self.journal.clone(),
                ))
            })
            .clone();
        Ok(store)
    }

    fn existing_queue_store(&self, client_id: &str) -> Result<Option<Arc<dyn QueueStore>>> {
        self.ensure_open()?;
        Ok(self
            .queues
            .get(client_id)
            .map(|q| q.clone() as Arc<dyn QueueStore>))
    }

    fn unack_store(&self, client_id: &str) -> Result<Arc<dyn UnackStore>> {
        self.ensure_open()?;
        let store = self
            .unacks
            .entry(Arc::from(client_id))
            .or_insert_with(|| {
                Arc::new(LocalUnackStore::new(
                    Arc::from(client_id),
                    UnackTable::new(self.settings.max_awaiting_rel),
                    self.journal.clone(),
                ))
            })
            .clone();
        Ok(store)
    }

    async fn remove_client(&self, client_id: &str) -> Result<()> {
        self.ensure_open()?;
        if self.journal.is_durable() {
            self.journal.apply(vec![
                JournalOp::ClearQueue {
                    client_id: client_id.to_string(),
                },
                JournalOp::ClearUnacks {
                    client_id: client_id.to_string(),
                },
            ])?;
        }
        self.queues.remove(client_id);
        self.unacks.remove(client_id);
        debug!(client_id, "client queue and unack state removed");
        Ok(())
    }

    fn event_log(&self, peer: &str) -> Result<Arc<dyn EventLog>> {
        self.ensure_open()?;
        let log = self
            .logs
            .entry(Arc::from(peer))
            .or_insert_with(|| Arc::new(LocalEventLog::new(peer, self.journal.clone())))
            .clone();
        Ok(log)
    }

    async fn flush(&self) -> Result<()> {
        self.ensure_open()?;
        self.journal.flush()
    }

    async fn close(&self) -> Result<()> {
        if self.state.swap(CLOSED, Ordering::AcqRel) == CLOSED {
            return Ok(());
        }
        let logs: Vec<Arc<LocalEventLog>> = self.logs.iter().map(|l| l.value().clone()).collect();
        for log in logs {
            // Closing a log only flips flags and wakes readers
            let _ = log.close().await;
        }
        self.journal.close()?;
        info!(backend = self.journal.name(), "persistence closed");
        Ok(())
    }
}
