//! Broker dispatch core
//!
//! [`Broker`] ties the stores, the hook pipeline, the topic alias manager
//! and federation together. The transport layer drives it through two
//! entry points: [`Broker::connect`], which returns a [`Connection`] for
//! every protocol event of one client, and [`Broker::publish`] for
//! server-originated messages.
//!
//! Startup order is persistence, federation, plugins, timers. Shutdown runs
//! it backwards: timers and connections stop first, then plugins,
//! federation logs and finally the persistence backend.

mod connection;
mod dispatch;
mod error;
mod session;
mod timers;


pub use connection::{ConnectRequest, Connection, Delivery, Outbound, PublishOutcome};
pub use dispatch::PublishReport;
pub use error::{BrokerError, Result};

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::alias::TopicAliasManager;
use crate::config::Config;
use crate::federation::{Federation, FederationError, FederationSettings, PeerLink};
use crate::hooks::{CloseReason, HookPipeline, PluginRegistry};
use crate::metrics::Metrics;
use crate::persistence::{
    Persistence, PersistenceRegistry, RetainedStore, SessionStore, SubscriptionStore,
};
use connection::{BrokerNotifier, ConnectionShared};
use session::{LifecycleLock, PendingWill};

const RUNNING: u8 = 0;
const STOPPING: u8 = 1;
const STOPPED: u8 = 2;

/// The delivery core of one broker instance
pub struct Broker {
    config: Config,
    persistence: Arc<dyn Persistence>,
    sessions: Arc<dyn SessionStore>,
    subscriptions: Arc<dyn SubscriptionStore>,
    retained: Arc<dyn RetainedStore>,
    pipeline: HookPipeline,
    aliases: TopicAliasManager,
    federation: Option<Arc<Federation>>,
    metrics: Metrics,
    /// client id -> live connection
    connections: DashMap<Arc<str>, Arc<ConnectionShared>>,
    pending_wills: DashMap<Arc<str>, PendingWill>,
    /// client id -> lock serializing attach and teardown
    lifecycles: DashMap<Arc<str>, LifecycleLock>,
    next_connection: AtomicU64,
    state: AtomicU8,
    shutdown: broadcast::Sender<()>,
    timers: Mutex<Vec<JoinHandle<()>>>,
}

impl Broker {
    /// Resolve the backend and plugins named in `config`, then start
    pub async fn from_config(
        config: Config,
        backends: &PersistenceRegistry,
        plugins: &PluginRegistry,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let persistence = backends.build(&config)?;
        let pipeline = plugins.load(&config.plugins)?;
        Self::start(config, persistence, pipeline).await
    }

    /// Open `persistence`, load the plugins and start the background timers
    pub async fn start(
        config: Config,
        persistence: Arc<dyn Persistence>,
        pipeline: HookPipeline,
    ) -> Result<Arc<Self>> {
        let metrics = Metrics::new()?;
        persistence.open().await?;
        let sessions = persistence.session_store()?;
        let subscriptions = persistence.subscription_store()?;
        let retained = persistence.retained_store()?;

        let federation = if config.federation.enabled {
            let logs = config
                .federation
                .peers
                .iter()
                .map(|peer| persistence.event_log(peer))
                .collect::<std::result::Result<Vec<_>, _>>()?;
            let settings = FederationSettings {
                node_name: Arc::from(config.federation.node_name.as_str()),
                fetch_batch: config.federation.fetch_batch,
                retry_interval: config.federation.retry_interval,
            };
            let federation = Federation::new(settings, logs).with_metrics(metrics.clone());
            federation.open().await?;
            Some(Arc::new(federation))
        } else {
            None
        };

        let (shutdown, _) = broadcast::channel(1);
        if let Err(e) = pipeline.start(&shutdown).await {
            if let Some(federation) = &federation {
                let _ = federation.close().await;
            }
            let _ = persistence.close().await;
            return Err(e.into());
        }

        metrics
            .sessions_current
            .set(sessions.list().await?.len() as i64);
        metrics
            .subscriptions_current
            .set(subscriptions.count() as i64);
        metrics
            .retained_messages_current
            .set(retained.count() as i64);

        let broker = Arc::new(Self {
            config,
            persistence,
            sessions,
            subscriptions,
            retained,
            pipeline,
            aliases: TopicAliasManager::new(),
            federation,
            metrics,
            connections: DashMap::new(),
            pending_wills: DashMap::new(),
            lifecycles: DashMap::new(),
            next_connection: AtomicU64::new(0),
            state: AtomicU8::new(RUNNING),
            shutdown,
            timers: Mutex::new(Vec::new()),
        });
        *broker.timers.lock() = timers::spawn(&broker);

        info!(
            backend = broker.persistence.name(),
            plugins = ?broker.pipeline.names(),
            federation = broker.federation.is_some(),
            "broker started"
        );
        Ok(broker)
    }

    pub(crate) fn ensure_running(&self) -> Result<()> {
        if self.state.load(Ordering::Acquire) == RUNNING {
            Ok(())
        } else {
            Err(BrokerError::ShuttingDown)
        }
    }

    pub(crate) fn offline_notifier(&self) -> Arc<BrokerNotifier> {
        Arc::new(BrokerNotifier::offline(self.metrics.clone()))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn aliases(&self) -> &TopicAliasManager {
        &self.aliases
    }

    pub fn federation(&self) -> Option<&Arc<Federation>> {
        self.federation.as_ref()
    }

    pub fn persistence(&self) -> &Arc<dyn Persistence> {
        &self.persistence
    }

    pub fn is_connected(&self, client_id: &str) -> bool {
        self.connections.contains_key(client_id)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.count()
    }

    pub fn retained_count(&self) -> usize {
        self.retained.count()
    }

    pub async fn session_count(&self) -> Result<usize> {
        Ok(self.sessions.list().await?.len())
    }

    /// Start replicating to a peer over `link`. The peer must be listed in
    /// the federation configuration.
    pub fn attach_peer(&self, link: Arc<dyn PeerLink>) -> Result<()> {
        self.ensure_running()?;
        let federation = self
            .federation
            .as_ref()
            .ok_or_else(|| FederationError::UnknownPeer(link.peer().to_string()))?;
        federation.spawn_sender(link, self.shutdown.subscribe())?;
        Ok(())
    }

    /// Stop timers, close every connection, unload plugins, close the
    /// federation logs and the persistence backend. Later calls are no-ops.
    pub async fn shutdown(self: &Arc<Self>) -> Result<()> {
        if self
            .state
            .compare_exchange(RUNNING, STOPPING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(());
        }
        info!(connections = self.connections.len(), "broker shutting down");
        let _ = self.shutdown.send(());

        let timers: Vec<JoinHandle<()>> = std::mem::take(&mut *self.timers.lock());
        for timer in timers {
            let _ = timer.await;
        }

        let open: Vec<Arc<ConnectionShared>> = self
            .connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for shared in open {
            if let Err(e) = self.close_connection(&shared, CloseReason::Shutdown).await {
                warn!(client_id = %shared.client.client_id, error = %e, "close during shutdown failed");
            }
        }
        self.abort_wills();

        self.pipeline.stop().await;
        if let Some(federation) = &self.federation {
            federation.close().await?;
        }
        self.persistence.close().await?;
        self.state.store(STOPPED, Ordering::Release);
        info!("broker stopped");
        Ok(())
    }
}
