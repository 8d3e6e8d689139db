//! Hooks Module
//!
//! Interception points around every client event. Plugins implement
//! [`Hooks`] and are invoked in configured load order by the
//! [`HookPipeline`]. At each gating hook a plugin either passes the event
//! on ([`Verdict::Continue`]), settles it for the rest of the chain
//! ([`Verdict::Allow`]) or rejects it ([`Verdict::Deny`]). An event nobody
//! settles is allowed.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::alias::ConnectionId;
use crate::protocol::Message;
use crate::topic::Subscription;

mod registry;

pub use registry::{merge_json, PluginRegistry};
pub(crate) use registry::decode_settings;


/// Hook error types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookError {
    /// Internal error
    Internal(String),
    /// Authentication failed
    AuthenticationFailed,
    /// Authorization denied
    AuthorizationDenied,
    /// An external decision did not arrive in time
    Timeout,
    /// The wait was abandoned because the client went away
    Cancelled,
    /// A plugin refused the event for its own reason
    Rejected(String),
}

impl fmt::Display for HookError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookError::Internal(msg) => write!(f, "Internal error: {}", msg),
            HookError::AuthenticationFailed => write!(f, "Authentication failed"),
            HookError::AuthorizationDenied => write!(f, "Authorization denied"),
            HookError::Timeout => write!(f, "Timed out waiting for a decision"),
            HookError::Cancelled => write!(f, "Decision cancelled"),
            HookError::Rejected(reason) => write!(f, "Rejected: {}", reason),
        }
    }
}

impl std::error::Error for HookError {}

/// Hook result type
pub type HookResult<T> = Result<T, HookError>;

/// Outcome of a gating hook
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Verdict {
    /// No opinion; ask the next plugin
    #[default]
    Continue,
    /// Accept without consulting later plugins
    Allow,
    /// Reject the event
    Deny,
}

/// Identity of the client an event belongs to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    pub client_id: Arc<str>,
    pub username: Option<Arc<str>>,
    pub connection: ConnectionId,
}

impl ClientInfo {
    pub fn new(client_id: impl Into<Arc<str>>, username: Option<&str>, connection: ConnectionId) -> Self {
        Self {
            client_id: client_id.into(),
            username: username.map(Arc::from),
            connection,
        }
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }
}

/// Why a connection ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The client sent DISCONNECT
    Graceful,
    /// Network loss, protocol error or keep-alive timeout
    Abnormal,
    /// Another connection took over the client id
    TakenOver,
    /// The broker is stopping
    Shutdown,
}

impl CloseReason {
    pub fn is_graceful(self) -> bool {
        matches!(self, Self::Graceful | Self::TakenOver)
    }
}

/// Broker hooks trait
///
/// All methods have default implementations that pass the event on.
#[async_trait]
pub trait Hooks: Send + Sync {
    /// Called when a client presents credentials on CONNECT
    async fn on_basic_auth(
        &self,
        _client: &ClientInfo,
        _password: Option<&[u8]>,
    ) -> HookResult<Verdict> {
        Ok(Verdict::Continue)
    }

    /// Called for each requested subscription. The subscription may be
    /// altered (e.g. its QoS lowered) before it is stored.
    async fn on_subscribe(
        &self,
        _client: &ClientInfo,
        _subscription: &mut Subscription,
    ) -> HookResult<Verdict> {
        Ok(Verdict::Continue)
    }

    async fn on_unsubscribe(&self, _client: &ClientInfo, _filter: &str) -> HookResult<Verdict> {
        Ok(Verdict::Continue)
    }

    /// Called for every publish before it is routed. The message may be
    /// altered.
    async fn on_msg_arrived(
        &self,
        _client: &ClientInfo,
        _message: &mut Message,
    ) -> HookResult<Verdict> {
        Ok(Verdict::Continue)
    }

    /// Called after a client connected and its session is in place
    async fn on_connected(&self, _client: &ClientInfo) {}

    /// Called after a connection ended
    async fn on_closed(&self, _client: &ClientInfo, _reason: CloseReason) {}
}

/// A named, loadable set of hooks
#[async_trait]
pub trait Plugin: Hooks {
    fn name(&self) -> &str;

    /// Start background work. Failing aborts broker startup.
    async fn load(&self, _shutdown: broadcast::Receiver<()>) -> HookResult<()> {
        Ok(())
    }

    /// Stop background work
    async fn unload(&self) {}
}

/// Plugins in invocation order
#[derive(Default, Clone)]
pub struct HookPipeline {
    plugins: Vec<Arc<dyn Plugin>>,
}

impl HookPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a plugin to the end of the chain
    pub fn add(&mut self, plugin: Arc<dyn Plugin>) {
        self.plugins.push(plugin);
    }

    pub fn with(mut self, plugin: Arc<dyn Plugin>) -> Self {
        self.add(plugin);
        self
    }

    pub fn names(&self) -> Vec<&str> {
        self.plugins.iter().map(|p| p.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Load every plugin in order. On failure the plugins already loaded
    /// are unloaded again.
    pub async fn start(&self, shutdown: &broadcast::Sender<()>) -> HookResult<()> {
        for (i, plugin) in self.plugins.iter().enumerate() {
            if let Err(e) = plugin.load(shutdown.subscribe()).await {
                warn!(plugin = plugin.name(), error = %e, "plugin failed to load");
                for loaded in self.plugins[..i].iter().rev() {
                    loaded.unload().await;
                }
                return Err(e);
            }
            debug!(plugin = plugin.name(), "plugin loaded");
        }
        Ok(())
    }

    /// Unload in reverse load order
    pub async fn stop(&self) {
        for plugin in self.plugins.iter().rev() {
            plugin.unload().await;
            debug!(plugin = plugin.name(), "plugin unloaded");
        }
    }

    pub async fn authenticate(&self, client: &ClientInfo, password: Option<&[u8]>) -> HookResult<()> {
        for plugin in &self.plugins {
            match plugin.on_basic_auth(client, password).await? {
                Verdict::Continue => {}
                Verdict::Allow => return Ok(()),
                Verdict::Deny => {
                    debug!(plugin = plugin.name(), client_id = %client.client_id, "authentication denied");
                    return Err(HookError::AuthenticationFailed);
                }
            }
        }
        Ok(())
    }

    pub async fn subscribe(&self, client: &ClientInfo, subscription: &mut Subscription) -> HookResult<()> {
        for plugin in &self.plugins {
            match plugin.on_subscribe(client, subscription).await? {
                Verdict::Continue => {}
                Verdict::Allow => return Ok(()),
                Verdict::Deny => {
                    debug!(
                        plugin = plugin.name(),
                        client_id = %client.client_id,
                        filter = %subscription.filter,
                        "subscribe denied"
                    );
                    return Err(HookError::AuthorizationDenied);
                }
            }
        }
        Ok(())
    }

    pub async fn unsubscribe(&self, client: &ClientInfo, filter: &str) -> HookResult<()> {
        for plugin in &self.plugins {
            match plugin.on_unsubscribe(client, filter).await? {
                Verdict::Continue => {}
                Verdict::Allow => return Ok(()),
                Verdict::Deny => {
                    debug!(plugin = plugin.name(), client_id = %client.client_id, filter, "unsubscribe denied");
                    return Err(HookError::AuthorizationDenied);
                }
            }
        }
        Ok(())
    }

    pub async fn msg_arrived(&self, client: &ClientInfo, message: &mut Message) -> HookResult<()> {
        for plugin in &self.plugins {
            match plugin.on_msg_arrived(client, message).await? {
                Verdict::Continue => {}
                Verdict::Allow => return Ok(()),
                Verdict::Deny => {
                    debug!(
                        plugin = plugin.name(),
                        client_id = %client.client_id,
                        topic = %message.topic,
                        "publish denied"
                    );
                    return Err(HookError::AuthorizationDenied);
                }
            }
        }
        Ok(())
    }

    pub async fn connected(&self, client: &ClientInfo) {
        for plugin in &self.plugins {
            plugin.on_connected(client).await;
        }
    }

    pub async fn closed(&self, client: &ClientInfo, reason: CloseReason) {
        for plugin in &self.plugins {
            plugin.on_closed(client, reason).await;
        }
    }
}
