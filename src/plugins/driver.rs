//! Device driver authorisation plugin
//!
//! Login decisions for device clients are made by an external driver
//! service. On CONNECT the plugin sends a [`DriverRequest`] down a channel
//! and waits, bounded by `timeout`, for the driver to answer through
//! [`DriverRequest::respond`]. Waits belonging to a connection that closes
//! are cancelled.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::ack::{AckError, AckTable};
use crate::config::ConfigError;
use crate::hooks::{ClientInfo, CloseReason, HookError, HookResult, Hooks, Plugin, PluginRegistry, Verdict};

pub const NAME: &str = "driver";

/// Answer from the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverDecision {
    Allow,
    Deny,
    /// Not a device this driver manages; let later plugins decide
    Ignore,
}

impl From<DriverDecision> for Verdict {
    fn from(decision: DriverDecision) -> Self {
        match decision {
            DriverDecision::Allow => Verdict::Allow,
            DriverDecision::Deny => Verdict::Deny,
            DriverDecision::Ignore => Verdict::Continue,
        }
    }
}

/// Settings under `plugins.config.driver`
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DriverSettings {
    /// Longest a CONNECT waits for the driver
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// How often abandoned waits are swept
    #[serde(with = "humantime_serde")]
    pub reaper_interval: Duration,
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            reaper_interval: Duration::from_secs(1),
        }
    }
}

/// An authorisation question for the driver
pub struct DriverRequest {
    pub id: u64,
    pub client_id: Arc<str>,
    pub username: Option<Arc<str>>,
    pub password: Option<Bytes>,
    table: Arc<AckTable<DriverDecision>>,
}

impl DriverRequest {
    /// Deliver the decision. False if the wait already ended.
    pub fn respond(&self, decision: DriverDecision) -> bool {
        self.table.complete(self.id, decision)
    }
}

/// The broker side of the driver channel
#[derive(Clone)]
pub struct DriverConnector {
    requests: mpsc::Sender<DriverRequest>,
    table: Arc<AckTable<DriverDecision>>,
}

/// Create a connector and the receiver the driver reads requests from
pub fn channel(capacity: usize) -> (DriverConnector, mpsc::Receiver<DriverRequest>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let connector = DriverConnector {
        requests: tx,
        table: Arc::new(AckTable::new(DriverSettings::default().timeout)),
    };
    (connector, rx)
}

pub struct DriverPlugin {
    settings: DriverSettings,
    connector: DriverConnector,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl DriverPlugin {
    pub fn new(settings: DriverSettings, connector: DriverConnector) -> Self {
        Self {
            settings,
            connector,
            reaper: Mutex::new(None),
        }
    }

    /// Outstanding driver requests
    pub fn pending(&self) -> usize {
        self.connector.table.len()
    }
}

/// Owner key of a wait: one per connection, not per client id
fn wait_owner(client: &ClientInfo) -> String {
    format!("{}@{}", client.client_id, client.connection)
}

#[async_trait]
impl Hooks for DriverPlugin {
    async fn on_basic_auth(&self, client: &ClientInfo, password: Option<&[u8]>) -> HookResult<Verdict> {
        let table = &self.connector.table;
        let owner = wait_owner(client);
        let pending = table.register_with_timeout(Some(&owner), self.settings.timeout);
        let id = pending.id();
        let request = DriverRequest {
            id,
            client_id: client.client_id.clone(),
            username: client.username.clone(),
            password: password.map(Bytes::copy_from_slice),
            table: table.clone(),
        };

        match tokio::time::timeout(self.settings.timeout, self.connector.requests.send(request)).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => {
                table.cancel(id);
                return Err(HookError::Internal("driver channel closed".to_string()));
            }
            Err(_) => {
                table.cancel(id);
                warn!(client_id = %client.client_id, "driver request queue full");
                return Err(HookError::Timeout);
            }
        }

        match pending.wait(self.settings.timeout).await {
            Ok(decision) => {
                debug!(client_id = %client.client_id, ?decision, "driver decision");
                Ok(decision.into())
            }
            Err(AckError::Timeout) => {
                warn!(client_id = %client.client_id, "driver did not answer in time");
                Err(HookError::Timeout)
            }
            Err(AckError::Cancelled) => Err(HookError::Cancelled),
        }
    }

    async fn on_closed(&self, client: &ClientInfo, _reason: CloseReason) {
        self.connector.table.cancel_owner(&wait_owner(client));
    }
}

#[async_trait]
impl Plugin for DriverPlugin {
    fn name(&self) -> &str {
        NAME
    }

    async fn load(&self, shutdown: broadcast::Receiver<()>) -> HookResult<()> {
        let handle = self
            .connector
            .table
            .spawn_reaper(self.settings.reaper_interval, shutdown);
        if let Some(old) = self.reaper.lock().replace(handle) {
            old.abort();
        }
        Ok(())
    }

    async fn unload(&self) {
        let handle = self.reaper.lock().take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }
    }
}

/// Make the `driver` plugin available, talking through `connector`
pub fn register(registry: &mut PluginRegistry, connector: DriverConnector) {
    registry.register(
        NAME,
        json!({"timeout": "5s", "reaper_interval": "1s"}),
        move |settings| {
            let settings: DriverSettings = crate::hooks::decode_settings(NAME, settings)?;
            if settings.timeout.is_zero() {
                return Err(ConfigError::Plugin {
                    name: NAME.to_string(),
                    reason: "timeout must be greater than zero".to_string(),
                });
            }
            Ok(Arc::new(DriverPlugin::new(settings, connector.clone())) as Arc<dyn Plugin>)
        },
    );
}
