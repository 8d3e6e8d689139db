//! Configuration Module
//!
//! TOML configuration for meshmq covering:
//! - Session lifetime and topic alias limits
//! - Outbound queue tunables
//! - Persistence backend selection
//! - Plugin load order and per-plugin settings
//! - Federation peers
//! - Environment variable overrides (MESHMQ__* prefix)

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

use crate::queue::{ExpiryAction, FullPolicy, QueueSettings};


fn env_var_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}").expect("static pattern"))
}

/// Replace `${VAR}` and `${VAR:-default}` with values from the environment
fn substitute_env_vars(content: &str) -> String {
    env_var_pattern()
        .replace_all(content, |caps: &regex::Captures| {
            let default = caps.get(2).map_or("", |m| m.as_str());
            std::env::var(&caps[1]).unwrap_or_else(|_| default.to_string())
        })
        .into_owned()
}

/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Config crate error
    Config(config::ConfigError),
    /// Validation error
    Validation(String),
    /// `persistence.backend` names no registered backend
    UnknownBackend(String),
    /// `plugins.order` names no registered plugin
    UnknownPlugin(String),
    /// A plugin rejected its configuration or failed to load
    Plugin { name: String, reason: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Config(e) => write!(f, "Config error: {}", e),
            ConfigError::Validation(msg) => write!(f, "Validation error: {}", msg),
            ConfigError::UnknownBackend(name) => {
                write!(f, "unknown persistence backend '{}'", name)
            }
            ConfigError::UnknownPlugin(name) => write!(f, "unknown plugin '{}'", name),
            ConfigError::Plugin { name, reason } => {
                write!(f, "plugin '{}' failed to load: {}", name, reason)
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io(e) => Some(e),
            ConfigError::Parse(e) => Some(e),
            ConfigError::Config(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log: LogConfig,
    pub session: SessionConfig,
    pub queue: QueueConfig,
    pub unack: UnackConfig,
    pub persistence: PersistenceConfig,
    pub plugins: PluginsConfig,
    pub federation: FederationConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Session lifetime configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Seconds between sweeps for expired sessions
    pub expiry_check_interval: u64,
    /// Expiry in seconds given to persistent sessions that do not set one
    pub default_expiry_interval: u32,
    /// Upper bound on a requested expiry interval (0 = no cap)
    pub max_expiry_interval: u32,
    /// Highest topic alias a client may register
    pub max_topic_aliases: u16,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            expiry_check_interval: 60,
            default_expiry_interval: 7200,
            max_expiry_interval: 0,
            max_topic_aliases: 65535,
        }
    }
}

impl SessionConfig {
    pub fn expiry_check_interval_duration(&self) -> Duration {
        Duration::from_secs(self.expiry_check_interval)
    }

    /// Apply the configured cap to a requested interval
    pub fn clamp_expiry(&self, requested: u32) -> u32 {
        if self.max_expiry_interval == 0 {
            requested
        } else {
            requested.min(self.max_expiry_interval)
        }
    }
}

/// Outbound queue tunables
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Maximum entries per session (0 = unbounded)
    pub max_queued_messages: usize,
    /// Maximum unacknowledged QoS 1/2 deliveries per session
    pub max_inflight: usize,
    #[serde(with = "humantime_serde")]
    pub inflight_expiry: Duration,
    pub full_policy: FullPolicy,
    pub expiry_action: ExpiryAction,
    /// Transmissions before an entry is given up (0 = unlimited)
    pub max_delivery_attempts: u32,
    /// How often the broker sweeps queues for expired entries
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        let defaults = QueueSettings::default();
        Self {
            max_queued_messages: defaults.max_queued,
            max_inflight: defaults.max_inflight,
            inflight_expiry: defaults.inflight_expiry,
            full_policy: defaults.full_policy,
            expiry_action: defaults.expiry_action,
            max_delivery_attempts: defaults.max_attempts,
            sweep_interval: Duration::from_secs(1),
        }
    }
}

impl QueueConfig {
    pub fn settings(&self) -> QueueSettings {
        QueueSettings {
            max_queued: self.max_queued_messages,
            max_inflight: self.max_inflight,
            inflight_expiry: self.inflight_expiry,
            full_policy: self.full_policy,
            expiry_action: self.expiry_action,
            max_attempts: self.max_delivery_attempts,
        }
    }
}

/// Inbound QoS 2 bookkeeping
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UnackConfig {
    /// Maximum pending PUBREL per client (0 = unbounded)
    pub max_awaiting_rel: usize,
}

impl Default for UnackConfig {
    fn default() -> Self {
        Self {
            max_awaiting_rel: 100,
        }
    }
}

/// Persistence backend selection
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Registered backend name ("memory", "fjall", ...)
    pub backend: String,
    /// Data directory for on-disk backends
    pub path: PathBuf,
    /// Interval between background flushes (e.g. "100ms", "1s")
    #[serde(with = "humantime_serde")]
    pub flush_interval: Duration,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            backend: "memory".to_string(),
            path: PathBuf::from("./data"),
            flush_interval: Duration::from_millis(100),
        }
    }
}

/// Plugin load order and user settings
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PluginsConfig {
    /// Plugins to load, in hook invocation order
    pub order: Vec<String>,
    /// Per-plugin settings, deep-merged over the plugin's defaults
    pub config: HashMap<String, serde_json::Value>,
}

fn default_node_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "meshmq".to_string())
}

/// Federation with peer brokers
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FederationConfig {
    pub enabled: bool,
    /// Name this broker stamps on replicated events
    pub node_name: String,
    /// Peer broker names; one replication log each
    pub peers: Vec<String>,
    /// Maximum events sent to a peer in one batch
    pub fetch_batch: usize,
    /// Wait before resending after a link failure
    #[serde(with = "humantime_serde")]
    pub retry_interval: Duration,
}

impl Default for FederationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            node_name: default_node_name(),
            peers: Vec::new(),
            fetch_batch: 100,
            retry_interval: Duration::from_secs(5),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file with environment variable overrides.
    ///
    /// Supports two forms of environment variable usage:
    /// 1. In-file substitution: `${VAR}` or `${VAR:-default}` syntax in the TOML file
    /// 2. Override via env vars: `MESHMQ__` prefix with double underscores for nesting:
    ///    - `MESHMQ__PERSISTENCE__BACKEND=fjall` overrides `persistence.backend`
    ///    - `MESHMQ__QUEUE__MAX_QUEUED_MESSAGES=500` overrides `queue.max_queued_messages`
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let defaults = Config::default();
        let mut builder = config::Config::builder()
            .set_default("log.level", defaults.log.level.as_str())?
            .set_default("session.expiry_check_interval", defaults.session.expiry_check_interval as i64)?
            .set_default(
                "session.default_expiry_interval",
                defaults.session.default_expiry_interval as i64,
            )?
            .set_default("session.max_expiry_interval", defaults.session.max_expiry_interval as i64)?
            .set_default("session.max_topic_aliases", defaults.session.max_topic_aliases as i64)?
            .set_default("queue.max_queued_messages", defaults.queue.max_queued_messages as i64)?
            .set_default("queue.max_inflight", defaults.queue.max_inflight as i64)?
            .set_default("queue.inflight_expiry", "30s")?
            .set_default("queue.full_policy", "drop_oldest")?
            .set_default("queue.expiry_action", "redeliver")?
            .set_default("queue.max_delivery_attempts", defaults.queue.max_delivery_attempts as i64)?
            .set_default("queue.sweep_interval", "1s")?
            .set_default("unack.max_awaiting_rel", defaults.unack.max_awaiting_rel as i64)?
            .set_default("persistence.backend", defaults.persistence.backend.as_str())?
            .set_default("persistence.path", "./data")?
            .set_default("persistence.flush_interval", "100ms")?
            .set_default("federation.enabled", false)?
            .set_default("federation.node_name", defaults.federation.node_name.as_str())?
            .set_default("federation.fetch_batch", defaults.federation.fetch_batch as i64)?
            .set_default("federation.retry_interval", "5s")?;

        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let substituted = substitute_env_vars(&content);
                builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // File doesn't exist, use defaults
            }
            Err(e) => return Err(ConfigError::Io(e)),
        }

        // Double underscore separates nested keys, single underscore preserved in field names
        let cfg = builder
            .add_source(
                Environment::with_prefix("MESHMQ")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("federation.peers")
                    .with_list_parse_key("plugins.order"),
            )
            .build()?;

        let config: Config = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Configuration from defaults and environment variables only
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(Path::new(""))
    }

    /// Parse configuration from a string (for testing, no env var support)
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue.max_inflight == 0 {
            return Err(ConfigError::Validation(
                "queue.max_inflight must be at least 1".to_string(),
            ));
        }
        if self.queue.max_inflight > u16::MAX as usize {
            return Err(ConfigError::Validation(format!(
                "queue.max_inflight must not exceed {}",
                u16::MAX
            )));
        }

        let mut seen = HashSet::new();
        for name in &self.plugins.order {
            if !seen.insert(name.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "plugin '{}' listed more than once in plugins.order",
                    name
                )));
            }
        }

        if self.federation.enabled {
            if self.federation.node_name.is_empty() {
                return Err(ConfigError::Validation(
                    "federation.node_name must not be empty".to_string(),
                ));
            }
            if self.federation.fetch_batch == 0 {
                return Err(ConfigError::Validation(
                    "federation.fetch_batch must be at least 1".to_string(),
                ));
            }
            if self.federation.peers.iter().any(|p| *p == self.federation.node_name) {
                return Err(ConfigError::Validation(
                    "federation.peers must not include this node".to_string(),
                ));
            }
        }

        Ok(())
    }
}
