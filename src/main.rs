//! meshmq - MQTT delivery core
//!
//! Usage:
//!   meshmq [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>    Configuration file path
//!   -b, --backend <NAME>   Persistence backend (memory, fjall)
//!   -d, --data <DIR>       Data directory for on-disk backends
//!   -n, --node <NAME>      Federation node name
//!   --check                Validate the configuration and exit
//!   -l, --log-level        Log level (error, warn, info, debug, trace)
//!   -h, --help             Print help

use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use meshmq::broker::Broker;
use meshmq::config::Config;
use meshmq::hooks::PluginRegistry;
use meshmq::persistence::PersistenceRegistry;

/// Log level for CLI
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum LogLevel {
    /// Only errors
    Error,
    /// Warnings and errors
    Warn,
    /// Informational messages
    #[default]
    Info,
    /// Debug messages
    Debug,
    /// Trace messages (very verbose)
    Trace,
}

impl LogLevel {
    fn to_tracing_level(self) -> Level {
        match self {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }

    fn from_config(level: &str) -> Self {
        match level.to_lowercase().as_str() {
            "error" => LogLevel::Error,
            "warn" => LogLevel::Warn,
            "debug" => LogLevel::Debug,
            "trace" => LogLevel::Trace,
            _ => LogLevel::Info,
        }
    }
}

/// meshmq - MQTT delivery core with pluggable persistence and federation
#[derive(Parser, Debug)]
#[command(name = "meshmq")]
#[command(version)]
#[command(about = "MQTT delivery core with pluggable persistence and federation")]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Persistence backend name
    #[arg(short, long)]
    backend: Option<String>,

    /// Data directory for on-disk backends
    #[arg(short, long)]
    data: Option<PathBuf>,

    /// Federation node name
    #[arg(short, long)]
    node: Option<String>,

    /// Validate the configuration and exit
    #[arg(long)]
    check: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevel>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Config file if given, otherwise defaults plus MESHMQ__ overrides
    let loaded = match &args.config {
        Some(path) => Config::load(path),
        None => Config::from_env(),
    };
    let mut config = match loaded {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading configuration: {}", e);
            std::process::exit(1);
        }
    };

    // CLI overrides config
    if let Some(backend) = args.backend {
        config.persistence.backend = backend;
    }
    if let Some(data) = args.data {
        config.persistence.path = data;
    }
    if let Some(node) = args.node {
        config.federation.node_name = node;
    }

    let log_level = args
        .log_level
        .unwrap_or_else(|| LogLevel::from_config(&config.log.level));
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level.to_tracing_level())
        .with_target(false)
        .with_thread_ids(true)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if let Some(path) = &args.config {
        info!("Loaded configuration from {:?}", path);
    }
    if let Err(e) = config.validate() {
        eprintln!("Invalid configuration: {}", e);
        std::process::exit(1);
    }

    let backends = PersistenceRegistry::with_defaults();
    let plugins = PluginRegistry::with_defaults();
    if args.check {
        backends.build(&config)?;
        plugins.load(&config.plugins)?;
        println!("configuration ok");
        return Ok(());
    }

    info!("Starting meshmq");
    info!("  Persistence: {}", config.persistence.backend);
    info!("  Plugins: {:?}", config.plugins.order);
    if config.federation.enabled {
        info!(
            "  Federation: node {} with peers {:?}",
            config.federation.node_name, config.federation.peers
        );
    } else {
        info!("  Federation: disabled");
    }

    let broker = match Broker::from_config(config, &backends, &plugins).await {
        Ok(broker) => broker,
        Err(e) => {
            eprintln!("Error starting broker: {}", e);
            std::process::exit(1);
        }
    };

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");
    broker.shutdown().await?;
    Ok(())
}
