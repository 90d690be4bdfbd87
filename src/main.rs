//! vibemesh - distributed publish/subscribe broker
//!
//! Usage:
//!   vibemesh [OPTIONS] [COMMAND]
//!
//! Options:
//!   -c, --config <FILE>    Configuration file path
//!   -b, --bind <ADDR>      MQTT bind address (default: 0.0.0.0:1883)
//!   -l, --log-level        Log level (error, warn, info, debug, trace)
//!   -h, --help             Print help
//!
//! Commands:
//!   license                Generate a new license and its master key

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use vibemesh::broker::Broker;
use vibemesh::config::Config;
use vibemesh::License;

/// Log level for CLI
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum LogLevel {
    /// Only errors
    Error,
    /// Warnings and errors
    #[default]
    Warn,
    /// Informational messages
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
            "info" => LogLevel::Info,
            "debug" => LogLevel::Debug,
            "trace" => LogLevel::Trace,
            _ => LogLevel::Warn,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate a new license and print it with its master key
    License,
}

/// vibemesh - distributed publish/subscribe broker
#[derive(Parser, Debug)]
#[command(name = "vibemesh")]
#[command(version)]
#[command(about = "Distributed MQTT publish/subscribe broker")]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// MQTT bind address
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevel>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    if let Some(Command::License) = args.command {
        let license = License::generate();
        let master = license.cipher().encrypt_key(&license.new_master_key(1));
        println!("license:    {}", license);
        println!("master key: {}", master);
        return Ok(());
    }

    // Environment overrides apply with or without a file
    let mut config = match &args.config {
        Some(path) => match Config::load(path) {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("Error loading config file: {}", e);
                std::process::exit(1);
            }
        },
        None => Config::from_env()?,
    };

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
    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }

    info!("Starting vibemesh broker");
    info!("  Bind address: {}", config.server.bind);
    info!("  Max connections: {}", config.server.max_connections);
    info!("  Storage: {:?}", config.storage.provider);
    if config.cluster.enabled {
        info!(
            "  Cluster: enabled (gossip={}, peer={})",
            config.cluster.gossip_addr, config.cluster.peer_addr
        );
        if !config.cluster.seeds.is_empty() {
            info!("    Seeds: {}", config.cluster.seeds.join(", "));
        }
    } else {
        info!("  Cluster: disabled");
    }

    let broker = std::sync::Arc::new(Broker::new(config).await?);

    let signal = broker.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, shutting down");
            signal.shutdown();
        }
    });

    broker.run().await?;
    Ok(())
}
