//! DStore OSD - Object Storage Daemon
//!
//! This binary provides the chunk storage node.

use anyhow::{Context, Result};
use clap::Parser;
use dstore_client::DirClient;
use dstore_common::{HeartbeatConfig, NetworkConfig, OsdId, Shutdown};
use dstore_osd::{heartbeat_loop, ChunkStore, OsdServer};
use serde::Deserialize;
use std::path::PathBuf;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "dstore-osd")]
#[command(about = "DStore Object Storage Daemon")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "osd.toml")]
    config: String,

    /// Port to listen on; also determines the OSD id (osd-<port>)
    #[arg(short, long, env = "DSTORE_OSD_PORT")]
    port: Option<u16>,

    /// Host to bind
    #[arg(long)]
    host: Option<String>,

    /// Coordinator address (host:port)
    #[arg(long, env = "DSTORE_DIR")]
    dir: Option<String>,

    /// Chunk storage directory (defaults to storage/<osd-id>)
    #[arg(long)]
    storage_dir: Option<PathBuf>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Configuration file structure
#[derive(Debug, Deserialize, Default)]
struct Config {
    #[serde(default)]
    osd: OsdConfig,
    #[serde(default)]
    network: NetworkConfig,
    #[serde(default)]
    heartbeat: HeartbeatConfig,
    #[serde(default)]
    logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Default)]
struct OsdConfig {
    #[serde(default)]
    port: Option<u16>,
    #[serde(default)]
    storage_dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct LoggingConfig {
    #[serde(default = "default_log_level")]
    level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load config file if it exists
    let config: Config = if std::path::Path::new(&args.config).exists() {
        let config_str = std::fs::read_to_string(&args.config)?;
        toml::from_str(&config_str).unwrap_or_else(|e| {
            eprintln!("Warning: Failed to parse config file: {e}");
            Config::default()
        })
    } else {
        Config::default()
    };

    // Merge CLI args with config file (CLI takes precedence)
    let port = args
        .port
        .or(config.osd.port)
        .unwrap_or(config.network.osd_base_port);
    let host = args.host.unwrap_or(config.network.osd_host);
    let dir_endpoint = args.dir.unwrap_or(config.network.dir_endpoint);
    let osd_id = OsdId::from_port(port);
    let storage_dir = args
        .storage_dir
        .or(config.osd.storage_dir)
        .unwrap_or_else(|| PathBuf::from("storage").join(osd_id.as_str()));
    let log_level = if args.log_level == "info" {
        config.logging.level
    } else {
        args.log_level
    };

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    config
        .heartbeat
        .validate()
        .context("invalid heartbeat configuration")?;

    info!("Starting DStore OSD {}", osd_id);
    info!("Config file: {}", args.config);
    info!("Storage directory: {}", storage_dir.display());
    info!("Coordinator: {}", dir_endpoint);

    let store = ChunkStore::open(&storage_dir)
        .await
        .with_context(|| format!("failed to open storage at {}", storage_dir.display()))?;

    let listen = format!("{host}:{port}");
    let listener = TcpListener::bind(&listen)
        .await
        .with_context(|| format!("failed to bind {listen}"))?;

    let shutdown = Shutdown::new();
    let heartbeat = tokio::spawn(heartbeat_loop(
        DirClient::new(dir_endpoint),
        osd_id.clone(),
        port,
        config.heartbeat,
        shutdown.subscribe(),
    ));
    let server = tokio::spawn(OsdServer::new(store).serve(listener, shutdown.subscribe()));

    tokio::signal::ctrl_c().await.ok();
    info!("Shutting down...");
    shutdown.trigger();

    if let Err(e) = server.await {
        warn!("OSD server task failed: {}", e);
    }
    if let Err(e) = heartbeat.await {
        warn!("Heartbeat task failed: {}", e);
    }

    info!("OSD {} shut down gracefully", osd_id);
    Ok(())
}
