//! DStore DIR - coordinator service
//!
//! This binary serves the DIR protocol and runs the replication manager.

use anyhow::{Context, Result};
use clap::Parser;
use dstore_common::{NetworkConfig, ReplicationConfig, Shutdown};
use dstore_dir::{metrics, ClusterState, DirCoordinator, DirServer};
use dstore_meta_store::MetaStore;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "dstore-dir")]
#[command(about = "DStore Coordinator Service")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "dir.toml")]
    config: String,

    /// Listen address for the DIR protocol
    #[arg(short, long, env = "DSTORE_DIR_LISTEN")]
    listen: Option<String>,

    /// Metadata directory
    #[arg(long)]
    meta_dir: Option<PathBuf>,

    /// Replication factor
    #[arg(long)]
    replication: Option<usize>,

    /// Port of the HTTP status endpoint (disabled when absent)
    #[arg(long)]
    metrics_port: Option<u16>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Configuration file structure
#[derive(Debug, Deserialize, Default)]
struct Config {
    #[serde(default)]
    dir: DirConfig,
    #[serde(default)]
    network: NetworkConfig,
    #[serde(default)]
    replication: ReplicationConfig,
    #[serde(default)]
    logging: LoggingConfig,
}

#[derive(Debug, Deserialize)]
struct DirConfig {
    #[serde(default = "default_meta_dir")]
    meta_dir: PathBuf,
    #[serde(default)]
    metrics_port: Option<u16>,
}

impl Default for DirConfig {
    fn default() -> Self {
        Self {
            meta_dir: default_meta_dir(),
            metrics_port: None,
        }
    }
}

fn default_meta_dir() -> PathBuf {
    PathBuf::from("dir-meta")
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
    let listen = args.listen.unwrap_or(config.network.dir_listen);
    let meta_dir = args.meta_dir.unwrap_or(config.dir.meta_dir);
    let metrics_port = args.metrics_port.or(config.dir.metrics_port);
    let mut replication = config.replication;
    if let Some(factor) = args.replication {
        replication.replication_factor = factor;
    }
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

    replication
        .validate()
        .context("invalid replication configuration")?;

    info!("Starting DStore DIR");
    info!("Config file: {}", args.config);
    info!("Metadata directory: {}", meta_dir.display());
    info!(
        "Replication factor {}, chunk size {} bytes",
        replication.replication_factor, replication.chunk_size
    );

    let store = MetaStore::open(&meta_dir)
        .with_context(|| format!("failed to open metadata store at {}", meta_dir.display()))?;
    let files = store.load_all().context("failed to load metadata")?;
    info!("Loaded {} files from {}", files.len(), meta_dir.display());

    let state = Arc::new(ClusterState::with_files(files));
    let coordinator = Arc::new(DirCoordinator::new(state, store, replication));

    let listener = TcpListener::bind(&listen)
        .await
        .with_context(|| format!("failed to bind {listen}"))?;

    let shutdown = Shutdown::new();
    let mut background = JoinSet::new();
    coordinator.replication().start(&shutdown, &mut background);

    if let Some(port) = metrics_port {
        let coordinator = Arc::clone(&coordinator);
        let signal = shutdown.subscribe();
        background.spawn(async move {
            if let Err(e) = metrics::serve_metrics(port, coordinator, signal).await {
                error!("Metrics server error: {}", e);
            }
        });
    }

    let server = tokio::spawn(DirServer::new(Arc::clone(&coordinator)).serve(listener, shutdown.subscribe()));

    tokio::signal::ctrl_c().await.ok();
    info!("Shutting down...");
    shutdown.trigger();

    if let Err(e) = server.await {
        warn!("DIR server task failed: {}", e);
    }
    dstore_common::shutdown::join_bounded(
        &mut background,
        dstore_common::shutdown::SHUTDOWN_GRACE,
        "background tasks",
    )
    .await;

    info!("DIR shut down gracefully");
    Ok(())
}
