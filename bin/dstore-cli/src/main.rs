//! DStore CLI - command line client for the coordinator
//!
//! Uploads, downloads and deletes files and prints the cluster reports.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use dstore_client::DirClient;
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "dstore-cli")]
#[command(about = "DStore command line client")]
#[command(version)]
struct Args {
    /// Coordinator address (host:port)
    #[arg(short, long, env = "DSTORE_DIR", default_value = "127.0.0.1:7000")]
    dir: String,

    /// Connect timeout in milliseconds
    #[arg(long, default_value = "3000")]
    connect_timeout_ms: u64,

    /// Log level
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Upload a local file
    Upload {
        /// Owner id
        owner: String,
        /// Local file to upload
        path: PathBuf,
        /// Name to store it under (defaults to the file name)
        #[arg(short, long)]
        name: Option<String>,
    },
    /// Download a file
    Download {
        owner: String,
        name: String,
        /// Output path (defaults to the file name)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Delete a file and its chunks
    Delete { owner: String, name: String },
    /// List the files of one owner
    Ls { owner: String },
    /// List every file
    LsAll,
    /// Show registered OSDs
    Cluster,
    /// Show OSD health and chunk counts
    Health,
    /// Show replication statistics
    Stats,
    /// Show the chunk placement map
    Chunks,
}

/// Format bytes as a human-readable size string.
#[allow(clippy::cast_precision_loss)]
fn format_size(bytes: u64) -> String {
    const GIB: u64 = 1024 * 1024 * 1024;
    const MIB: u64 = 1024 * 1024;
    const KIB: u64 = 1024;

    if bytes >= GIB {
        format!("{:.1} GiB", bytes as f64 / GIB as f64)
    } else if bytes >= MIB {
        format!("{:.1} MiB", bytes as f64 / MIB as f64)
    } else if bytes >= KIB {
        format!("{:.1} KiB", bytes as f64 / KIB as f64)
    } else {
        format!("{bytes} B")
    }
}

/// Render `name|size|chunks|maxReplicas` lines as a table
fn format_file_listing(report: &str) -> String {
    let mut out = format!("{:<32} {:>12} {:>7} {:>9}\n", "NAME", "SIZE", "CHUNKS", "REPLICAS");
    for line in report.lines().filter(|l| !l.is_empty()) {
        let fields: Vec<&str> = line.split('|').collect();
        if let [name, size, chunks, replicas] = fields.as_slice() {
            let size = size.parse().map_or_else(|_| (*size).to_string(), format_size);
            out.push_str(&format!("{name:<32} {size:>12} {chunks:>7} {replicas:>9}\n"));
        } else {
            out.push_str(line);
            out.push('\n');
        }
    }
    out
}

fn file_name_of(path: &std::path::Path) -> Result<String> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(ToString::to_string)
        .with_context(|| format!("cannot derive a file name from {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let client = DirClient::new(&args.dir)
        .with_connect_timeout(Duration::from_millis(args.connect_timeout_ms));
    debug!("Using coordinator at {}", client.address());

    match args.command {
        Commands::Upload { owner, path, name } => {
            let name = match name {
                Some(name) => name,
                None => file_name_of(&path)?,
            };
            let mut file = File::open(&path)
                .await
                .with_context(|| format!("failed to open {}", path.display()))?;
            let size = file.metadata().await?.len();
            let declared = i64::try_from(size).context("file too large")?;
            if client.upload_from(&owner, &name, declared, &mut file).await? {
                println!("Uploaded {} ({}) as {}/{}", path.display(), format_size(size), owner, name);
            } else {
                bail!("upload of {owner}/{name} failed");
            }
        }
        Commands::Download {
            owner,
            name,
            output,
        } => {
            let Some(data) = client.download(&owner, &name).await? else {
                bail!("{owner}/{name} not found or unavailable");
            };
            let output = output.unwrap_or_else(|| PathBuf::from(&name));
            let mut file = File::create(&output)
                .await
                .with_context(|| format!("failed to create {}", output.display()))?;
            file.write_all(&data).await?;
            file.flush().await?;
            println!("Downloaded {}/{} ({}) to {}", owner, name, format_size(data.len() as u64), output.display());
        }
        Commands::Delete { owner, name } => {
            if client.delete(&owner, &name).await? {
                println!("Deleted {owner}/{name}");
            } else {
                bail!("{owner}/{name} not found");
            }
        }
        Commands::Ls { owner } => {
            print!("{}", format_file_listing(&client.list_files(&owner).await?));
        }
        Commands::LsAll => print!("{}", client.list_all().await?),
        Commands::Cluster => print!("{}", client.cluster().await?),
        Commands::Health => print!("{}", client.health().await?),
        Commands::Stats => print!("{}", client.stats().await?),
        Commands::Chunks => print!("{}", client.chunks().await?),
    }

    Ok(())
}
