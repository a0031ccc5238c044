//! keyval server binary
//!
//! Parses flags (with environment fallbacks), opens the configured storage
//! engine once, and serves connections until Ctrl+C.

use anyhow::Context;
use clap::Parser;
use keyval::config::ServerConfig;
use keyval::server::Server;
use keyval::storage::{open_storage, StorageKind};
use std::path::PathBuf;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

/// Networked key-value store
#[derive(Parser, Debug)]
#[command(name = "keyval-server")]
#[command(about = "Networked key-value store with pluggable storage engines")]
#[command(version)]
struct Args {
    /// Storage engine: "hash" or "sqlite"
    #[arg(short, long, env = "SERVICE_STORAGE", default_value = "hash")]
    storage: String,

    /// Interface to bind to
    #[arg(long, env = "SERVICE_NIC", default_value = keyval::DEFAULT_HOST)]
    host: String,

    /// Port to listen on
    #[arg(short, long, env = "SERVICE_PORT", default_value_t = keyval::DEFAULT_PORT)]
    port: u16,

    /// SQLite database file
    #[arg(long, env = "SERVICE_DBNAME", default_value = "default.db")]
    db_path: PathBuf,

    /// Hash table bucket count
    #[arg(long, default_value_t = keyval::storage::DEFAULT_BUCKETS)]
    buckets: usize,

    /// Grow the hash table once its load factor exceeds this value
    #[arg(long)]
    max_load_factor: Option<f64>,

    /// Deadline for each storage operation, in milliseconds
    #[arg(long, default_value_t = 10_000)]
    op_timeout_ms: u64,
}

fn print_banner(config: &ServerConfig) {
    println!(
        r#"
keyval v{} - networked key-value store
──────────────────────────────────────────────────────────────
Storage engine: {}
Binding {}

Use Ctrl+C to shutdown gracefully.
"#,
        keyval::VERSION,
        config.storage.kind,
        config.bind_address()
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .init();

    let args = Args::parse();

    let kind: StorageKind = args
        .storage
        .parse()
        .context("invalid storage configuration")?;

    let mut builder = ServerConfig::builder()
        .host(&args.host)
        .port(args.port)
        .storage_kind(kind)
        .db_path(&args.db_path)
        .buckets(args.buckets)
        .op_timeout(Duration::from_millis(args.op_timeout_ms));
    if let Some(factor) = args.max_load_factor {
        builder = builder.max_load_factor(factor);
    }
    let config = builder.build();

    print_banner(&config);

    // Opened once, shared by every connection
    let storage = open_storage(&config.storage)
        .with_context(|| format!("failed to open {} storage", config.storage.kind))?;

    let server = Server::new(config, storage);
    let listener = server
        .bind()
        .await
        .with_context(|| format!("failed to bind {}", server.config().bind_address()))?;

    let shutdown = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    server.run_until(listener, shutdown).await;

    info!("Goodbye");
    Ok(())
}
