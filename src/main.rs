//! Courier CLI entry point.
//!
//! `start` runs the gateway until interrupted. `status`, `queue` and
//! `campaigns` inspect the snapshots on disk and are meant for a stopped
//! gateway or a quick look at a running one.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;

use courier::config::{load_config, runtime_paths, Config, RuntimePaths};
use courier::credentials::load_default_credentials;
use courier::provider::bridge::BridgeProvider;
use courier::store::Store;
use courier::types::SessionId;
use courier::{logging, Gateway};

/// Courier: multi-tenant messaging gateway.
#[derive(Parser)]
#[command(name = "courier", version, about)]
struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

/// Available CLI subcommands.
#[derive(Subcommand)]
enum Command {
    /// Connect configured sessions and process queues until Ctrl-C.
    Start,
    /// Show configured sessions with their queue and campaign counts.
    Status,
    /// Show a session's persisted queue.
    Queue {
        /// Session identifier.
        session: String,
        /// Discard every pending item.
        #[arg(long)]
        clear: bool,
    },
    /// List a session's campaigns, newest first.
    Campaigns {
        /// Session identifier.
        session: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Start => handle_start().await,
        Command::Status => handle_status().await,
        Command::Queue { session, clear } => handle_queue(&session, clear).await,
        Command::Campaigns { session } => handle_campaigns(&session).await,
    }
}

/// Load paths and configuration shared by every subcommand.
fn load_runtime() -> anyhow::Result<(RuntimePaths, Config)> {
    let paths = runtime_paths()?;
    let config = load_config(&paths.config_toml)
        .with_context(|| format!("failed to load {}", paths.config_toml.display()))?;
    Ok((paths, config))
}

/// Run the gateway until interrupted.
async fn handle_start() -> anyhow::Result<()> {
    let (paths, config) = load_runtime()?;
    let _logging_guard = logging::init_production(&paths.logs_dir, &config.logging.level)?;

    let credentials = load_default_credentials()
        .with_context(|| format!("failed to load {}", paths.env_file.display()))?;
    let provider = Arc::new(BridgeProvider::new(
        &config.bridge,
        credentials.bridge_token(&config.bridge),
    ));

    let gateway = Gateway::open(&config, &paths.data_dir, provider)
        .await
        .context("failed to open gateway")?;

    let connected = gateway.start_sessions(&config.sessions).await;
    info!(
        connected,
        configured = config.sessions.len(),
        bridge = %config.bridge.base_url,
        "courier started"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown signal received");

    gateway.shutdown().await;
    Ok(())
}

/// Print configured sessions with their persisted queue and campaign counts.
async fn handle_status() -> anyhow::Result<()> {
    logging::init_cli();
    let (paths, config) = load_runtime()?;
    let store = Store::open(&paths.data_dir).await?;
    let campaigns = store.list_campaigns().await;

    println!("courier {}", env!("CARGO_PKG_VERSION"));
    println!("bridge: {}", config.bridge.base_url);
    println!("data: {}", paths.data_dir.display());

    if config.sessions.is_empty() {
        println!("no sessions configured");
        return Ok(());
    }

    for entry in &config.sessions {
        let id = SessionId::parse(&entry.id)?;
        let snapshot = store.load_queue(&id).await.unwrap_or_default();
        let running = campaigns
            .iter()
            .filter(|c| c.session_id == id && c.is_processing())
            .count();
        println!(
            "{id}: autostart={} pending={} sent={} failed={} campaigns_running={running}",
            entry.autostart,
            snapshot.items.len(),
            snapshot.stats.success,
            snapshot.stats.failed,
        );
    }
    Ok(())
}

/// Print (or clear) a session's persisted queue.
async fn handle_queue(session: &str, clear: bool) -> anyhow::Result<()> {
    logging::init_cli();
    let (paths, _config) = load_runtime()?;
    let id = SessionId::parse(session)?;
    let store = Store::open(&paths.data_dir).await?;
    let mut snapshot = store.load_queue(&id).await.unwrap_or_default();

    if clear {
        let removed = snapshot.items.len();
        snapshot.items.clear();
        store.save_queue(&id, &snapshot).await?;
        println!("{id}: cleared {removed} pending item(s)");
        return Ok(());
    }

    println!(
        "{id}: pending={} total={} sent={} failed={} last_processed={}",
        snapshot.items.len(),
        snapshot.stats.total,
        snapshot.stats.success,
        snapshot.stats.failed,
        snapshot
            .last_processed
            .map_or_else(|| "never".to_owned(), |t| t.to_rfc3339()),
    );
    for item in &snapshot.items {
        println!(
            "  #{} {} -> {} (retries left {})",
            item.seq,
            item.kind(),
            item.recipient,
            item.retries_left
        );
    }
    Ok(())
}

/// List a session's campaigns from their snapshots.
async fn handle_campaigns(session: &str) -> anyhow::Result<()> {
    logging::init_cli();
    let (paths, _config) = load_runtime()?;
    let id = SessionId::parse(session)?;
    let store = Store::open(&paths.data_dir).await?;

    let mut campaigns: Vec<_> = store
        .list_campaigns()
        .await
        .into_iter()
        .filter(|c| c.session_id == id)
        .collect();
    campaigns.sort_by(|a, b| b.started_at.cmp(&a.started_at));

    if campaigns.is_empty() {
        println!("{id}: no campaigns");
        return Ok(());
    }
    for c in &campaigns {
        println!(
            "{} {} {} {}/{} sent={} failed={} started={}",
            c.id,
            c.status,
            c.kind,
            c.counts.processed,
            c.counts.total,
            c.counts.success,
            c.counts.failed,
            c.started_at.to_rfc3339(),
        );
    }
    Ok(())
}
