//! kinsync - command-line client for the offline-first family graph.
//!
//! Edits are applied to the local cache immediately and queued for the
//! remote store; `drain` and `watch` push them once the remote is reachable.

use std::io;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use kinsync_core::sync::NetworkMonitor;
use kinsync_core::{
    App, Config, DisconnectedRemote, FileStore, HttpRemote, NodeInput, RemoteStore, SyncStatus,
};

// ============================================================================
// Constants
// ============================================================================

/// Log file name inside the data directory
const LOG_FILE: &str = "kinsync.log";

const USAGE: &str = "\
Usage: kinsync <command> [args]

Commands:
  status                     Show connectivity and queue counts
  show <family>              Print the cached graph for a family
  add-person <family> <name> Add a person node (queued for sync)
  drain                      Push queued operations to the remote
  retry-failed               Requeue failed operations and drain
  watch                      Probe the remote and sync until Ctrl-C";

/// Initialize the tracing subscriber for logging.
///
/// Logs go to stderr and to a file in the data directory. The returned
/// guard must be held until exit so the file writer flushes.
fn init_tracing(data_dir: &Path) -> WorkerGuard {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let file_appender = tracing_appender::rolling::never(data_dir, LOG_FILE);
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(fmt::layer().with_ansi(false).with_writer(file_writer))
        .with(filter)
        .init();

    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first().map(String::as_str) else {
        eprintln!("{}", USAGE);
        return Ok(());
    };
    if matches!(command, "-h" | "--help" | "help") {
        println!("{}", USAGE);
        return Ok(());
    }

    let config = Config::load()?;
    let data_dir = config.data_dir()?;
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("Failed to create data directory {}", data_dir.display()))?;
    let _log_guard = init_tracing(&data_dir);
    info!(command, data_dir = %data_dir.display(), "kinsync starting");

    let store = Arc::new(FileStore::new(data_dir)?);
    let http = match config.remote_url {
        Some(ref url) => Some(Arc::new(HttpRemote::new(url.as_str())?)),
        None => None,
    };
    let remote: Arc<dyn RemoteStore> = match http {
        Some(ref client) => client.clone(),
        None => Arc::new(DisconnectedRemote),
    };

    let mut app = App::open(store, remote, config.app_settings()).await?;

    // One synchronous probe so commands see the real connectivity
    if let Some(ref client) = http {
        let reachable = client.is_reachable().await;
        app.engine.set_online(reachable).await?;
    }

    let result = match (command, &args[1..]) {
        ("status", []) => status(&app).await,
        ("show", [family]) => show(&app, family).await,
        ("add-person", [family, name]) => add_person(&app, family, name).await,
        ("drain", []) => drain(&app).await,
        ("retry-failed", []) => retry_failed(&app).await,
        ("watch", []) => match http {
            Some(client) => watch(&mut app, client, config.probe_interval()).await,
            None => Err(anyhow::anyhow!("No remote_url configured; nothing to watch")),
        },
        _ => {
            eprintln!("{}", USAGE);
            Err(anyhow::anyhow!("Unknown command or wrong arguments: {}", args.join(" ")))
        }
    };

    app.shutdown().await;
    info!("kinsync shutting down");
    result
}

fn print_status(status: &SyncStatus) {
    println!(
        "{}  pending: {}  failed: {}{}",
        if status.is_online { "online" } else { "offline" },
        status.pending_operations,
        status.failed_operations,
        if status.is_syncing { "  (syncing)" } else { "" }
    );
}

async fn status(app: &App) -> Result<()> {
    print_status(&app.engine.get_status().await);
    for op in app.engine.failed_operations().await {
        println!(
            "  failed {} {:?} {} after {} attempts: {}",
            op.id,
            op.kind,
            op.table,
            op.retry_count,
            op.error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}

async fn show(app: &App, family: &str) -> Result<()> {
    let graph = app.cache.get(family).await?;
    println!("{}", serde_json::to_string_pretty(&graph)?);
    if let Some(cached_at) = app.cache.cached_at(family).await? {
        eprintln!("cached at {}", cached_at.to_rfc3339());
    }
    Ok(())
}

async fn add_person(app: &App, family: &str, name: &str) -> Result<()> {
    if name.trim().is_empty() {
        bail!("Name must not be empty");
    }
    let mut data = serde_json::Map::new();
    data.insert("name".to_string(), name.trim().into());
    let node = app.mutations.add_node(family, NodeInput::person(data)).await?;
    println!("{}", node.id);
    Ok(())
}

async fn drain(app: &App) -> Result<()> {
    if !app.engine.is_online() {
        bail!("Remote is unreachable; operations stay queued");
    }
    let report = app.engine.drain().await?;
    println!(
        "attempted: {}  completed: {}  requeued: {}  failed: {}",
        report.attempted, report.completed, report.requeued, report.failed
    );
    print_status(&app.engine.get_status().await);
    Ok(())
}

async fn retry_failed(app: &App) -> Result<()> {
    let count = app.engine.retry_failed().await?;
    println!("requeued {} failed operations", count);
    if app.engine.is_online() {
        app.engine.drain().await?;
    }
    print_status(&app.engine.get_status().await);
    Ok(())
}

async fn watch(app: &mut App, monitor: Arc<HttpRemote>, interval: std::time::Duration) -> Result<()> {
    let unsubscribe = app.engine.subscribe(print_status).await;
    let monitor: Arc<dyn NetworkMonitor> = monitor;
    app.start_probe(monitor, interval);

    tokio::signal::ctrl_c().await?;
    unsubscribe();
    Ok(())
}
