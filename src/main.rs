//! labmon — laboratory instrument monitoring engine
//!
//! # Usage
//!
//! ```bash
//! # Run with defaults (./data, 0.0.0.0:8080)
//! labmon
//!
//! # Custom config and address
//! labmon --config /etc/labmon.toml --addr 127.0.0.1:9090
//!
//! # Against the bundled simulator
//! labmon-simulator --port 5025 &
//! labmon
//! ```
//!
//! # Environment Variables
//!
//! - `LABMON_CONFIG`: Path to the TOML config file
//! - `RUST_LOG`: Logging filter (default: info)

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use labmon::api::{create_app, ApiContext};
use labmon::collector::Collector;
use labmon::config::AppConfig;
use labmon::machine::MachineEngine;
use labmon::store::{Catalog, ReadingsLog};
use labmon::transport::LanFactory;

// ============================================================================
// CLI Arguments
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "labmon")]
#[command(about = "Laboratory instrument monitoring engine")]
#[command(version)]
struct CliArgs {
    /// Override the HTTP bind address (default: from config, 0.0.0.0:8080)
    #[arg(short, long)]
    addr: Option<String>,

    /// Override the data directory holding the JSON documents
    #[arg(long)]
    data_dir: Option<String>,

    /// Path to the TOML config file
    #[arg(long, env = "LABMON_CONFIG")]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

// ============================================================================
// Entry point
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();
    init_tracing(args.log_json);

    let mut config = match &args.config {
        Some(path) => AppConfig::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => AppConfig::load().context("Failed to load config")?,
    };
    if let Some(addr) = args.addr {
        config.server.addr = addr;
    }
    if let Some(dir) = args.data_dir {
        config.data.dir = dir;
    }

    info!("labmon starting");
    info!("  data dir:  {}", config.data.dir);
    info!("  readings:  cap {}", config.readings.max_entries);
    info!("  tick rate: {} Hz", config.machine.tick_hz);

    // ------------------------------------------------------------------
    // Services (constructed once, injected everywhere)
    // ------------------------------------------------------------------

    let data_dir = PathBuf::from(&config.data.dir);
    tokio::fs::create_dir_all(&data_dir)
        .await
        .with_context(|| format!("Failed to create data dir {}", data_dir.display()))?;

    let catalog = Arc::new(
        Catalog::open(&data_dir)
            .await
            .context("Failed to load instrument/setup documents")?,
    );
    let readings = Arc::new(
        ReadingsLog::open(&data_dir, config.readings.max_entries)
            .await
            .context("Failed to load readings log")?,
    );
    let transports = Arc::new(LanFactory::new(
        config.transport_deadline(),
        config.transport.lock_per_operation,
    ));
    let collector = Arc::new(Collector::new(
        Arc::clone(&catalog),
        Arc::clone(&readings),
        transports.clone(),
    ));
    let machine = Arc::new(MachineEngine::new(
        Arc::clone(&catalog),
        Arc::clone(&readings),
        Arc::clone(&collector),
        config.tick_period(),
    ));

    info!(
        "✓ loaded {} instruments, {} setups, {} readings",
        catalog.instruments().await.len(),
        catalog.setups().await.len(),
        readings.len().await,
    );

    let context = ApiContext {
        catalog: Arc::clone(&catalog),
        readings: Arc::clone(&readings),
        collector: Arc::clone(&collector),
        machine: Arc::clone(&machine),
        transports,
        started_at: Instant::now(),
    };
    let app = create_app(context);

    let listener = tokio::net::TcpListener::bind(&config.server.addr)
        .await
        .with_context(|| format!("Failed to bind to {}", config.server.addr))?;
    info!("✓ HTTP server listening on {}", config.server.addr);

    // ------------------------------------------------------------------
    // Supervisor
    // ------------------------------------------------------------------

    let cancel_token = CancellationToken::new();
    let mut task_set: JoinSet<Result<&'static str>> = JoinSet::new();

    let http_cancel = cancel_token.clone();
    task_set.spawn(async move {
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                http_cancel.cancelled().await;
                info!("[HttpServer] Received shutdown signal");
            })
            .await;
        match result {
            Ok(()) => Ok("HttpServer"),
            Err(e) => Err(anyhow::anyhow!("HTTP server error: {e}")),
        }
    });

    let signal_cancel = cancel_token.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for ctrl-c: {e}");
            return;
        }
        info!("Shutdown signal received");
        signal_cancel.cancel();
    });

    // Wait for any supervised task to finish (normally: HTTP on shutdown).
    while let Some(joined) = task_set.join_next().await {
        match joined {
            Ok(Ok(name)) => info!("[{name}] Task finished"),
            Ok(Err(e)) => {
                error!("Task failed: {e}");
                cancel_token.cancel();
            }
            Err(e) => {
                error!("Task panicked: {e}");
                cancel_token.cancel();
            }
        }
    }

    // ------------------------------------------------------------------
    // Ordered teardown: machines first (they send disables), then any
    // remaining collectors.
    // ------------------------------------------------------------------

    for setup_id in machine.running_setups().await {
        if let Err(e) = machine.stop(setup_id).await {
            warn!(setup_id, "machine stop during shutdown: {e}");
        }
    }
    for setup_id in collector.running_setups().await {
        if let Err(e) = collector.stop(setup_id).await {
            warn!(setup_id, "collector stop during shutdown: {e}");
        }
    }

    info!("labmon stopped");
    Ok(())
}
