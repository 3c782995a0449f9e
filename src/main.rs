use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use traceloom::boot::{self, StorageSeam};
use traceloom::config::Config;
use traceloom::export::health::CollectorMetrics;
use traceloom::storage::{BatchDao, MemoryDao, MetricsDao};

/// Streaming aggregation and persistence core for a distributed tracing
/// collector.
#[derive(Parser)]
#[command(name = "traceloom", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Command::Version) = &cli.command {
        println!("traceloom {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let filter = EnvFilter::try_new(&cli.log_level)
        .with_context(|| format!("invalid log level: {}", cli.log_level))?;

    fmt().with_env_filter(filter).with_target(true).init();

    let cfg = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::default(),
    };

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting traceloom");

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(async { run(cfg).await })
}

async fn run(cfg: Config) -> Result<()> {
    // Set up signal handling.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("received SIGINT, shutting down");
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, shutting down");
            }
        }

        let _ = shutdown_tx.send(());
    });

    let health = if cfg.health.enabled {
        let metrics = Arc::new(CollectorMetrics::new(&cfg.health.addr)?);
        metrics.start().await?;
        Some(metrics)
    } else {
        None
    };

    // The built-in backend keeps everything in memory; deployments embed
    // this crate and inject DAOs for their storage engine instead.
    let dao = Arc::new(MemoryDao::new());
    tracing::info!("using in-memory storage backend");

    let core = boot::assemble(
        &cfg,
        StorageSeam {
            metrics: Arc::clone(&dao) as Arc<dyn MetricsDao>,
            batch: dao as Arc<dyn BatchDao>,
        },
        health.clone(),
    )?;

    tracing::info!(node = %cfg.node_name, "traceloom collector started");

    // Wait for shutdown signal.
    let _ = shutdown_rx.await;

    // Graceful shutdown.
    core.stop().await;

    if let Some(health) = health {
        health.stop().await?;
    }

    tracing::info!("traceloom stopped");

    Ok(())
}
