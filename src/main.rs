use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use prof_aggregator::config;
use prof_aggregator::service::Service;
use tracing_subscriber::{fmt, EnvFilter};

/// Ingest, aggregate and persist profiling streams from recording agents.
#[derive(Parser)]
#[command(name = "prof-aggregator", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    /// Overrides `log_level` from the config file.
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,
}

mod version {
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Commit hash from the `GIT_COMMIT` build environment, if set.
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    pub fn full() -> String {
        format!(
            "{RELEASE} (commit: {}, {}/{})",
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Handle version subcommand before anything else.
    if let Some(Command::Version) = &cli.command {
        println!("prof-aggregator {}", version::full());
        return Ok(());
    }

    // Without a config file every setting takes its default.
    let cfg = match &cli.config {
        Some(path) => config::Config::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => config::Config::default(),
    };

    // Initialize tracing.
    let log_level = cfg.effective_log_level(cli.log_level.as_deref());
    let filter = EnvFilter::try_new(log_level)
        .with_context(|| format!("invalid log level: {log_level}"))?;

    fmt().with_env_filter(filter).with_target(true).init();

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        "starting prof-aggregator",
    );

    // Build and run the tokio runtime.
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(async { run(cfg).await })
}

async fn run(cfg: config::Config) -> Result<()> {
    // Set up signal handling.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("registering SIGTERM handler")?;

    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("received SIGINT, shutting down");
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, shutting down");
            }
        }

        let _ = shutdown_tx.send(());
    });

    let mut service = Service::new(cfg)?;
    service.start().await?;

    // Wait for shutdown signal.
    let _ = shutdown_rx.await;

    // Graceful shutdown flushes every open window.
    service.stop().await?;

    tracing::info!("prof-aggregator stopped");

    Ok(())
}
