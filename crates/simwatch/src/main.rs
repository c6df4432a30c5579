//! simwatch - Watchdog daemon supervising per-session simulation workers

use anyhow::{Context, Result};
use clap::Parser;
use simwatch::api::ApiClient;
use simwatch::catalog::SimulationCatalog;
use simwatch::config::WatchdogConfig;
use simwatch::ingress::{IngressServer, RequestBuffers};
use simwatch::supervisor::{Supervisor, SupervisorTimings};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// simwatch - Watchdog daemon supervising per-session simulation workers
#[derive(Parser, Debug)]
#[command(name = "simwatch")]
#[command(about = "Watchdog daemon supervising per-session simulation workers")]
#[command(version)]
struct Args {
    /// HTTP control-surface port (overrides the config file)
    #[arg(long, value_name = "PORT")]
    port: Option<u16>,

    /// Path to the simulation configuration file
    #[arg(long, value_name = "PATH", default_value = "simwatch.toml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging: --verbose wins, otherwise SIMWATCH_LOG, otherwise info.
    let log_level = if args.verbose {
        tracing::Level::DEBUG
    } else {
        match std::env::var("SIMWATCH_LOG").as_deref() {
            Ok("trace") => tracing::Level::TRACE,
            Ok("debug") => tracing::Level::DEBUG,
            Ok("warn") => tracing::Level::WARN,
            Ok("error") => tracing::Level::ERROR,
            _ => tracing::Level::INFO,
        }
    };
    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .init();

    info!("Starting simulation watchdog...");

    let config = WatchdogConfig::load(&args.config)
        .with_context(|| format!("Failed to load config from {}", args.config.display()))?;

    let catalog = SimulationCatalog::discover(&config.simulations);
    if catalog.is_empty() {
        warn!("No simulations configured; UpdateState requests naming any simulation will fail");
    }

    let port = args.port.or(config.port).unwrap_or(simwatch::DEFAULT_PORT);

    let buffers = Arc::new(RequestBuffers::new());
    let ingress = IngressServer::bind(port)
        .await
        .with_context(|| format!("Failed to bind control surface on port {port}"))?;

    // Create cancellation token for graceful shutdown
    let cancel_token = CancellationToken::new();

    // Set up signal handlers. Registration happens here so a failure
    // aborts startup instead of vanishing inside the detached task.
    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("Failed to register SIGTERM handler")?;

    let cancel_for_signals = cancel_token.clone();
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        {
            tokio::select! {
                _ = ctrl_c => {
                    info!("Received SIGINT (Ctrl+C)");
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM");
                }
            }
        }

        #[cfg(not(unix))]
        if let Err(e) = ctrl_c.await {
            warn!("Failed to listen for Ctrl+C: {e}");
        } else {
            info!("Received Ctrl+C");
        }

        cancel_for_signals.cancel();
    });

    // Ingress buffers requests; the supervisor loop applies them on its tick.
    let ingress_task = tokio::spawn(ingress.serve(Arc::clone(&buffers), cancel_token.clone()));

    let supervisor = Supervisor::new(
        catalog,
        ApiClient::new(),
        buffers,
        SupervisorTimings::default(),
    );
    supervisor.run(cancel_token).await;

    if let Err(e) = ingress_task.await {
        warn!("Control-surface task panicked: {e}");
    }

    info!("Watchdog shutdown complete");
    Ok(())
}
