//! TMC server binary.
//!
//! Runs a complete telescope on simulated sub-elements in a single process.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tmc_core::DeviceServer;
use tmc_server::{config, Deployment};
use tmc_sky::SphericalSkyModel;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// TMC control plane server.
#[derive(Parser, Debug)]
#[command(name = "tmc-server")]
#[command(about = "Run a TMC control plane on simulated sub-elements")]
#[command(version)]
struct Cli {
    /// Path to configuration file.
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Issue StartUpTelescope once every device is up.
    #[arg(long)]
    start_up: bool,

    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "tmc=debug,info" } else { "tmc=info,warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    let config = config::load(cli.config.as_deref())?;
    info!(
        telescope = %config.telescope.kind,
        subarrays = config.telescope.subarrays,
        cadence_ms = config.pointing.cadence_ms,
        delay_interval_secs = config.delay_model.update_interval_secs,
        timeout_secs = ?config.commands.timeout_secs,
        "configuration loaded"
    );

    let deployment = Deployment::build(&config, Arc::new(SphericalSkyModel::new())).await?;
    info!(central = %deployment.central.fqdn(), "TMC server running");

    if cli.start_up {
        match deployment.central.command_inout("StartUpTelescope", None).await {
            Ok(reply) if reply.is_success() => info!(%reply, "telescope started"),
            Ok(reply) => warn!(%reply, "telescope start-up incomplete"),
            Err(e) => error!(error = %e, "telescope start-up rejected"),
        }
    }

    shutdown_signal().await;
    deployment.shutdown().await;
    info!("TMC server shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received Ctrl+C, shutting down"),
        () = terminate => info!("received SIGTERM, shutting down"),
    }
}
