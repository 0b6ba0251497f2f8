//! Dashcam - Main Entry Point

use anyhow::{bail, Context};
use clap::Parser;
use dashcam::{init_logging, DashcamConfig, DashcamSystem, SyntheticDevices, DEFAULT_CONFIG_PATH};
use std::path::PathBuf;
use tracing::{error, info};

/// Dual-camera dashcam with rear-view mirror display
#[derive(Parser, Debug)]
#[command(name = "dashcam")]
#[command(version, about, long_about = None)]
struct CliArgs {
    /// Configuration file (TOML)
    #[arg(short, long, value_name = "FILE", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Use test-pattern cameras and a simulated vehicle bus
    #[arg(long)]
    synthetic: bool,

    /// Validate the configuration and exit
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();

    let config = DashcamConfig::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    config.validate().context("validating configuration")?;
    if args.check {
        println!("Configuration OK");
        return Ok(());
    }

    init_logging(config.log_level()?, config.log_json).context("installing log subscriber")?;
    info!("=== Dashcam v{} ===", env!("CARGO_PKG_VERSION"));

    if !args.synthetic {
        bail!("no camera driver is linked into this build; run with --synthetic for test-pattern cameras");
    }

    let delay = config.startup_delay();
    if !delay.is_zero() {
        info!("Waiting {:.1}s for hardware...", delay.as_secs_f64());
        tokio::time::sleep(delay).await;
    }

    let startup_config = config.clone();
    let system = tokio::task::spawn_blocking(move || {
        DashcamSystem::start(&startup_config, &SyntheticDevices)
    })
    .await
    .context("startup task panicked")?
    .context("starting dashcam")?;

    let mut status = tokio::time::interval(config.status_interval());
    status.tick().await;
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = status.tick() => info!("Status: {}", system.status()),
        }
    }

    let stuck = tokio::task::spawn_blocking(move || system.shutdown())
        .await
        .context("shutdown task panicked")?;
    if stuck > 0 {
        error!("{} threads were abandoned during shutdown", stuck);
    }
    Ok(())
}

/// Resolve on SIGINT or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}
