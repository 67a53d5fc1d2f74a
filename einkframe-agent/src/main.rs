//! einkframe agent binary
//!
//! Loads the configuration, assembles the agent and runs it until a signal
//! or the on-battery policy shuts it down.

use anyhow::{Context, Result};
use einkframe_agent::config::AgentConfig;
use einkframe_agent::runtime::{Collaborators, Runtime};
use einkframe_agent::session::{mqtt, ShutdownReason};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
    // .env is optional
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,einkframe_agent=debug".into()),
        )
        .init();

    if let Err(e) = run().await {
        error!("Agent failed: {:#}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    info!("Starting einkframe agent v{}", env!("CARGO_PKG_VERSION"));

    let path = AgentConfig::config_file_path(std::env::args().nth(1));
    let config = AgentConfig::load(&path)
        .await
        .with_context(|| format!("Failed to load configuration from {}", path.display()))?;
    let device_id = config
        .resolve_device_id()
        .context("Failed to determine device id")?;
    let client_id = config.client_id();
    info!(%device_id, %client_id, broker = %config.mqtt.broker, "Configuration loaded");

    let parts = Collaborators::from_config(&config)?;
    let runtime = Runtime::new(&config, device_id, parts, |topics, will| {
        mqtt::connect(&config.mqtt, &client_id, topics, will)
    })?;

    let handle = runtime.handle();
    tokio::spawn(async move {
        match shutdown_signal().await {
            Ok(()) => handle.request_shutdown(ShutdownReason::Signal),
            Err(e) => warn!(error = %e, "Signal handling unavailable"),
        }
    });

    let exit = runtime.run().await?;
    info!(reason = ?exit.reason, "einkframe agent stopped");
    Ok(())
}

async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result.context("Failed to listen for Ctrl+C")?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;

    info!("Shutdown signal received");
    Ok(())
}
