//! Host power-off
//!
//! Runs after the session has closed and the power board is armed. The
//! agent needs passwordless sudo for `shutdown` on the frame.

use anyhow::{anyhow, Context, Result};
use std::time::Instant;
use tokio::process::Command as AsyncCommand;
use tracing::info;

/// Command line used to halt the host
pub const HALT_COMMAND: [&str; 4] = ["sudo", "shutdown", "-h", "now"];

/// Halt the operating system now
pub async fn halt_host() -> Result<()> {
    run(&HALT_COMMAND).await
}

async fn run(command: &[&str]) -> Result<()> {
    let (program, args) = command
        .split_first()
        .ok_or_else(|| anyhow!("Empty command line"))?;

    let started = Instant::now();
    info!("Executing power command: {}", command.join(" "));

    let output = AsyncCommand::new(program)
        .args(args)
        .output()
        .await
        .with_context(|| format!("Failed to execute {}", program))?;

    if output.status.success() {
        info!(elapsed_ms = started.elapsed().as_millis() as u64, "Host halt initiated");
        Ok(())
    } else {
        Err(anyhow!(
            "Shutdown failed ({}): {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        ))
    }
}
