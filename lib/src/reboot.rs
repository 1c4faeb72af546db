//! Handling of system restarts.

use std::io::Write;

use anyhow::Result;
use fn_error_context::context;
use rpmostreed_utils::CommandRunExt;

/// Ask the init system to reboot. Runs off the main thread so the daemon
/// keeps serving until the init system tears it down.
#[context("Initiating reboot")]
pub(crate) async fn reboot() -> Result<()> {
    // Flush output streams
    let _ = std::io::stdout().flush();
    let _ = std::io::stderr().flush();
    tracing::info!("Initiating reboot");
    tokio::task::spawn_blocking(|| std::process::Command::new("systemctl").arg("reboot").run())
        .await?
}
