use anyhow::{Context, Result};

/// Resolves on ctrl-c, or on SIGTERM where there is one
#[cfg(unix)]
pub async fn signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate()).context("Failed to listen for SIGTERM")?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("Failed to listen for ctrl-c")?,
        _ = terminate.recv() => tracing::debug!("Received SIGTERM"),
    }
    Ok(())
}

#[cfg(not(unix))]
pub async fn signal() -> Result<()> {
    tokio::signal::ctrl_c().await.context("Failed to listen for ctrl-c")
}
