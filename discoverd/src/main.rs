use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use anyhow::{bail, Context, Result};
use mdns_discoverd::config::Config;
use mdns_discoverd::discoverer::{self as discovery, Discoverer, DiscoverySettings};
use mdns_discoverd::mdns::advertise;
use mdns_discoverd::shutdown;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("mdns_discoverd=info"))
        )
        .init();

    // Load config
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/etc/mdns-discoverd/discoverd.toml".to_string());
    let mode = std::env::args().nth(2).unwrap_or_else(|| "discover".to_string());

    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path))?;

    tracing::info!("Loaded config from {}", config_path);

    // Create cancellation token for graceful shutdown
    let cancel = CancellationToken::new();

    let handle = match mode.as_str() {
        "discover" => {
            let settings = DiscoverySettings::from_config(&config.discovery);
            let discoverer = Arc::new(Discoverer::with_settings(&config.discovery.cache_path, settings));
            tracing::info!(
                "Starting discovery of {:?} every {}s",
                config.discovery.service_types,
                config.discovery.interval_secs
            );

            let loop_cancel = cancel.clone();
            let loop_config = config.discovery.clone();
            tokio::spawn(async move {
                if let Err(e) = discovery::run(discoverer.clone(), loop_config, loop_cancel.clone()).await {
                    tracing::error!("Discovery loop error: {}", e);
                }
                if let Err(e) = discoverer.shutdown().await {
                    tracing::error!("Failed to shutdown cache: {}", e);
                }
                loop_cancel.cancel();
            })
        }
        "announce" => {
            let Some(announce) = config.announce.clone() else {
                bail!("announce mode needs an [announce] section in {}", config_path);
            };

            let announce_cancel = cancel.clone();
            tokio::spawn(async move {
                if let Err(e) = advertise::run_announcer(announce, announce_cancel.clone()).await {
                    tracing::error!("Announcer error: {:#}", e);
                }
                // an announcer that failed to start ends the process
                announce_cancel.cancel();
            })
        }
        other => bail!("unknown mode {:?}, expected \"discover\" or \"announce\"", other),
    };

    // Wait for shutdown signal
    tokio::select! {
        result = shutdown::signal() => {
            result?;
            tracing::info!("Shutdown signal received");
        }
        _ = cancel.cancelled() => {}
    }

    // Trigger cancellation
    cancel.cancel();

    if let Err(e) = handle.await {
        tracing::error!("Task failed: {}", e);
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
