use std::collections::HashMap;
use mdns_sd::{ServiceDaemon, ServiceInfo};
use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use shared::protocol::{service_address, DEFAULT_DOMAIN};
use crate::config::AnnounceConfig;
use super::interfaces::{self, NetInterface};

pub fn register_service(
    daemon: &ServiceDaemon,
    config: &AnnounceConfig,
    interfaces: &[NetInterface],
) -> Result<ServiceInfo> {
    let host_name = host_name(config.host.as_deref())?;
    let service_type = service_address(&config.service_type, DEFAULT_DOMAIN);

    let addresses = interfaces
        .iter()
        .map(|iface| iface.addr.to_string())
        .collect::<Vec<_>>()
        .join(",");

    tracing::debug!(
        name = %config.name,
        service_type = %service_type,
        host = %host_name,
        port = config.port,
        txt = ?config.txt,
        "Going to announce"
    );

    let mut service_info = ServiceInfo::new(
        &service_type,
        &config.name,
        &host_name,
        addresses.as_str(),
        config.port,
        txt_properties(&config.txt),
    )
    .context("Failed to create ServiceInfo")?;

    if interfaces.is_empty() {
        service_info = service_info.enable_addr_auto();
    }

    daemon
        .register(service_info.clone())
        .context("Failed to register mDNS service")?;

    tracing::info!(
        "Registered {} as {} on port {}",
        service_type,
        config.name,
        config.port
    );

    Ok(service_info)
}

pub fn unregister_service(daemon: &ServiceDaemon, service_info: &ServiceInfo) -> Result<()> {
    daemon
        .unregister(service_info.get_fullname())
        .context("Failed to unregister mDNS service")?;

    tracing::info!("Unregistered {}", service_info.get_fullname());
    Ok(())
}

/// Announce the configured service on every eligible interface until
/// `cancel` fires, then withdraw it.
pub async fn run_announcer(config: AnnounceConfig, cancel: CancellationToken) -> Result<()> {
    let eligible = interfaces::eligible_ipv4().context("Failed to list network interfaces")?;

    let daemon = ServiceDaemon::new().context("Failed to create mDNS daemon")?;
    if !eligible.is_empty() {
        daemon
            .disable_interface(mdns_sd::IfKind::All)
            .context("Failed to disable default interfaces")?;
        for iface in &eligible {
            daemon
                .enable_interface(iface.name.as_str())
                .with_context(|| format!("Failed to enable interface {}", iface.name))?;
        }
    }

    let service_info = register_service(&daemon, &config, &eligible)?;

    cancel.cancelled().await;
    tracing::debug!("Shutting down announcer");

    if let Err(e) = unregister_service(&daemon, &service_info) {
        tracing::error!("Failed to unregister mDNS service: {}", e);
    }
    if let Err(e) = daemon.shutdown() {
        tracing::error!("Failed to shutdown mDNS daemon: {}", e);
    }

    Ok(())
}

/// "host" or the system hostname, as a fully qualified ".local." name
fn host_name(configured: Option<&str>) -> Result<String> {
    let host = match configured {
        Some(host) => host.to_string(),
        None => hostname::get()
            .context("Failed to get system hostname")?
            .to_string_lossy()
            .to_string(),
    };

    let host = host.trim_end_matches('.');
    if host.ends_with(".local") {
        Ok(format!("{}.", host))
    } else {
        Ok(format!("{}.local.", host))
    }
}

/// "key=value" TXT strings as properties; a bare "flag" gets an empty value
fn txt_properties(lines: &[String]) -> HashMap<String, String> {
    lines
        .iter()
        .map(|line| match line.split_once('=') {
            Some((key, value)) => (key.to_string(), value.to_string()),
            None => (line.clone(), String::new()),
        })
        .collect()
}
