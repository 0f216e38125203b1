use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use anyhow::Result;
use shared::protocol::{service_address, DEFAULT_DOMAIN};
use shared::types::CacheEntry;
use crate::cache::table::CacheTable;
use crate::cache_manager::CacheHandle;
use crate::config::DiscoveryConfig;
use crate::error::ClientError;
use crate::mdns::client::{lookup, MdnsClient, QueryParams, RoundReport};
use crate::mdns::{interfaces, ServiceRecord};

/// Knobs for each discovery round
#[derive(Debug, Clone)]
pub struct DiscoverySettings {
    pub domain: String,
    pub interface: Option<std::net::Ipv4Addr>,
    pub want_unicast_response: bool,
    /// Completed records buffered per round; more are dropped
    pub result_capacity: usize,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            domain: DEFAULT_DOMAIN.to_string(),
            interface: None,
            want_unicast_response: false,
            result_capacity: 32,
        }
    }
}

impl DiscoverySettings {
    /// Settings from config; an interface that cannot be resolved falls back
    /// to the system default
    pub fn from_config(config: &DiscoveryConfig) -> Self {
        let interface = config.interface.as_deref().and_then(|name| {
            interfaces::resolve(name)
                .map_err(|e| tracing::warn!("Ignoring interface {}: {}", name, e))
                .ok()
        });

        Self {
            domain: config.domain.clone(),
            interface,
            want_unicast_response: config.want_unicast_response,
            result_capacity: config.result_capacity.max(1),
        }
    }
}

pub struct Discoverer {
    cache: CacheHandle,
    storage: Option<PathBuf>,
    settings: DiscoverySettings,
}

impl Discoverer {
    /// Load the cache persisted at `path`, or start empty. An empty path
    /// keeps the cache in memory only.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self::with_settings(path, DiscoverySettings::default())
    }

    pub fn with_settings(path: impl AsRef<Path>, settings: DiscoverySettings) -> Self {
        let path = path.as_ref();
        let (table, storage) = if path.as_os_str().is_empty() {
            (CacheTable::new(), None)
        } else {
            (CacheTable::load(path), Some(path.to_path_buf()))
        };

        Self {
            cache: CacheHandle::spawn(table),
            storage,
            settings,
        }
    }

    /// Run one query round for `service_type` and cache every match.
    /// Returns how many entries were stored. Nothing is written to disk.
    pub async fn discover(&self, service_type: &str, timeout: Duration) -> Result<usize, ClientError> {
        self.store_round(service_type, timeout, |params, entries| async move {
            lookup(&params, &entries).await
        })
        .await
    }

    /// Same as [`Discoverer::discover`] on a caller-owned client
    pub async fn discover_with(
        &self,
        client: &MdnsClient,
        service_type: &str,
        timeout: Duration,
    ) -> Result<usize, ClientError> {
        self.store_round(service_type, timeout, |params, entries| async move {
            client.query(&params, &entries).await
        })
        .await
    }

    fn params(&self, service_type: &str, timeout: Duration) -> QueryParams {
        QueryParams {
            domain: self.settings.domain.clone(),
            timeout,
            want_unicast_response: self.settings.want_unicast_response,
            interface: self.settings.interface,
            ..QueryParams::new(service_type)
        }
    }

    /// Drive `round` while a consumer task stores its results. The round owns
    /// the sender, so the consumer ends when the round does.
    async fn store_round<F, Fut>(
        &self,
        service_type: &str,
        timeout: Duration,
        round: F,
    ) -> Result<usize, ClientError>
    where
        F: FnOnce(QueryParams, mpsc::Sender<ServiceRecord>) -> Fut,
        Fut: Future<Output = Result<RoundReport, ClientError>>,
    {
        let (entries_tx, entries_rx) = mpsc::channel(self.settings.result_capacity);
        let suffix = service_address(service_type, &self.settings.domain);

        let consumer = tokio::spawn(store_matches(
            self.cache.clone(),
            entries_rx,
            service_type.trim_matches('.').to_string(),
            suffix,
        ));

        let outcome = round(self.params(service_type, timeout), entries_tx).await;

        let stored = match consumer.await {
            Ok(stored) => stored,
            Err(e) => {
                tracing::error!("Discovery consumer task failed: {}", e);
                0
            }
        };

        outcome?;
        Ok(stored)
    }

    /// Evict expired entries and persist what is left. Failures are logged.
    pub async fn flush(&self) -> usize {
        match self.cache.flush(self.storage.clone()).await {
            Ok(remaining) => remaining,
            Err(e) => {
                tracing::error!("Failed to flush cache: {}", e);
                0
            }
        }
    }

    /// Cached services, ordered by host
    pub async fn entries(&self) -> Result<Vec<(String, CacheEntry)>> {
        self.cache.snapshot().await
    }

    pub async fn get(&self, host: &str) -> Result<Option<CacheEntry>> {
        self.cache.get(host.to_string()).await
    }

    pub fn storage(&self) -> Option<&Path> {
        self.storage.as_deref()
    }

    /// Stop the cache thread
    pub async fn shutdown(&self) -> Result<()> {
        self.cache.shutdown().await
    }
}

/// Drain completed records of one round into the cache, keeping only names
/// under `suffix`
async fn store_matches(
    cache: CacheHandle,
    mut entries: mpsc::Receiver<ServiceRecord>,
    service: String,
    suffix: String,
) -> usize {
    let mut stored = 0;

    while let Some(record) = entries.recv().await {
        if !record.name.ends_with(&suffix) {
            tracing::debug!("Ignoring {}, not under {}", record.name, suffix);
            continue;
        }

        let host = if record.host.is_empty() {
            record.name.clone()
        } else {
            record.host.clone()
        };
        tracing::debug!("Seeing {}", record.name);

        let entry = CacheEntry {
            name: record.name,
            addresses_v4: record.addresses_v4.into_iter().collect(),
            addresses_v6: record.addresses_v6.into_iter().collect(),
            port: record.port,
            timestamp: Utc::now(),
            text: record.text,
            ttl: record.ttl,
            service: service.clone(),
        };

        match cache.upsert(host, entry).await {
            Ok(()) => stored += 1,
            Err(e) => tracing::error!("Failed to cache service: {}", e),
        }
    }

    stored
}

/// Discover every configured service type each interval, flushing after
/// each pass and once more on shutdown
pub async fn run(
    discoverer: Arc<Discoverer>,
    config: DiscoveryConfig,
    cancel: CancellationToken,
) -> Result<()> {
    let mut interval = tokio::time::interval(config.interval());

    loop {
        tokio::select! {
            _ = interval.tick() => {
                for service_type in &config.service_types {
                    match discoverer.discover(service_type, config.timeout()).await {
                        Ok(stored) => tracing::info!("Discovered {} {} services", stored, service_type),
                        Err(e) => tracing::error!("Discovery of {} failed: {}", service_type, e),
                    }
                }
                discoverer.flush().await;
            }
            _ = cancel.cancelled() => {
                tracing::info!("Discovery loop shutting down");
                break;
            }
        }
    }

    discoverer.flush().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mdns::wire::testing::{a, ptr, response, srv, txt};
    use std::net::Ipv4Addr;
    use tokio::net::UdpSocket;

    async fn loopback_client() -> (MdnsClient, UdpSocket) {
        let unicast = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let multicast = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let responder = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let client = MdnsClient::from_sockets(unicast, multicast, responder.local_addr().unwrap());
        (client, responder)
    }

    /// Answer the first query with `answers`
    fn respond_once(responder: UdpSocket, answers: Vec<hickory_proto::rr::Record>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            let (_, from) = responder.recv_from(&mut buf).await.unwrap();
            responder.send_to(&response(answers), from).await.unwrap();
        })
    }

    fn complete(instance: &str, host: &str, last: u8) -> Vec<hickory_proto::rr::Record> {
        vec![
            srv(instance, host, 8080),
            txt(instance, &["v=1"]),
            a(host, Ipv4Addr::new(10, 0, 0, last)),
        ]
    }

    #[tokio::test]
    async fn test_discover_caches_by_host() {
        let discoverer = Discoverer::new("");
        let (client, responder) = loopback_client().await;

        let mut answers = vec![ptr("_http._tcp.local.", "web._http._tcp.local.")];
        answers.extend(complete("web._http._tcp.local.", "nas.local.", 5));
        let fake = respond_once(responder, answers);

        let stored = discoverer
            .discover_with(&client, "_http._tcp", Duration::from_millis(300))
            .await
            .unwrap();
        fake.await.unwrap();

        assert_eq!(stored, 1);
        let entry = discoverer.get("nas.local.").await.unwrap().unwrap();
        assert_eq!(entry.name, "web._http._tcp.local.");
        assert_eq!(entry.port, 8080);
        assert_eq!(entry.addresses_v4, vec![Ipv4Addr::new(10, 0, 0, 5)]);
        assert_eq!(entry.text, vec!["v=1".to_string()]);
        assert_eq!(entry.service, "_http._tcp");
        assert_eq!(entry.ttl, 120);
    }

    #[tokio::test]
    async fn test_discover_filters_other_service_types() {
        let discoverer = Discoverer::new("");
        let (client, responder) = loopback_client().await;

        let mut answers = complete("web._http._tcp.local.", "web.local.", 1);
        answers.extend(complete("box._ssh._tcp.local.", "box.local.", 2));
        let fake = respond_once(responder, answers);

        let stored = discoverer
            .discover_with(&client, "_http._tcp", Duration::from_millis(300))
            .await
            .unwrap();
        fake.await.unwrap();

        assert_eq!(stored, 1);
        let hosts: Vec<_> = discoverer.entries().await.unwrap().into_iter().map(|(h, _)| h).collect();
        assert_eq!(hosts, vec!["web.local.".to_string()]);
    }

    #[tokio::test]
    async fn test_latest_observation_wins() {
        let discoverer = Discoverer::new("");

        for (port, last) in [(8080u16, 1u8), (9090, 2)] {
            let (client, responder) = loopback_client().await;
            let fake = respond_once(
                responder,
                vec![
                    srv("web._http._tcp.local.", "web.local.", port),
                    txt("web._http._tcp.local.", &[]),
                    a("web.local.", Ipv4Addr::new(10, 0, 0, last)),
                ],
            );
            discoverer
                .discover_with(&client, "_http._tcp", Duration::from_millis(200))
                .await
                .unwrap();
            fake.await.unwrap();
        }

        let entry = discoverer.get("web.local.").await.unwrap().unwrap();
        assert_eq!(entry.port, 9090);
        assert_eq!(entry.addresses_v4, vec![Ipv4Addr::new(10, 0, 0, 2)]);
        assert!(entry.text.is_empty());
    }

    #[tokio::test]
    async fn test_empty_round_is_not_an_error() {
        let discoverer = Discoverer::new("");
        let (client, _responder) = loopback_client().await;

        let stored = discoverer
            .discover_with(&client, "_http._tcp", Duration::from_millis(100))
            .await
            .unwrap();

        assert_eq!(stored, 0);
        assert!(discoverer.entries().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_closed_client_surfaces_error() {
        let discoverer = Discoverer::new("");
        let (client, _responder) = loopback_client().await;
        client.close().await;

        let err = discoverer
            .discover_with(&client, "_http._tcp", Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Closed));
    }

    #[tokio::test]
    async fn test_flush_then_new_restores_cache() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("discoverd").join("cache.json");

        let discoverer = Discoverer::new(&path);
        let (client, responder) = loopback_client().await;
        let fake = respond_once(responder, complete("web._http._tcp.local.", "web.local.", 3));
        discoverer
            .discover_with(&client, "_http._tcp", Duration::from_millis(200))
            .await
            .unwrap();
        fake.await.unwrap();

        assert_eq!(discoverer.flush().await, 1);

        let restored = Discoverer::new(&path);
        assert_eq!(restored.entries().await.unwrap(), discoverer.entries().await.unwrap());
    }

    #[tokio::test]
    async fn test_corrupt_cache_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        std::fs::write(&path, "[1, 2").unwrap();

        let discoverer = Discoverer::new(&path);
        assert!(discoverer.entries().await.unwrap().is_empty());
        assert_eq!(discoverer.storage(), Some(path.as_path()));
    }

    #[tokio::test]
    async fn test_run_with_zero_interval_stops_on_cancel() {
        let discoverer = Arc::new(Discoverer::new(""));
        let config = DiscoveryConfig {
            service_types: vec![],
            interval_secs: 0,
            ..Default::default()
        };
        let cancel = CancellationToken::new();
        let loop_task = tokio::spawn(run(discoverer, config, cancel.clone()));

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        let outcome = tokio::time::timeout(Duration::from_secs(2), loop_task)
            .await
            .expect("discovery loop ignored cancellation")
            .unwrap();
        assert!(outcome.is_ok());
    }

    #[test]
    fn test_params_follow_settings() {
        let settings = DiscoverySettings {
            domain: "lan".to_string(),
            interface: Some(Ipv4Addr::new(192, 168, 0, 2)),
            want_unicast_response: true,
            result_capacity: 4,
        };
        let discoverer = Discoverer::with_settings("", settings);

        let params = discoverer.params("_ipp._tcp", Duration::from_millis(750));
        assert_eq!(params.service, "_ipp._tcp");
        assert_eq!(params.domain, "lan");
        assert_eq!(params.timeout, Duration::from_millis(750));
        assert_eq!(params.interface, Some(Ipv4Addr::new(192, 168, 0, 2)));
        assert!(params.want_unicast_response);
    }

    #[test]
    fn test_settings_from_config() {
        let config = DiscoveryConfig {
            interface: Some("10.9.8.7".to_string()),
            want_unicast_response: true,
            result_capacity: 0,
            ..Default::default()
        };

        let settings = DiscoverySettings::from_config(&config);
        assert_eq!(settings.interface, Some(Ipv4Addr::new(10, 9, 8, 7)));
        assert!(settings.want_unicast_response);
        assert_eq!(settings.result_capacity, 1);
        assert_eq!(settings.domain, "local");
    }
}
