use std::path::{Path, PathBuf};
use std::time::Duration;
use serde::Deserialize;
use anyhow::{Context, Result};
use shared::protocol::DEFAULT_DOMAIN;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    /// Present only when this host announces a service
    pub announce: Option<AnnounceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiscoveryConfig {
    /// Empty disables persistence
    #[serde(default = "default_cache_path")]
    pub cache_path: PathBuf,
    #[serde(default = "default_service_types")]
    pub service_types: Vec<String>,
    #[serde(default = "default_domain")]
    pub domain: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Pause between discovery rounds
    #[serde(default = "default_interval")]
    pub interval_secs: u64,
    #[serde(default)]
    pub want_unicast_response: bool,
    /// Interface name or IPv4 address; system default when unset
    #[serde(default)]
    pub interface: Option<String>,
    /// Completed records buffered per round before new ones are dropped
    #[serde(default = "default_result_capacity")]
    pub result_capacity: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AnnounceConfig {
    /// Instance name, e.g. "printer"
    pub name: String,
    /// e.g. "_ipp._tcp"
    pub service_type: String,
    /// Host name to advertise; the system hostname when unset
    #[serde(default)]
    pub host: Option<String>,
    pub port: u16,
    /// TXT strings, "key=value"
    #[serde(default)]
    pub txt: Vec<String>,
}

fn default_cache_path() -> PathBuf {
    PathBuf::from("/var/lib/mdns-discoverd/cache.json")
}

fn default_service_types() -> Vec<String> {
    vec!["_http._tcp".to_string()]
}

fn default_domain() -> String {
    DEFAULT_DOMAIN.to_string()
}

fn default_timeout_ms() -> u64 {
    1000
}

fn default_interval() -> u64 {
    60
}

fn default_result_capacity() -> usize {
    32
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            cache_path: default_cache_path(),
            service_types: default_service_types(),
            domain: default_domain(),
            timeout_ms: default_timeout_ms(),
            interval_secs: default_interval(),
            want_unicast_response: false,
            interface: None,
            result_capacity: default_result_capacity(),
        }
    }
}

impl DiscoveryConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Time between discovery passes, never less than one second
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::parse("").unwrap();

        assert_eq!(config.discovery.service_types, vec!["_http._tcp".to_string()]);
        assert_eq!(config.discovery.domain, "local");
        assert_eq!(config.discovery.timeout(), Duration::from_secs(1));
        assert_eq!(config.discovery.result_capacity, 32);
        assert!(config.discovery.interface.is_none());
        assert!(config.announce.is_none());
    }

    #[test]
    fn test_full_config() {
        let config = Config::parse(
            r#"
            [discovery]
            cache_path = "/tmp/cache.json"
            service_types = ["_ipp._tcp", "_ssh._tcp"]
            timeout_ms = 2500
            interval_secs = 30
            want_unicast_response = true
            interface = "eth0"
            result_capacity = 4

            [announce]
            name = "printer"
            service_type = "_ipp._tcp"
            port = 631
            txt = ["rp=printers/lab", "ty=Laser"]
            "#,
        )
        .unwrap();

        assert_eq!(config.discovery.cache_path, PathBuf::from("/tmp/cache.json"));
        assert_eq!(config.discovery.service_types.len(), 2);
        assert_eq!(config.discovery.timeout(), Duration::from_millis(2500));
        assert_eq!(config.discovery.interval(), Duration::from_secs(30));
        assert!(config.discovery.want_unicast_response);
        assert_eq!(config.discovery.interface.as_deref(), Some("eth0"));

        let announce = config.announce.unwrap();
        assert_eq!(announce.port, 631);
        assert!(announce.host.is_none());
        assert_eq!(announce.txt.len(), 2);
    }

    #[test]
    fn test_zero_interval_is_raised_to_one_second() {
        let config = Config::parse(
            r#"
            [discovery]
            interval_secs = 0
            "#,
        )
        .unwrap();

        assert_eq!(config.discovery.interval_secs, 0);
        assert_eq!(config.discovery.interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_announce_requires_port() {
        let result = Config::parse(
            r#"
            [announce]
            name = "printer"
            service_type = "_ipp._tcp"
            "#,
        );
        assert!(result.is_err());
    }
}
