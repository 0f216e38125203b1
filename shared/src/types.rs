use std::net::{Ipv4Addr, Ipv6Addr};
use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};

/// A service as remembered by the discovery cache.
/// Keyed by the resolved host (SRV target) in the cache table; empty fields
/// are left out of the persisted document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheEntry {
    /// Full DNS-SD instance name, e.g. "fileserver._http._tcp.local."
    #[serde(skip_serializing_if = "String::is_empty")]
    pub name: String,

    #[serde(rename = "ip4", skip_serializing_if = "Vec::is_empty")]
    pub addresses_v4: Vec<Ipv4Addr>,

    /// Kept for AAAA answers; the client itself only listens on IPv4
    #[serde(rename = "ip6", skip_serializing_if = "Vec::is_empty")]
    pub addresses_v6: Vec<Ipv6Addr>,

    #[serde(skip_serializing_if = "is_zero_port")]
    pub port: u16,

    /// When this entry was last observed
    pub timestamp: DateTime<Utc>,

    /// TXT strings in wire order
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub text: Vec<String>,

    /// Advertised record TTL in seconds (not the cache expiry)
    #[serde(rename = "TTL", skip_serializing_if = "is_zero_ttl")]
    pub ttl: u32,

    /// Service type this entry was discovered under, e.g. "_http._tcp"
    #[serde(skip_serializing_if = "String::is_empty")]
    pub service: String,
}

impl CacheEntry {
    /// Age of the entry relative to `now`
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.timestamp
    }
}

fn is_zero_port(port: &u16) -> bool {
    *port == 0
}

fn is_zero_ttl(ttl: &u32) -> bool {
    *ttl == 0
}
