use std::net::Ipv4Addr;

/// IPv4 mDNS multicast group
pub const MDNS_IPV4_GROUP: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 251);

/// mDNS port
pub const MDNS_PORT: u16 = 5353;

/// Domain appended to service types when none is given
pub const DEFAULT_DOMAIN: &str = "local";

/// Cache entries older than this are evicted on load and flush
pub const CACHE_EXPIRATION_SECS: i64 = 600;

/// Builds the DNS-SD browse name, e.g. "_http._tcp" + "local" -> "_http._tcp.local."
pub fn service_address(service: &str, domain: &str) -> String {
    format!("{}.{}.", service.trim_matches('.'), domain.trim_matches('.'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_address_trims_dots() {
        assert_eq!(service_address("_http._tcp", "local"), "_http._tcp.local.");
        assert_eq!(service_address("._http._tcp.", ".local."), "_http._tcp.local.");
    }
}
