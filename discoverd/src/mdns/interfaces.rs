use std::io;
use std::net::Ipv4Addr;
use if_addrs::IfAddr;

/// An IPv4 interface able to carry multicast traffic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetInterface {
    pub name: String,
    pub addr: Ipv4Addr,
}

/// Non-loopback IPv4 interfaces with a broadcast address. Point-to-point
/// links have none and are skipped.
pub fn eligible_ipv4() -> io::Result<Vec<NetInterface>> {
    let interfaces = if_addrs::get_if_addrs()?
        .into_iter()
        .filter(|iface| !iface.is_loopback())
        .filter_map(|iface| match iface.addr {
            IfAddr::V4(v4) if v4.broadcast.is_some() => {
                tracing::debug!("Found eligible interface {} ({})", iface.name, v4.ip);
                Some(NetInterface {
                    name: iface.name,
                    addr: v4.ip,
                })
            }
            _ => None,
        })
        .collect();

    Ok(interfaces)
}

/// Resolve an interface given either by name ("eth0") or by one of its
/// IPv4 addresses
pub fn resolve(name_or_addr: &str) -> io::Result<Ipv4Addr> {
    if let Ok(addr) = name_or_addr.parse::<Ipv4Addr>() {
        return Ok(addr);
    }

    eligible_ipv4()?
        .into_iter()
        .find(|iface| iface.name == name_or_addr)
        .map(|iface| iface.addr)
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no eligible IPv4 interface named {}", name_or_addr),
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_address_literal() {
        assert_eq!(resolve("192.168.1.20").unwrap(), Ipv4Addr::new(192, 168, 1, 20));
    }

    #[test]
    fn test_eligible_excludes_loopback() {
        let interfaces = eligible_ipv4().unwrap();
        assert!(interfaces.iter().all(|iface| !iface.addr.is_loopback()));
    }

    #[test]
    fn test_resolve_unknown_name() {
        let err = resolve("no-such-interface0").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
