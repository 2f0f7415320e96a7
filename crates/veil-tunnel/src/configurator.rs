//! Mode-specific interface configuration.
//!
//! Filtering modes use documentation address space — the interface is a
//! sink for DNS, not a real network. Routed mode uses the lease's virtual
//! addresses and routes only public IPv4 space, so local traffic never
//! enters the tunnel.

use crate::model::Lease;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use tracing::debug;

pub const MTU: u16 = 1280;

/// TEST-NET range from RFC 5735.
const FILTERING_IPV4: Ipv4Addr = Ipv4Addr::new(203, 0, 113, 69);

/// Some devices reject TEST-NET addressing; providers may substitute this
/// when the platform refuses [`InterfaceConfig::addresses`].
pub const FILTERING_IPV4_FALLBACK: Ipv4Addr = Ipv4Addr::new(192, 168, 50, 1);

/// Documentation prefix from RFC 3849.
const FILTERING_IPV6: Ipv6Addr = Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 0);

/// Everything public, nothing private: IPv4 space minus RFC 1918, link
/// local, loopback and friends.
const IPV4_PUBLIC_NETWORKS: &[(Ipv4Addr, u8)] = &[
    (Ipv4Addr::new(0, 0, 0, 0), 5),
    (Ipv4Addr::new(8, 0, 0, 0), 7),
    (Ipv4Addr::new(11, 0, 0, 0), 8),
    (Ipv4Addr::new(12, 0, 0, 0), 6),
    (Ipv4Addr::new(16, 0, 0, 0), 4),
    (Ipv4Addr::new(32, 0, 0, 0), 3),
    (Ipv4Addr::new(64, 0, 0, 0), 2),
    (Ipv4Addr::new(128, 0, 0, 0), 3),
    (Ipv4Addr::new(160, 0, 0, 0), 5),
    (Ipv4Addr::new(168, 0, 0, 0), 6),
    (Ipv4Addr::new(172, 0, 0, 0), 12),
    (Ipv4Addr::new(172, 32, 0, 0), 11),
    (Ipv4Addr::new(172, 64, 0, 0), 10),
    (Ipv4Addr::new(172, 128, 0, 0), 9),
    (Ipv4Addr::new(173, 0, 0, 0), 8),
    (Ipv4Addr::new(174, 0, 0, 0), 7),
    (Ipv4Addr::new(176, 0, 0, 0), 4),
    (Ipv4Addr::new(192, 0, 0, 0), 9),
    (Ipv4Addr::new(192, 128, 0, 0), 11),
    (Ipv4Addr::new(192, 160, 0, 0), 13),
    (Ipv4Addr::new(192, 169, 0, 0), 16),
    (Ipv4Addr::new(192, 170, 0, 0), 15),
    (Ipv4Addr::new(192, 172, 0, 0), 14),
    (Ipv4Addr::new(192, 176, 0, 0), 12),
    (Ipv4Addr::new(192, 192, 0, 0), 10),
    (Ipv4Addr::new(193, 0, 0, 0), 8),
    (Ipv4Addr::new(194, 0, 0, 0), 7),
    (Ipv4Addr::new(196, 0, 0, 0), 6),
    (Ipv4Addr::new(200, 0, 0, 0), 5),
    (Ipv4Addr::new(208, 0, 0, 0), 4),
];

/// What the platform needs to establish one interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceConfig {
    pub session_name: String,
    pub addresses: Vec<(IpAddr, u8)>,
    pub routes: Vec<(IpAddr, u8)>,
    pub dns_servers: Vec<IpAddr>,
    pub mtu: u16,
    /// Let apps opt out of interception entirely. Filtering modes only;
    /// better to let ads through than to break an app.
    pub allow_bypass: bool,
    pub bypassed_apps: Vec<String>,
}

/// Configuration for the filtering-only modes.
///
/// `route_dns` adds a host route per advertised resolver so only DNS is
/// pulled into the interface; the minimal variant skips the routes.
pub fn for_filtering(
    dns_servers: &[IpAddr],
    ipv6: bool,
    route_dns: bool,
    bypassed_apps: Vec<String>,
) -> InterfaceConfig {
    debug!("Configuring interface for filtering mode");

    let mut addresses = vec![(IpAddr::V4(FILTERING_IPV4), 24)];
    if ipv6 {
        addresses.push((IpAddr::V6(FILTERING_IPV6), 120));
    }

    let routes = if route_dns {
        dns_servers.iter().map(|addr| (*addr, 32)).collect()
    } else {
        Vec::new()
    };

    InterfaceConfig {
        session_name: "veil".to_string(),
        addresses,
        routes,
        dns_servers: dns_servers.to_vec(),
        mtu: MTU,
        allow_bypass: true,
        bypassed_apps,
    }
}

/// Configuration for routed ("plus") mode, addressed by the lease.
pub fn for_plus(
    lease: &Lease,
    dns_servers: &[IpAddr],
    ipv6: bool,
    bypassed_apps: Vec<String>,
) -> InterfaceConfig {
    debug!("Configuring interface for plus mode");

    let mut addresses = vec![(IpAddr::V4(lease.vip4), 32)];
    if ipv6 {
        addresses.push((IpAddr::V6(lease.vip6), 128));
    }

    let mut routes: Vec<(IpAddr, u8)> = IPV4_PUBLIC_NETWORKS
        .iter()
        .map(|(net, prefix)| (IpAddr::V4(*net), *prefix))
        .collect();
    // The mapped resolvers live in private space the public list skips.
    routes.extend(dns_servers.iter().map(|addr| (*addr, 32)));
    if ipv6 {
        routes.push((IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0));
    }

    InterfaceConfig {
        session_name: "veil".to_string(),
        addresses,
        routes,
        dns_servers: dns_servers.to_vec(),
        mtu: MTU,
        allow_bypass: false,
        bypassed_apps,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lease() -> Lease {
        Lease {
            account_id: "acc".to_string(),
            public_key: "pk".to_string(),
            gateway_id: "gw".to_string(),
            expires: "2026-09-01T00:00:00Z".to_string(),
            vip4: Ipv4Addr::new(10, 143, 0, 42),
            vip6: "fdaa::2a".parse().unwrap(),
        }
    }

    #[test]
    fn test_filtering_config_uses_test_net() {
        let servers = vec![IpAddr::V4(Ipv4Addr::new(10, 154, 154, 1))];
        let config = for_filtering(&servers, false, true, Vec::new());

        assert_eq!(config.addresses, vec![(IpAddr::V4(FILTERING_IPV4), 24)]);
        // Only the resolver is routed in; everything else stays outside.
        assert_eq!(config.routes, vec![(servers[0], 32)]);
        assert!(config.allow_bypass);
        assert_eq!(config.mtu, MTU);
    }

    #[test]
    fn test_minimal_filtering_has_no_routes() {
        let servers = vec![IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1))];
        let config = for_filtering(&servers, false, false, Vec::new());

        assert!(config.routes.is_empty());
        assert_eq!(config.dns_servers, servers);
    }

    #[test]
    fn test_filtering_ipv6_address_is_optional() {
        let servers = vec![IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1))];

        assert_eq!(for_filtering(&servers, false, true, Vec::new()).addresses.len(), 1);
        assert_eq!(for_filtering(&servers, true, true, Vec::new()).addresses.len(), 2);
    }

    #[test]
    fn test_plus_config_uses_lease_addresses() {
        let servers = vec![IpAddr::V4(Ipv4Addr::new(10, 154, 154, 1))];
        let config = for_plus(&lease(), &servers, true, vec!["com.example.game".into()]);

        assert_eq!(config.addresses[0], (IpAddr::V4(Ipv4Addr::new(10, 143, 0, 42)), 32));
        assert_eq!(config.addresses[1].1, 128);
        assert!(!config.allow_bypass);
        assert_eq!(config.bypassed_apps.len(), 1);

        // Public networks, the mapped resolver, and the IPv6 default.
        assert!(config.routes.contains(&(servers[0], 32)));
        assert!(config.routes.contains(&(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0)));
        assert!(!config.routes.contains(&(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 0)), 8)));
    }
}
