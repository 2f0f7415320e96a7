//! DNS selection and the in-tunnel resolver mapping.
//!
//! The interface cannot advertise arbitrary upstream resolvers — queries
//! have to land inside the intercepted range so the loop sees them. Each
//! upstream gets an index-mapped virtual address; the redirect table the
//! translator applies undoes the mapping on the way out, either to the
//! real upstream or to the local encrypted-DNS proxy.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use veil_engine::DnsRedirect;

/// Virtual resolver subnet advertised to the interface; the last octet is
/// the 1-based upstream index.
const DNS_MAP_TEMPLATE: [u8; 4] = [10, 154, 154, 0];

/// Where the local encrypted-DNS proxy listens.
pub const DOH_PROXY_ADDR: SocketAddr =
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 5301);

const DNS_PORT: u16 = 53;

/// One selectable DNS configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsSpec {
    pub id: String,
    /// Upstream addresses, in preference order.
    pub addresses: Vec<IpAddr>,
    /// HTTPS endpoint when the resolver speaks DNS-over-HTTPS.
    pub doh_url: Option<String>,
}

impl DnsSpec {
    pub fn supports_doh(&self) -> bool {
        self.doh_url.is_some()
    }

    /// IPv4 upstreams only; the mapped range is IPv4.
    pub fn ipv4_addresses(&self) -> impl Iterator<Item = Ipv4Addr> + '_ {
        self.addresses.iter().filter_map(|addr| match addr {
            IpAddr::V4(v4) => Some(*v4),
            IpAddr::V6(_) => None,
        })
    }
}

impl Default for DnsSpec {
    fn default() -> Self {
        Self {
            id: "cloudflare".to_string(),
            addresses: vec![
                IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)),
                IpAddr::V4(Ipv4Addr::new(1, 0, 0, 1)),
            ],
            doh_url: Some("https://cloudflare-dns.com/dns-query".to_string()),
        }
    }
}

/// The virtual servers to advertise plus the redirect that maps them back.
pub struct MappedDns {
    pub servers: Vec<IpAddr>,
    pub redirect: DnsRedirect,
}

/// Build the mapped resolver set for one session.
///
/// With `use_doh` every mapped address lands on the local proxy;
/// otherwise each maps to its real upstream on port 53.
pub fn map_dns(dns: &DnsSpec, use_doh: bool) -> MappedDns {
    let mut servers = Vec::new();
    let mut entries = Vec::new();

    for (index, upstream) in dns.ipv4_addresses().enumerate() {
        let mut octets = DNS_MAP_TEMPLATE;
        octets[3] = (index + 1) as u8;
        let mapped = IpAddr::V4(Ipv4Addr::from(octets));

        let real = if use_doh {
            DOH_PROXY_ADDR
        } else {
            SocketAddr::new(IpAddr::V4(upstream), DNS_PORT)
        };

        servers.push(mapped);
        entries.push((mapped, real));
    }

    MappedDns {
        servers,
        redirect: DnsRedirect::new(entries),
    }
}
