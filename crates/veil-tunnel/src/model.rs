//! Lease and gateway models.
//!
//! Both arrive as JSON from the account backend; the controller only
//! consumes them for mode selection and routed-mode addressing.

use crate::keys::PrivateKey;
use crate::status::GatewayId;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// A time-bounded grant binding an account and device key to a gateway.
/// Presence of a lease selects routed ("plus") mode and supplies the
/// session's virtual addresses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub account_id: String,
    /// Device public key the lease was created for, base64.
    pub public_key: String,
    pub gateway_id: GatewayId,
    /// RFC 3339 expiry timestamp.
    pub expires: String,
    /// Virtual IPv4 assigned to this device.
    pub vip4: Ipv4Addr,
    /// Virtual IPv6 assigned to this device.
    pub vip6: Ipv6Addr,
}

/// A remote gateway as listed by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Gateway {
    /// The gateway's public key doubles as its id.
    pub public_key: GatewayId,
    pub region: String,
    pub ipv4: Ipv4Addr,
    pub ipv6: Ipv6Addr,
    pub port: u16,
}

impl Gateway {
    pub fn endpoint(&self) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(self.ipv4), self.port)
    }
}

/// Everything `connect` needs to route through a gateway.
#[derive(Debug, Clone)]
pub struct PlusConfig {
    pub private_key: PrivateKey,
    pub gateway: Option<Gateway>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_deserializes_from_backend_json() {
        let json = r#"{
            "account_id": "a1b2c3",
            "public_key": "WDvCRKv9hVAx1P3L7dKxiNxI3CxbK9Ue1tL8x2ZqRVk=",
            "gateway_id": "gw-frankfurt-1",
            "expires": "2026-09-01T00:00:00Z",
            "vip4": "10.143.0.42",
            "vip6": "fdaa::2a"
        }"#;

        let lease: Lease = serde_json::from_str(json).unwrap();
        assert_eq!(lease.gateway_id, "gw-frankfurt-1");
        assert_eq!(lease.vip4, Ipv4Addr::new(10, 143, 0, 42));
    }

    #[test]
    fn test_gateway_endpoint() {
        let gateway = Gateway {
            public_key: "pk".to_string(),
            region: "de-fra".to_string(),
            ipv4: Ipv4Addr::new(185, 186, 78, 1),
            ipv6: "2a03::1".parse().unwrap(),
            port: 51820,
        };

        assert_eq!(gateway.endpoint().port(), 51820);
    }
}
