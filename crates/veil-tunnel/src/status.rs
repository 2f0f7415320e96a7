//! Tunnel status value.
//!
//! Replaced wholesale on every transition; never mutated field by field.
//! Exactly one of the named constructors describes the session at any
//! time, and `active` and `in_progress` are never both set.

use serde::Serialize;

pub type GatewayId = String;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TunnelStatus {
    /// The interface is up and traffic is being intercepted.
    pub active: bool,
    /// A control operation is in flight; callers must hold off.
    pub in_progress: bool,
    /// DNS goes through the encrypted proxy.
    pub use_encrypted_dns: bool,
    /// Set only while routed through a remote gateway.
    pub gateway_id: Option<GatewayId>,
    pub error: Option<String>,
    pub pause_seconds: u32,
}

impl TunnelStatus {
    pub fn off() -> Self {
        Self {
            active: false,
            in_progress: false,
            use_encrypted_dns: false,
            gateway_id: None,
            error: None,
            pause_seconds: 0,
        }
    }

    pub fn in_progress() -> Self {
        Self {
            in_progress: true,
            ..Self::off()
        }
    }

    pub fn filtering_only(use_encrypted_dns: bool) -> Self {
        Self {
            active: true,
            use_encrypted_dns,
            ..Self::off()
        }
    }

    pub fn connected(gateway_id: GatewayId) -> Self {
        Self {
            active: true,
            gateway_id: Some(gateway_id),
            ..Self::off()
        }
    }

    pub fn no_permissions() -> Self {
        Self {
            error: Some("no permission to open the virtual interface".to_string()),
            ..Self::off()
        }
    }

    pub fn error(reason: impl Into<String>) -> Self {
        Self {
            error: Some(reason.into()),
            ..Self::off()
        }
    }
}
