//! Platform contracts: the virtual-interface provider and the encrypted
//! transport factory.

use crate::configurator::InterfaceConfig;
use crate::keys::PrivateKey;
use crate::model::Gateway;
use std::io;
use std::sync::Arc;
use thiserror::Error;
use veil_engine::{TunDevice, TunnelTransport};

#[derive(Debug, Error)]
pub enum InterfaceError {
    /// The platform refused to create the interface (missing VPN
    /// permission or user revocation).
    #[error("no permission to open the virtual interface")]
    NoPermissions,

    #[error("{0}")]
    Establish(String),
}

/// The OS-provided virtual interface.
///
/// `open` establishes the interface with a mode-specific configuration;
/// `device` hands out a fresh descriptor handle to the open interface and
/// may be called once per packet-loop session. Asynchronous teardown
/// (user revocation, platform death) is delivered as an
/// [`InterfaceEvent`] on the channel the app wires to the controller.
pub trait InterfaceProvider: Send + Sync {
    fn open(&self, config: &InterfaceConfig) -> Result<(), InterfaceError>;

    fn device(&self) -> Result<Box<dyn TunDevice>, InterfaceError>;

    fn close(&self);
}

/// Notifications from the interface provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InterfaceEvent {
    /// The interface went away. `reason` is set when the teardown was not
    /// requested (revocation); `None` for a normal close.
    Closed { reason: Option<String> },
}

/// Opens the encrypted transport for routed mode. The implementation is
/// the external cryptographic library; the controller only passes the
/// lease key and the chosen gateway through.
pub trait TransportFactory: Send + Sync {
    fn open_tunnel(
        &self,
        private_key: &PrivateKey,
        gateway: &Gateway,
    ) -> io::Result<Arc<dyn TunnelTransport>>;
}
