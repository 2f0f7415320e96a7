//! veil Tunnel Controller
//!
//! Session lifecycle for the interception engine:
//! - Opens and closes the virtual interface with mode-specific
//!   configuration (addresses, routes, DNS, MTU, bypass list)
//! - Starts and stops the packet loop, and the encrypted-DNS proxy
//!   around it
//! - Sequences the routed ("plus") connect/disconnect sub-state over a
//!   lease and gateway
//! - Serializes restarts, including the settling delay the platform's
//!   asynchronous interface teardown requires
//! - Converts health verdicts and platform revocations into recovery
//!   and owner notifications

mod config;
mod configurator;
mod controller;
mod device;
mod dns;
mod dns_proxy;
mod error;
mod keys;
mod model;
mod status;

pub use config::{ConfigSource, ControllerConfig};
pub use configurator::{FILTERING_IPV4_FALLBACK, InterfaceConfig, MTU};
pub use controller::{ControllerDeps, Flavor, TunnelController, TunnelEvent};
pub use device::{InterfaceError, InterfaceEvent, InterfaceProvider, TransportFactory};
pub use dns::{DOH_PROXY_ADDR, DnsSpec, MappedDns, map_dns};
pub use dns_proxy::DnsProxy;
pub use error::TunnelError;
pub use keys::{KeyError, KeyPair, PrivateKey, PublicKey};
pub use model::{Gateway, Lease, PlusConfig};
pub use status::{GatewayId, TunnelStatus};
