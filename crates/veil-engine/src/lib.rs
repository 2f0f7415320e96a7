//! veil Packet Engine
//!
//! The forwarding core of the interception layer. One dedicated thread per
//! session runs a poll-driven loop over the virtual interface and a bounded
//! set of ephemeral forwarding sockets:
//!
//! 1. Device readable → parse outbound IP/UDP packet
//! 2. DNS queries → host filter verdict (blocked queries are answered
//!    with NXDOMAIN in place)
//! 3. Forwarded datagrams → fresh protected socket, tracked until the
//!    reply arrives
//! 4. Socket readable → rewrite the reply into a checksummed IP frame
//!    addressed back to the original sender, write it to the device
//!
//! A health monitor brackets every iteration and every DNS round trip;
//! threshold breaches and unexpected loop exits surface on the engine
//! event channel for the tunnel controller to act on.

mod device;
mod error;
mod event;
mod forwarder;
mod health;
mod packet;
mod packet_loop;

pub use device::{SocketFactory, TunDevice, TunnelTransport};
pub use error::EngineError;
pub use event::{EngineEvent, event_channel};
pub use forwarder::{DEFAULT_MAX_FORWARDS, Forwarder, ForwardingEntry};
pub use health::{HealthConfig, HealthMonitor, RTT_UNKNOWN_MS, RttHandle};
pub use packet::{DeviceEvent, DnsQuery, DnsRedirect, Envelope, PacketTranslator, PlainDatagram};
pub use packet_loop::{LoopMode, PacketLoopConfig, PacketLoopHandle, spawn_packet_loop};
