//! Contracts the engine expects from the platform layer.

use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::os::fd::RawFd;

/// One open virtual-interface device.
///
/// Reads yield whole outbound IP packets; writes inject whole response
/// packets back into the system stack. The descriptor must be
/// non-blocking — the loop only reads after readiness and drains until
/// `WouldBlock`.
///
/// Dropping the device releases the loop's handles on the descriptors;
/// tearing down the interface itself is the provider's job.
pub trait TunDevice: Send {
    /// Descriptor registered with the readiness poll.
    fn raw_fd(&self) -> RawFd;

    fn read_packet(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    fn write_packet(&mut self, buf: &[u8]) -> io::Result<usize>;
}

/// Creates the ephemeral forwarding sockets.
///
/// Each socket must come back freshly bound and protected, so its traffic
/// bypasses the virtual interface and reaches the real network directly.
pub trait SocketFactory: Send + Sync {
    fn protected_socket(&self) -> io::Result<UdpSocket>;
}

/// Encrypted transport interposed in routed ("plus") mode.
///
/// The engine never sees key material or the cipher; it hands plaintext
/// payloads to `seal` and sealed replies to `open`. The implementation is
/// an external cryptographic library bound to one gateway.
pub trait TunnelTransport: Send + Sync {
    /// Gateway endpoint sealed datagrams are sent to.
    fn endpoint(&self) -> SocketAddr;

    fn seal(&self, payload: &[u8]) -> io::Result<Vec<u8>>;

    fn open(&self, sealed: &[u8]) -> io::Result<Vec<u8>>;
}
