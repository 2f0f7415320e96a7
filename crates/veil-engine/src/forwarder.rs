//! Bounded table of in-flight forwarding sockets.
//!
//! One entry per forwarded datagram still waiting for its reply. The table
//! exclusively owns each socket and the matching origin envelope until the
//! entry is taken for the receive-then-close sequence, or until teardown
//! closes everything.

use crate::packet::Envelope;
use mio::net::UdpSocket;
use mio::{Registry, Token};
use tracing::debug;

/// Default cap on concurrently tracked sockets. Beyond this the poll set
/// would grow without bound under reply loss.
pub const DEFAULT_MAX_FORWARDS: usize = 256;

#[derive(Debug)]
pub struct ForwardingEntry {
    pub socket: UdpSocket,
    pub envelope: Envelope,
    pub token: Token,
    /// DNS transaction id when the forwarded datagram was a query.
    pub sequence: Option<u16>,
}

pub struct Forwarder {
    entries: Vec<ForwardingEntry>,
    capacity: usize,
}

impl Forwarder {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::new(),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Track a new in-flight socket. Returns the entry back when the table
    /// is at capacity so the caller can dispose of it.
    pub fn add(&mut self, entry: ForwardingEntry) -> Result<(), ForwardingEntry> {
        if self.entries.len() >= self.capacity {
            return Err(entry);
        }
        self.entries.push(entry);
        Ok(())
    }

    /// Remove the entry registered under `token`, if still tracked.
    pub fn take(&mut self, token: Token) -> Option<ForwardingEntry> {
        let index = self.entries.iter().position(|e| e.token == token)?;
        Some(self.entries.swap_remove(index))
    }

    /// Deregister and close every tracked socket. Runs unconditionally at
    /// loop teardown; broken sockets are tolerated.
    pub fn close_all(&mut self, registry: &Registry) {
        if !self.entries.is_empty() {
            debug!("Closing {} in-flight forwarding sockets", self.entries.len());
        }
        for mut entry in self.entries.drain(..) {
            let _ = registry.deregister(&mut entry.socket);
            // Dropping the socket closes it.
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    fn entry(token: usize) -> ForwardingEntry {
        let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        socket.set_nonblocking(true).unwrap();
        let src: SocketAddr = "10.0.0.2:40000".parse().unwrap();
        let dst: SocketAddr = "1.1.1.1:53".parse().unwrap();
        ForwardingEntry {
            socket: UdpSocket::from_std(socket),
            envelope: Envelope { src, dst },
            token: Token(token),
            sequence: Some(token as u16),
        }
    }

    #[test]
    fn test_add_and_take_by_token() {
        let mut forwarder = Forwarder::new(8);
        forwarder.add(entry(2)).unwrap();
        forwarder.add(entry(3)).unwrap();
        assert_eq!(forwarder.len(), 2);

        let taken = forwarder.take(Token(2)).unwrap();
        assert_eq!(taken.sequence, Some(2));
        assert_eq!(forwarder.len(), 1);

        assert!(forwarder.take(Token(2)).is_none());
    }

    #[test]
    fn test_capacity_rejects_entry() {
        let mut forwarder = Forwarder::new(1);
        forwarder.add(entry(2)).unwrap();

        let rejected = forwarder.add(entry(3));
        assert!(rejected.is_err());
        assert_eq!(forwarder.len(), 1);
    }

    #[test]
    fn test_close_all_empties_table() {
        let registry_poll = mio::Poll::new().unwrap();
        let mut forwarder = Forwarder::new(8);
        forwarder.add(entry(2)).unwrap();
        forwarder.add(entry(3)).unwrap();

        // Sockets were never registered; deregister failures are tolerated.
        forwarder.close_all(registry_poll.registry());
        assert!(forwarder.is_empty());
    }
}
