//! The poll-driven forwarding loop.
//!
//! One dedicated thread per session. The poll set is the waker (the
//! control pipe), the device descriptor, and one entry per in-flight
//! forwarding socket. The sole suspension point is the indefinite poll;
//! everything else in an iteration runs to completion before the next
//! interruption check.

use crate::device::{SocketFactory, TunDevice, TunnelTransport};
use crate::error::EngineError;
use crate::event::EngineEvent;
use crate::forwarder::{DEFAULT_MAX_FORWARDS, Forwarder, ForwardingEntry};
use crate::health::{HealthConfig, HealthMonitor, RttHandle};
use crate::packet::{DeviceEvent, DnsQuery, DnsRedirect, Envelope, PacketTranslator};
use crossbeam_channel::Sender;
use mio::net::UdpSocket as MioUdpSocket;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, trace, warn};
use veil_filter::HostFilter;

const TOKEN_WAKER: Token = Token(0);
const TOKEN_DEVICE: Token = Token(1);
const FIRST_FORWARD_TOKEN: usize = 2;

const PACKET_BUFFER_SIZE: usize = 1600;

/// Iterations between housekeeping sweeps of the translator cache.
const PURGE_INTERVAL: u64 = 1024;

/// Operating mode of one loop session.
///
/// Filtering runs in every mode; the variants differ in the interface
/// configuration they pair with and, for `Plus`, the encrypted transport
/// interposed on forwarded traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopMode {
    /// Restricted filtering-only session.
    Minimal,
    /// Full filtering-only session.
    Full,
    /// Filtering plus routing through an encrypted remote gateway.
    Plus,
}

impl fmt::Display for LoopMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoopMode::Minimal => write!(f, "minimal"),
            LoopMode::Full => write!(f, "full"),
            LoopMode::Plus => write!(f, "plus"),
        }
    }
}

/// Per-session loop configuration.
#[derive(Debug, Clone)]
pub struct PacketLoopConfig {
    pub mode: LoopMode,
    /// Forced-resolver mapping applied to DNS destinations.
    pub redirect: Option<DnsRedirect>,
    pub health: HealthConfig,
    /// Cap on concurrently tracked forwarding sockets.
    pub max_forwards: usize,
}

impl Default for PacketLoopConfig {
    fn default() -> Self {
        Self {
            mode: LoopMode::Full,
            redirect: None,
            health: HealthConfig::default(),
            max_forwards: DEFAULT_MAX_FORWARDS,
        }
    }
}

/// Start the packet loop on its own thread.
///
/// The caller keeps at most one loop per session; the returned handle
/// stops it. `Plus` mode requires a transport.
pub fn spawn_packet_loop(
    device: Box<dyn TunDevice>,
    sockets: Arc<dyn SocketFactory>,
    filter: Arc<HostFilter>,
    config: PacketLoopConfig,
    transport: Option<Arc<dyn TunnelTransport>>,
    events: Sender<EngineEvent>,
) -> Result<PacketLoopHandle, EngineError> {
    if config.mode == LoopMode::Plus && transport.is_none() {
        return Err(EngineError::MissingTransport);
    }

    let poll = Poll::new()?;
    let waker = Arc::new(Waker::new(poll.registry(), TOKEN_WAKER)?);
    poll.registry()
        .register(&mut SourceFd(&device.raw_fd()), TOKEN_DEVICE, Interest::READABLE)?;

    let health = HealthMonitor::new(config.health, events.clone());
    let rtt = health.rtt_handle();
    let shutdown = Arc::new(AtomicBool::new(false));

    let worker = LoopWorker {
        mode: config.mode,
        poll,
        device,
        sockets,
        filter,
        translator: PacketTranslator::new(config.redirect),
        forwarder: Forwarder::new(config.max_forwards),
        health,
        transport,
        events_tx: events,
        shutdown: shutdown.clone(),
        next_token: FIRST_FORWARD_TOKEN,
        iterations: 0,
    };

    let thread = thread::Builder::new()
        .name("veil-packet-loop".into())
        .spawn(move || run(worker))?;

    Ok(PacketLoopHandle {
        thread: Some(thread),
        shutdown,
        waker,
        rtt,
    })
}

/// Owner-side handle to a running loop.
pub struct PacketLoopHandle {
    thread: Option<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
    waker: Arc<Waker>,
    rtt: RttHandle,
}

impl PacketLoopHandle {
    /// Request shutdown and wait for the loop thread to exit. Returns only
    /// after every forwarding socket is closed, so the interface can be
    /// torn down safely afterwards. Idempotent.
    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        let _ = self.waker.wake();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Last measured DNS round-trip time, for diagnostics.
    pub fn rtt_handle(&self) -> RttHandle {
        self.rtt.clone()
    }
}

impl Drop for PacketLoopHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

enum LoopExit {
    Requested,
    Failed(String),
}

struct LoopWorker {
    mode: LoopMode,
    poll: Poll,
    device: Box<dyn TunDevice>,
    sockets: Arc<dyn SocketFactory>,
    filter: Arc<HostFilter>,
    translator: PacketTranslator,
    forwarder: Forwarder,
    health: HealthMonitor,
    transport: Option<Arc<dyn TunnelTransport>>,
    events_tx: Sender<EngineEvent>,
    shutdown: Arc<AtomicBool>,
    next_token: usize,
    iterations: u64,
}

fn run(mut worker: LoopWorker) {
    info!("Started packet loop thread ({})", worker.mode);
    worker.health.start();

    let exit = panic::catch_unwind(AssertUnwindSafe(|| worker.run_loop()));

    worker.cleanup();

    match exit {
        Ok(LoopExit::Requested) => debug!("Packet loop stopped on request"),
        Ok(LoopExit::Failed(reason)) => {
            warn!("Packet loop stopped unexpectedly: {}", reason);
            let _ = worker
                .events_tx
                .try_send(EngineEvent::StoppedUnexpectedly { reason });
        }
        Err(panic) => {
            let reason = panic_message(panic);
            error!("Packet loop panicked: {}", reason);
            let _ = worker
                .events_tx
                .try_send(EngineEvent::StoppedUnexpectedly { reason });
        }
    }
}

impl LoopWorker {
    fn run_loop(&mut self) -> LoopExit {
        let mut events = Events::with_capacity(64);
        let mut ready_forwards = Vec::new();

        loop {
            self.health.on_loop_enter();
            if self.shutdown.load(Ordering::SeqCst) {
                return LoopExit::Requested;
            }

            match self.poll.poll(&mut events, None) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return LoopExit::Failed(format!("poll failed: {}", e)),
            }

            let mut woken = false;
            let mut device_ready = false;
            ready_forwards.clear();
            for event in events.iter() {
                match event.token() {
                    TOKEN_WAKER => woken = true,
                    TOKEN_DEVICE => device_ready = true,
                    token => ready_forwards.push(token),
                }
            }

            if woken || self.shutdown.load(Ordering::SeqCst) {
                return LoopExit::Requested;
            }

            // Replies first: each one frees its socket before new
            // forwards claim fresh ones.
            for token in ready_forwards.drain(..) {
                self.relay_response(token);
            }

            if device_ready {
                if let Err(reason) = self.drain_device() {
                    return LoopExit::Failed(reason);
                }
            }

            self.iterations += 1;
            if self.iterations % PURGE_INTERVAL == 0 {
                self.translator.maintain();
            }

            self.health.on_loop_exit();
        }
    }

    /// One forwarding socket became readable: receive the single expected
    /// reply, rewrite it at the device, and retire the socket.
    fn relay_response(&mut self, token: Token) {
        let Some(mut entry) = self.forwarder.take(token) else {
            return;
        };
        let _ = self.poll.registry().deregister(&mut entry.socket);

        let mut buf = [0u8; PACKET_BUFFER_SIZE];
        let received = match entry.socket.recv_from(&mut buf) {
            Ok((len, _)) => len,
            Err(e) => {
                debug!("Failed receiving socket: {}", e);
                self.health.on_recoverable_error(e);
                return;
            }
        };

        let opened;
        let payload: &[u8] = match &self.transport {
            Some(transport) => match transport.open(&buf[..received]) {
                Ok(plain) => {
                    opened = plain;
                    &opened
                }
                Err(e) => {
                    debug!("Failed opening sealed reply: {}", e);
                    self.health.on_recoverable_error(e);
                    return;
                }
            },
            None => &buf[..received],
        };

        match self.translator.to_device(payload, &entry.envelope) {
            Ok(frame) => match self.device.write_packet(&frame) {
                Ok(_) => {
                    if let Some(sequence) = entry.sequence {
                        self.health.on_dns_query_finished(sequence);
                    }
                }
                Err(e) => {
                    debug!("Failed writing reply to device: {}", e);
                    self.health.on_recoverable_error(e);
                }
            },
            Err(e) => debug!("Failed rewriting reply: {}", e),
        }
        // The entry drops here; its socket closes either way.
    }

    /// The device became readable: process every queued outbound packet.
    /// Readiness is edge-style, so reads continue until `WouldBlock`.
    fn drain_device(&mut self) -> Result<(), String> {
        let mut buf = [0u8; PACKET_BUFFER_SIZE];
        loop {
            match self.device.read_packet(&mut buf) {
                Ok(0) => {
                    if self.shutdown.load(Ordering::SeqCst) {
                        return Ok(());
                    }
                    return Err("device closed".into());
                }
                Ok(len) => self.handle_device_packet(len, &buf),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    // Read errors are expected while the session tears down.
                    if self.shutdown.load(Ordering::SeqCst) {
                        return Ok(());
                    }
                    return Err(format!("device read failed: {}", e));
                }
            }
        }
    }

    fn handle_device_packet(&mut self, len: usize, buf: &[u8; PACKET_BUFFER_SIZE]) {
        match self.translator.from_device(&buf[..len]) {
            DeviceEvent::Dns(query) => {
                if self.filter.classify(&query.host).is_denied() {
                    trace!("Dropping query for {}", query.host);
                    match self.translator.blocked_response(&query) {
                        Ok(reply) => {
                            if let Err(e) = self.device.write_packet(&reply) {
                                debug!("Failed writing blocked response: {}", e);
                                self.health.on_recoverable_error(e);
                            }
                        }
                        Err(e) => debug!("Failed synthesizing blocked response: {}", e),
                    }
                } else {
                    let DnsQuery {
                        envelope,
                        target,
                        payload,
                        sequence,
                        ..
                    } = query;
                    self.forward(payload, target, envelope, Some(sequence));
                }
            }
            DeviceEvent::Udp(datagram) => {
                let dst = datagram.envelope.dst;
                self.forward(datagram.payload, dst, datagram.envelope, None);
            }
            DeviceEvent::Ignored(reason) => trace!("Ignoring packet: {}", reason),
        }
    }

    /// Send one datagram to the real network on a fresh protected socket
    /// and track it until the reply comes back.
    fn forward(
        &mut self,
        payload: Vec<u8>,
        dst: SocketAddr,
        envelope: Envelope,
        sequence: Option<u16>,
    ) {
        let socket = match self.sockets.protected_socket() {
            Ok(socket) => socket,
            Err(e) => {
                debug!("Socket factory failed: {}", e);
                self.health.on_recoverable_error(e);
                return;
            }
        };
        if let Err(e) = socket.set_nonblocking(true) {
            debug!("Failed configuring forwarding socket: {}", e);
            self.health.on_recoverable_error(e);
            return;
        }
        let mut socket = MioUdpSocket::from_std(socket);

        let (wire, target) = match &self.transport {
            Some(transport) => match transport.seal(&payload) {
                Ok(sealed) => (sealed, transport.endpoint()),
                Err(e) => {
                    debug!("Failed sealing datagram: {}", e);
                    self.health.on_recoverable_error(e);
                    return;
                }
            },
            None => (payload, dst),
        };

        if let Err(e) = socket.send_to(&wire, target) {
            debug!("Failed sending datagram to {}: {}", target, e);
            self.health.on_recoverable_error(e);
            return;
        }

        let token = self.next_forward_token();
        if let Err(e) = self
            .poll
            .registry()
            .register(&mut socket, token, Interest::READABLE)
        {
            debug!("Failed registering forwarding socket: {}", e);
            self.health.on_recoverable_error(e);
            return;
        }

        let entry = ForwardingEntry {
            socket,
            envelope,
            token,
            sequence,
        };
        match self.forwarder.add(entry) {
            Ok(()) => {
                if let Some(sequence) = sequence {
                    self.health.on_dns_query_started(sequence);
                }
            }
            Err(mut rejected) => {
                let _ = self.poll.registry().deregister(&mut rejected.socket);
                debug!("Forwarding table full, dropping in-flight entry");
                self.health.on_recoverable_error("forwarding table full");
            }
        }
    }

    fn next_forward_token(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token = match self.next_token.checked_add(1) {
            Some(next) => next,
            None => FIRST_FORWARD_TOKEN,
        };
        token
    }

    fn cleanup(&mut self) {
        debug!("Cleaning up packet loop resources");
        self.forwarder.close_all(self.poll.registry());
        let _ = self
            .poll
            .registry()
            .deregister(&mut SourceFd(&self.device.raw_fd()));
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
