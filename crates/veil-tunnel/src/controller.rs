//! Tunnel lifecycle orchestration.
//!
//! Sequences interface setup and teardown across the three operating
//! modes, owns the packet loop for the current session, and reacts to the
//! engine's health verdicts. Control operations are serialized by an
//! internal mutex; `status().in_progress` stays the advisory signal for
//! callers.

use crate::config::{ConfigSource, ControllerConfig};
use crate::configurator;
use crate::device::{InterfaceEvent, InterfaceProvider, TransportFactory};
use crate::dns::{DnsSpec, map_dns};
use crate::dns_proxy::DnsProxy;
use crate::error::TunnelError;
use crate::model::{Lease, PlusConfig};
use crate::status::TunnelStatus;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use veil_engine::{
    EngineEvent, LoopMode, PacketLoopConfig, PacketLoopHandle, SocketFactory, spawn_packet_loop,
};
use veil_filter::HostFilter;

/// Build capability. Minimal builds never route, regardless of lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flavor {
    Minimal,
    Full,
}

/// Notifications surfaced to the owning layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelEvent {
    /// The health monitor tripped; a restart is already in flight.
    ConnectivityLost,
    /// The session died underneath us; status is Off.
    StoppedUnexpectedly { reason: String },
}

/// Collaborators the controller drives. All are owned by the embedding
/// app and outlive the controller.
pub struct ControllerDeps {
    pub provider: Arc<dyn InterfaceProvider>,
    pub sockets: Arc<dyn SocketFactory>,
    pub filter: Arc<HostFilter>,
    pub dns_proxy: Arc<dyn DnsProxy>,
    pub prefs: Arc<dyn ConfigSource>,
    pub transports: Arc<dyn TransportFactory>,
    /// Closed notifications from the interface provider.
    pub interface_events: mpsc::Receiver<InterfaceEvent>,
}

#[derive(Clone)]
pub struct TunnelController {
    inner: Arc<Inner>,
}

struct Inner {
    flavor: Flavor,
    provider: Arc<dyn InterfaceProvider>,
    sockets: Arc<dyn SocketFactory>,
    filter: Arc<HostFilter>,
    dns_proxy: Arc<dyn DnsProxy>,
    prefs: Arc<dyn ConfigSource>,
    transports: Arc<dyn TransportFactory>,
    config: ControllerConfig,
    engine_tx: crossbeam_channel::Sender<EngineEvent>,
    /// Single-flight guard for control operations.
    control: tokio::sync::Mutex<()>,
    state: Mutex<State>,
    owner_tx: mpsc::Sender<TunnelEvent>,
}

struct State {
    status: TunnelStatus,
    dns: DnsSpec,
    dns_plus: DnsSpec,
    lease: Option<Lease>,
    /// Last routing config, kept for reconnect-after-restart.
    plus: Option<PlusConfig>,
    loop_handle: Option<PacketLoopHandle>,
}

impl TunnelController {
    /// Create the controller and its owner-event stream. Must be called
    /// from within a tokio runtime; the event pump is spawned here.
    pub fn new(
        flavor: Flavor,
        dns: DnsSpec,
        deps: ControllerDeps,
        config: ControllerConfig,
    ) -> (Self, mpsc::Receiver<TunnelEvent>) {
        let (owner_tx, owner_rx) = mpsc::channel(16);
        let (engine_tx, engine_rx) = veil_engine::event_channel();

        let inner = Arc::new(Inner {
            flavor,
            provider: deps.provider,
            sockets: deps.sockets,
            filter: deps.filter,
            dns_proxy: deps.dns_proxy,
            prefs: deps.prefs,
            transports: deps.transports,
            config,
            engine_tx,
            control: tokio::sync::Mutex::new(()),
            state: Mutex::new(State {
                status: TunnelStatus::off(),
                dns: dns.clone(),
                dns_plus: dns,
                lease: None,
                plus: None,
                loop_handle: None,
            }),
            owner_tx,
        });

        // Bridge the loop thread's crossbeam events into the async world.
        // The thread exits when the last engine sender is dropped.
        let (bridge_tx, mut bridge_rx) = mpsc::channel::<EngineEvent>(16);
        std::thread::Builder::new()
            .name("veil-engine-events".into())
            .spawn(move || {
                while let Ok(event) = engine_rx.recv() {
                    if bridge_tx.blocking_send(event).is_err() {
                        break;
                    }
                }
            })
            .expect("Failed to spawn engine event bridge thread");

        let pump = Arc::downgrade(&inner);
        tokio::spawn(async move {
            while let Some(event) = bridge_rx.recv().await {
                let Some(inner) = pump.upgrade() else { break };
                inner.handle_engine_event(event).await;
            }
        });

        let pump = Arc::downgrade(&inner);
        let mut interface_events = deps.interface_events;
        tokio::spawn(async move {
            while let Some(event) = interface_events.recv().await {
                let Some(inner) = pump.upgrade() else { break };
                inner.handle_interface_event(event).await;
            }
        });

        (Self { inner }, owner_rx)
    }

    pub fn status(&self) -> TunnelStatus {
        self.inner.status()
    }

    /// Last measured DNS round-trip time of the running session.
    pub fn last_rtt_ms(&self) -> Option<u64> {
        let state = self.inner.state.lock().unwrap();
        state
            .loop_handle
            .as_ref()
            .map(|handle| handle.rtt_handle().last_rtt_ms())
    }

    /// Swap the DNS selection without touching a running session. Takes
    /// effect on the next start; use [`reconfigure_dns`] to apply live.
    ///
    /// [`reconfigure_dns`]: Self::reconfigure_dns
    pub fn set_dns(&self, dns: DnsSpec, dns_plus: Option<DnsSpec>) {
        let mut state = self.inner.state.lock().unwrap();
        state.dns_plus = dns_plus.unwrap_or_else(|| dns.clone());
        state.dns = dns;
    }

    /// Open the interface and begin filtering. With a lease the interface
    /// is configured for routing, but traffic flows only after `connect`.
    pub async fn start(&self, lease: Option<Lease>) -> Result<(), TunnelError> {
        let _guard = self.inner.control.lock().await;
        self.inner.start_locked(lease)
    }

    /// Tear the session down completely.
    pub async fn stop(&self) -> Result<(), TunnelError> {
        let _guard = self.inner.control.lock().await;
        self.inner.stop_locked()
    }

    /// Begin routing through the configured gateway. Requires an active
    /// tunnel that was started with a lease.
    pub async fn connect(&self, config: PlusConfig) -> Result<(), TunnelError> {
        let _guard = self.inner.control.lock().await;
        self.inner.connect_locked(config)
    }

    /// Stop routing, fall back to filtering only.
    pub async fn disconnect(&self) -> Result<(), TunnelError> {
        let _guard = self.inner.control.lock().await;
        self.inner.disconnect_locked()
    }

    /// Unconditional stop → settle → start sequence.
    pub async fn restart(&self, lease: Option<Lease>) -> Result<(), TunnelError> {
        let _guard = self.inner.control.lock().await;
        self.inner.restart_interface_locked(lease).await
    }

    /// Apply a new DNS selection to the running session: disconnect if
    /// routed, restart the interface, reconnect if it was routed.
    pub async fn reconfigure_dns(
        &self,
        dns: DnsSpec,
        dns_plus: Option<DnsSpec>,
    ) -> Result<(), TunnelError> {
        let _guard = self.inner.control.lock().await;
        info!("Requested to change DNS: {}", dns.id);
        {
            let mut state = self.inner.state.lock().unwrap();
            state.dns_plus = dns_plus.unwrap_or_else(|| dns.clone());
            state.dns = dns;
        }
        self.inner.full_restart_locked().await
    }

    /// Reload the block lists and cycle the session so the loop picks the
    /// new sets up from a clean slate.
    pub async fn reload_block_lists(&self) -> Result<(), TunnelError> {
        let _guard = self.inner.control.lock().await;
        info!("Reloading block lists");
        self.inner.filter.reload();
        self.inner.full_restart_locked().await
    }
}

impl Inner {
    fn status(&self) -> TunnelStatus {
        self.state.lock().unwrap().status.clone()
    }

    fn set_status(&self, status: TunnelStatus) {
        let mut state = self.state.lock().unwrap();
        debug!("Status: {:?} -> {:?}", state.status, status);
        state.status = status;
    }

    fn current_dns(&self) -> (DnsSpec, DnsSpec) {
        let state = self.state.lock().unwrap();
        (state.dns.clone(), state.dns_plus.clone())
    }

    fn take_loop_and_stop(&self) {
        let handle = self.state.lock().unwrap().loop_handle.take();
        if let Some(mut handle) = handle {
            // Joins the loop thread; all forwarding sockets are closed
            // when this returns, so the interface may be torn down next.
            handle.stop();
        }
    }

    fn start_locked(&self, lease: Option<Lease>) -> Result<(), TunnelError> {
        info!("Starting tunnel (lease present: {})", lease.is_some());

        if lease.is_some() && self.flavor == Flavor::Minimal {
            return Err(TunnelError::InvalidState(
                "routing is not available in this build",
            ));
        }
        // One loop per process; a running session must be stopped first.
        if self.status().active {
            return Err(TunnelError::InvalidState("tunnel is already active"));
        }

        self.set_status(TunnelStatus::in_progress());
        self.state.lock().unwrap().lease = lease.clone();

        let result = match &lease {
            None => self.start_filtering(),
            Some(lease) => self.start_plus_interface(lease),
        };

        if let Err(e) = &result {
            warn!("Failed starting tunnel: {}", e);
            match e {
                TunnelError::NoPermissions => self.set_status(TunnelStatus::no_permissions()),
                _ => self.set_status(TunnelStatus::error(e.to_string())),
            }
        }
        result
    }

    fn start_filtering(&self) -> Result<(), TunnelError> {
        let (dns, _) = self.current_dns();
        let use_doh = dns.supports_doh() && self.prefs.use_encrypted_dns();
        let mapped = map_dns(&dns, use_doh);

        if use_doh {
            self.dns_proxy.start_dns_proxy(&dns);
        }

        // Only the full flavor routes the mapped resolvers in explicitly.
        let route_dns = self.flavor == Flavor::Full;
        let config = configurator::for_filtering(
            &mapped.servers,
            self.prefs.ipv6_enabled(),
            route_dns,
            self.prefs.bypassed_apps(),
        );
        self.provider.open(&config)?;
        let device = self.provider.device()?;

        let mode = match self.flavor {
            Flavor::Minimal => LoopMode::Minimal,
            Flavor::Full => LoopMode::Full,
        };
        let handle = spawn_packet_loop(
            device,
            self.sockets.clone(),
            self.filter.clone(),
            PacketLoopConfig {
                mode,
                redirect: Some(mapped.redirect),
                health: self.config.health,
                max_forwards: self.config.max_forwards,
            },
            None,
            self.engine_tx.clone(),
        )?;
        self.state.lock().unwrap().loop_handle = Some(handle);

        self.set_status(TunnelStatus::filtering_only(use_doh));
        Ok(())
    }

    fn start_plus_interface(&self, lease: &Lease) -> Result<(), TunnelError> {
        let (_, dns_plus) = self.current_dns();
        let use_doh = dns_plus.supports_doh() && self.prefs.use_encrypted_dns();
        let mapped = map_dns(&dns_plus, use_doh);

        if use_doh {
            self.dns_proxy.start_dns_proxy(&dns_plus);
        }

        let config = configurator::for_plus(
            lease,
            &mapped.servers,
            self.prefs.ipv6_enabled(),
            self.prefs.bypassed_apps(),
        );
        self.provider.open(&config)?;

        // The packet loop starts when the gateway connection is made.
        self.set_status(TunnelStatus::filtering_only(use_doh));
        Ok(())
    }

    fn stop_locked(&self) -> Result<(), TunnelError> {
        info!("Stopping tunnel");
        self.set_status(TunnelStatus::in_progress());

        self.dns_proxy.stop_dns_proxy();
        self.take_loop_and_stop();
        self.provider.close();

        self.set_status(TunnelStatus::off());
        Ok(())
    }

    fn connect_locked(&self, config: PlusConfig) -> Result<(), TunnelError> {
        info!("Connecting to gateway");

        // Precondition violations must not touch the status.
        if !self.status().active {
            return Err(TunnelError::InvalidState("tunnel is not active"));
        }
        let gateway = config.gateway.clone().ok_or(TunnelError::NoGateway)?;
        if self.state.lock().unwrap().lease.is_none() {
            return Err(TunnelError::InvalidState("tunnel was not started for routing"));
        }

        self.set_status(TunnelStatus::in_progress());

        // A previous routed loop (reconnect) goes away first.
        self.take_loop_and_stop();

        let (_, dns_plus) = self.current_dns();
        let use_doh = dns_plus.supports_doh() && self.prefs.use_encrypted_dns();
        let mapped = map_dns(&dns_plus, use_doh);

        let result = (|| {
            let transport = self
                .transports
                .open_tunnel(&config.private_key, &gateway)
                .map_err(|e| TunnelError::Transport(e.to_string()))?;
            let device = self.provider.device()?;
            let handle = spawn_packet_loop(
                device,
                self.sockets.clone(),
                self.filter.clone(),
                PacketLoopConfig {
                    mode: LoopMode::Plus,
                    redirect: Some(mapped.redirect),
                    health: self.config.health,
                    max_forwards: self.config.max_forwards,
                },
                Some(transport),
                self.engine_tx.clone(),
            )?;
            Ok::<_, TunnelError>(handle)
        })();

        match result {
            Ok(handle) => {
                let mut state = self.state.lock().unwrap();
                state.loop_handle = Some(handle);
                state.plus = Some(config);
                drop(state);
                self.set_status(TunnelStatus::connected(gateway.public_key));
                Ok(())
            }
            Err(e) => {
                warn!("Failed connecting to gateway: {}", e);
                self.set_status(TunnelStatus::error(e.to_string()));
                Err(e)
            }
        }
    }

    fn disconnect_locked(&self) -> Result<(), TunnelError> {
        info!("Disconnecting from gateway");

        if !self.status().active {
            return Err(TunnelError::InvalidState("tunnel is not active"));
        }

        self.set_status(TunnelStatus::in_progress());
        self.take_loop_and_stop();

        let (dns, _) = self.current_dns();
        let use_doh = dns.supports_doh() && self.prefs.use_encrypted_dns();
        self.set_status(TunnelStatus::filtering_only(use_doh));
        Ok(())
    }

    async fn restart_interface_locked(&self, lease: Option<Lease>) -> Result<(), TunnelError> {
        self.stop_locked()?;
        debug!("Waiting after stopping the interface, before another start");
        tokio::time::sleep(self.config.settle_delay).await;
        self.start_locked(lease)
    }

    /// Disconnect-if-routed → restart interface → reconnect-if-routed.
    /// A no-op unless the tunnel is active.
    async fn full_restart_locked(&self) -> Result<(), TunnelError> {
        let status = self.status();
        if !status.active {
            return Ok(());
        }

        let was_connected = status.gateway_id.is_some();
        if was_connected {
            self.disconnect_locked()?;
        }

        let lease = self.state.lock().unwrap().lease.clone();
        self.restart_interface_locked(lease).await?;

        if was_connected {
            let plus = self
                .state
                .lock()
                .unwrap()
                .plus
                .clone()
                .ok_or(TunnelError::InvalidState("no routing config to reconnect"))?;
            self.connect_locked(plus)?;
        }
        Ok(())
    }

    async fn handle_engine_event(&self, event: EngineEvent) {
        match event {
            EngineEvent::NoConnectivity => {
                warn!("No connectivity reported by the engine, restarting session");
                let _ = self.owner_tx.try_send(TunnelEvent::ConnectivityLost);

                let _guard = self.control.lock().await;
                if !self.status().active {
                    return;
                }
                let lease = self.state.lock().unwrap().lease.clone();
                if let Err(e) = self.restart_interface_locked(lease).await {
                    error!("Failed restarting after connectivity loss: {}", e);
                }
            }
            EngineEvent::StoppedUnexpectedly { reason } => {
                let _guard = self.control.lock().await;
                self.handle_unexpected(reason);
            }
        }
    }

    async fn handle_interface_event(&self, event: InterfaceEvent) {
        match event {
            InterfaceEvent::Closed { reason: Some(reason) } => {
                let _guard = self.control.lock().await;
                self.handle_unexpected(reason);
            }
            InterfaceEvent::Closed { reason: None } => {
                debug!("Interface closed normally");
            }
        }
    }

    /// Shared path for both unexpected-death signals: the loop dying on
    /// its own and the platform revoking the interface.
    fn handle_unexpected(&self, reason: String) {
        warn!("Session ended unexpectedly: {}", reason);

        self.take_loop_and_stop();
        self.dns_proxy.stop_dns_proxy();
        self.provider.close();
        self.set_status(TunnelStatus::off());

        let _ = self
            .owner_tx
            .try_send(TunnelEvent::StoppedUnexpectedly { reason });
    }
}
