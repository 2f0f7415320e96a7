//! Loop health monitoring.
//!
//! Watches every loop iteration and every DNS round trip. Two independent
//! detectors feed the no-connectivity signal: a recoverable-error counter
//! with a clean-streak decay, and a one-way-DNS counter that catches a
//! black-holed resolver (queries leave, nothing ever comes back).

use crate::event::EngineEvent;
use crossbeam_channel::Sender;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, error, warn};

/// RTT sentinel reported until the first measured round trip.
pub const RTT_UNKNOWN_MS: u64 = 9999;

/// Thresholds for the connectivity breaker. Defaults follow the tuning
/// that shipped in production; both ceilings are per-session.
#[derive(Debug, Clone, Copy)]
pub struct HealthConfig {
    /// Recoverable errors tolerated before the breaker trips.
    pub max_recent_errors: u32,
    /// Consecutive unanswered DNS queries tolerated after the first
    /// successful round trip.
    pub max_one_way_queries: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            max_recent_errors: 50,
            max_one_way_queries: 30,
        }
    }
}

/// Shared read handle for the last measured DNS round-trip time.
///
/// Written from the loop thread, read from diagnostics tasks; a single
/// atomic instead of a lock on the hot path.
#[derive(Debug, Clone)]
pub struct RttHandle(Arc<AtomicU64>);

impl RttHandle {
    fn new() -> Self {
        Self(Arc::new(AtomicU64::new(RTT_UNKNOWN_MS)))
    }

    pub fn last_rtt_ms(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    fn set(&self, ms: u64) {
        self.0.store(ms, Ordering::Relaxed);
    }
}

/// Per-session health state. Owned by the loop thread; only the RTT cell
/// is shared out.
pub struct HealthMonitor {
    config: HealthConfig,
    events: Sender<EngineEvent>,

    error_counter: u32,
    errors_before_loop: u32,
    clean_loop_counter: u32,

    had_successful_query: bool,
    one_way_counter: u32,

    /// Sequence id and start time of the query currently being timed.
    timed_query: Option<(u16, Instant)>,
    last_rtt: RttHandle,

    query_counter: u32,
    log_every: u32,
}

impl HealthMonitor {
    pub fn new(config: HealthConfig, events: Sender<EngineEvent>) -> Self {
        Self {
            config,
            events,
            error_counter: 0,
            errors_before_loop: 0,
            clean_loop_counter: 0,
            had_successful_query: false,
            one_way_counter: 0,
            timed_query: None,
            last_rtt: RttHandle::new(),
            query_counter: 0,
            log_every: 1,
        }
    }

    /// Shared handle for the last measured round-trip time.
    pub fn rtt_handle(&self) -> RttHandle {
        self.last_rtt.clone()
    }

    /// Reset all counters. Must run once per session before the loop.
    pub fn start(&mut self) {
        debug!("Started health monitor");
        self.error_counter = 0;
        self.errors_before_loop = 0;
        self.clean_loop_counter = 0;
        self.had_successful_query = false;
        self.one_way_counter = 0;
        self.timed_query = None;
        self.query_counter = 0;
        self.log_every = 1;
        // Signals connection problems until the first response lands.
        self.last_rtt.set(RTT_UNKNOWN_MS);
    }

    pub fn on_loop_enter(&mut self) {
        self.errors_before_loop = self.error_counter;
    }

    /// Decay: enough consecutive clean iterations forgive old errors, so a
    /// burst from long ago cannot trip the breaker much later.
    pub fn on_loop_exit(&mut self) {
        if self.error_counter == 0 {
            return;
        }

        if self.errors_before_loop == self.error_counter {
            self.clean_loop_counter += 1;
        } else {
            self.clean_loop_counter = 0;
        }

        if self.clean_loop_counter >= self.config.max_recent_errors / 2 {
            debug!("Loop running clean, resetting error counter");
            self.error_counter = 0;
            self.clean_loop_counter = 0;
        }
    }

    pub fn on_recoverable_error(&mut self, reason: impl fmt::Display) {
        self.error_counter += 1;
        warn!(
            "Recoverable error occurred ({}): {}",
            self.error_counter, reason
        );
        if self.error_counter >= self.config.max_recent_errors {
            error!("Connectivity lost, too many errors recently");
            self.no_connectivity();
        }
    }

    pub fn on_dns_query_started(&mut self, sequence: u16) {
        if self.had_successful_query {
            self.one_way_counter += 1;
            if self.one_way_counter >= self.config.max_one_way_queries {
                error!(
                    "Connectivity lost, {} DNS requests without a response",
                    self.one_way_counter
                );
                self.no_connectivity();
            }
        }

        if self.timed_query.is_none() {
            self.timed_query = Some((sequence, Instant::now()));
        }
    }

    pub fn on_dns_query_finished(&mut self, sequence: u16) {
        self.one_way_counter = 0;
        self.had_successful_query = true;

        if let Some((id, started)) = self.timed_query {
            if id == sequence {
                let rtt = started.elapsed().as_millis() as u64;
                self.last_rtt.set(rtt);
                self.timed_query = None;

                self.query_counter += 1;
                if self.query_counter % self.log_every == 0 {
                    debug!(
                        "DNS-RTT/REC-ERR: {}ms/{}",
                        rtt, self.error_counter
                    );
                    if self.log_every < 30 {
                        self.log_every += 1;
                    }
                    self.query_counter = 0;
                }
            }
        }
    }

    fn no_connectivity(&self) {
        let _ = self.events.try_send(EngineEvent::NoConnectivity);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::event_channel;
    use crossbeam_channel::Receiver;

    fn monitor() -> (HealthMonitor, Receiver<EngineEvent>) {
        let (tx, rx) = event_channel();
        let mut health = HealthMonitor::new(HealthConfig::default(), tx);
        health.start();
        (health, rx)
    }

    fn breaker_events(rx: &Receiver<EngineEvent>) -> usize {
        rx.try_iter()
            .filter(|e| *e == EngineEvent::NoConnectivity)
            .count()
    }

    #[test]
    fn test_error_ceiling_fires_exactly_at_threshold() {
        let (mut health, rx) = monitor();

        for _ in 0..49 {
            health.on_recoverable_error("io failure");
        }
        assert_eq!(breaker_events(&rx), 0);

        health.on_recoverable_error("io failure");
        assert_eq!(breaker_events(&rx), 1);
    }

    #[test]
    fn test_clean_streak_decays_error_count() {
        let (mut health, rx) = monitor();

        for _ in 0..40 {
            health.on_recoverable_error("io failure");
        }

        // 25 clean iterations (half the ceiling) forgive the backlog.
        for _ in 0..25 {
            health.on_loop_enter();
            health.on_loop_exit();
        }

        for _ in 0..40 {
            health.on_recoverable_error("io failure");
        }
        assert_eq!(breaker_events(&rx), 0);
    }

    #[test]
    fn test_one_way_dns_requires_prior_success() {
        let (mut health, rx) = monitor();

        // Without any successful round trip the detector stays disarmed.
        for seq in 0..100u16 {
            health.on_dns_query_started(seq);
        }
        assert_eq!(breaker_events(&rx), 0);
    }

    #[test]
    fn test_one_way_dns_fires_after_thirty_unanswered() {
        let (mut health, rx) = monitor();

        health.on_dns_query_started(1);
        health.on_dns_query_finished(1);

        for seq in 0..29u16 {
            health.on_dns_query_started(seq);
        }
        assert_eq!(breaker_events(&rx), 0);

        health.on_dns_query_started(29);
        assert_eq!(breaker_events(&rx), 1);
    }

    #[test]
    fn test_finish_resets_one_way_counter() {
        let (mut health, rx) = monitor();

        health.on_dns_query_started(1);
        health.on_dns_query_finished(1);

        for seq in 0..29u16 {
            health.on_dns_query_started(seq);
        }
        health.on_dns_query_finished(7);

        for seq in 0..29u16 {
            health.on_dns_query_started(seq);
        }
        assert_eq!(breaker_events(&rx), 0);
    }

    #[test]
    fn test_rtt_measured_on_matching_sequence() {
        let (mut health, _rx) = monitor();
        let rtt = health.rtt_handle();

        assert_eq!(rtt.last_rtt_ms(), RTT_UNKNOWN_MS);

        health.on_dns_query_started(42);
        health.on_dns_query_finished(42);

        assert!(rtt.last_rtt_ms() < RTT_UNKNOWN_MS);
    }

    #[test]
    fn test_start_is_idempotent() {
        let (mut health, rx) = monitor();

        health.on_recoverable_error("io failure");
        health.on_dns_query_started(9);
        health.on_dns_query_finished(9);

        health.start();
        health.start();

        assert_eq!(health.rtt_handle().last_rtt_ms(), RTT_UNKNOWN_MS);

        // Fresh counters: the ceiling is still the full 50 away.
        for _ in 0..49 {
            health.on_recoverable_error("io failure");
        }
        assert_eq!(breaker_events(&rx), 0);
    }
}
