//! Fire-and-forget per-host counters.
//!
//! Classification runs on the packet-loop thread, so the sink must never
//! add backpressure there. Events go through a bounded channel with
//! `try_send`; a full queue drops the event rather than blocking.

use crate::host_filter::Host;
use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use serde::{Deserialize, Serialize};
use tracing::trace;

/// How a host lookup was categorized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatVerdict {
    /// Not in any set, passed through.
    Passed,
    /// On the user allowlist.
    PassedAllowed,
    /// In the merged block set.
    Blocked,
    /// On the user denylist.
    BlockedDenied,
}

/// One counted classification event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatEvent {
    pub host: Host,
    pub verdict: StatVerdict,
}

/// Sending half of the stats queue, held by the filter.
#[derive(Clone)]
pub struct StatsHandle {
    tx: Sender<StatEvent>,
}

impl StatsHandle {
    /// Create a queue with the given capacity. The receiver goes to the
    /// stats collaborator; the handle goes to the filter.
    pub fn new(capacity: usize) -> (Self, Receiver<StatEvent>) {
        let (tx, rx) = bounded(capacity);
        (Self { tx }, rx)
    }

    pub(crate) fn emit(&self, verdict: StatVerdict, host: &str) {
        let event = StatEvent {
            host: host.to_string(),
            verdict,
        };
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(ev)) => trace!("Stats queue full, dropping {:?}", ev.verdict),
            // Sink went away; counters are best-effort anyway.
            Err(TrySendError::Disconnected(_)) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_delivers_event() {
        let (handle, rx) = StatsHandle::new(8);

        handle.emit(StatVerdict::Blocked, "ads.example.com");

        let event = rx.try_recv().unwrap();
        assert_eq!(event.host, "ads.example.com");
        assert_eq!(event.verdict, StatVerdict::Blocked);
    }

    #[test]
    fn test_full_queue_drops_without_blocking() {
        let (handle, rx) = StatsHandle::new(1);

        handle.emit(StatVerdict::Passed, "a.com");
        handle.emit(StatVerdict::Passed, "b.com");

        // Only the first event fits; the second was dropped silently.
        assert_eq!(rx.try_recv().unwrap().host, "a.com");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_disconnected_sink_is_ignored() {
        let (handle, rx) = StatsHandle::new(1);
        drop(rx);

        // Must not panic or block.
        handle.emit(StatVerdict::BlockedDenied, "tracker.com");
    }
}
