//! Events from the loop thread to its owner.

use crossbeam_channel::{Receiver, Sender, bounded};

/// Capacity of the engine event channel. Events are rare (breaker trips,
/// loop death); the loop never blocks on a slow consumer.
const EVENT_QUEUE_CAPACITY: usize = 16;

/// Notifications emitted by the packet loop and its health monitor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// The health monitor decided the network path is broken. The owner
    /// is expected to restart the session.
    NoConnectivity,
    /// The loop terminated without being asked to stop.
    StoppedUnexpectedly { reason: String },
}

/// Create the engine event channel. The receiver goes to the controller.
pub fn event_channel() -> (Sender<EngineEvent>, Receiver<EngineEvent>) {
    bounded(EVENT_QUEUE_CAPACITY)
}
