//! Controller configuration and the persisted-settings contract.

use std::time::Duration;
use veil_engine::HealthConfig;

/// Read-only view of the persisted local settings the controller consults
/// at interface-configuration time. Owned by the app's persistence layer.
pub trait ConfigSource: Send + Sync {
    fn ipv6_enabled(&self) -> bool;
    fn use_encrypted_dns(&self) -> bool;
    /// App identifiers excluded from interception.
    fn bypassed_apps(&self) -> Vec<String>;
}

/// Tunables for the controller itself.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Pause between stop and start during a restart. Interface teardown
    /// is asynchronous on the platform side; reopening too fast can fail
    /// or hang.
    pub settle_delay: Duration,
    pub health: HealthConfig,
    /// Cap on concurrently tracked forwarding sockets per session.
    pub max_forwards: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_secs(5),
            health: HealthConfig::default(),
            max_forwards: veil_engine::DEFAULT_MAX_FORWARDS,
        }
    }
}
