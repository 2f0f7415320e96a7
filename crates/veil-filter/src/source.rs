//! Blocklist data source contract.

use crate::host_filter::Host;

/// Supplies the merged block set and the user overrides.
///
/// Implementations live outside the core (downloaded lists merged on disk,
/// user preferences). One hostname per entry, no further schema. A missing
/// or unreadable list is an empty list, never an error — the filter then
/// degrades to "nothing blocked".
pub trait BlocklistSource: Send + Sync {
    fn load_merged(&self) -> Vec<Host>;
    fn load_user_allowed(&self) -> Vec<Host>;
    fn load_user_denied(&self) -> Vec<Host>;
}

/// Fixed in-memory lists, for embedding defaults and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticLists {
    pub merged: Vec<Host>,
    pub user_allowed: Vec<Host>,
    pub user_denied: Vec<Host>,
}

impl BlocklistSource for StaticLists {
    fn load_merged(&self) -> Vec<Host> {
        self.merged.clone()
    }

    fn load_user_allowed(&self) -> Vec<Host> {
        self.user_allowed.clone()
    }

    fn load_user_denied(&self) -> Vec<Host> {
        self.user_denied.clone()
    }
}
