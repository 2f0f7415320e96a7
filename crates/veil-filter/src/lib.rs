//! veil Host Filter
//!
//! Answers the one question the packet loop asks on every DNS query:
//! should this host be resolved or dropped?
//!
//! Flow:
//! 1. Query name extracted from the DNS packet
//! 2. User denylist check → blocked
//! 3. Merged block set check (bloom prefilter + exact) → blocked
//! 4. User allowlist / default → passed
//!
//! Every verdict is also pushed to a fire-and-forget stats queue so the
//! UI counters never add latency to the packet path.

mod host_filter;
mod source;
mod stats;

pub use host_filter::{Host, HostDecision, HostFilter};
pub use source::{BlocklistSource, StaticLists};
pub use stats::{StatEvent, StatVerdict, StatsHandle};
