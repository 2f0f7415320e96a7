//! Host classification against the merged block set and user overrides.

use crate::source::BlocklistSource;
use crate::stats::{StatVerdict, StatsHandle};
use bloomfilter::Bloom;
use std::collections::HashSet;
use std::sync::RwLock;
use tracing::{debug, info};
use xxhash_rust::xxh3::xxh3_64;

pub type Host = String;

/// False positive rate for the merged-set prefilter. A false positive only
/// costs one extra hash-set lookup, never a wrong verdict.
const BLOOM_FP_RATE: f64 = 0.001;

/// Verdict for one host lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostDecision {
    /// On the user allowlist.
    Allowed,
    /// On the user denylist.
    DeniedByUser,
    /// In the merged block set.
    DeniedByList,
    /// In no set; default pass-through.
    Passed,
}

impl HostDecision {
    /// Whether a DNS query for this host should be dropped.
    pub fn is_denied(&self) -> bool {
        matches!(self, HostDecision::DeniedByUser | HostDecision::DeniedByList)
    }
}

/// The three host sets. Replaced as one unit on reload so a lookup never
/// observes a half-updated state.
struct HostSets {
    /// xxh3 hashes of the merged block set. Merged lists run into the
    /// hundreds of thousands of entries; storing hashes keeps this at
    /// 8 bytes per host.
    merged: HashSet<u64>,
    /// Prefilter over `merged`; a miss skips the exact lookup.
    merged_bloom: Bloom<str>,
    user_allowed: HashSet<Host>,
    user_denied: HashSet<Host>,
}

impl HostSets {
    fn empty() -> Self {
        Self::build(Vec::new(), Vec::new(), Vec::new())
    }

    fn build(merged: Vec<Host>, user_allowed: Vec<Host>, user_denied: Vec<Host>) -> Self {
        let mut merged_bloom = Bloom::new_for_fp_rate(merged.len().max(1), BLOOM_FP_RATE);
        let mut merged_hashes = HashSet::with_capacity(merged.len());
        for host in &merged {
            merged_bloom.set(host.as_str());
            merged_hashes.insert(xxh3_64(host.as_bytes()));
        }

        Self {
            merged: merged_hashes,
            merged_bloom,
            user_allowed: user_allowed.into_iter().collect(),
            user_denied: user_denied.into_iter().collect(),
        }
    }

    fn in_merged(&self, host: &str) -> bool {
        self.merged_bloom.check(host) && self.merged.contains(&xxh3_64(host.as_bytes()))
    }
}

/// In-memory host filter fed by an external blocklist collaborator.
///
/// `classify` is the packet-path entry point; precedence is user-deny,
/// then merged block set, then user-allow, then pass.
pub struct HostFilter {
    sets: RwLock<HostSets>,
    source: Box<dyn BlocklistSource>,
    stats: StatsHandle,
}

impl HostFilter {
    /// Create an empty filter. Nothing is blocked until `reload` runs.
    pub fn new(source: Box<dyn BlocklistSource>, stats: StatsHandle) -> Self {
        Self {
            sets: RwLock::new(HostSets::empty()),
            source,
            stats,
        }
    }

    /// Re-read all three lists from the source and swap them in as a unit.
    pub fn reload(&self) {
        debug!("Reloading blocklist");
        let merged = self.source.load_merged();
        let user_allowed = self.source.load_user_allowed();
        let user_denied = self.source.load_user_denied();

        info!(
            "Reloaded: {} hosts, + user: {} denied, {} allowed",
            merged.len(),
            user_denied.len(),
            user_allowed.len()
        );

        let sets = HostSets::build(merged, user_allowed, user_denied);
        *self.sets.write().unwrap() = sets;
    }

    /// Classify one host. Also emits the matching stats event.
    pub fn classify(&self, host: &str) -> HostDecision {
        let sets = self.sets.read().unwrap();

        let decision = if sets.user_denied.contains(host) {
            HostDecision::DeniedByUser
        } else if sets.in_merged(host) {
            HostDecision::DeniedByList
        } else if sets.user_allowed.contains(host) {
            HostDecision::Allowed
        } else {
            HostDecision::Passed
        };
        drop(sets);

        let verdict = match decision {
            HostDecision::Allowed => StatVerdict::PassedAllowed,
            HostDecision::DeniedByUser => StatVerdict::BlockedDenied,
            HostDecision::DeniedByList => StatVerdict::Blocked,
            HostDecision::Passed => StatVerdict::Passed,
        };
        self.stats.emit(verdict, host);

        decision
    }

    /// Size of the merged block set.
    pub fn merged_len(&self) -> usize {
        self.sets.read().unwrap().merged.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::StaticLists;

    fn filter_with(merged: &[&str], allowed: &[&str], denied: &[&str]) -> HostFilter {
        let source = StaticLists {
            merged: merged.iter().map(|s| s.to_string()).collect(),
            user_allowed: allowed.iter().map(|s| s.to_string()).collect(),
            user_denied: denied.iter().map(|s| s.to_string()).collect(),
        };
        let (stats, _rx) = StatsHandle::new(64);
        let filter = HostFilter::new(Box::new(source), stats);
        filter.reload();
        filter
    }

    #[test]
    fn test_user_deny_wins_over_everything() {
        let filter = filter_with(
            &["tracker.com"],
            &["tracker.com"],
            &["tracker.com"],
        );

        assert_eq!(filter.classify("tracker.com"), HostDecision::DeniedByUser);
    }

    #[test]
    fn test_merged_blocks() {
        let filter = filter_with(&["ads.example.com"], &[], &[]);

        assert_eq!(
            filter.classify("ads.example.com"),
            HostDecision::DeniedByList
        );
        assert!(filter.classify("ads.example.com").is_denied());
    }

    #[test]
    fn test_unlisted_host_passes() {
        let filter = filter_with(&["ads.example.com"], &["good.com"], &["bad.com"]);

        assert_eq!(filter.classify("example.com"), HostDecision::Passed);
    }

    #[test]
    fn test_user_allowed_category() {
        let filter = filter_with(&[], &["good.com"], &[]);

        assert_eq!(filter.classify("good.com"), HostDecision::Allowed);
        assert!(!filter.classify("good.com").is_denied());
    }

    #[test]
    fn test_empty_lists_block_nothing() {
        let filter = filter_with(&[], &[], &[]);

        assert_eq!(filter.classify("anything.com"), HostDecision::Passed);
        assert_eq!(filter.merged_len(), 0);
    }

    #[test]
    fn test_reload_replaces_sets() {
        let source = StaticLists {
            merged: vec!["old.com".to_string()],
            ..Default::default()
        };
        let (stats, _rx) = StatsHandle::new(64);
        let filter = HostFilter::new(Box::new(source), stats);

        // Before the first reload nothing is blocked.
        assert_eq!(filter.classify("old.com"), HostDecision::Passed);

        filter.reload();
        assert_eq!(filter.classify("old.com"), HostDecision::DeniedByList);
    }

    #[test]
    fn test_stats_categories() {
        let source = StaticLists {
            merged: vec!["blocked.com".to_string()],
            user_allowed: vec!["allowed.com".to_string()],
            user_denied: vec!["denied.com".to_string()],
        };
        let (stats, rx) = StatsHandle::new(64);
        let filter = HostFilter::new(Box::new(source), stats);
        filter.reload();

        filter.classify("blocked.com");
        filter.classify("allowed.com");
        filter.classify("denied.com");
        filter.classify("other.com");

        let verdicts: Vec<_> = rx.try_iter().map(|e| e.verdict).collect();
        assert_eq!(
            verdicts,
            vec![
                StatVerdict::Blocked,
                StatVerdict::PassedAllowed,
                StatVerdict::BlockedDenied,
                StatVerdict::Passed,
            ]
        );
    }
}
