//! Encrypted-DNS proxy contract.

use crate::dns::DnsSpec;

/// The local DNS-over-HTTPS proxy. Runs independently; the controller
/// only brackets it around the tunnel lifecycle. Stopping an already
/// stopped proxy is a no-op.
pub trait DnsProxy: Send + Sync {
    fn start_dns_proxy(&self, dns: &DnsSpec);
    fn stop_dns_proxy(&self);
}
