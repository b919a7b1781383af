use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

/// Tunables for the SWIM layer. Hashicorp's memberlist leaves
/// the exact retransmit multiplier and gossip fan-out to the implementer;
/// the values below are the well-known memberlist defaults this system is
/// modeled on, chosen because they satisfy the binding log-proportional
/// requirement and are documented as such in DESIGN.md.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MembershipConfig {
    pub bind_addr: SocketAddr,
    pub probe_interval: Duration,
    pub probe_timeout: Duration,
    pub indirect_checks: usize,
    pub suspicion_min_timeout: Duration,
    pub suspicion_max_timeout: Duration,
    pub retransmit_mult: u32,
    pub gossip_interval: Duration,
    pub gossip_nodes: usize,
    pub push_pull_interval: Duration,
    /// Packets larger than this must be split or sent over the stream
    /// channel instead.
    pub udp_buffer_size: usize,
    pub degraded_after_cycles: u32,
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:7946".parse().unwrap(),
            probe_interval: Duration::from_millis(1000),
            probe_timeout: Duration::from_millis(500),
            indirect_checks: 3,
            suspicion_min_timeout: Duration::from_secs(2),
            suspicion_max_timeout: Duration::from_secs(6),
            retransmit_mult: 4,
            gossip_interval: Duration::from_millis(200),
            gossip_nodes: 3,
            push_pull_interval: Duration::from_secs(30),
            udp_buffer_size: 1400,
            degraded_after_cycles: 3,
        }
    }
}

impl MembershipConfig {
    /// Dynamic suspicion timeout duration for a given confirmation count and
    /// cluster size: starts at `max`, shortens
    /// logarithmically toward `min` as more peers independently confirm.
    pub fn suspicion_timeout(&self, cluster_size: usize, confirmations: u32) -> Duration {
        let n = (cluster_size.max(1) as f64).ln().max(1.0);
        let frac = (confirmations as f64 + 1.0) / n;
        let span = self.suspicion_max_timeout.as_secs_f64() - self.suspicion_min_timeout.as_secs_f64();
        let timeout = self.suspicion_max_timeout.as_secs_f64() - span * frac.min(1.0);
        Duration::from_secs_f64(timeout.max(self.suspicion_min_timeout.as_secs_f64()))
    }

    /// The log-proportional retransmit bound.
    pub fn retransmit_limit(&self, cluster_size: usize) -> u32 {
        let n = cluster_size.max(1) as f64 + 1.0;
        (n.log2().ceil() as u32) * self.retransmit_mult
    }
}
