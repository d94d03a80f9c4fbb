//! Replica configuration.

use std::time::Duration;

/// Tunable parameters for the PBFT replica.
///
/// The backup suspicion interval is not configured directly: it scales with
/// cluster size as `heartbeat_interval × N` to avoid spurious view changes
/// in larger rosters.
#[derive(Debug, Clone)]
pub struct PbftConfig {
    /// Primary heartbeat tick.
    pub heartbeat_interval: Duration,

    /// How long a backup waits for a forwarded request to commit before
    /// suspecting the primary.
    pub request_timeout: Duration,

    /// Committed sequence numbers between checkpoint attestations.
    pub checkpoint_interval: u64,

    /// Base interval for view-change rebroadcast; doubles on every
    /// retransmission up to [`PbftConfig::MAX_BACKOFF_EXPONENT`].
    pub view_change_retransmit_base: Duration,

    /// Maximum pre-prepares re-sent to one lagging peer per heartbeat tick.
    pub catch_up_batch: usize,

    /// Outbound RPC attempt timeout.
    pub rpc_timeout: Duration,

    /// Outbound RPC retry bound; after this the send is given up silently.
    pub rpc_retries: u32,
}

impl PbftConfig {
    /// Cap on the view-change retransmit backoff (2^6 = 64× base).
    pub const MAX_BACKOFF_EXPONENT: u32 = 6;

    /// The watermark window spans this many checkpoint intervals above the
    /// low watermark.
    pub const WATERMARK_WINDOW_INTERVALS: u64 = 2;

    /// Backup suspicion interval for a cluster of `n` replicas.
    pub fn suspicion_interval(&self, n: usize) -> Duration {
        self.heartbeat_interval * n as u32
    }

    /// Current view-change retransmit delay for a backoff exponent.
    pub fn retransmit_delay(&self, exponent: u32) -> Duration {
        self.view_change_retransmit_base * 2u32.pow(exponent.min(Self::MAX_BACKOFF_EXPONENT))
    }
}

impl Default for PbftConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(1),
            request_timeout: Duration::from_secs(8),
            checkpoint_interval: 100,
            view_change_retransmit_base: Duration::from_secs(2),
            catch_up_batch: 16,
            rpc_timeout: Duration::from_millis(100),
            rpc_retries: 3,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suspicion_scales_with_cluster_size() {
        let config = PbftConfig::default();
        assert_eq!(config.suspicion_interval(4), Duration::from_secs(4));
        assert_eq!(config.suspicion_interval(7), Duration::from_secs(7));
    }

    #[test]
    fn retransmit_backoff_doubles_and_caps() {
        let config = PbftConfig {
            view_change_retransmit_base: Duration::from_secs(2),
            ..Default::default()
        };
        assert_eq!(config.retransmit_delay(0), Duration::from_secs(2));
        assert_eq!(config.retransmit_delay(1), Duration::from_secs(4));
        assert_eq!(config.retransmit_delay(3), Duration::from_secs(16));
        assert_eq!(config.retransmit_delay(6), Duration::from_secs(128));
        assert_eq!(config.retransmit_delay(20), Duration::from_secs(128));
    }
}
