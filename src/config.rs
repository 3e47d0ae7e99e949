//! Operator-facing configuration (SPEC_FULL.md §A.3).
//!
//! Mirrors the shape of the teacher's `PeerManagerConfig`
//! (`ec_peers.rs`): one struct, one documented `Default` impl, loaded once
//! at startup.

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Number of tokens this node claims on the ring when bootstrapping
    /// fresh (spec.md §4.4 step 2).
    pub num_tokens: usize,

    /// `max(ring_delay_ms, gossip_interval)` in the original; here taken as
    /// a direct wait bound applied before checking for other live members
    /// (spec.md §4.4 `join_token_ring` step 2, SPEC_FULL.md §C.1).
    pub ring_delay: Duration,

    /// Gossip's broadcast interval, used as the floor for `ring_delay`
    /// (SPEC_FULL.md §C.1).
    pub gossip_interval: Duration,

    /// If true, bootstrap/replace refuse to proceed while any other
    /// bootstrapping/leaving endpoint is visible (spec.md §4.4, §8 S3).
    pub consistent_rangemovement: bool,

    /// Shadow gossip collision scan bound (spec.md §5).
    pub shadow_round_timeout: Duration,

    /// `consistent_rangemovement` retry bound (spec.md §5).
    pub consistent_rangemovement_retry: Duration,

    /// `wait_alive` bound during replace (spec.md §5).
    pub wait_alive_timeout: Duration,

    /// Peer watchdog silence bound before an in-flight node-ops entry
    /// self-aborts (spec.md §4.5, §5).
    pub watchdog_silence: Duration,

    /// Interval between node-ops heartbeats sent by the coordinator
    /// (spec.md §4.5, §5).
    pub heartbeat_period: Duration,

    /// Max send attempts for `replication_finished` (spec.md §5).
    pub replication_finished_max_attempts: u32,

    /// Number of local execution shards (spec.md §5).
    pub shard_count: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            num_tokens: 256,
            ring_delay: Duration::from_secs(30),
            gossip_interval: Duration::from_secs(1),
            consistent_rangemovement: true,
            shadow_round_timeout: Duration::from_secs(60),
            consistent_rangemovement_retry: Duration::from_secs(60),
            wait_alive_timeout: Duration::from_secs(120),
            watchdog_silence: Duration::from_secs(120),
            heartbeat_period: Duration::from_secs(10),
            replication_finished_max_attempts: 3,
            shard_count: 1,
        }
    }
}

impl CoordinatorConfig {
    pub fn from_yaml(raw: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(raw)
    }

    /// spec.md §9 / SPEC_FULL.md §C.1: `ring_delay` is the max of the
    /// configured delay and the gossip broadcast interval, not a bare
    /// config read.
    pub fn effective_ring_delay(&self) -> Duration {
        self.ring_delay.max(self.gossip_interval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn effective_ring_delay_is_the_max_of_the_two() {
        let mut cfg = CoordinatorConfig { ring_delay: Duration::from_secs(1), ..Default::default() };
        cfg.gossip_interval = Duration::from_secs(5);
        assert_eq!(cfg.effective_ring_delay(), Duration::from_secs(5));
    }

    #[test]
    fn from_yaml_round_trips_defaults() {
        let cfg = CoordinatorConfig::default();
        let yaml = serde_yaml::to_string(&cfg).unwrap();
        let parsed = CoordinatorConfig::from_yaml(&yaml).unwrap();
        assert_eq!(parsed.num_tokens, cfg.num_tokens);
    }

    #[test]
    fn from_yaml_allows_partial_overrides() {
        let parsed = CoordinatorConfig::from_yaml("num_tokens: 16\n").unwrap();
        assert_eq!(parsed.num_tokens, 16);
        assert_eq!(parsed.shard_count, CoordinatorConfig::default().shard_count);
    }
}
