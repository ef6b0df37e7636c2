//! Consensus configuration

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Timeouts and limits for a consensus instance
///
/// Every timeout for round `r` is `base + delta * r`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    pub propose_timeout_base_ms: u64,
    pub propose_timeout_delta_ms: u64,
    pub prevote_timeout_base_ms: u64,
    pub prevote_timeout_delta_ms: u64,
    pub precommit_timeout_base_ms: u64,
    pub precommit_timeout_delta_ms: u64,
    /// Delay between a PreVote quorum and entering PreCommit
    pub precommit_wait_ms: u64,
    /// Delay between a decision and entering EndCommit
    pub endcommit_wait_ms: u64,
    /// Entries kept in the block validity memo
    pub validity_cache_capacity: usize,
    /// Upper bound on upon-rule passes per mutation
    pub max_fixpoint_iterations: usize,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            propose_timeout_base_ms: 8_000,
            propose_timeout_delta_ms: 4_000,
            prevote_timeout_base_ms: 1_000,
            prevote_timeout_delta_ms: 1_000,
            precommit_timeout_base_ms: 1_000,
            precommit_timeout_delta_ms: 1_000,
            precommit_wait_ms: 0,
            endcommit_wait_ms: 0,
            validity_cache_capacity: 128,
            max_fixpoint_iterations: 64,
        }
    }
}

impl ConsensusConfig {
    /// Load from a JSON file; absent keys keep their defaults
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let data = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&data)?;
        tracing::debug!("Loaded consensus config from {:?}", path.as_ref());
        Ok(config)
    }

    pub fn propose_timeout(&self, round: u32) -> Duration {
        linear(self.propose_timeout_base_ms, self.propose_timeout_delta_ms, round)
    }

    pub fn prevote_timeout(&self, round: u32) -> Duration {
        linear(self.prevote_timeout_base_ms, self.prevote_timeout_delta_ms, round)
    }

    pub fn precommit_timeout(&self, round: u32) -> Duration {
        linear(self.precommit_timeout_base_ms, self.precommit_timeout_delta_ms, round)
    }

    pub fn precommit_wait(&self) -> Duration {
        Duration::from_millis(self.precommit_wait_ms)
    }

    pub fn endcommit_wait(&self) -> Duration {
        Duration::from_millis(self.endcommit_wait_ms)
    }
}

fn linear(base_ms: u64, delta_ms: u64, round: u32) -> Duration {
    Duration::from_millis(base_ms.saturating_add(delta_ms.saturating_mul(round as u64)))
}
