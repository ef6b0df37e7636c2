//! Timers that drive liveness

use crate::config::ConsensusConfig;
use crate::types::{BlockHash, Step};
use std::time::Duration;

/// What a timer does when it fires
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeoutKind {
    /// No proposal arrived: PreVote nil
    Propose,
    /// No PreVote majority: PreCommit nil
    PreVote,
    /// No PreCommit majority: end the round
    PreCommit,
    /// Debounced entry into PreCommit for the carried hash
    PreCommitWait(BlockHash),
    /// Debounced entry into EndCommit
    EndCommitWait,
}

impl TimeoutKind {
    /// Step a timeout guards, `None` for the debounced waits
    pub fn step(&self) -> Option<Step> {
        match self {
            TimeoutKind::Propose => Some(Step::Propose),
            TimeoutKind::PreVote => Some(Step::PreVote),
            TimeoutKind::PreCommit => Some(Step::PreCommit),
            TimeoutKind::PreCommitWait(_) | TimeoutKind::EndCommitWait => None,
        }
    }

    /// Delay before the timer fires in `round`
    pub fn delay(&self, config: &ConsensusConfig, round: u32) -> Duration {
        match self {
            TimeoutKind::Propose => config.propose_timeout(round),
            TimeoutKind::PreVote => config.prevote_timeout(round),
            TimeoutKind::PreCommit => config.precommit_timeout(round),
            TimeoutKind::PreCommitWait(_) => config.precommit_wait(),
            TimeoutKind::EndCommitWait => config.endcommit_wait(),
        }
    }
}

/// A timer scheduled for one round of one height
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeout {
    pub height: u64,
    pub round: u32,
    pub kind: TimeoutKind,
}

impl Timeout {
    pub fn new(height: u64, round: u32, kind: TimeoutKind) -> Self {
        Self {
            height,
            round,
            kind,
        }
    }
}
