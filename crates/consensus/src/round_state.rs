//! Per-round state: votes, proposal and one-shot scheduling flags

use crate::error::{ConsensusError, Result};
use crate::messages::Proposal;
use crate::timeout::TimeoutKind;
use crate::types::VoteFlag;
use crate::validator_set::ValidatorSet;
use crate::vote_set::VoteSet;
use std::sync::Arc;

/// Flags recording which timers were already armed this round
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScheduleFlags {
    pub propose_timeout: bool,
    pub prevote_timeout: bool,
    pub precommit_timeout: bool,
    pub precommit_wait: bool,
    pub endcommit_wait: bool,
}

#[derive(Debug, Clone)]
pub struct RoundState {
    round: u32,
    prevotes: VoteSet,
    precommits: VoteSet,
    proposal: Option<Proposal>,
    flags: ScheduleFlags,
    /// Set once the PreVote quorum of this round updated lock/valid state
    prevote_quorum_handled: bool,
}

impl RoundState {
    pub fn new(height: u64, round: u32, validators: Arc<ValidatorSet>) -> Self {
        Self {
            round,
            prevotes: VoteSet::new(height, round, VoteFlag::PreVote, validators.clone()),
            precommits: VoteSet::new(height, round, VoteFlag::PreCommit, validators),
            proposal: None,
            flags: ScheduleFlags::default(),
            prevote_quorum_handled: false,
        }
    }

    pub fn round(&self) -> u32 {
        self.round
    }

    pub fn prevotes(&self) -> &VoteSet {
        &self.prevotes
    }

    pub fn precommits(&self) -> &VoteSet {
        &self.precommits
    }

    pub fn votes(&self, flag: VoteFlag) -> Option<&VoteSet> {
        match flag {
            VoteFlag::PreVote => Some(&self.prevotes),
            VoteFlag::PreCommit => Some(&self.precommits),
            VoteFlag::Null => None,
        }
    }

    pub fn votes_mut(&mut self, flag: VoteFlag) -> Option<&mut VoteSet> {
        match flag {
            VoteFlag::PreVote => Some(&mut self.prevotes),
            VoteFlag::PreCommit => Some(&mut self.precommits),
            VoteFlag::Null => None,
        }
    }

    pub fn proposal(&self) -> Option<&Proposal> {
        self.proposal.as_ref()
    }

    /// Accept the round's proposal; a second one is refused
    pub fn set_proposal(&mut self, proposal: Proposal) -> Result<()> {
        if self.proposal.is_some() {
            return Err(ConsensusError::ProposalAlreadyExists { round: self.round });
        }
        self.proposal = Some(proposal);
        Ok(())
    }

    /// Drop the round's proposal so a correct one can be accepted
    pub fn discard_proposal(&mut self) -> Option<Proposal> {
        self.proposal.take()
    }

    pub fn flags(&self) -> ScheduleFlags {
        self.flags
    }

    /// Arm the flag for `kind`. Returns false if it was already armed.
    pub fn try_schedule(&mut self, kind: TimeoutKind) -> bool {
        let flag = match kind {
            TimeoutKind::Propose => &mut self.flags.propose_timeout,
            TimeoutKind::PreVote => &mut self.flags.prevote_timeout,
            TimeoutKind::PreCommit => &mut self.flags.precommit_timeout,
            TimeoutKind::PreCommitWait(_) => &mut self.flags.precommit_wait,
            TimeoutKind::EndCommitWait => &mut self.flags.endcommit_wait,
        };
        !std::mem::replace(flag, true)
    }

    pub fn prevote_quorum_handled(&self) -> bool {
        self.prevote_quorum_handled
    }

    /// Mark the PreVote quorum as handled. Returns false if it already was.
    pub fn mark_prevote_quorum_handled(&mut self) -> bool {
        !std::mem::replace(&mut self.prevote_quorum_handled, true)
    }
}
