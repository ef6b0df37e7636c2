//! Consensus errors

use crate::chain::BlockError;
use crate::evidence::DuplicateVoteEvidence;
use crate::types::BlockHash;
use thiserror::Error;

/// Errors raised while feeding inputs into a consensus instance
#[derive(Error, Debug, Clone)]
pub enum ConsensusError {
    #[error("invalid vote: {0}")]
    InvalidVote(String),

    #[error("invalid proposal: {0}")]
    InvalidProposal(String),

    #[error("invalid maj23: {0}")]
    InvalidMaj23(String),

    #[error("invalid vote set bits: {0}")]
    InvalidVoteSetBits(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("height must be at least 1, got {0}")]
    InvalidHeight(u64),

    #[error("invalid validator set: {0}")]
    InvalidValidatorSet(String),

    /// Two different votes from one validator for the same height, round and type
    #[error("conflicting votes from {}", .0.validator())]
    DuplicateVote(Box<DuplicateVoteEvidence>),

    #[error("proposal for round {round} already exists")]
    ProposalAlreadyExists { round: u32 },

    #[error("proposal {proposal} conflicts with the 2/3 majority {majority} of round {round}")]
    ProposalConflictsWithMajority {
        round: u32,
        proposal: BlockHash,
        majority: BlockHash,
    },

    #[error("cannot move round back from {current} to {requested}")]
    RoundRegression { current: u32, requested: u32 },

    #[error("invalid block: {0}")]
    InvalidBlock(#[from] BlockError),

    #[error("blockchain error: {0}")]
    Chain(String),

    #[error("upon-rule evaluation did not settle after {0} iterations")]
    FixpointLimitExceeded(usize),

    #[error("consensus already started")]
    AlreadyStarted,

    #[error("consensus not started")]
    NotStarted,

    #[error("consensus stopped")]
    Stopped,

    #[error("consensus cancelled")]
    Cancelled,
}

impl ConsensusError {
    /// Errors that terminate the mutation consumer
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ConsensusError::FixpointLimitExceeded(_)
                | ConsensusError::Chain(_)
                | ConsensusError::RoundRegression { .. }
        )
    }

    /// Errors worth recording as misbehavior evidence
    pub fn is_evidence(&self) -> bool {
        matches!(self, ConsensusError::DuplicateVote(_))
    }

    /// Validation and protocol errors that leave state untouched
    pub fn is_rejection(&self) -> bool {
        !self.is_fatal() && !matches!(self, ConsensusError::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, ConsensusError>;
