//! Signals a consensus instance emits to the surrounding service

use crate::block::{Block, BlockCommit};
use crate::error::ConsensusError;
use crate::messages::ConsensusMessage;
use crate::timeout::Timeout;
use crate::types::{BlockHash, Step, VoteFlag};
use std::time::Duration;

/// Observable consensus progress
#[derive(Debug, Clone)]
pub enum ConsensusEvent {
    RoundStarted {
        height: u64,
        round: u32,
    },
    StepChanged {
        height: u64,
        round: u32,
        step: Step,
    },
    PreVoteEntered {
        round: u32,
        block_hash: BlockHash,
    },
    PreCommitEntered {
        round: u32,
        block_hash: BlockHash,
    },
    QuorumReached {
        round: u32,
        block_hash: BlockHash,
        flag: VoteFlag,
    },
    /// The held proposal disagrees with the PreVote majority and was dropped
    ProposalReclaimed {
        round: u32,
        block_hash: BlockHash,
    },
    BlockProposed {
        round: u32,
        valid_round: Option<u32>,
        block: Block,
    },
    /// A message this node signed, to be gossiped
    MessagePublished(ConsensusMessage),
    Completed {
        block: Block,
        commit: BlockCommit,
    },
    ExceptionOccurred(ConsensusError),
    TimeoutProcessed {
        round: u32,
        step: Step,
    },
}

/// Side effect requested by the state machine, carried out by the runtime
#[derive(Debug, Clone)]
pub enum Effect {
    /// Gossip a message signed by this node and feed it back as input
    Publish(ConsensusMessage),
    Emit(ConsensusEvent),
    Schedule { timeout: Timeout, delay: Duration },
}
