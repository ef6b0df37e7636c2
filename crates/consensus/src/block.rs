//! Blocks and commit certificates

use crate::chain::BlockError;
use crate::messages::Vote;
use crate::types::{now_millis, Address, BlockHash, VoteFlag};
use crate::validator_set::ValidatorSet;
use borsh::{BorshDeserialize, BorshSerialize};

/// A block as agreed on by consensus
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Block {
    pub height: u64,
    /// Hash of the parent block, `None` for the first block
    pub previous_hash: Option<BlockHash>,
    pub proposer: Address,
    /// Timestamp (unix millis)
    pub timestamp: i64,
    pub transactions: Vec<Vec<u8>>,
    /// Commit certificate of the parent block
    pub last_commit: Option<BlockCommit>,
}

impl Block {
    pub fn new(
        height: u64,
        previous_hash: Option<BlockHash>,
        proposer: Address,
        transactions: Vec<Vec<u8>>,
        last_commit: Option<BlockCommit>,
    ) -> Self {
        Self {
            height,
            previous_hash,
            proposer,
            timestamp: now_millis(),
            transactions,
            last_commit,
        }
    }

    /// Compute the hash of this block
    pub fn hash(&self) -> BlockHash {
        let bytes = borsh::to_vec(self).expect("Block serialization should not fail");
        BlockHash(*blake3::hash(&bytes).as_bytes())
    }
}

/// Positional PreCommit votes proving a block was decided
///
/// `votes[i]` belongs to the i-th validator of the height's set. Validators
/// that did not PreCommit the block are filled with unsigned `Null` votes.
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct BlockCommit {
    pub height: u64,
    pub round: u32,
    pub block_hash: BlockHash,
    pub votes: Vec<Vote>,
}

impl BlockCommit {
    /// Check signatures, positions and that the committed power exceeds 2/3
    pub fn verify(&self, validators: &ValidatorSet) -> Result<(), BlockError> {
        if self.block_hash.is_nil() {
            return Err(BlockError::InvalidCommit("commit for nil".to_string()));
        }
        if self.votes.len() != validators.len() {
            return Err(BlockError::InvalidCommit(format!(
                "expected {} votes, got {}",
                validators.len(),
                self.votes.len()
            )));
        }

        let mut power = 0u64;
        for (vote, validator) in self.votes.iter().zip(validators.iter()) {
            if vote.validator() != validator.address {
                return Err(BlockError::InvalidCommit(format!(
                    "vote of {} out of position",
                    vote.validator()
                )));
            }
            if vote.height() != self.height || vote.round() != self.round {
                return Err(BlockError::InvalidCommit(format!(
                    "vote of {} is for another height or round",
                    vote.validator()
                )));
            }
            match vote.flag() {
                VoteFlag::Null => continue,
                VoteFlag::PreCommit => {}
                VoteFlag::PreVote => {
                    return Err(BlockError::InvalidCommit(format!(
                        "prevote from {} in commit",
                        vote.validator()
                    )));
                }
            }
            if vote.block_hash() != self.block_hash || !vote.verify() {
                return Err(BlockError::InvalidCommit(format!(
                    "bad precommit from {}",
                    vote.validator()
                )));
            }
            power = power.saturating_add(validator.power);
        }

        if !validators.exceeds_two_thirds(power) {
            return Err(BlockError::InvalidCommit(format!(
                "committed power {} of {} is not a 2/3 majority",
                power,
                validators.total_power()
            )));
        }
        Ok(())
    }
}
