//! Votes of one type for one round

use crate::block::BlockCommit;
use crate::error::{ConsensusError, Result};
use crate::evidence::DuplicateVoteEvidence;
use crate::messages::Vote;
use crate::types::{Address, BlockHash, VoteFlag};
use crate::validator_set::ValidatorSet;
use std::collections::HashMap;
use std::sync::Arc;

/// One vote per validator, with voting power tallied per block hash
///
/// The first block hash whose tally exceeds 2/3 of the total power becomes the
/// majority and stays fixed for the life of the set.
#[derive(Debug, Clone)]
pub struct VoteSet {
    height: u64,
    round: u32,
    flag: VoteFlag,
    validators: Arc<ValidatorSet>,
    votes: HashMap<Address, Vote>,
    power_by_hash: HashMap<BlockHash, u64>,
    /// Power of every recorded vote regardless of hash
    sum: u64,
    maj23: Option<BlockHash>,
    /// Majorities claimed by peers
    peer_maj23s: HashMap<Address, BlockHash>,
}

impl VoteSet {
    pub fn new(height: u64, round: u32, flag: VoteFlag, validators: Arc<ValidatorSet>) -> Self {
        Self {
            height,
            round,
            flag,
            validators,
            votes: HashMap::new(),
            power_by_hash: HashMap::new(),
            sum: 0,
            maj23: None,
            peer_maj23s: HashMap::new(),
        }
    }

    pub fn height(&self) -> u64 {
        self.height
    }

    pub fn round(&self) -> u32 {
        self.round
    }

    pub fn flag(&self) -> VoteFlag {
        self.flag
    }

    pub fn validators(&self) -> &ValidatorSet {
        &self.validators
    }

    /// Record a vote
    ///
    /// The signature is not checked here; callers verify before routing.
    pub fn add(&mut self, vote: Vote) -> Result<()> {
        if vote.height() != self.height {
            return Err(ConsensusError::InvalidVote(format!(
                "height mismatch: expected {}, got {}",
                self.height,
                vote.height()
            )));
        }
        if vote.round() != self.round {
            return Err(ConsensusError::InvalidVote(format!(
                "round mismatch: expected {}, got {}",
                self.round,
                vote.round()
            )));
        }
        if vote.flag() != self.flag {
            return Err(ConsensusError::InvalidVote(format!(
                "type mismatch: expected {}, got {}",
                self.flag,
                vote.flag()
            )));
        }

        let validator = vote.validator();
        let power = self.validators.power_of(&validator).ok_or_else(|| {
            ConsensusError::InvalidVote(format!("{} is not a validator", validator))
        })?;
        if vote.power() != power {
            return Err(ConsensusError::InvalidVote(format!(
                "power mismatch for {}: claimed {}, expected {}",
                validator,
                vote.power(),
                power
            )));
        }

        if let Some(existing) = self.votes.get(&validator) {
            if existing.block_hash() == vote.block_hash() {
                return Err(ConsensusError::InvalidVote(format!(
                    "{} from {} already recorded",
                    self.flag, validator
                )));
            }
            return Err(ConsensusError::DuplicateVote(Box::new(
                DuplicateVoteEvidence::new(existing.clone(), vote),
            )));
        }

        let hash = vote.block_hash();
        self.votes.insert(validator, vote);
        self.sum = self.sum.saturating_add(power);
        let tally = self.power_by_hash.entry(hash).or_insert(0);
        *tally = tally.saturating_add(power);

        if self.maj23.is_none() && self.validators.exceeds_two_thirds(*tally) {
            tracing::debug!(
                "{} majority for {} at height {} round {}",
                self.flag,
                hash,
                self.height,
                self.round
            );
            self.maj23 = Some(hash);
        }
        Ok(())
    }

    pub fn get(&self, validator: &Address) -> Option<&Vote> {
        self.votes.get(validator)
    }

    pub fn len(&self) -> usize {
        self.votes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.votes.is_empty()
    }

    /// Power of all recorded votes
    pub fn sum(&self) -> u64 {
        self.sum
    }

    /// Power recorded for one block hash
    pub fn power_for(&self, hash: &BlockHash) -> u64 {
        self.power_by_hash.get(hash).copied().unwrap_or(0)
    }

    /// All votes together exceed 1/3 of the total power
    pub fn has_one_third_any(&self) -> bool {
        self.validators.exceeds_one_third(self.sum)
    }

    /// All votes together exceed 2/3 of the total power
    pub fn has_two_thirds_any(&self) -> bool {
        self.validators.exceeds_two_thirds(self.sum)
    }

    /// The fixed majority hash, if one was reached
    pub fn two_thirds_majority(&self) -> Option<BlockHash> {
        self.maj23
    }

    pub fn has_two_thirds_majority(&self) -> bool {
        self.maj23.is_some()
    }

    /// Record a peer's majority claim; a different second claim is refused
    pub fn set_peer_maj23(&mut self, peer: Address, hash: BlockHash) -> Result<()> {
        match self.peer_maj23s.get(&peer) {
            Some(existing) if *existing == hash => Ok(()),
            Some(existing) => Err(ConsensusError::InvalidMaj23(format!(
                "{} already claimed {} for {} round {}, now claims {}",
                peer, existing, self.flag, self.round, hash
            ))),
            None => {
                self.peer_maj23s.insert(peer, hash);
                Ok(())
            }
        }
    }

    pub fn peer_maj23(&self, peer: &Address) -> Option<BlockHash> {
        self.peer_maj23s.get(peer).copied()
    }

    /// One flag per validator, in set order: do we hold its vote for `hash`
    pub fn bits_for(&self, hash: &BlockHash) -> Vec<bool> {
        self.validators
            .iter()
            .map(|v| {
                self.votes
                    .get(&v.address)
                    .is_some_and(|vote| vote.block_hash() == *hash)
            })
            .collect()
    }

    /// Votes for `hash`, in validator set order
    pub fn votes_for(&self, hash: &BlockHash) -> Vec<Vote> {
        self.validators
            .iter()
            .filter_map(|v| self.votes.get(&v.address))
            .filter(|vote| vote.block_hash() == *hash)
            .cloned()
            .collect()
    }

    /// Commit certificate for the majority block
    ///
    /// `None` unless this is a PreCommit set with a non-nil majority.
    pub fn block_commit(&self) -> Option<BlockCommit> {
        if self.flag != VoteFlag::PreCommit {
            return None;
        }
        let hash = self.maj23.filter(|h| !h.is_nil())?;

        let votes = self
            .validators
            .iter()
            .map(|v| match self.votes.get(&v.address) {
                Some(vote) if vote.block_hash() == hash => vote.clone(),
                _ => Vote::null(self.height, self.round, hash, v.address, v.power),
            })
            .collect();

        Some(BlockCommit {
            height: self.height,
            round: self.round,
            block_hash: hash,
            votes,
        })
    }
}
