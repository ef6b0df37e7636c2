//! Validation and ingestion of peer messages

use super::Consensus;
use crate::error::{ConsensusError, Result};
use crate::messages::{
    ConsensusMessage, Maj23, Proposal, Vote, VoteSetBits, VoteSetBitsMetadata,
};
use crate::types::{now_millis, BlockHash, VoteFlag};

impl Consensus {
    pub(super) fn add_message(&mut self, message: ConsensusMessage) -> Result<()> {
        if message.height() != self.height {
            return Err(ConsensusError::InvalidMessage(format!(
                "height mismatch: expected {}, got {}",
                self.height,
                message.height()
            )));
        }

        match message {
            ConsensusMessage::Proposal(proposal) => {
                let round = proposal.round();
                self.add_proposal(proposal)?;
                self.process_height_or_round_rules(round)
            }
            ConsensusMessage::Vote(vote) => {
                let round = vote.round();
                self.add_vote(vote)?;
                self.process_height_or_round_rules(round)
            }
            ConsensusMessage::Maj23(maj23) => {
                if let Some(bits) = self.add_maj23(&maj23)? {
                    self.publish(ConsensusMessage::VoteSetBits(bits));
                }
                Ok(())
            }
            ConsensusMessage::VoteSetBits(bits) => {
                for message in self.vote_set_bits_response(&bits)? {
                    self.publish(message);
                }
                Ok(())
            }
        }
    }

    fn add_proposal(&mut self, proposal: Proposal) -> Result<()> {
        let round = proposal.round();
        if proposal.height() != self.height {
            return Err(ConsensusError::InvalidProposal(format!(
                "height mismatch: expected {}, got {}",
                self.height,
                proposal.height()
            )));
        }
        if !proposal.verify() {
            return Err(ConsensusError::InvalidProposal(format!(
                "invalid signature from {}",
                proposal.proposer()
            )));
        }
        if proposal.block().hash() != proposal.block_hash() {
            return Err(ConsensusError::InvalidProposal(
                "block does not match the proposed hash".to_string(),
            ));
        }
        if proposal.block().height != self.height {
            return Err(ConsensusError::InvalidProposal(format!(
                "block height {} does not match height {}",
                proposal.block().height,
                self.height
            )));
        }

        let expected = self.validators.proposer(self.height, round).address;
        if proposal.proposer() != expected {
            return Err(ConsensusError::InvalidProposal(format!(
                "{} is not the proposer of round {}, expected {}",
                proposal.proposer(),
                round,
                expected
            )));
        }
        if round != self.round {
            return Err(ConsensusError::InvalidProposal(format!(
                "round mismatch: expected {}, got {}",
                self.round, round
            )));
        }
        if let Some(valid_round) = proposal.valid_round() {
            if valid_round >= round {
                return Err(ConsensusError::InvalidProposal(format!(
                    "valid round {} is not below round {}",
                    valid_round, round
                )));
            }
        }

        let state = self.state.round_mut(round);
        if state.proposal().is_some() {
            return Err(ConsensusError::ProposalAlreadyExists { round });
        }
        let hash = proposal.block_hash();
        for majority in [
            state.prevotes().two_thirds_majority(),
            state.precommits().two_thirds_majority(),
        ]
        .into_iter()
        .flatten()
        {
            if majority != hash {
                return Err(ConsensusError::ProposalConflictsWithMajority {
                    round,
                    proposal: hash,
                    majority,
                });
            }
        }

        tracing::debug!(
            "Accepted proposal {} for height {} round {} from {}",
            hash,
            self.height,
            round,
            proposal.proposer()
        );
        state.set_proposal(proposal)
    }

    fn add_vote(&mut self, vote: Vote) -> Result<()> {
        if vote.height() != self.height {
            return Err(ConsensusError::InvalidVote(format!(
                "height mismatch: expected {}, got {}",
                self.height,
                vote.height()
            )));
        }
        if vote.flag() == VoteFlag::Null {
            return Err(ConsensusError::InvalidVote(
                "null votes cannot be added".to_string(),
            ));
        }
        if !vote.verify() {
            return Err(ConsensusError::InvalidVote(format!(
                "invalid signature from {}",
                vote.validator()
            )));
        }

        match self.state.add_vote(vote) {
            Err(ConsensusError::DuplicateVote(evidence)) => {
                self.evidence.record((*evidence).clone());
                Err(ConsensusError::DuplicateVote(evidence))
            }
            result => result,
        }
    }

    /// Record a peer's 2/3 claim
    ///
    /// Returns the VoteSetBits to send back when this node is missing some of
    /// the claimed votes.
    pub fn add_maj23(&mut self, maj23: &Maj23) -> Result<Option<VoteSetBits>> {
        let metadata = &maj23.metadata;
        if metadata.height != self.height {
            return Err(ConsensusError::InvalidMaj23(format!(
                "height mismatch: expected {}, got {}",
                self.height, metadata.height
            )));
        }
        if metadata.flag == VoteFlag::Null {
            return Err(ConsensusError::InvalidMaj23(
                "claim must be for PreVote or PreCommit".to_string(),
            ));
        }
        if !self.validators.contains(&metadata.validator) {
            return Err(ConsensusError::InvalidMaj23(format!(
                "{} is not a validator",
                metadata.validator
            )));
        }
        if !maj23.verify() {
            return Err(ConsensusError::InvalidMaj23(format!(
                "invalid signature from {}",
                metadata.validator
            )));
        }

        let (round, hash, flag) = (metadata.round, metadata.block_hash, metadata.flag);
        let Some(state) = self.state.round_for(round, metadata.validator) else {
            return Err(ConsensusError::InvalidMaj23(format!(
                "{} opened too many future rounds, refusing round {}",
                metadata.validator, round
            )));
        };
        let Some(votes) = state.votes_mut(flag) else {
            return Ok(None);
        };
        votes.set_peer_maj23(metadata.validator, hash)?;
        let bits = votes.bits_for(&hash);
        if bits.iter().all(|held| *held) {
            return Ok(None);
        }

        tracing::debug!(
            "Peer {} claims {} majority for {} in round {}, requesting missing votes",
            metadata.validator,
            flag,
            hash,
            round
        );
        Ok(Some(self.sign_vote_set_bits(round, hash, flag, bits)))
    }

    /// Which votes for `hash` this node holds in `round`, signed by this node
    pub fn vote_set_bits(&self, round: u32, hash: BlockHash, flag: VoteFlag) -> Result<VoteSetBits> {
        if flag == VoteFlag::Null {
            return Err(ConsensusError::InvalidVoteSetBits(
                "bits must be for PreVote or PreCommit".to_string(),
            ));
        }
        let bits = self
            .state
            .get(round)
            .and_then(|state| state.votes(flag))
            .map(|votes| votes.bits_for(&hash))
            .unwrap_or_else(|| vec![false; self.validators.len()]);
        Ok(self.sign_vote_set_bits(round, hash, flag, bits))
    }

    /// Votes this node holds that the sender of `bits` is missing
    pub fn vote_set_bits_response(&self, bits: &VoteSetBits) -> Result<Vec<ConsensusMessage>> {
        let metadata = &bits.metadata;
        if metadata.height != self.height {
            return Err(ConsensusError::InvalidVoteSetBits(format!(
                "height mismatch: expected {}, got {}",
                self.height, metadata.height
            )));
        }
        if metadata.flag == VoteFlag::Null {
            return Err(ConsensusError::InvalidVoteSetBits(
                "bits must be for PreVote or PreCommit".to_string(),
            ));
        }
        if metadata.vote_bits.len() != self.validators.len() {
            return Err(ConsensusError::InvalidVoteSetBits(format!(
                "expected {} bits, got {}",
                self.validators.len(),
                metadata.vote_bits.len()
            )));
        }
        if !bits.verify() {
            return Err(ConsensusError::InvalidVoteSetBits(format!(
                "invalid signature from {}",
                metadata.validator
            )));
        }

        let Some(votes) = self
            .state
            .get(metadata.round)
            .and_then(|state| state.votes(metadata.flag))
        else {
            return Ok(Vec::new());
        };

        Ok(self
            .validators
            .iter()
            .zip(&metadata.vote_bits)
            .filter(|(_, held)| !**held)
            .filter_map(|(validator, _)| votes.get(&validator.address))
            .filter(|vote| vote.block_hash() == metadata.block_hash)
            .cloned()
            .map(ConsensusMessage::Vote)
            .collect())
    }

    fn sign_vote_set_bits(
        &self,
        round: u32,
        block_hash: BlockHash,
        flag: VoteFlag,
        vote_bits: Vec<bool>,
    ) -> VoteSetBits {
        let metadata = VoteSetBitsMetadata {
            height: self.height,
            round,
            block_hash,
            timestamp: now_millis(),
            validator: self.address(),
            flag,
            vote_bits,
        };
        VoteSetBits::sign(metadata, self.signer.as_ref())
    }
}
