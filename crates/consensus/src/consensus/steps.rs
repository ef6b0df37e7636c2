//! Round and step transitions, and timeout handling

use super::{Consensus, RoundBlock};
use crate::block::Block;
use crate::chain::BlockError;
use crate::error::{ConsensusError, Result};
use crate::events::ConsensusEvent;
use crate::messages::{ConsensusMessage, Proposal, ProposalMetadata, Vote, VoteMetadata};
use crate::timeout::{Timeout, TimeoutKind};
use crate::types::{BlockHash, Step, VoteFlag};

impl Consensus {
    pub(super) fn start_round(&mut self, round: u32) -> Result<()> {
        self.state.set_round(round)?;
        self.round = round;
        tracing::info!("Starting round {} at height {}", round, self.height);
        self.emit(ConsensusEvent::RoundStarted {
            height: self.height,
            round,
        });
        self.set_step(Step::Propose);

        let proposer = self.validators.proposer(self.height, round).address;
        if proposer != self.address() {
            self.schedule(round, TimeoutKind::Propose);
            return Ok(());
        }

        match self.proposal_block() {
            Ok((block, valid_round)) => {
                let metadata =
                    ProposalMetadata::new(self.height, round, block.clone(), proposer, valid_round);
                tracing::info!(
                    "Proposing block {} at height {} round {} (valid round {:?})",
                    metadata.block_hash,
                    self.height,
                    round,
                    valid_round
                );
                let proposal = Proposal::sign(metadata, self.signer.as_ref());
                self.emit(ConsensusEvent::BlockProposed {
                    round,
                    valid_round,
                    block,
                });
                self.publish(ConsensusMessage::Proposal(proposal));
            }
            Err(e) => {
                tracing::warn!(
                    "Failed to assemble a block at height {} round {}: {}",
                    self.height,
                    round,
                    e
                );
                self.emit(ConsensusEvent::ExceptionOccurred(e.into()));
                self.schedule(round, TimeoutKind::Propose);
            }
        }
        Ok(())
    }

    /// Re-propose the valid block if there is one, otherwise ask the chain
    fn proposal_block(&self) -> std::result::Result<(Block, Option<u32>), BlockError> {
        if let Some(valid) = &self.valid {
            return Ok((valid.block.clone(), Some(valid.round)));
        }
        self.chain
            .propose_block(&self.address(), self.height)
            .map(|block| (block, None))
    }

    fn set_step(&mut self, step: Step) {
        tracing::debug!(
            "Height {} round {}: {} -> {}",
            self.height,
            self.round,
            self.step,
            step
        );
        self.step = step;
        self.emit(ConsensusEvent::StepChanged {
            height: self.height,
            round: self.round,
            step,
        });
    }

    /// Sign and publish this node's vote if it is a validator
    fn publish_vote(&mut self, round: u32, block_hash: BlockHash, flag: VoteFlag) {
        let address = self.address();
        let Some(power) = self.validators.power_of(&address) else {
            return;
        };
        let metadata = VoteMetadata::new(self.height, round, block_hash, address, power, flag);
        let vote = Vote::sign(metadata, self.signer.as_ref());
        self.publish(ConsensusMessage::Vote(vote));
    }

    pub(super) fn enter_prevote(&mut self, round: u32, block_hash: BlockHash) -> bool {
        if self.round != round || self.step == Step::Default || self.step >= Step::PreVote {
            return false;
        }
        self.set_step(Step::PreVote);
        tracing::debug!("PreVote {} at height {} round {}", block_hash, self.height, round);
        self.emit(ConsensusEvent::PreVoteEntered { round, block_hash });
        self.publish_vote(round, block_hash, VoteFlag::PreVote);
        true
    }

    pub(super) fn enter_precommit(&mut self, round: u32, block_hash: BlockHash) -> bool {
        if self.round != round || self.step == Step::Default || self.step >= Step::PreCommit {
            return false;
        }
        self.set_step(Step::PreCommit);
        tracing::debug!("PreCommit {} at height {} round {}", block_hash, self.height, round);
        self.emit(ConsensusEvent::PreCommitEntered { round, block_hash });
        self.publish_vote(round, block_hash, VoteFlag::PreCommit);
        true
    }

    /// End the round: complete the height if a block was decided, otherwise
    /// move on to the next round
    pub(super) fn enter_endcommit(&mut self, round: u32) -> Result<bool> {
        if self.round != round || matches!(self.step, Step::Default | Step::EndCommit) {
            return Ok(false);
        }
        self.set_step(Step::EndCommit);

        let Some(RoundBlock {
            round: committed_round,
            hash,
            block,
        }) = self.decision.clone()
        else {
            tracing::info!(
                "No decision at height {} round {}, moving to round {}",
                self.height,
                round,
                round + 1
            );
            self.start_round(round + 1)?;
            return Ok(true);
        };

        self.chain.validate_block(&block)?;
        let commit = self
            .state
            .get(committed_round)
            .and_then(|state| state.precommits().block_commit())
            .ok_or_else(|| {
                ConsensusError::Chain(format!(
                    "no commit for decided block {} in round {}",
                    hash,
                    committed_round
                ))
            })?;

        tracing::info!(
            "Completed height {} with block {} in round {}",
            self.height,
            hash,
            committed_round
        );
        self.emit(ConsensusEvent::Completed { block, commit });
        Ok(true)
    }

    pub(super) fn on_timeout(&mut self, timeout: Timeout) -> Result<()> {
        if timeout.height != self.height {
            tracing::debug!(
                "Ignoring timeout for height {} at height {}",
                timeout.height,
                self.height
            );
            return Ok(());
        }
        let round = timeout.round;
        tracing::debug!(
            "Timeout {:?} fired for height {} round {} (at round {} step {})",
            timeout.kind,
            self.height,
            round,
            self.round,
            self.step
        );

        match timeout.kind {
            TimeoutKind::Propose => {
                if self.step == Step::Propose {
                    self.enter_prevote(round, BlockHash::NIL);
                }
            }
            TimeoutKind::PreVote => {
                if self.step == Step::PreVote {
                    self.enter_precommit(round, BlockHash::NIL);
                }
            }
            TimeoutKind::PreCommit => {
                self.enter_endcommit(round)?;
            }
            TimeoutKind::PreCommitWait(block_hash) => {
                self.enter_precommit(round, block_hash);
            }
            TimeoutKind::EndCommitWait => {
                self.enter_endcommit(round)?;
            }
        }

        if let Some(step) = timeout.kind.step() {
            self.emit(ConsensusEvent::TimeoutProcessed { round, step });
        }
        Ok(())
    }
}
