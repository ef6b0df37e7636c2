//! Upon-rules of the round protocol
//!
//! The generic rules only look at the current round and are re-run until
//! none of them changes anything. The height/round rules (decide and round
//! skip) run once after each vote or proposal is added.

use super::{Consensus, RoundBlock};
use crate::error::{ConsensusError, Result};
use crate::events::ConsensusEvent;
use crate::timeout::TimeoutKind;
use crate::types::{BlockHash, Step, VoteFlag};

impl Consensus {
    /// Re-evaluate the generic rules until nothing fires
    pub(super) fn run_to_fixpoint(&mut self) -> Result<()> {
        if self.step == Step::Default {
            return Ok(());
        }
        let limit = self.config.max_fixpoint_iterations.max(1);
        for _ in 0..limit {
            if !self.process_generic_rules() {
                return Ok(());
            }
        }
        tracing::error!(
            "Upon-rules at height {} round {} did not settle after {} passes",
            self.height,
            self.round,
            limit
        );
        Err(ConsensusError::FixpointLimitExceeded(limit))
    }

    /// One pass over the generic rules. Returns true if any rule fired.
    fn process_generic_rules(&mut self) -> bool {
        let round = self.round;
        let proposal = self.state.get(round).and_then(|s| s.proposal()).cloned();
        let mut changed = false;

        // Fresh proposal, or a re-proposal backed by a PreVote majority in its valid round
        if self.step == Step::Propose {
            if let Some(proposal) = &proposal {
                let hash = proposal.block_hash();
                match proposal.valid_round() {
                    None => {
                        let acceptable = self.is_valid(hash, proposal.block())
                            && self.locked_hash().map_or(true, |locked| locked == hash);
                        let vote = if acceptable { hash } else { BlockHash::NIL };
                        changed |= self.enter_prevote(round, vote);
                    }
                    Some(valid_round)
                        if valid_round < round
                            && self.prevote_majority(valid_round) == Some(hash) =>
                    {
                        let acceptable = self.is_valid(hash, proposal.block())
                            && (self.locked_round() <= Some(valid_round)
                                || self.locked_hash() == Some(hash));
                        let vote = if acceptable { hash } else { BlockHash::NIL };
                        changed |= self.enter_prevote(round, vote);
                    }
                    Some(_) => {}
                }
            }
        }

        if self.step == Step::PreVote && self.has_two_thirds_any(round, VoteFlag::PreVote) {
            changed |= self.schedule(round, TimeoutKind::PreVote);
        }

        // PreVote quorum on the proposed block: lock and remember it as valid
        if matches!(self.step, Step::PreVote | Step::PreCommit) {
            if let Some(proposal) = &proposal {
                let hash = proposal.block_hash();
                let handled = self
                    .state
                    .get(round)
                    .is_some_and(|s| s.prevote_quorum_handled());
                if !handled
                    && self.prevote_majority(round) == Some(hash)
                    && self.is_valid(hash, proposal.block())
                {
                    self.state.round_mut(round).mark_prevote_quorum_handled();
                    let block = proposal.block().clone();
                    if self.step == Step::PreVote {
                        tracing::info!(
                            "Locked on block {} at height {} round {}",
                            hash,
                            self.height,
                            round
                        );
                        self.locked = Some(RoundBlock::new(round, hash, block.clone()));
                        self.schedule(round, TimeoutKind::PreCommitWait(hash));
                        self.emit(ConsensusEvent::QuorumReached {
                            round,
                            block_hash: hash,
                            flag: VoteFlag::PreVote,
                        });
                    }
                    self.valid = Some(RoundBlock::new(round, hash, block));
                    changed = true;
                }
            }
        }

        if self.step == Step::PreVote {
            if let Some(majority) = self.prevote_majority(round) {
                let held = self
                    .state
                    .get(round)
                    .and_then(|s| s.proposal())
                    .map(|p| p.block_hash());
                if majority.is_nil() {
                    changed |= self.schedule(round, TimeoutKind::PreCommitWait(BlockHash::NIL));
                } else if held.is_some_and(|held| held != majority) {
                    tracing::info!(
                        "Dropping proposal for round {}, PreVote majority is for {}",
                        round,
                        majority
                    );
                    self.state.round_mut(round).discard_proposal();
                    self.emit(ConsensusEvent::ProposalReclaimed {
                        round,
                        block_hash: majority,
                    });
                    changed = true;
                }
            }
        }

        if self.has_two_thirds_any(round, VoteFlag::PreCommit) {
            changed |= self.schedule(round, TimeoutKind::PreCommit);
        }

        changed
    }

    /// Decide on a PreCommit majority, or skip ahead when more than 1/3 of
    /// the power is already voting in a later round
    pub(super) fn process_height_or_round_rules(&mut self, message_round: u32) -> Result<()> {
        if self.step == Step::Default || self.decision.is_some() {
            return Ok(());
        }

        let round = self.round;
        if let Some(proposal) = self.state.get(round).and_then(|s| s.proposal()).cloned() {
            let hash = proposal.block_hash();
            if self.precommit_majority(round) == Some(hash) && self.is_valid(hash, proposal.block()) {
                tracing::info!(
                    "Decided block {} at height {} round {}",
                    hash,
                    self.height,
                    round
                );
                self.decision = Some(RoundBlock::new(round, hash, proposal.block().clone()));
                self.emit(ConsensusEvent::QuorumReached {
                    round,
                    block_hash: hash,
                    flag: VoteFlag::PreCommit,
                });
                self.schedule(round, TimeoutKind::EndCommitWait);
                return Ok(());
            }
        }

        if message_round > round && self.has_one_third_any(message_round, VoteFlag::PreVote) {
            tracing::info!(
                "More than 1/3 of the power is in round {}, skipping from round {}",
                message_round,
                round
            );
            self.start_round(message_round)?;
        }
        Ok(())
    }

    fn prevote_majority(&self, round: u32) -> Option<BlockHash> {
        self.state.get(round)?.prevotes().two_thirds_majority()
    }

    fn precommit_majority(&self, round: u32) -> Option<BlockHash> {
        self.state.get(round)?.precommits().two_thirds_majority()
    }

    fn has_two_thirds_any(&self, round: u32, flag: VoteFlag) -> bool {
        self.state
            .get(round)
            .and_then(|s| s.votes(flag))
            .is_some_and(|votes| votes.has_two_thirds_any())
    }

    fn has_one_third_any(&self, round: u32, flag: VoteFlag) -> bool {
        self.state
            .get(round)
            .and_then(|s| s.votes(flag))
            .is_some_and(|votes| votes.has_one_third_any())
    }
}
