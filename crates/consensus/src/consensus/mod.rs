//! Consensus state machine for a single height
//!
//! `Consensus` is synchronous and performs no I/O. Every input arrives as a
//! [`Mutation`]; after applying it the upon-rules are re-evaluated until none
//! fires. Messages to gossip, events and timers are queued as [`Effect`]s and
//! collected with [`Consensus::drain_effects`]. [`crate::node::ConsensusNode`]
//! runs this on tokio.

mod ingest;
mod rules;
mod steps;
#[cfg(test)]
mod tests;

use crate::block::{Block, BlockCommit};
use crate::chain::Blockchain;
use crate::config::ConsensusConfig;
use crate::crypto::Signer;
use crate::error::{ConsensusError, Result};
use crate::events::{ConsensusEvent, Effect};
use crate::evidence::EvidenceCollector;
use crate::height_state::HeightState;
use crate::messages::{ConsensusMessage, Proposal};
use crate::timeout::{Timeout, TimeoutKind};
use crate::types::{Address, BlockHash, Step};
use crate::validator_set::ValidatorSet;
use crate::validity_cache::ValidityCache;
use std::sync::Arc;

/// One atomic input to the state machine
#[derive(Debug, Clone)]
pub enum Mutation {
    /// Start round 0
    Start,
    Message(ConsensusMessage),
    Timeout(Timeout),
}

/// A block remembered with its hash and the round it was seen in
#[derive(Debug, Clone)]
struct RoundBlock {
    round: u32,
    hash: BlockHash,
    block: Block,
}

impl RoundBlock {
    fn new(round: u32, hash: BlockHash, block: Block) -> Self {
        Self { round, hash, block }
    }
}

pub struct Consensus {
    height: u64,
    round: u32,
    step: Step,
    validators: Arc<ValidatorSet>,
    signer: Arc<dyn Signer>,
    chain: Arc<dyn Blockchain>,
    config: ConsensusConfig,
    state: HeightState,
    /// Block this validator must keep prevoting, with the round it locked in
    locked: Option<RoundBlock>,
    /// Latest block seen with a PreVote quorum, with its round
    valid: Option<RoundBlock>,
    /// Decided block with the round it was committed in
    decision: Option<RoundBlock>,
    validity: ValidityCache,
    evidence: Arc<EvidenceCollector>,
    effects: Vec<Effect>,
}

impl Consensus {
    pub fn new(
        height: u64,
        signer: Arc<dyn Signer>,
        chain: Arc<dyn Blockchain>,
        config: ConsensusConfig,
        evidence: Arc<EvidenceCollector>,
    ) -> Result<Self> {
        if height == 0 {
            return Err(ConsensusError::InvalidHeight(height));
        }
        let validators = Arc::new(
            chain
                .validator_set(height)
                .map_err(|e| ConsensusError::Chain(e.to_string()))?,
        );

        Ok(Self {
            height,
            round: 0,
            step: Step::Default,
            state: HeightState::new(height, validators.clone()),
            validators,
            signer,
            chain,
            validity: ValidityCache::new(config.validity_cache_capacity),
            config,
            locked: None,
            valid: None,
            decision: None,
            evidence,
            effects: Vec::new(),
        })
    }

    /// Apply one mutation and settle the upon-rules
    ///
    /// On error the mutation is rejected; effects queued before the error are
    /// still returned by the next `drain_effects`.
    pub fn handle(&mut self, mutation: Mutation) -> Result<()> {
        match mutation {
            Mutation::Start => self.start()?,
            Mutation::Message(message) => self.add_message(message)?,
            Mutation::Timeout(timeout) => self.on_timeout(timeout)?,
        }
        self.run_to_fixpoint()
    }

    /// Take the effects queued since the last call
    pub fn drain_effects(&mut self) -> Vec<Effect> {
        std::mem::take(&mut self.effects)
    }

    pub fn height(&self) -> u64 {
        self.height
    }

    /// Current round, `None` before start
    pub fn round(&self) -> Option<u32> {
        (self.step != Step::Default).then_some(self.round)
    }

    pub fn step(&self) -> Step {
        self.step
    }

    pub fn address(&self) -> Address {
        self.signer.address()
    }

    pub fn validators(&self) -> &ValidatorSet {
        &self.validators
    }

    pub fn config(&self) -> &ConsensusConfig {
        &self.config
    }

    pub fn state(&self) -> &HeightState {
        &self.state
    }

    /// The accepted proposal of the current round
    pub fn proposal(&self) -> Option<&Proposal> {
        self.state.get(self.round).and_then(|s| s.proposal())
    }

    pub fn locked_round(&self) -> Option<u32> {
        self.locked.as_ref().map(|locked| locked.round)
    }

    pub fn locked_block(&self) -> Option<&Block> {
        self.locked.as_ref().map(|locked| &locked.block)
    }

    pub fn valid_round(&self) -> Option<u32> {
        self.valid.as_ref().map(|valid| valid.round)
    }

    pub fn valid_block(&self) -> Option<&Block> {
        self.valid.as_ref().map(|valid| &valid.block)
    }

    pub fn decision(&self) -> Option<&Block> {
        self.decision.as_ref().map(|decision| &decision.block)
    }

    /// Commit certificate of the decided block
    pub fn block_commit(&self) -> Option<BlockCommit> {
        let round = self.decision.as_ref()?.round;
        self.state.get(round)?.precommits().block_commit()
    }

    pub fn evidence(&self) -> &Arc<EvidenceCollector> {
        &self.evidence
    }

    fn start(&mut self) -> Result<()> {
        if self.step != Step::Default {
            return Err(ConsensusError::AlreadyStarted);
        }
        tracing::info!(
            "Starting consensus at height {} as {} ({} validators)",
            self.height,
            self.address(),
            self.validators.len()
        );
        self.start_round(0)?;
        self.process_height_or_round_rules(0)
    }

    fn locked_hash(&self) -> Option<BlockHash> {
        self.locked.as_ref().map(|locked| locked.hash)
    }

    /// Memoized validity predicate for blocks of this height
    ///
    /// `hash` must be the hash of `block`; proposals are checked for this on
    /// admission.
    fn is_valid(&self, hash: BlockHash, block: &Block) -> bool {
        self.validity.get_or_insert_with(hash, || {
            if block.height != self.height {
                return false;
            }
            match self.chain.validate_block(block) {
                Ok(()) => true,
                Err(e) => {
                    tracing::debug!("Block {} is invalid: {}", hash, e);
                    false
                }
            }
        })
    }

    fn emit(&mut self, event: ConsensusEvent) {
        self.effects.push(Effect::Emit(event));
    }

    fn publish(&mut self, message: ConsensusMessage) {
        self.effects.push(Effect::Publish(message));
    }

    /// Arm a timer once per round and kind
    fn schedule(&mut self, round: u32, kind: TimeoutKind) -> bool {
        if !self.state.round_mut(round).try_schedule(kind) {
            return false;
        }
        let delay = kind.delay(&self.config, round);
        tracing::trace!(
            "Scheduling {:?} for height {} round {} in {:?}",
            kind,
            self.height,
            round,
            delay
        );
        self.effects.push(Effect::Schedule {
            timeout: Timeout::new(self.height, round, kind),
            delay,
        });
        true
    }
}
