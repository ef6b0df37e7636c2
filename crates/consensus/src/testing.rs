//! Shared test fixtures

use crate::block::Block;
use crate::chain::{Blockchain, MemoryChain};
use crate::config::ConsensusConfig;
use crate::consensus::{Consensus, Mutation};
use crate::crypto::{PrivateKey, Signer};
use crate::error::{ConsensusError, Result};
use crate::events::{ConsensusEvent, Effect};
use crate::evidence::EvidenceCollector;
use crate::messages::{ConsensusMessage, Proposal, ProposalMetadata, Vote, VoteMetadata};
use crate::timeout::{Timeout, TimeoutKind};
use crate::types::{Address, BlockHash, VoteFlag};
use crate::validator_set::{Validator, ValidatorSet};
use std::collections::VecDeque;
use std::sync::Arc;

/// Deterministic keys
pub fn keys(n: usize) -> Vec<PrivateKey> {
    (0..n)
        .map(|i| PrivateKey::from_bytes([i as u8 + 1; 32]))
        .collect()
}

/// Validator set giving `powers[i]` to `keys[i]`
pub fn validator_set(keys: &[PrivateKey], powers: &[u64]) -> ValidatorSet {
    ValidatorSet::new(
        keys.iter()
            .zip(powers)
            .map(|(key, power)| Validator::new(key.address(), *power))
            .collect(),
    )
    .unwrap()
}

/// Signed vote carrying the power `set` assigns to `key`
pub fn vote(
    key: &PrivateKey,
    set: &ValidatorSet,
    height: u64,
    round: u32,
    block_hash: BlockHash,
    flag: VoteFlag,
) -> Vote {
    let power = set.power_of(&key.address()).unwrap();
    Vote::sign(
        VoteMetadata::new(height, round, block_hash, key.address(), power, flag),
        key,
    )
}

pub fn proposal(
    key: &PrivateKey,
    height: u64,
    round: u32,
    block: Block,
    valid_round: Option<u32>,
) -> Proposal {
    Proposal::sign(
        ProposalMetadata::new(height, round, block, key.address(), valid_round),
        key,
    )
}

/// Index into `keys(n)` of the proposer for `round` at height 1
pub fn proposer_index(n: usize, round: u32) -> usize {
    let keys = keys(n);
    let address = validator_set(&keys, &vec![1; n]).proposer(1, round).address;
    keys.iter().position(|k| k.address() == address).unwrap()
}

/// Drives one `Consensus` synchronously
///
/// Own proposals and votes are fed back as input and zero-delay timers fire
/// immediately; other timers wait for [`Harness::fire`].
pub struct Harness {
    pub keys: Vec<PrivateKey>,
    pub chain: Arc<MemoryChain>,
    pub consensus: Consensus,
    pub evidence: Arc<EvidenceCollector>,
    pub published: Vec<ConsensusMessage>,
    pub events: Vec<ConsensusEvent>,
    pub timers: Vec<Timeout>,
    pub errors: Vec<ConsensusError>,
}

impl Harness {
    /// `n` equal-power validators, running as `keys[me]`
    pub fn new(n: usize, me: usize) -> Self {
        Self::with_config(n, me, ConsensusConfig::default())
    }

    /// Running as the proposer of `round`
    pub fn proposing(n: usize, round: u32) -> Self {
        Self::new(n, proposer_index(n, round))
    }

    /// Running as a validator that proposes none of `rounds`
    pub fn not_proposing(n: usize, rounds: &[u32]) -> Self {
        let excluded: Vec<usize> = rounds.iter().map(|r| proposer_index(n, *r)).collect();
        let me = (0..n).find(|i| !excluded.contains(i)).unwrap();
        Self::new(n, me)
    }

    pub fn with_config(n: usize, me: usize, config: ConsensusConfig) -> Self {
        let keys = keys(n);
        let set = validator_set(&keys, &vec![1; n]);
        let chain = Arc::new(MemoryChain::new(set));
        let evidence = Arc::new(EvidenceCollector::new());
        let signer: Arc<dyn Signer> = Arc::new(PrivateKey::from_bytes(keys[me].to_bytes()));
        let consensus =
            Consensus::new(1, signer, chain.clone(), config, evidence.clone()).unwrap();

        Self {
            keys,
            chain,
            consensus,
            evidence,
            published: Vec::new(),
            events: Vec::new(),
            timers: Vec::new(),
            errors: Vec::new(),
        }
    }

    pub fn set(&self) -> &ValidatorSet {
        self.consensus.validators()
    }

    pub fn address(&self) -> Address {
        self.consensus.address()
    }

    /// Key of the proposer for `round` at height 1
    pub fn proposer_key(&self, round: u32) -> &PrivateKey {
        let address = self.set().proposer(1, round).address;
        self.keys.iter().find(|k| k.address() == address).unwrap()
    }

    /// Keys other than this node's, in key order
    pub fn peers(&self) -> Vec<&PrivateKey> {
        let me = self.address();
        self.keys.iter().filter(|k| k.address() != me).collect()
    }

    /// Owned copies of the peer keys
    pub fn peer_keys(&self) -> Vec<PrivateKey> {
        self.peers()
            .into_iter()
            .map(|k| PrivateKey::from_bytes(k.to_bytes()))
            .collect()
    }

    pub fn start(&mut self) {
        self.handle(Mutation::Start).unwrap();
    }

    /// Apply a mutation and everything it triggers; returns the first error
    pub fn handle(&mut self, mutation: Mutation) -> Result<()> {
        let errors = self.errors.len();
        let mut queue = VecDeque::from([mutation]);
        while let Some(mutation) = queue.pop_front() {
            if let Err(e) = self.consensus.handle(mutation) {
                self.errors.push(e);
            }
            for effect in self.consensus.drain_effects() {
                match effect {
                    Effect::Publish(message) => {
                        let own = message.validator() == self.address()
                            && matches!(
                                message,
                                ConsensusMessage::Proposal(_) | ConsensusMessage::Vote(_)
                            );
                        if own {
                            queue.push_back(Mutation::Message(message.clone()));
                        }
                        self.published.push(message);
                    }
                    Effect::Emit(event) => self.events.push(event),
                    Effect::Schedule { timeout, delay } => {
                        if delay.is_zero() {
                            queue.push_back(Mutation::Timeout(timeout));
                        } else {
                            self.timers.push(timeout);
                        }
                    }
                }
            }
        }
        match self.errors.get(errors) {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    pub fn receive(&mut self, message: impl Into<ConsensusMessage>) -> Result<()> {
        self.handle(Mutation::Message(message.into()))
    }

    /// Vote from `key` at height 1
    pub fn vote(&self, key: &PrivateKey, round: u32, hash: BlockHash, flag: VoteFlag) -> Vote {
        vote(key, self.set(), 1, round, hash, flag)
    }

    /// Block for height 1 proposed by `key`
    pub fn block(&self, key: &PrivateKey) -> Block {
        self.chain.propose_block(&key.address(), 1).unwrap()
    }

    /// Fire the pending timer of `kind` for `round`, if armed
    pub fn fire(&mut self, round: u32, kind: TimeoutKind) -> bool {
        let Some(index) = self
            .timers
            .iter()
            .position(|t| t.round == round && t.kind == kind)
        else {
            return false;
        };
        let timeout = self.timers.remove(index);
        let _ = self.handle(Mutation::Timeout(timeout));
        true
    }

    /// Votes this node published, in order
    pub fn own_votes(&self) -> Vec<&Vote> {
        let me = self.address();
        self.published
            .iter()
            .filter_map(|m| match m {
                ConsensusMessage::Vote(v) if v.validator() == me => Some(v),
                _ => None,
            })
            .collect()
    }

    pub fn completed(&self) -> Option<&Block> {
        self.events.iter().find_map(|e| match e {
            ConsensusEvent::Completed { block, .. } => Some(block),
            _ => None,
        })
    }
}
