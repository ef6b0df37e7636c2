//! Round-indexed state for one height

use crate::error::{ConsensusError, Result};
use crate::messages::Vote;
use crate::round_state::RoundState;
use crate::types::{Address, BlockHash};
use crate::validator_set::ValidatorSet;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Rounds beyond the next one that a single validator may open
pub const MAX_CATCHUP_ROUNDS: usize = 2;

/// Rounds of one height, created on first touch
#[derive(Debug, Clone)]
pub struct HeightState {
    height: u64,
    validators: Arc<ValidatorSet>,
    rounds: BTreeMap<u32, RoundState>,
    round: u32,
    /// Rounds above `round + 1` each validator caused to be created
    catchup_rounds: HashMap<Address, Vec<u32>>,
}

impl HeightState {
    pub fn new(height: u64, validators: Arc<ValidatorSet>) -> Self {
        let mut rounds = BTreeMap::new();
        rounds.insert(0, RoundState::new(height, 0, validators.clone()));
        Self {
            height,
            validators,
            rounds,
            round: 0,
            catchup_rounds: HashMap::new(),
        }
    }

    pub fn height(&self) -> u64 {
        self.height
    }

    /// Highest round set as current
    pub fn round(&self) -> u32 {
        self.round
    }

    /// Move the current round forward, creating any skipped rounds
    pub fn set_round(&mut self, round: u32) -> Result<()> {
        if round < self.round {
            return Err(ConsensusError::RoundRegression {
                current: self.round,
                requested: round,
            });
        }
        for r in self.round..=round {
            self.round_mut(r);
        }
        self.round = round;
        Ok(())
    }

    pub fn get(&self, round: u32) -> Option<&RoundState> {
        self.rounds.get(&round)
    }

    /// Round state, created if missing
    pub fn round_mut(&mut self, round: u32) -> &mut RoundState {
        let height = self.height;
        let validators = &self.validators;
        self.rounds
            .entry(round)
            .or_insert_with(|| RoundState::new(height, round, validators.clone()))
    }

    /// Round state for input signed by `from`
    ///
    /// Rounds up to the next one, and rounds that already exist, are always
    /// available. Any later round is charged to `from`, and `None` is returned
    /// once `from` has opened `MAX_CATCHUP_ROUNDS` of them.
    pub fn round_for(&mut self, round: u32, from: Address) -> Option<&mut RoundState> {
        if round > self.round.saturating_add(1) && !self.rounds.contains_key(&round) {
            let opened = self.catchup_rounds.entry(from).or_default();
            if opened.len() >= MAX_CATCHUP_ROUNDS {
                tracing::debug!(
                    "{} exhausted its catch-up rounds {:?}, refusing round {} at round {}",
                    from,
                    opened,
                    round,
                    self.round
                );
                return None;
            }
            opened.push(round);
        }
        Some(self.round_mut(round))
    }

    /// Route a vote into its round's PreVote or PreCommit set
    pub fn add_vote(&mut self, vote: Vote) -> Result<()> {
        if vote.height() != self.height {
            return Err(ConsensusError::InvalidVote(format!(
                "height mismatch: expected {}, got {}",
                self.height,
                vote.height()
            )));
        }
        let validator = vote.validator();
        if !self.validators.contains(&validator) {
            return Err(ConsensusError::InvalidVote(format!(
                "{} is not a validator",
                validator
            )));
        }
        let (round, flag) = (vote.round(), vote.flag());
        self.round_for(round, validator)
            .ok_or_else(|| {
                ConsensusError::InvalidVote(format!(
                    "{} opened too many future rounds, refusing round {}",
                    validator, round
                ))
            })?
            .votes_mut(flag)
            .ok_or_else(|| ConsensusError::InvalidVote(format!("{} votes cannot be added", flag)))?
            .add(vote)
    }

    /// Proof of lock: highest round up to the current one whose PreVotes have
    /// a non-nil majority, with that majority's hash
    pub fn pol(&self) -> Option<(u32, BlockHash)> {
        self.rounds
            .range(..=self.round)
            .rev()
            .find_map(|(round, state)| {
                state
                    .prevotes()
                    .two_thirds_majority()
                    .filter(|hash| !hash.is_nil())
                    .map(|hash| (*round, hash))
            })
    }

    pub fn rounds(&self) -> impl Iterator<Item = &RoundState> {
        self.rounds.values()
    }
}
