//! Validator set for a single height

use crate::error::{ConsensusError, Result};
use crate::types::Address;
use borsh::{BorshDeserialize, BorshSerialize};
use std::collections::HashSet;

/// A validator and its voting power
#[derive(Debug, Clone, Copy, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Validator {
    pub address: Address,
    pub power: u64,
}

impl Validator {
    pub fn new(address: Address, power: u64) -> Self {
        Self { address, power }
    }
}

/// Immutable, address-ordered validator set
///
/// Thresholds are computed in `u128` so that `2 * total` never overflows.
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct ValidatorSet {
    validators: Vec<Validator>,
    total_power: u64,
}

impl ValidatorSet {
    /// Build a set, sorting by address. Rejects duplicates and zero total power.
    pub fn new(mut validators: Vec<Validator>) -> Result<Self> {
        let mut seen = HashSet::with_capacity(validators.len());
        for validator in &validators {
            if !seen.insert(validator.address) {
                return Err(ConsensusError::InvalidValidatorSet(format!(
                    "duplicate validator {}",
                    validator.address
                )));
            }
        }

        let total_power = validators
            .iter()
            .try_fold(0u64, |acc, v| acc.checked_add(v.power))
            .ok_or_else(|| {
                ConsensusError::InvalidValidatorSet("total power overflows".to_string())
            })?;
        if total_power == 0 {
            return Err(ConsensusError::InvalidValidatorSet(
                "total power must be positive".to_string(),
            ));
        }

        validators.sort_by(|a, b| a.address.cmp(&b.address));
        Ok(Self {
            validators,
            total_power,
        })
    }

    pub fn len(&self) -> usize {
        self.validators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Validator> {
        self.validators.iter()
    }

    pub fn get(&self, index: usize) -> Option<&Validator> {
        self.validators.get(index)
    }

    pub fn total_power(&self) -> u64 {
        self.total_power
    }

    pub fn contains(&self, address: &Address) -> bool {
        self.index_of(address).is_some()
    }

    pub fn index_of(&self, address: &Address) -> Option<usize> {
        self.validators
            .binary_search_by(|v| v.address.cmp(address))
            .ok()
    }

    pub fn power_of(&self, address: &Address) -> Option<u64> {
        self.index_of(address).map(|i| self.validators[i].power)
    }

    /// Smallest power strictly above two thirds of the total, `floor(2 * total / 3) + 1`
    pub fn two_thirds_threshold(&self) -> u64 {
        (self.total_power as u128 * 2 / 3) as u64 + 1
    }

    /// Smallest power strictly above one third of the total, `floor(total / 3) + 1`
    pub fn one_third_threshold(&self) -> u64 {
        (self.total_power as u128 / 3) as u64 + 1
    }

    /// `power > 2/3 * total`
    pub fn exceeds_two_thirds(&self, power: u64) -> bool {
        power >= self.two_thirds_threshold()
    }

    /// `power > 1/3 * total`
    pub fn exceeds_one_third(&self, power: u64) -> bool {
        power >= self.one_third_threshold()
    }

    /// Deterministic round-robin proposer for `(height, round)`
    pub fn proposer(&self, height: u64, round: u32) -> &Validator {
        let index = (height as u128 + round as u128) % self.validators.len() as u128;
        &self.validators[index as usize]
    }
}
