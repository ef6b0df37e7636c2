//! Misbehavior evidence
//!
//! Conflicting votes detected while processing are kept here until the
//! surrounding service drains them for inclusion in a later block.

use crate::messages::Vote;
use crate::types::{now_millis, Address, VoteFlag};
use parking_lot::Mutex;

/// Two signed votes from one validator for the same height, round and type
/// but different block hashes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateVoteEvidence {
    /// The vote recorded first
    pub vote_a: Vote,
    /// The conflicting vote that was refused
    pub vote_b: Vote,
    /// Unix millis when the conflict was detected
    pub detected_at: i64,
}

impl DuplicateVoteEvidence {
    pub fn new(vote_a: Vote, vote_b: Vote) -> Self {
        Self {
            vote_a,
            vote_b,
            detected_at: now_millis(),
        }
    }

    pub fn validator(&self) -> Address {
        self.vote_a.validator()
    }

    pub fn height(&self) -> u64 {
        self.vote_a.height()
    }

    pub fn round(&self) -> u32 {
        self.vote_a.round()
    }

    pub fn flag(&self) -> VoteFlag {
        self.vote_a.flag()
    }
}

/// Thread-safe accumulator of evidence
#[derive(Debug, Default)]
pub struct EvidenceCollector {
    pending: Mutex<Vec<DuplicateVoteEvidence>>,
}

impl EvidenceCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, evidence: DuplicateVoteEvidence) {
        tracing::warn!(
            "Conflicting {} votes from {} at height {} round {}",
            evidence.flag(),
            evidence.validator(),
            evidence.height(),
            evidence.round()
        );
        self.pending.lock().push(evidence);
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    /// Take everything collected so far
    pub fn drain(&self) -> Vec<DuplicateVoteEvidence> {
        std::mem::take(&mut *self.pending.lock())
    }
}
