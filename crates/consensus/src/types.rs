//! Core types shared across the consensus engine

use borsh::{BorshDeserialize, BorshSerialize};
use ed25519_dalek::Verifier;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Validator identity: a 32-byte ed25519 verifying key
#[derive(
    Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, BorshSerialize, BorshDeserialize,
)]
pub struct Address(pub [u8; 32]);

impl Address {
    /// Check an ed25519 signature made by this address over `message`
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        let Ok(key) = ed25519_dalek::VerifyingKey::from_bytes(&self.0) else {
            return false;
        };
        let Ok(signature) = ed25519_dalek::Signature::from_slice(signature) else {
            return false;
        };
        key.verify(message, &signature).is_ok()
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", bs58::encode(self.0).into_string())
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let encoded = bs58::encode(self.0).into_string();
        write!(f, "Address({})", &encoded[..encoded.len().min(8)])
    }
}

/// Block hash (blake3). The all-zero hash stands for nil.
#[derive(
    Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, BorshSerialize, BorshDeserialize,
)]
pub struct BlockHash(pub [u8; 32]);

impl BlockHash {
    pub const NIL: BlockHash = BlockHash([0u8; 32]);

    pub fn is_nil(&self) -> bool {
        *self == Self::NIL
    }
}

impl fmt::Display for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_nil() {
            return write!(f, "nil");
        }
        write!(f, "{}", bs58::encode(self.0).into_string())
    }
}

impl fmt::Debug for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_nil() {
            return write!(f, "BlockHash(nil)");
        }
        let encoded = bs58::encode(self.0).into_string();
        write!(f, "BlockHash({})", &encoded[..encoded.len().min(8)])
    }
}

/// Vote kind. `Null` only appears as a placeholder inside a block commit.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    BorshSerialize,
    BorshDeserialize,
    Serialize,
    Deserialize,
)]
pub enum VoteFlag {
    Null,
    PreVote,
    PreCommit,
}

impl fmt::Display for VoteFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VoteFlag::Null => write!(f, "null"),
            VoteFlag::PreVote => write!(f, "prevote"),
            VoteFlag::PreCommit => write!(f, "precommit"),
        }
    }
}

/// Phase within a round. Ordered: a step only moves forward inside a round.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub enum Step {
    #[default]
    Default,
    Propose,
    PreVote,
    PreCommit,
    EndCommit,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Step::Default => "default",
            Step::Propose => "propose",
            Step::PreVote => "prevote",
            Step::PreCommit => "precommit",
            Step::EndCommit => "endcommit",
        };
        write!(f, "{}", name)
    }
}

/// Current unix time in milliseconds
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
