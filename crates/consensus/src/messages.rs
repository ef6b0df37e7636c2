//! Signed consensus messages
//!
//! Every message is a metadata payload plus an ed25519 signature over the
//! payload's borsh encoding. The signer is named inside the payload, so any
//! message can be verified on its own.

use crate::block::Block;
use crate::crypto::Signer;
use crate::types::{now_millis, Address, BlockHash, VoteFlag};
use borsh::{BorshDeserialize, BorshSerialize};

/// Payload that can be wrapped in [`Signed`]
pub trait Payload: BorshSerialize + Sized {
    /// Address expected to have produced the signature
    fn signer(&self) -> Address;

    /// Bytes covered by the signature
    fn sign_bytes(&self) -> Vec<u8> {
        borsh::to_vec(self).expect("message payload serialization should not fail")
    }
}

/// A payload together with its signature
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Signed<M> {
    pub metadata: M,
    pub signature: Vec<u8>,
}

impl<M: Payload> Signed<M> {
    /// Sign `metadata` with `signer`
    pub fn sign<S: Signer + ?Sized>(metadata: M, signer: &S) -> Self {
        let signature = signer.sign(&metadata.sign_bytes());
        Self {
            metadata,
            signature,
        }
    }

    /// Check that the signature was produced by the payload's signer
    pub fn verify(&self) -> bool {
        !self.signature.is_empty()
            && self
                .metadata
                .signer()
                .verify(&self.metadata.sign_bytes(), &self.signature)
    }
}

/// Vote payload
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct VoteMetadata {
    pub height: u64,
    pub round: u32,
    pub block_hash: BlockHash,
    pub timestamp: i64,
    pub validator: Address,
    /// Power claimed by the voter; checked against the validator set on ingestion
    pub validator_power: u64,
    pub flag: VoteFlag,
}

impl VoteMetadata {
    pub fn new(
        height: u64,
        round: u32,
        block_hash: BlockHash,
        validator: Address,
        validator_power: u64,
        flag: VoteFlag,
    ) -> Self {
        Self {
            height,
            round,
            block_hash,
            timestamp: now_millis(),
            validator,
            validator_power,
            flag,
        }
    }
}

impl Payload for VoteMetadata {
    fn signer(&self) -> Address {
        self.validator
    }
}

pub type Vote = Signed<VoteMetadata>;

impl Vote {
    /// Unsigned placeholder for a validator absent from a commit
    pub fn null(height: u64, round: u32, block_hash: BlockHash, validator: Address, power: u64) -> Self {
        Self {
            metadata: VoteMetadata {
                height,
                round,
                block_hash,
                timestamp: 0,
                validator,
                validator_power: power,
                flag: VoteFlag::Null,
            },
            signature: Vec::new(),
        }
    }

    pub fn height(&self) -> u64 {
        self.metadata.height
    }

    pub fn round(&self) -> u32 {
        self.metadata.round
    }

    pub fn block_hash(&self) -> BlockHash {
        self.metadata.block_hash
    }

    pub fn validator(&self) -> Address {
        self.metadata.validator
    }

    pub fn power(&self) -> u64 {
        self.metadata.validator_power
    }

    pub fn flag(&self) -> VoteFlag {
        self.metadata.flag
    }

    pub fn is_nil(&self) -> bool {
        self.metadata.block_hash.is_nil()
    }
}

/// Proposal payload. Carries the proposed block itself.
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct ProposalMetadata {
    pub height: u64,
    pub round: u32,
    pub block_hash: BlockHash,
    pub timestamp: i64,
    pub proposer: Address,
    /// Earlier round whose PreVote quorum this block carries forward
    pub valid_round: Option<u32>,
    pub block: Block,
}

impl ProposalMetadata {
    pub fn new(height: u64, round: u32, block: Block, proposer: Address, valid_round: Option<u32>) -> Self {
        Self {
            height,
            round,
            block_hash: block.hash(),
            timestamp: now_millis(),
            proposer,
            valid_round,
            block,
        }
    }
}

impl Payload for ProposalMetadata {
    fn signer(&self) -> Address {
        self.proposer
    }
}

pub type Proposal = Signed<ProposalMetadata>;

impl Proposal {
    pub fn height(&self) -> u64 {
        self.metadata.height
    }

    pub fn round(&self) -> u32 {
        self.metadata.round
    }

    pub fn block_hash(&self) -> BlockHash {
        self.metadata.block_hash
    }

    pub fn block(&self) -> &Block {
        &self.metadata.block
    }

    pub fn proposer(&self) -> Address {
        self.metadata.proposer
    }

    pub fn valid_round(&self) -> Option<u32> {
        self.metadata.valid_round
    }
}

/// A peer's claim of having observed a 2/3 majority
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Maj23Metadata {
    pub height: u64,
    pub round: u32,
    pub block_hash: BlockHash,
    pub timestamp: i64,
    pub validator: Address,
    pub flag: VoteFlag,
}

impl Payload for Maj23Metadata {
    fn signer(&self) -> Address {
        self.validator
    }
}

pub type Maj23 = Signed<Maj23Metadata>;

/// Which validators' votes for a block hash the sender already holds
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct VoteSetBitsMetadata {
    pub height: u64,
    pub round: u32,
    pub block_hash: BlockHash,
    pub timestamp: i64,
    pub validator: Address,
    pub flag: VoteFlag,
    /// One entry per validator, in validator set order
    pub vote_bits: Vec<bool>,
}

impl Payload for VoteSetBitsMetadata {
    fn signer(&self) -> Address {
        self.validator
    }
}

pub type VoteSetBits = Signed<VoteSetBitsMetadata>;

/// Everything that travels between consensus instances
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum ConsensusMessage {
    Proposal(Proposal),
    Vote(Vote),
    Maj23(Maj23),
    VoteSetBits(VoteSetBits),
}

impl ConsensusMessage {
    pub fn height(&self) -> u64 {
        match self {
            ConsensusMessage::Proposal(p) => p.metadata.height,
            ConsensusMessage::Vote(v) => v.metadata.height,
            ConsensusMessage::Maj23(m) => m.metadata.height,
            ConsensusMessage::VoteSetBits(b) => b.metadata.height,
        }
    }

    pub fn round(&self) -> u32 {
        match self {
            ConsensusMessage::Proposal(p) => p.metadata.round,
            ConsensusMessage::Vote(v) => v.metadata.round,
            ConsensusMessage::Maj23(m) => m.metadata.round,
            ConsensusMessage::VoteSetBits(b) => b.metadata.round,
        }
    }

    /// The validator that signed this message
    pub fn validator(&self) -> Address {
        match self {
            ConsensusMessage::Proposal(p) => p.metadata.signer(),
            ConsensusMessage::Vote(v) => v.metadata.signer(),
            ConsensusMessage::Maj23(m) => m.metadata.signer(),
            ConsensusMessage::VoteSetBits(b) => b.metadata.signer(),
        }
    }

    /// Serialize for network transmission
    pub fn to_bytes(&self) -> Vec<u8> {
        borsh::to_vec(self).expect("ConsensusMessage serialization should not fail")
    }

    /// Deserialize from network
    pub fn from_bytes(data: &[u8]) -> Result<Self, borsh::io::Error> {
        borsh::from_slice(data)
    }
}

impl From<Proposal> for ConsensusMessage {
    fn from(proposal: Proposal) -> Self {
        ConsensusMessage::Proposal(proposal)
    }
}

impl From<Vote> for ConsensusMessage {
    fn from(vote: Vote) -> Self {
        ConsensusMessage::Vote(vote)
    }
}
