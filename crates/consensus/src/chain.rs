//! Blockchain collaborator
//!
//! Consensus only needs a narrow view of the chain: the validator set for a
//! height, a way to assemble a block, a validity predicate and a way to append
//! a decided block. `MemoryChain` is a small in-memory implementation used by
//! tests and the simulator.

use crate::block::{Block, BlockCommit};
use crate::types::{Address, BlockHash};
use crate::validator_set::ValidatorSet;
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use thiserror::Error;

/// Maximum transactions `MemoryChain` packs into one block
pub const MAX_TXS_PER_BLOCK: usize = 64;

/// Block validation and chain errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BlockError {
    #[error("expected height {expected}, got {actual}")]
    HeightMismatch { expected: u64, actual: u64 },

    #[error("block does not extend the current tip")]
    PreviousHashMismatch,

    #[error("proposer {0} is not a validator")]
    UnknownProposer(Address),

    #[error("invalid transaction: {0}")]
    InvalidTransaction(String),

    #[error("invalid commit: {0}")]
    InvalidCommit(String),

    #[error("block {0} rejected")]
    Rejected(BlockHash),

    #[error("no validator set for height {0}")]
    UnknownHeight(u64),
}

/// The chain as seen by a consensus instance
pub trait Blockchain: Send + Sync {
    /// Validator set that decides `height`
    fn validator_set(&self, height: u64) -> Result<ValidatorSet, BlockError>;

    /// Assemble a new block for `height` proposed by `proposer`
    fn propose_block(&self, proposer: &Address, height: u64) -> Result<Block, BlockError>;

    /// Validity predicate for a proposed block
    fn validate_block(&self, block: &Block) -> Result<(), BlockError>;

    /// Validity hook for a single transaction
    fn validate_transaction(&self, _tx: &[u8]) -> Result<(), BlockError> {
        Ok(())
    }

    /// Append a decided block with its commit certificate
    fn append(&self, block: Block, commit: BlockCommit) -> Result<(), BlockError>;
}

/// In-memory chain with a fixed validator set
pub struct MemoryChain {
    validators: ValidatorSet,
    /// Appended blocks; index 0 holds height 1
    blocks: RwLock<Vec<(Block, BlockCommit)>>,
    /// Transactions waiting to be proposed
    pending: Mutex<Vec<Vec<u8>>>,
    /// Hashes `validate_block` refuses
    rejected: RwLock<HashSet<BlockHash>>,
}

impl MemoryChain {
    pub fn new(validators: ValidatorSet) -> Self {
        Self {
            validators,
            blocks: RwLock::new(Vec::new()),
            pending: Mutex::new(Vec::new()),
            rejected: RwLock::new(HashSet::new()),
        }
    }

    /// Height of the last appended block, 0 when empty
    pub fn tip_height(&self) -> u64 {
        self.blocks.read().len() as u64
    }

    pub fn tip_hash(&self) -> Option<BlockHash> {
        self.blocks.read().last().map(|(block, _)| block.hash())
    }

    /// Get an appended block and its commit
    pub fn block(&self, height: u64) -> Option<(Block, BlockCommit)> {
        let index = height.checked_sub(1)? as usize;
        self.blocks.read().get(index).cloned()
    }

    /// Queue a transaction for the next proposal
    pub fn add_transaction(&self, tx: Vec<u8>) -> Result<(), BlockError> {
        self.validate_transaction(&tx)?;
        self.pending.lock().push(tx);
        Ok(())
    }

    pub fn pending_transactions(&self) -> usize {
        self.pending.lock().len()
    }

    /// Make `validate_block` refuse the block with this hash
    pub fn reject(&self, hash: BlockHash) {
        self.rejected.write().insert(hash);
    }
}

impl Blockchain for MemoryChain {
    fn validator_set(&self, height: u64) -> Result<ValidatorSet, BlockError> {
        if height == 0 || height > self.tip_height() + 1 {
            return Err(BlockError::UnknownHeight(height));
        }
        Ok(self.validators.clone())
    }

    fn propose_block(&self, proposer: &Address, height: u64) -> Result<Block, BlockError> {
        let expected = self.tip_height() + 1;
        if height != expected {
            return Err(BlockError::HeightMismatch {
                expected,
                actual: height,
            });
        }

        let transactions: Vec<Vec<u8>> = {
            let pending = self.pending.lock();
            pending.iter().take(MAX_TXS_PER_BLOCK).cloned().collect()
        };
        let last_commit = self.blocks.read().last().map(|(_, commit)| commit.clone());

        Ok(Block::new(
            height,
            self.tip_hash(),
            *proposer,
            transactions,
            last_commit,
        ))
    }

    fn validate_block(&self, block: &Block) -> Result<(), BlockError> {
        let hash = block.hash();
        if self.rejected.read().contains(&hash) {
            return Err(BlockError::Rejected(hash));
        }

        let expected = self.tip_height() + 1;
        if block.height != expected {
            return Err(BlockError::HeightMismatch {
                expected,
                actual: block.height,
            });
        }
        if block.previous_hash != self.tip_hash() {
            return Err(BlockError::PreviousHashMismatch);
        }
        if !self.validators.contains(&block.proposer) {
            return Err(BlockError::UnknownProposer(block.proposer));
        }
        for tx in &block.transactions {
            self.validate_transaction(tx)?;
        }

        match (&block.last_commit, self.blocks.read().last()) {
            (None, None) => {}
            (Some(commit), Some((parent, _))) => {
                if commit.height != parent.height || commit.block_hash != parent.hash() {
                    return Err(BlockError::InvalidCommit(
                        "last commit does not match parent".to_string(),
                    ));
                }
                commit.verify(&self.validators)?;
            }
            (None, Some(_)) => {
                return Err(BlockError::InvalidCommit("missing last commit".to_string()));
            }
            (Some(_), None) => {
                return Err(BlockError::InvalidCommit(
                    "first block cannot carry a commit".to_string(),
                ));
            }
        }

        Ok(())
    }

    fn append(&self, block: Block, commit: BlockCommit) -> Result<(), BlockError> {
        self.validate_block(&block)?;
        if commit.height != block.height || commit.block_hash != block.hash() {
            return Err(BlockError::InvalidCommit(
                "commit is for another block".to_string(),
            ));
        }
        commit.verify(&self.validators)?;

        let included: HashSet<&Vec<u8>> = block.transactions.iter().collect();
        self.pending.lock().retain(|tx| !included.contains(tx));

        tracing::info!(
            "Appended block {} at height {} ({} txs)",
            block.hash(),
            block.height,
            block.transactions.len()
        );
        self.blocks.write().push((block, commit));
        Ok(())
    }
}
