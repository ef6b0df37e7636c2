//! BFT Consensus - Tendermint-style agreement on one block per height
//!
//! Architecture:
//! - `Consensus` is a synchronous state machine for a single height: it takes
//!   proposals, votes and timeouts as mutations and returns effects
//! - `ConsensusNode` runs it on tokio with serialized mutation queues,
//!   cancellable timers and a broadcast channel of events
//! - The chain and the signing key are collaborators behind the
//!   `Blockchain` and `Signer` traits
//! - Conflicting votes are kept as evidence for later slashing

pub mod block;
pub mod chain;
pub mod config;
pub mod consensus;
pub mod crypto;
pub mod error;
pub mod events;
pub mod evidence;
pub mod height_state;
pub mod messages;
pub mod node;
pub mod round_state;
pub mod timeout;
pub mod types;
pub mod validator_set;
pub mod validity_cache;
pub mod vote_set;

#[cfg(test)]
mod testing;

pub use block::{Block, BlockCommit};
pub use chain::{BlockError, Blockchain, MemoryChain};
pub use config::ConsensusConfig;
pub use consensus::{Consensus, Mutation};
pub use crypto::{PrivateKey, Signer};
pub use error::{ConsensusError, Result};
pub use events::{ConsensusEvent, Effect};
pub use evidence::{DuplicateVoteEvidence, EvidenceCollector};
pub use messages::{
    ConsensusMessage, Maj23, Maj23Metadata, Proposal, ProposalMetadata, Signed, Vote,
    VoteMetadata, VoteSetBits, VoteSetBitsMetadata,
};
pub use node::{ConsensusNode, ConsensusNodeBuilder};
pub use timeout::{Timeout, TimeoutKind};
pub use types::{Address, BlockHash, Step, VoteFlag};
pub use validator_set::{Validator, ValidatorSet};
