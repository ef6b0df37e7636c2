use super::*;
use crate::chain::{BlockError, MemoryChain};
use crate::height_state::MAX_CATCHUP_ROUNDS;
use crate::config::ConsensusConfig;
use crate::crypto::{PrivateKey, Signer};
use crate::messages::{Maj23, Maj23Metadata, VoteSetBits, VoteSetBitsMetadata};
use crate::testing::{proposal, proposer_index, Harness};
use crate::validator_set::ValidatorSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use crate::types::{now_millis, VoteFlag};

/// Chain that counts block validations
struct CountingChain {
    inner: Arc<MemoryChain>,
    validations: AtomicUsize,
}

impl Blockchain for CountingChain {
    fn validator_set(&self, height: u64) -> std::result::Result<ValidatorSet, BlockError> {
        self.inner.validator_set(height)
    }

    fn propose_block(&self, proposer: &Address, height: u64) -> std::result::Result<Block, BlockError> {
        self.inner.propose_block(proposer, height)
    }

    fn validate_block(&self, block: &Block) -> std::result::Result<(), BlockError> {
        self.validations.fetch_add(1, Ordering::SeqCst);
        self.inner.validate_block(block)
    }

    fn append(&self, block: Block, commit: BlockCommit) -> std::result::Result<(), BlockError> {
        self.inner.append(block, commit)
    }
}

fn precommits_in(harness: &Harness) -> usize {
    harness
        .own_votes()
        .iter()
        .filter(|v| v.flag() == VoteFlag::PreCommit)
        .count()
}

/// Lock `harness` on a block proposed in round 0, then push it into round 1
/// with nil precommits from its peers
fn lock_in_round_zero(harness: &mut Harness) -> Block {
    harness.start();
    let block = harness.block(harness.proposer_key(0));
    let p = proposal(harness.proposer_key(0), 1, 0, block.clone(), None);
    harness.receive(p).unwrap();

    let peers = harness.peer_keys();
    for key in &peers[..2] {
        let v = harness.vote(key, 0, block.hash(), VoteFlag::PreVote);
        harness.receive(v).unwrap();
    }
    assert_eq!(harness.consensus.locked_round(), Some(0));

    for key in &peers[..2] {
        let v = harness.vote(key, 0, BlockHash::NIL, VoteFlag::PreCommit);
        harness.receive(v).unwrap();
    }
    assert!(harness.fire(0, TimeoutKind::PreCommit));
    assert_eq!(harness.consensus.round(), Some(1));
    block
}

#[test]
fn test_new_rejects_height_zero() {
    let harness = Harness::new(4, 0);
    let result = Consensus::new(
        0,
        Arc::new(PrivateKey::from_bytes([9u8; 32])),
        harness.chain.clone(),
        ConsensusConfig::default(),
        Arc::new(EvidenceCollector::new()),
    );
    assert!(matches!(result, Err(ConsensusError::InvalidHeight(0))));
}

#[test]
fn test_start_once() {
    let mut harness = Harness::new(4, 0);
    assert_eq!(harness.consensus.round(), None);
    assert_eq!(harness.consensus.step(), Step::Default);

    harness.start();
    assert_eq!(harness.consensus.round(), Some(0));
    assert!(matches!(
        harness.handle(Mutation::Start),
        Err(ConsensusError::AlreadyStarted)
    ));
    assert!(matches!(
        harness.events.first(),
        Some(ConsensusEvent::RoundStarted { height: 1, round: 0 })
    ));
}

#[test]
fn test_happy_path_as_proposer() {
    let mut harness = Harness::proposing(4, 0);
    harness.start();

    let block = match harness.published.first() {
        Some(ConsensusMessage::Proposal(p)) => p.block().clone(),
        other => panic!("expected a proposal, got {:?}", other),
    };
    let hash = block.hash();
    assert_eq!(harness.consensus.step(), Step::PreVote);
    assert_eq!(harness.own_votes()[0].block_hash(), hash);

    let peers = harness.peer_keys();
    for key in &peers {
        let v = harness.vote(key, 0, hash, VoteFlag::PreVote);
        harness.receive(v).unwrap();
    }
    assert_eq!(harness.consensus.step(), Step::PreCommit);
    assert_eq!(harness.consensus.locked_block(), Some(&block));
    assert_eq!(harness.consensus.valid_round(), Some(0));

    for key in &peers {
        let v = harness.vote(key, 0, hash, VoteFlag::PreCommit);
        harness.receive(v).unwrap();
    }

    assert_eq!(harness.consensus.step(), Step::EndCommit);
    assert_eq!(harness.consensus.decision(), Some(&block));
    assert_eq!(harness.completed(), Some(&block));

    let commit = harness.consensus.block_commit().unwrap();
    assert_eq!(commit.block_hash, hash);
    assert_eq!(commit.votes.len(), 4);
    assert!(commit.votes.iter().all(|v| v.flag() == VoteFlag::PreCommit));
    commit.verify(harness.set()).unwrap();
    assert!(harness.errors.is_empty());
}

#[test]
fn test_propose_timeout_prevotes_nil() {
    let mut harness = Harness::not_proposing(4, &[0]);
    harness.start();
    assert!(harness.published.is_empty());
    assert_eq!(harness.consensus.step(), Step::Propose);

    assert!(harness.fire(0, TimeoutKind::Propose));
    let votes = harness.own_votes();
    assert_eq!(votes.len(), 1);
    assert!(votes[0].is_nil());
    assert_eq!(votes[0].flag(), VoteFlag::PreVote);
    assert!(harness.events.iter().any(|e| matches!(
        e,
        ConsensusEvent::TimeoutProcessed { round: 0, step: Step::Propose }
    )));
}

#[test]
fn test_prevote_is_cast_once() {
    let mut harness = Harness::not_proposing(4, &[0]);
    harness.start();
    harness.fire(0, TimeoutKind::Propose);

    let block = harness.block(harness.proposer_key(0));
    let p = proposal(harness.proposer_key(0), 1, 0, block, None);
    harness.receive(p).unwrap();

    assert_eq!(harness.own_votes().len(), 1);
    assert!(harness.own_votes()[0].is_nil());
}

#[test]
fn test_prevote_timeout_scheduled_once() {
    let mut harness = Harness::not_proposing(4, &[0]);
    harness.start();
    harness.fire(0, TimeoutKind::Propose);

    let x = BlockHash([7u8; 32]);
    let peers = harness.peer_keys();
    for key in &peers {
        let v = harness.vote(key, 0, x, VoteFlag::PreVote);
        harness.receive(v).unwrap();
    }

    let armed = harness
        .timers
        .iter()
        .filter(|t| t.kind == TimeoutKind::PreVote)
        .count();
    assert_eq!(armed, 1);
    assert_eq!(harness.consensus.step(), Step::PreVote);

    assert!(harness.fire(0, TimeoutKind::PreVote));
    assert_eq!(harness.consensus.step(), Step::PreCommit);
    let last = harness.own_votes().last().copied().unwrap();
    assert_eq!(last.flag(), VoteFlag::PreCommit);
    assert!(last.is_nil());
}

#[test]
fn test_wrong_height_leaves_state_unchanged() {
    let mut harness = Harness::not_proposing(4, &[0]);
    harness.start();
    assert!(harness.consensus.state().get(0).unwrap().prevotes().is_empty());
    let v = crate::testing::vote(&harness.keys[1], harness.set(), 2, 0, BlockHash([1u8; 32]), VoteFlag::PreVote);

    assert!(matches!(
        harness.receive(v),
        Err(ConsensusError::InvalidMessage(_))
    ));
    let state = harness.consensus.state().get(0).unwrap();
    assert!(state.prevotes().is_empty());
    assert!(state.precommits().is_empty());
}

#[test]
fn test_conflicting_precommits_become_evidence() {
    let mut harness = Harness::not_proposing(4, &[0]);
    harness.start();
    let key = harness.peer_keys().remove(0);

    let a = harness.vote(&key, 0, BlockHash([1u8; 32]), VoteFlag::PreCommit);
    let b = harness.vote(&key, 0, BlockHash([2u8; 32]), VoteFlag::PreCommit);
    harness.receive(a).unwrap();
    assert!(matches!(
        harness.receive(b),
        Err(ConsensusError::DuplicateVote(_))
    ));

    let evidence = harness.evidence.drain();
    assert_eq!(evidence.len(), 1);
    assert_eq!(evidence[0].validator(), key.address());
    assert_eq!(evidence[0].flag(), VoteFlag::PreCommit);
}

#[test]
fn test_unsigned_vote_is_rejected() {
    let mut harness = Harness::new(4, 0);
    harness.start();
    let mut v = harness.vote(&harness.keys[1], 0, BlockHash([1u8; 32]), VoteFlag::PreVote);
    v.signature = vec![0u8; 64];
    assert!(matches!(harness.receive(v), Err(ConsensusError::InvalidVote(_))));
}

#[test]
fn test_round_skip_on_one_third_prevotes() {
    let mut harness = Harness::not_proposing(4, &[0]);
    harness.start();
    let peers = harness.peer_keys();

    let v = harness.vote(&peers[0], 1, BlockHash::NIL, VoteFlag::PreVote);
    harness.receive(v).unwrap();
    assert_eq!(harness.consensus.round(), Some(0));

    let v = harness.vote(&peers[1], 1, BlockHash::NIL, VoteFlag::PreVote);
    harness.receive(v).unwrap();
    assert_eq!(harness.consensus.round(), Some(1));
    assert!(harness
        .events
        .iter()
        .any(|e| matches!(e, ConsensusEvent::RoundStarted { round: 1, .. })));
}

#[test]
fn test_locked_validator_prevotes_nil_for_other_block() {
    let mut harness = Harness::not_proposing(4, &[0, 1]);
    let locked = lock_in_round_zero(&mut harness);

    let other = harness.block(harness.proposer_key(1));
    assert_ne!(other.hash(), locked.hash());
    let p = proposal(harness.proposer_key(1), 1, 1, other, None);
    harness.receive(p).unwrap();

    let last = harness.own_votes().last().copied().unwrap();
    assert_eq!((last.round(), last.flag()), (1, VoteFlag::PreVote));
    assert!(last.is_nil());
    assert_eq!(harness.consensus.locked_block(), Some(&locked));
}

#[test]
fn test_lock_released_by_later_valid_round() {
    let mut harness = Harness::not_proposing(4, &[0, 1, 2]);
    lock_in_round_zero(&mut harness);
    let peers = harness.peer_keys();

    // Round 1: no proposal reaches us, but peers prevote another block
    let other = harness.block(harness.proposer_key(2));
    harness.fire(1, TimeoutKind::Propose);
    for key in &peers {
        let v = harness.vote(key, 1, other.hash(), VoteFlag::PreVote);
        harness.receive(v).unwrap();
    }
    assert!(harness.fire(1, TimeoutKind::PreVote));
    for key in &peers[..2] {
        let v = harness.vote(key, 1, BlockHash::NIL, VoteFlag::PreCommit);
        harness.receive(v).unwrap();
    }
    assert!(harness.fire(1, TimeoutKind::PreCommit));
    assert_eq!(harness.consensus.round(), Some(2));
    assert_eq!(harness.consensus.locked_round(), Some(0));

    // Round 2 re-proposes it with valid round 1
    let p = proposal(harness.proposer_key(2), 1, 2, other.clone(), Some(1));
    harness.receive(p).unwrap();

    let last = harness.own_votes().last().copied().unwrap();
    assert_eq!((last.round(), last.flag()), (2, VoteFlag::PreVote));
    assert_eq!(last.block_hash(), other.hash());
}

#[test]
fn test_proposer_reproposes_valid_block() {
    let mut harness = Harness::not_proposing(4, &[0]);
    let locked = lock_in_round_zero(&mut harness);
    assert_eq!(harness.consensus.valid_block(), Some(&locked));

    // Whoever proposes round 1 on this node's behalf would carry valid round 0
    if harness.set().proposer(1, 1).address == harness.address() {
        let reproposed = harness.published.iter().rev().find_map(|m| match m {
            ConsensusMessage::Proposal(p) if p.round() == 1 => Some(p.clone()),
            _ => None,
        });
        let reproposed = reproposed.unwrap();
        assert_eq!(reproposed.valid_round(), Some(0));
        assert_eq!(reproposed.block_hash(), locked.hash());
    }
}

#[test]
fn test_invalid_block_prevotes_nil() {
    let mut harness = Harness::not_proposing(4, &[0]);
    harness.start();
    let block = harness.block(harness.proposer_key(0));
    harness.chain.reject(block.hash());

    let p = proposal(harness.proposer_key(0), 1, 0, block, None);
    harness.receive(p).unwrap();

    let votes = harness.own_votes();
    assert_eq!(votes.len(), 1);
    assert!(votes[0].is_nil());
}

#[test]
fn test_proposal_validation() {
    let mut harness = Harness::not_proposing(4, &[0]);
    harness.start();
    let block = harness.block(harness.proposer_key(0));

    let impostor = harness
        .keys
        .iter()
        .find(|k| k.address() != harness.set().proposer(1, 0).address)
        .unwrap();
    let wrong = proposal(impostor, 1, 0, block.clone(), None);
    assert!(matches!(
        harness.receive(wrong),
        Err(ConsensusError::InvalidProposal(_))
    ));

    let future = proposal(harness.proposer_key(1), 1, 1, block.clone(), None);
    assert!(matches!(
        harness.receive(future),
        Err(ConsensusError::InvalidProposal(_))
    ));

    let bad_valid_round = proposal(harness.proposer_key(0), 1, 0, block.clone(), Some(0));
    assert!(matches!(
        harness.receive(bad_valid_round),
        Err(ConsensusError::InvalidProposal(_))
    ));

    let p = proposal(harness.proposer_key(0), 1, 0, block.clone(), None);
    harness.receive(p.clone()).unwrap();
    assert!(matches!(
        harness.receive(p),
        Err(ConsensusError::ProposalAlreadyExists { round: 0 })
    ));
    assert_eq!(harness.consensus.proposal().map(|p| p.block_hash()), Some(block.hash()));
}

#[test]
fn test_proposal_conflicting_with_majority() {
    let mut harness = Harness::not_proposing(4, &[0]);
    harness.start();
    let x = BlockHash([7u8; 32]);
    let peers = harness.peer_keys();
    for key in &peers {
        let v = harness.vote(key, 0, x, VoteFlag::PreVote);
        harness.receive(v).unwrap();
    }

    let block = harness.block(harness.proposer_key(0));
    let p = proposal(harness.proposer_key(0), 1, 0, block, None);
    assert!(matches!(
        harness.receive(p),
        Err(ConsensusError::ProposalConflictsWithMajority { round: 0, majority, .. }) if majority == x
    ));
}

#[test]
fn test_proposal_reclaimed_on_other_majority() {
    let mut harness = Harness::not_proposing(4, &[0]);
    harness.start();
    let block = harness.block(harness.proposer_key(0));
    let p = proposal(harness.proposer_key(0), 1, 0, block.clone(), None);
    harness.receive(p).unwrap();
    assert_eq!(harness.own_votes()[0].block_hash(), block.hash());

    let x = BlockHash([7u8; 32]);
    let peers = harness.peer_keys();
    for key in &peers {
        let v = harness.vote(key, 0, x, VoteFlag::PreVote);
        harness.receive(v).unwrap();
    }

    assert!(harness.consensus.proposal().is_none());
    assert!(harness.events.iter().any(|e| matches!(
        e,
        ConsensusEvent::ProposalReclaimed { round: 0, block_hash } if *block_hash == x
    )));
}

#[test]
fn test_nil_majority_precommits_nil() {
    let mut harness = Harness::not_proposing(4, &[0]);
    harness.start();
    harness.fire(0, TimeoutKind::Propose);
    let peers = harness.peer_keys();
    for key in &peers[..2] {
        let v = harness.vote(key, 0, BlockHash::NIL, VoteFlag::PreVote);
        harness.receive(v).unwrap();
    }

    assert_eq!(harness.consensus.step(), Step::PreCommit);
    assert_eq!(precommits_in(&harness), 1);
    assert!(harness.own_votes().last().unwrap().is_nil());
    assert_eq!(harness.consensus.locked_round(), None);
}

#[test]
fn test_precommit_timeout_starts_next_round() {
    let mut harness = Harness::not_proposing(4, &[0]);
    harness.start();
    let peers = harness.peer_keys();
    for key in &peers {
        let v = harness.vote(key, 0, BlockHash::NIL, VoteFlag::PreCommit);
        harness.receive(v).unwrap();
    }
    assert_eq!(harness.consensus.round(), Some(0));

    assert!(harness.fire(0, TimeoutKind::PreCommit));
    assert_eq!(harness.consensus.round(), Some(1));
    assert!(harness.completed().is_none());
}

#[test]
fn test_block_invalidated_before_endcommit() {
    let config = ConsensusConfig {
        endcommit_wait_ms: 10,
        ..Default::default()
    };
    let me = proposer_index(4, 0);
    let mut harness = Harness::with_config(4, me, config);
    harness.start();
    let hash = harness.consensus.proposal().unwrap().block_hash();

    let peers = harness.peer_keys();
    for flag in [VoteFlag::PreVote, VoteFlag::PreCommit] {
        for key in &peers {
            let v = harness.vote(key, 0, hash, flag);
            harness.receive(v).unwrap();
        }
    }
    assert!(harness.consensus.decision().is_some());

    harness.chain.reject(hash);
    assert!(harness.fire(0, TimeoutKind::EndCommitWait));
    assert!(harness.completed().is_none());
    assert!(matches!(
        harness.errors.last(),
        Some(ConsensusError::InvalidBlock(BlockError::Rejected(_)))
    ));
}

#[test]
fn test_fixpoint_limit_is_fatal() {
    let config = ConsensusConfig {
        max_fixpoint_iterations: 1,
        ..Default::default()
    };
    let mut harness = Harness::with_config(4, proposer_index(4, 1), config);
    harness.start();

    let block = harness.block(harness.proposer_key(0));
    let p = proposal(harness.proposer_key(0), 1, 0, block, None);
    let error = harness.receive(p).unwrap_err();
    assert!(matches!(error, ConsensusError::FixpointLimitExceeded(1)));
    assert!(error.is_fatal());
}

#[test]
fn test_maj23_requests_missing_votes() {
    let mut harness = Harness::not_proposing(4, &[0]);
    harness.start();
    let peers = harness.peer_keys();
    let x = BlockHash([7u8; 32]);
    let v = harness.vote(&peers[0], 0, x, VoteFlag::PreVote);
    harness.receive(v).unwrap();

    let claim = Maj23::sign(
        Maj23Metadata {
            height: 1,
            round: 0,
            block_hash: x,
            timestamp: now_millis(),
            validator: peers[1].address(),
            flag: VoteFlag::PreVote,
        },
        &peers[1],
    );
    let bits = harness.consensus.add_maj23(&claim).unwrap().unwrap();
    assert_eq!(bits.metadata.vote_bits.iter().filter(|b| **b).count(), 1);
    assert_eq!(bits.metadata.validator, harness.address());
    assert_eq!(
        harness.consensus.state().get(0).unwrap().prevotes().peer_maj23(&peers[1].address()),
        Some(x)
    );

    // The peer answers with the votes we lack
    let index = harness
        .keys
        .iter()
        .position(|k| k.address() == peers[1].address())
        .unwrap();
    let mut peer = Harness::new(4, index);
    for key in &peers {
        let v = peer.vote(key, 0, x, VoteFlag::PreVote);
        peer.receive(v).unwrap();
    }
    let response = peer.consensus.vote_set_bits_response(&bits).unwrap();
    assert_eq!(response.len(), 2);
    assert!(response
        .iter()
        .all(|m| matches!(m, ConsensusMessage::Vote(v) if v.block_hash() == x)));
}

#[test]
fn test_maj23_message_publishes_vote_set_bits() {
    let mut harness = Harness::not_proposing(4, &[0]);
    harness.start();
    let key = harness.peer_keys().remove(0);
    let claim = Maj23::sign(
        Maj23Metadata {
            height: 1,
            round: 0,
            block_hash: BlockHash([7u8; 32]),
            timestamp: now_millis(),
            validator: key.address(),
            flag: VoteFlag::PreCommit,
        },
        &key,
    );
    harness.receive(ConsensusMessage::Maj23(claim)).unwrap();
    assert!(matches!(
        harness.published.last(),
        Some(ConsensusMessage::VoteSetBits(b)) if b.metadata.flag == VoteFlag::PreCommit
    ));
}

#[test]
fn test_vote_set_bits_validation() {
    let mut harness = Harness::new(4, 0);
    harness.start();
    assert!(matches!(
        harness.consensus.vote_set_bits(0, BlockHash::NIL, VoteFlag::Null),
        Err(ConsensusError::InvalidVoteSetBits(_))
    ));

    let empty = harness
        .consensus
        .vote_set_bits(5, BlockHash::NIL, VoteFlag::PreVote)
        .unwrap();
    assert_eq!(empty.metadata.vote_bits, vec![false; 4]);
    assert!(empty.verify());

    let key = &harness.keys[1];
    let short = VoteSetBits::sign(
        VoteSetBitsMetadata {
            height: 1,
            round: 0,
            block_hash: BlockHash::NIL,
            timestamp: now_millis(),
            validator: key.address(),
            flag: VoteFlag::PreVote,
            vote_bits: vec![false; 3],
        },
        key,
    );
    assert!(matches!(
        harness.consensus.vote_set_bits_response(&short),
        Err(ConsensusError::InvalidVoteSetBits(_))
    ));
}

#[test]
fn test_block_validated_once_before_endcommit() {
    let mut harness = Harness::proposing(4, 0);
    let chain = Arc::new(CountingChain {
        inner: harness.chain.clone(),
        validations: AtomicUsize::new(0),
    });
    let signer: Arc<dyn Signer> =
        Arc::new(PrivateKey::from_bytes(harness.keys[proposer_index(4, 0)].to_bytes()));
    harness.consensus = Consensus::new(
        1,
        signer,
        chain.clone(),
        ConsensusConfig::default(),
        harness.evidence.clone(),
    )
    .unwrap();
    harness.start();

    let hash = harness.consensus.proposal().unwrap().block_hash();
    let peers = harness.peer_keys();
    for flag in [VoteFlag::PreVote, VoteFlag::PreCommit] {
        for key in &peers {
            let v = harness.vote(key, 0, hash, flag);
            harness.receive(v).unwrap();
        }
    }

    assert_eq!(harness.consensus.locked_block().map(|b| b.hash()), Some(hash));
    assert_eq!(harness.consensus.decision().map(|b| b.hash()), Some(hash));
    assert!(harness.completed().is_some());
    // Once through the memo, once more when ending the height
    assert_eq!(chain.validations.load(Ordering::SeqCst), 2);
}

#[test]
fn test_future_round_votes_are_bounded_per_validator() {
    let mut harness = Harness::not_proposing(4, &[0]);
    harness.start();
    let key = harness.peer_keys().remove(0);

    let mut refused = 0;
    for round in 1..=50 {
        let v = harness.vote(&key, round, BlockHash::NIL, VoteFlag::PreVote);
        if let Err(e) = harness.receive(v) {
            assert!(matches!(e, ConsensusError::InvalidVote(_)));
            refused += 1;
        }
    }

    assert_eq!(harness.consensus.round(), Some(0));
    assert_eq!(harness.consensus.state().rounds().count(), 2 + MAX_CATCHUP_ROUNDS);
    assert_eq!(refused, 49 - MAX_CATCHUP_ROUNDS);

    let claim = Maj23::sign(
        Maj23Metadata {
            height: 1,
            round: 60,
            block_hash: BlockHash([7u8; 32]),
            timestamp: now_millis(),
            validator: key.address(),
            flag: VoteFlag::PreVote,
        },
        &key,
    );
    assert!(matches!(
        harness.consensus.add_maj23(&claim),
        Err(ConsensusError::InvalidMaj23(_))
    ));
    assert!(harness.consensus.state().get(60).is_none());
}
