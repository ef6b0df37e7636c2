//! Async runtime around the consensus state machine
//!
//! Inputs from any task are queued: peer messages go through a message queue
//! that feeds the mutation queue, and a single consumer applies one mutation
//! at a time. Timers are tokio tasks that enqueue timeout mutations. Everything
//! spawned here shares one cancellation token, cancelled by `stop` or on drop.

use crate::block::{Block, BlockCommit};
use crate::chain::Blockchain;
use crate::config::ConsensusConfig;
use crate::consensus::{Consensus, Mutation};
use crate::crypto::Signer;
use crate::error::{ConsensusError, Result};
use crate::events::{ConsensusEvent, Effect};
use crate::evidence::{DuplicateVoteEvidence, EvidenceCollector};
use crate::messages::{ConsensusMessage, Maj23, Proposal, Vote, VoteSetBits};
use crate::types::{Address, BlockHash, Step, VoteFlag};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Capacity of the event channel; slow subscribers lag instead of blocking
const EVENT_CHANNEL_CAPACITY: usize = 1024;

type Queues = (
    mpsc::UnboundedReceiver<ConsensusMessage>,
    mpsc::UnboundedReceiver<Mutation>,
);

struct Inner {
    consensus: Mutex<Consensus>,
    address: Address,
    messages: mpsc::UnboundedSender<ConsensusMessage>,
    mutations: mpsc::UnboundedSender<Mutation>,
    events: broadcast::Sender<ConsensusEvent>,
    evidence: Arc<EvidenceCollector>,
    cancel: CancellationToken,
    running: AtomicBool,
}

/// A consensus instance for one height, driven by tokio tasks
pub struct ConsensusNode {
    inner: Arc<Inner>,
    queues: Mutex<Option<Queues>>,
    tasks: Mutex<Vec<JoinHandle<Result<()>>>>,
}

impl ConsensusNode {
    pub fn new(consensus: Consensus) -> Self {
        let (messages, message_rx) = mpsc::unbounded_channel();
        let (mutations, mutation_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let address = consensus.address();
        let evidence = consensus.evidence().clone();

        Self {
            inner: Arc::new(Inner {
                consensus: Mutex::new(consensus),
                address,
                messages,
                mutations,
                events,
                evidence,
                cancel: CancellationToken::new(),
                running: AtomicBool::new(false),
            }),
            queues: Mutex::new(Some((message_rx, mutation_rx))),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the consumers and start round 0
    ///
    /// Fails with `AlreadyStarted` on a second call and `Stopped` after `stop`.
    pub fn start(&self) -> Result<()> {
        if self.inner.cancel.is_cancelled() {
            return Err(ConsensusError::Stopped);
        }
        let (message_rx, mutation_rx) = self
            .queues
            .lock()
            .take()
            .ok_or(ConsensusError::AlreadyStarted)?;

        let height = self.height();
        tracing::info!("Starting consensus node {} at height {}", self.inner.address, height);

        self.inner
            .mutations
            .send(Mutation::Start)
            .map_err(|_| ConsensusError::Stopped)?;
        self.inner.running.store(true, Ordering::SeqCst);

        let mut tasks = self.tasks.lock();
        tasks.push(tokio::spawn(run_messages(self.inner.clone(), message_rx)));
        tasks.push(tokio::spawn(run_mutations(self.inner.clone(), mutation_rx)));
        Ok(())
    }

    /// Cancel the consumers and all pending timers
    ///
    /// Fails with `NotStarted` on a node that was never started. Stopping a
    /// stopped node again is a no-op.
    pub fn stop(&self) -> Result<()> {
        if self.inner.cancel.is_cancelled() {
            return Ok(());
        }
        if self.queues.lock().is_some() {
            return Err(ConsensusError::NotStarted);
        }
        tracing::info!("Stopping consensus node {}", self.inner.address);
        self.inner.running.store(false, Ordering::SeqCst);
        self.inner.cancel.cancel();
        Ok(())
    }

    /// Wait for the consumer tasks to exit
    ///
    /// Returns the fatal error that terminated the mutation consumer, if any.
    /// Cancellation is a clean exit.
    pub async fn join(&self) -> Result<()> {
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        let mut result = Ok(());
        for task in tasks {
            match task.await {
                Ok(Ok(())) | Ok(Err(ConsensusError::Cancelled)) => {}
                Ok(Err(e)) => {
                    if result.is_ok() {
                        result = Err(e);
                    }
                }
                Err(e) => tracing::error!("Consensus task panicked: {}", e),
            }
        }
        result
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Subscribe to consensus events
    pub fn subscribe(&self) -> broadcast::Receiver<ConsensusEvent> {
        self.inner.events.subscribe()
    }

    /// Queue a peer message. Returns immediately.
    pub fn post_message(&self, message: ConsensusMessage) -> Result<()> {
        self.inner
            .messages
            .send(message)
            .map_err(|_| ConsensusError::Stopped)
    }

    pub fn post_proposal(&self, proposal: Proposal) -> Result<()> {
        self.post_message(ConsensusMessage::Proposal(proposal))
    }

    pub fn post_vote(&self, vote: Vote) -> Result<()> {
        self.post_message(ConsensusMessage::Vote(vote))
    }

    /// Record a peer's 2/3 claim; returns a bit request if votes are missing
    pub fn add_maj23(&self, maj23: &Maj23) -> Result<Option<VoteSetBits>> {
        self.inner.consensus.lock().add_maj23(maj23)
    }

    pub fn get_vote_set_bits(
        &self,
        round: u32,
        block_hash: BlockHash,
        flag: VoteFlag,
    ) -> Result<VoteSetBits> {
        self.inner.consensus.lock().vote_set_bits(round, block_hash, flag)
    }

    /// Votes the sender of `bits` is missing
    pub fn get_vote_set_bits_response(&self, bits: &VoteSetBits) -> Result<Vec<ConsensusMessage>> {
        self.inner.consensus.lock().vote_set_bits_response(bits)
    }

    pub fn get_block_commit(&self) -> Option<BlockCommit> {
        self.inner.consensus.lock().block_commit()
    }

    /// Take the conflicting-vote evidence gathered so far
    pub fn collect_evidence_exceptions(&self) -> Vec<DuplicateVoteEvidence> {
        self.inner.evidence.drain()
    }

    pub fn address(&self) -> Address {
        self.inner.address
    }

    pub fn height(&self) -> u64 {
        self.inner.consensus.lock().height()
    }

    pub fn round(&self) -> Option<u32> {
        self.inner.consensus.lock().round()
    }

    pub fn step(&self) -> Step {
        self.inner.consensus.lock().step()
    }

    pub fn proposal(&self) -> Option<Proposal> {
        self.inner.consensus.lock().proposal().cloned()
    }

    pub fn locked_round(&self) -> Option<u32> {
        self.inner.consensus.lock().locked_round()
    }

    pub fn valid_round(&self) -> Option<u32> {
        self.inner.consensus.lock().valid_round()
    }

    pub fn decision(&self) -> Option<Block> {
        self.inner.consensus.lock().decision().cloned()
    }
}

impl Drop for ConsensusNode {
    fn drop(&mut self) {
        self.inner.cancel.cancel();
    }
}

impl Inner {
    fn emit(&self, event: ConsensusEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn dispatch(&self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Publish(message) => {
                    let own = message.validator() == self.address
                        && matches!(
                            message,
                            ConsensusMessage::Proposal(_) | ConsensusMessage::Vote(_)
                        );
                    self.emit(ConsensusEvent::MessagePublished(message.clone()));
                    if own {
                        let _ = self.messages.send(message);
                    }
                }
                Effect::Emit(event) => self.emit(event),
                Effect::Schedule { timeout, delay } => {
                    self.schedule(Mutation::Timeout(timeout), delay);
                }
            }
        }
    }

    fn schedule(&self, mutation: Mutation, delay: Duration) {
        let cancel = self.cancel.clone();
        let mutations = self.mutations.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let _ = mutations.send(mutation);
                }
            }
        });
    }
}

/// Drain the message queue into the mutation queue
async fn run_messages(
    inner: Arc<Inner>,
    mut rx: mpsc::UnboundedReceiver<ConsensusMessage>,
) -> Result<()> {
    loop {
        let message = tokio::select! {
            _ = inner.cancel.cancelled() => return Err(ConsensusError::Cancelled),
            message = rx.recv() => message.ok_or(ConsensusError::Stopped)?,
        };
        inner
            .mutations
            .send(Mutation::Message(message))
            .map_err(|_| ConsensusError::Stopped)?;
    }
}

/// Apply mutations one at a time
async fn run_mutations(inner: Arc<Inner>, mut rx: mpsc::UnboundedReceiver<Mutation>) -> Result<()> {
    loop {
        let mutation = tokio::select! {
            _ = inner.cancel.cancelled() => return Err(ConsensusError::Cancelled),
            mutation = rx.recv() => mutation.ok_or(ConsensusError::Stopped)?,
        };

        let (result, effects) = {
            let mut consensus = inner.consensus.lock();
            let result = consensus.handle(mutation);
            (result, consensus.drain_effects())
        };
        inner.dispatch(effects);

        match result {
            Ok(()) => {}
            Err(e) if e.is_fatal() => {
                tracing::error!("Consensus node {} failed: {}", inner.address, e);
                inner.emit(ConsensusEvent::ExceptionOccurred(e.clone()));
                inner.running.store(false, Ordering::SeqCst);
                inner.cancel.cancel();
                return Err(e);
            }
            Err(e) if e.is_rejection() => {
                if e.is_evidence() {
                    tracing::warn!("Consensus node {}: {}", inner.address, e);
                } else {
                    tracing::debug!("Consensus node {} rejected input: {}", inner.address, e);
                }
                inner.emit(ConsensusEvent::ExceptionOccurred(e));
            }
            Err(e) => return Err(e),
        }
    }
}

/// Builder for ConsensusNode
pub struct ConsensusNodeBuilder {
    height: u64,
    signer: Arc<dyn Signer>,
    chain: Arc<dyn Blockchain>,
    config: ConsensusConfig,
    evidence: Option<Arc<EvidenceCollector>>,
}

impl ConsensusNodeBuilder {
    pub fn new(signer: Arc<dyn Signer>, chain: Arc<dyn Blockchain>) -> Self {
        Self {
            height: 1,
            signer,
            chain,
            config: ConsensusConfig::default(),
            evidence: None,
        }
    }

    pub fn height(mut self, height: u64) -> Self {
        self.height = height;
        self
    }

    pub fn config(mut self, config: ConsensusConfig) -> Self {
        self.config = config;
        self
    }

    /// Share an evidence collector across heights
    pub fn evidence(mut self, evidence: Arc<EvidenceCollector>) -> Self {
        self.evidence = Some(evidence);
        self
    }

    pub fn build(self) -> Result<ConsensusNode> {
        let evidence = self
            .evidence
            .unwrap_or_else(|| Arc::new(EvidenceCollector::new()));
        let consensus = Consensus::new(self.height, self.signer, self.chain, self.config, evidence)?;
        Ok(ConsensusNode::new(consensus))
    }
}
