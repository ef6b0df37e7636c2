//! In-process validator network
//!
//! Every validator keeps its own `MemoryChain`. For each height a fresh
//! `ConsensusNode` is built per validator and published messages are relayed
//! to every other online node. Published proposals are also logged and
//! re-sent to a node when it enters their round, since a proposal that
//! arrives before its round is rejected.

use anyhow::{anyhow, bail, Result};
use bft_consensus::{
    Block, BlockCommit, Blockchain, ConsensusConfig, ConsensusEvent, ConsensusMessage,
    ConsensusNode, ConsensusNodeBuilder, EvidenceCollector, MemoryChain, PrivateKey, Signer,
    Validator, ValidatorSet,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

struct Member {
    key: Arc<PrivateKey>,
    chain: Arc<MemoryChain>,
    evidence: Arc<EvidenceCollector>,
    online: bool,
}

/// Result of one decided height
#[derive(Debug)]
pub struct HeightReport {
    pub height: u64,
    pub block: Block,
    pub round: u32,
    pub elapsed: Duration,
}

pub struct Network {
    members: Vec<Member>,
    config: ConsensusConfig,
}

impl Network {
    /// `validators` equal-power validators, the last `offline` of which never start
    pub fn new(validators: usize, offline: usize, config: ConsensusConfig) -> Result<Self> {
        if validators == 0 {
            bail!("need at least one validator");
        }
        if offline >= validators {
            bail!("at least one validator must be online");
        }

        let keys: Vec<Arc<PrivateKey>> = (0..validators)
            .map(|_| Arc::new(PrivateKey::generate()))
            .collect();
        let set = ValidatorSet::new(keys.iter().map(|k| Validator::new(k.address(), 1)).collect())?;

        let members = keys
            .into_iter()
            .enumerate()
            .map(|(i, key)| Member {
                key,
                chain: Arc::new(MemoryChain::new(set.clone())),
                evidence: Arc::new(EvidenceCollector::new()),
                online: i < validators - offline,
            })
            .collect::<Vec<_>>();

        for member in &members {
            tracing::info!(
                "Validator {} ({})",
                member.key.address(),
                if member.online { "online" } else { "offline" }
            );
        }
        Ok(Self { members, config })
    }

    /// Queue the same transaction on every validator
    pub fn submit(&self, tx: Vec<u8>) -> Result<()> {
        for member in &self.members {
            member.chain.add_transaction(tx.clone())?;
        }
        Ok(())
    }

    pub fn tip_height(&self) -> u64 {
        self.members[0].chain.tip_height()
    }

    /// Conflicting votes seen by any validator
    pub fn evidence_count(&self) -> usize {
        self.members.iter().map(|m| m.evidence.len()).sum()
    }

    /// Run consensus for the next height until every online validator completes
    pub async fn run_height(&self, timeout: Duration) -> Result<HeightReport> {
        let height = self.tip_height() + 1;
        let started = Instant::now();

        let nodes = self
            .members
            .iter()
            .map(|m| {
                let signer: Arc<dyn Signer> = m.key.clone();
                let chain: Arc<dyn Blockchain> = m.chain.clone();
                ConsensusNodeBuilder::new(signer, chain)
                    .height(height)
                    .config(self.config.clone())
                    .evidence(m.evidence.clone())
                    .build()
                    .map(Arc::new)
            })
            .collect::<bft_consensus::Result<Vec<_>>>()?;

        let online: Vec<usize> = (0..nodes.len())
            .filter(|i| self.members[*i].online)
            .collect();
        let relays = CancellationToken::new();
        let proposals: ProposalLog = Arc::default();
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();

        for &i in &online {
            let relay = Relay {
                index: i,
                node: nodes[i].clone(),
                peers: online
                    .iter()
                    .filter(|j| **j != i)
                    .map(|j| nodes[*j].clone())
                    .collect(),
                proposals: proposals.clone(),
                done: done_tx.clone(),
            };
            tokio::spawn(relay.run(nodes[i].subscribe(), relays.clone()));
        }
        for &i in &online {
            nodes[i].start()?;
        }

        let mut decided: Vec<(usize, Block, BlockCommit)> = Vec::new();
        let result = tokio::time::timeout(timeout, async {
            while decided.len() < online.len() {
                match done_rx.recv().await {
                    Some(completed) => decided.push(completed),
                    None => break,
                }
            }
        })
        .await;

        relays.cancel();
        for &i in &online {
            nodes[i].stop()?;
        }
        for node in &nodes {
            node.join().await?;
        }

        if result.is_err() {
            bail!(
                "height {} not decided within {:?} ({}/{} validators completed)",
                height,
                timeout,
                decided.len(),
                online.len()
            );
        }

        let (_, block, commit) = decided
            .first()
            .cloned()
            .ok_or_else(|| anyhow!("no validator completed height {}", height))?;
        if let Some((i, other, _)) = decided.iter().find(|(_, b, _)| b.hash() != block.hash()) {
            bail!(
                "validator {} decided {} at height {}, expected {}",
                i,
                other.hash(),
                height,
                block.hash()
            );
        }

        for member in &self.members {
            member.chain.append(block.clone(), commit.clone())?;
        }

        Ok(HeightReport {
            height,
            round: commit.round,
            block,
            elapsed: started.elapsed(),
        })
    }
}

type ProposalLog = Arc<Mutex<Vec<ConsensusMessage>>>;

/// Gossip stand-in for one online node
struct Relay {
    index: usize,
    node: Arc<ConsensusNode>,
    peers: Vec<Arc<ConsensusNode>>,
    proposals: ProposalLog,
    done: mpsc::UnboundedSender<(usize, Block, BlockCommit)>,
}

impl Relay {
    /// Forward the node's published messages to its peers and report completion
    async fn run(
        self,
        mut events: tokio::sync::broadcast::Receiver<ConsensusEvent>,
        cancel: CancellationToken,
    ) {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => return,
                event = events.recv() => event,
            };
            match event {
                Ok(ConsensusEvent::MessagePublished(message)) => {
                    if matches!(message, ConsensusMessage::Proposal(_)) {
                        self.proposals.lock().push(message.clone());
                    }
                    for peer in &self.peers {
                        let _ = peer.post_message(message.clone());
                    }
                }
                Ok(ConsensusEvent::RoundStarted { height, round }) => {
                    if round > 0 {
                        tracing::info!(
                            "Validator {} moved to round {} at height {}",
                            self.index,
                            round,
                            height
                        );
                    }
                    self.resend_proposals(round);
                }
                Ok(ConsensusEvent::Completed { block, commit }) => {
                    let _ = self.done.send((self.index, block, commit));
                }
                Ok(ConsensusEvent::ExceptionOccurred(e)) => {
                    tracing::debug!("Validator {}: {}", self.index, e);
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("Relay for validator {} skipped {} events", self.index, skipped);
                }
                Err(RecvError::Closed) => return,
            }
        }
    }

    fn resend_proposals(&self, round: u32) {
        let missed: Vec<ConsensusMessage> = self
            .proposals
            .lock()
            .iter()
            .filter(|m| m.round() == round)
            .cloned()
            .collect();
        for message in missed {
            let _ = self.node.post_message(message);
        }
    }
}
