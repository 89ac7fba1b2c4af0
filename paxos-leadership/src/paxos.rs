//! The Paxos façade: one node's view of the protocol.
//!
//! [`Paxos`] wires together the local proposer, the local learner and the full
//! peer acceptor and learner lists. The leadership layer only talks to this
//! type; it never drives acceptors directly.
//!
//! ## Catch-up
//!
//! A learner can miss a learn broadcast (it was partitioned, or the proposer
//! crashed right after phase 2). [`Paxos::update_learned_state_from_peers`]
//! closes the gap by asking peer learners for everything after the local
//! greatest sequence:
//!
//! ```text
//! next = greatest.sequence + 1   (0 if nothing learned)
//! for value in union(peer.learned_values_since(next)):
//!     if local learner lacks value.sequence: learn it
//! ```
//!
//! Values held by any learner were chosen, so absorbing them is always safe,
//! whether or not a full quorum of learners answered.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info};

use crate::acceptor::PaxosAcceptor;
use crate::config::PaxosConfig;
use crate::learner::PaxosLearner;
use crate::proposer::PaxosProposer;
use crate::quorum::{majority, QuorumBroadcaster};
use crate::types::{NodeId, PaxosError, PaxosValue, Phase};

/// One node's handle on the consensus protocol.
pub struct Paxos {
    id: NodeId,
    proposer: PaxosProposer,
    local_learner: Arc<dyn PaxosLearner>,
    acceptors: Vec<Arc<dyn PaxosAcceptor>>,
    learners: Vec<Arc<dyn PaxosLearner>>,
    broadcaster: QuorumBroadcaster,
}

impl Paxos {
    /// Wire up a node.
    ///
    /// `acceptors` and `learners` list every node in the cluster, this one
    /// included (as its in-process implementation).
    pub fn new(
        id: NodeId,
        local_learner: Arc<dyn PaxosLearner>,
        acceptors: Vec<Arc<dyn PaxosAcceptor>>,
        learners: Vec<Arc<dyn PaxosLearner>>,
        config: &PaxosConfig,
    ) -> Self {
        let broadcaster = QuorumBroadcaster::new(config.request_timeout);
        let proposer = PaxosProposer::new(
            id,
            acceptors.clone(),
            learners.clone(),
            Arc::clone(&local_learner),
            broadcaster.clone(),
        );
        Self {
            id,
            proposer,
            local_learner,
            acceptors,
            learners,
            broadcaster,
        }
    }

    /// This node's id.
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Acceptor quorum size.
    pub fn quorum_size(&self) -> usize {
        self.proposer.quorum_size()
    }

    /// The local learner.
    pub fn local_learner(&self) -> &Arc<dyn PaxosLearner> {
        &self.local_learner
    }

    /// The value with the highest sequence learned locally.
    pub async fn greatest_learned_local_value(&self) -> Result<Option<PaxosValue>, PaxosError> {
        self.local_learner.greatest_learned_value().await
    }

    /// Pull values learned by peers after `current` and learn them locally.
    ///
    /// Returns whether anything new was absorbed. Only a failure of the local
    /// learner is an error; unreachable peers just contribute nothing.
    pub async fn update_learned_state_from_peers(
        &self,
        current: Option<&PaxosValue>,
    ) -> Result<bool, PaxosError> {
        let next = current.map_or(0, |value| value.sequence() + 1);

        let updates = self
            .broadcaster
            .collect_quorum(
                &self.learners,
                majority(self.learners.len()),
                move |learner: Arc<dyn PaxosLearner>| async move {
                    learner.learned_values_since(next).await
                },
                |_: &Vec<PaxosValue>| true,
            )
            .await;

        if !updates.has_quorum() {
            debug!(
                next,
                got = updates.successes(),
                needed = updates.quorum_size(),
                phase = %Phase::CatchUp,
                "partial catch-up"
            );
        }

        // Deduplicate across peers; the first copy of each sequence wins.
        let mut missing = BTreeMap::new();
        for value in updates.into_responses().into_iter().flatten() {
            if value.sequence() >= next {
                missing.entry(value.sequence()).or_insert(value);
            }
        }

        let mut learned = 0usize;
        for (sequence, value) in missing {
            if self.local_learner.learned_value(sequence).await?.is_none() {
                self.local_learner.learn(sequence, value).await?;
                learned += 1;
            }
        }

        if learned > 0 {
            info!(node = %self.id, from = next, learned, "caught up from peers");
        }
        Ok(learned > 0)
    }

    /// Run one proposal attempt for `sequence`.
    ///
    /// See [`PaxosProposer::propose`].
    pub async fn propose(
        &self,
        sequence: u64,
        payload: Option<Vec<u8>>,
    ) -> Result<PaxosValue, PaxosError> {
        self.proposer.propose(sequence, payload).await
    }

    /// Whether a quorum of acceptors has seen nothing past `sequence`.
    ///
    /// `Ok(false)` means enough acceptors report a later sequence that this
    /// round can no longer be the latest. If too few acceptors answer to
    /// decide either way, the result is
    /// [`QuorumNotReached`](PaxosError::QuorumNotReached) for
    /// [`Phase::Verify`].
    pub async fn is_latest_round(&self, sequence: u64) -> Result<bool, PaxosError> {
        let quorum_size = self.quorum_size();
        let responses = self
            .broadcaster
            .collect_quorum(
                &self.acceptors,
                quorum_size,
                |acceptor: Arc<dyn PaxosAcceptor>| async move {
                    acceptor.latest_sequence_prepared_or_accepted().await
                },
                move |latest: &Option<u64>| latest.map_or(true, |latest| latest <= sequence),
            )
            .await;

        if responses.has_quorum() {
            return Ok(true);
        }

        let superseded = responses
            .responses()
            .iter()
            .flatten()
            .filter(|latest| **latest > sequence)
            .count();
        if superseded + quorum_size > self.acceptors.len() {
            debug!(sequence, superseded, "round superseded");
            return Ok(false);
        }

        Err(PaxosError::QuorumNotReached {
            phase: Phase::Verify,
            got: responses.successes(),
            needed: quorum_size,
        })
    }
}
