//! Proposer role: drives the two phases of classic Paxos for one round.
//!
//! ## Algorithm
//!
//! ```text
//! propose(seq, payload):
//!   n = next proposal number
//!   1. Prepare:  broadcast prepare(seq, n), need a majority of promises
//!   2. Select:   if any promise carries an accepted proposal, adopt the value
//!                with the highest accepted number; else use our own payload
//!   3. Accept:   broadcast accept(seq, n, value), need a majority of acks
//!   4. Learn:    record the value in the local learner, then tell the other
//!                learners best-effort
//! ```
//!
//! Step 2 is the safety rule: a value that might already be chosen is never
//! replaced. Every rejection carries the acceptor's promised number, and the
//! proposer moves its counter past it so the next attempt can win.
//!
//! A failed attempt returns a round failure ([`PaxosError::RoundConflict`] or
//! [`PaxosError::QuorumNotReached`]). The proposer never retries on its own:
//! whether and when to retry is up to the caller.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::acceptor::PaxosAcceptor;
use crate::learner::PaxosLearner;
use crate::quorum::{majority, QuorumBroadcaster, QuorumResponses};
use crate::types::{
    NodeId, PaxosAck, PaxosError, PaxosPromise, PaxosProposal, PaxosValue, Phase, ProposalNumber,
    Round,
};

/// Proposer for one node.
pub struct PaxosProposer {
    id: NodeId,
    acceptors: Vec<Arc<dyn PaxosAcceptor>>,
    learners: Vec<Arc<dyn PaxosLearner>>,
    local_learner: Arc<dyn PaxosLearner>,
    quorum_size: usize,
    proposal_number: AtomicU64,
    broadcaster: QuorumBroadcaster,
}

impl PaxosProposer {
    /// Create a proposer.
    ///
    /// `acceptors` and `learners` are the full peer lists, this node's own
    /// roles included. `local_learner` is this node's learner; it is updated
    /// before `propose` returns.
    pub fn new(
        id: NodeId,
        acceptors: Vec<Arc<dyn PaxosAcceptor>>,
        learners: Vec<Arc<dyn PaxosLearner>>,
        local_learner: Arc<dyn PaxosLearner>,
        broadcaster: QuorumBroadcaster,
    ) -> Self {
        let quorum_size = majority(acceptors.len());
        Self {
            id,
            acceptors,
            learners,
            local_learner,
            quorum_size,
            proposal_number: AtomicU64::new(0),
            broadcaster,
        }
    }

    /// This proposer's node id.
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Number of acceptors that must agree in each phase.
    pub fn quorum_size(&self) -> usize {
        self.quorum_size
    }

    /// The acceptor peer list.
    pub fn acceptors(&self) -> &[Arc<dyn PaxosAcceptor>] {
        &self.acceptors
    }

    fn next_proposal_number(&self) -> ProposalNumber {
        let number = self.proposal_number.fetch_add(1, Ordering::SeqCst) + 1;
        ProposalNumber::new(number, self.id)
    }

    /// Move the counter past a number some acceptor reported.
    fn observe(&self, seen: ProposalNumber) {
        self.proposal_number.fetch_max(seen.number, Ordering::SeqCst);
    }

    /// Run one attempt to get a value chosen for `sequence`.
    ///
    /// Returns the value that was actually chosen. It is this node's payload
    /// unless an earlier proposal had to be adopted, in which case the
    /// returned value names the other node in its round.
    pub async fn propose(
        &self,
        sequence: u64,
        payload: Option<Vec<u8>>,
    ) -> Result<PaxosValue, PaxosError> {
        let number = self.next_proposal_number();
        let own_value = PaxosValue::new(Round::new(sequence, self.id), payload);

        debug!(sequence, %number, "starting prepare phase");

        // Phase 1: collect promises.
        let promises = self
            .broadcaster
            .collect_quorum(
                &self.acceptors,
                self.quorum_size,
                move |acceptor: Arc<dyn PaxosAcceptor>| async move {
                    acceptor.prepare(sequence, number).await
                },
                |promise: &PaxosPromise| promise.promised,
            )
            .await;

        for promise in promises.responses() {
            self.observe(promise.highest_seen);
        }
        if !promises.has_quorum() {
            return Err(self.round_failure(sequence, number, Phase::Prepare, &promises, |p| {
                p.highest_seen
            }));
        }

        // Value selection: adopt the highest previously accepted proposal.
        let value = promises
            .responses()
            .iter()
            .filter(|promise| promise.promised)
            .filter_map(|promise| promise.previously_accepted.as_ref())
            .max_by_key(|accepted| accepted.number)
            .map(|accepted| accepted.value.clone())
            .unwrap_or(own_value);

        if value.round.proposer != self.id {
            info!(
                sequence,
                adopted = %value.round,
                "adopting previously accepted value"
            );
        }

        // Phase 2: collect acknowledgements.
        let proposal = PaxosProposal {
            number,
            value: value.clone(),
        };
        let acks = self
            .broadcaster
            .collect_quorum(
                &self.acceptors,
                self.quorum_size,
                move |acceptor: Arc<dyn PaxosAcceptor>| {
                    let proposal = proposal.clone();
                    async move { acceptor.accept(sequence, proposal).await }
                },
                |ack: &PaxosAck| ack.accepted,
            )
            .await;

        for ack in acks.responses() {
            self.observe(ack.highest_seen);
        }
        if !acks.has_quorum() {
            return Err(self.round_failure(sequence, number, Phase::Accept, &acks, |a| {
                a.highest_seen
            }));
        }

        debug!(sequence, %number, round = %value.round, "value chosen");

        self.local_learner.learn(sequence, value.clone()).await?;
        self.broadcast_learn(sequence, &value);

        Ok(value)
    }

    /// Tell every learner about a chosen value without waiting for them.
    ///
    /// Learners that miss this catch up through `learned_values_since`.
    fn broadcast_learn(&self, sequence: u64, value: &PaxosValue) {
        for learner in &self.learners {
            let learner = Arc::clone(learner);
            let value = value.clone();
            tokio::spawn(async move {
                if let Err(e) = learner.learn(sequence, value).await {
                    debug!(sequence, error = %e, "learn broadcast failed for peer");
                }
            });
        }
    }

    fn round_failure<R>(
        &self,
        sequence: u64,
        number: ProposalNumber,
        phase: Phase,
        responses: &QuorumResponses<R>,
        highest_seen: impl Fn(&R) -> ProposalNumber,
    ) -> PaxosError {
        let seen = responses.responses().iter().map(highest_seen).max();
        match seen {
            Some(seen) if seen > number => {
                warn!(sequence, %number, %seen, %phase, "round conflict");
                PaxosError::RoundConflict { sequence, seen }
            }
            _ => {
                warn!(
                    sequence,
                    %number,
                    %phase,
                    got = responses.successes(),
                    needed = self.quorum_size,
                    "quorum not reached"
                );
                PaxosError::QuorumNotReached {
                    phase,
                    got: responses.successes(),
                    needed: self.quorum_size,
                }
            }
        }
    }
}
