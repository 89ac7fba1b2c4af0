//! Leader election on top of the Paxos façade.
//!
//! Leadership is just "the greatest learned value names this node, and no
//! quorum of acceptors has moved past its round". Taking leadership means
//! getting a value naming this node chosen at `greatest + 1`.
//!
//! ## State Machine
//!
//! ```text
//!             propose own round succeeded
//!   Following ─────────────┐
//!       ▲   │ no live      ▼
//!       │   │ leader    Leading
//!       │   ▼              │
//!   SeekingLeadership      │ superseded (acceptors saw a later round)
//!       ▲                  │
//!       └──────────────────┘
//! ```
//!
//! One attempt to lead goes through these steps:
//!
//! 1. Verify: if the local greatest learned value names us and is still the
//!    latest round, we lead. Mint a token.
//! 2. Ping peers: if any of them claims leadership for a round at least as
//!    recent as ours, stand down until the next check.
//! 3. Catch up from peer learners. If anything new arrived, re-evaluate.
//! 4. Propose ourselves at `greatest + 1`. On a round failure, or if another
//!    node's value was adopted, back off with jitter and start over.
//!
//! Two nodes believing they lead at once (for example across a healed
//! partition) is resolved the same way: the older one fails verification as
//! soon as a quorum of acceptors reports the later round.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::LeaderElectionConfig;
use crate::paxos::Paxos;
use crate::ping::PingableLeader;
use crate::quorum::QuorumBroadcaster;
use crate::types::{NodeId, PaxosError, PaxosValue, PingResponse, Round};

/// Where a node stands in the election state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeadershipStatus {
    /// Another node leads, or nobody is known to.
    Following,
    /// Actively trying to become leader.
    SeekingLeadership,
    /// This node holds a verified leadership token.
    Leading,
}

/// Answer to "does this token still hold?".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StillLeadingStatus {
    /// The token's round is still the latest and names this node.
    Leading,
    /// Leadership moved on, or was never ours.
    NotLeading,
    /// Too few acceptors answered to tell.
    NoQuorum,
}

/// A revocable claim that this node believed itself leader for a round.
///
/// Tokens are cheap to clone. Two tokens are equal when they refer to the same
/// learned value, regardless of when they were minted.
#[derive(Debug, Clone)]
pub struct LeadershipToken {
    value: PaxosValue,
    acquired_at: Instant,
}

impl LeadershipToken {
    /// Mint a token for a learned value naming this node.
    pub fn new(value: PaxosValue) -> Self {
        Self {
            value,
            acquired_at: Instant::now(),
        }
    }

    /// The round this token was minted for.
    pub fn round(&self) -> Round {
        self.value.round
    }

    /// The learned value backing this token.
    pub fn value(&self) -> &PaxosValue {
        &self.value
    }

    /// When this token was minted.
    pub fn acquired_at(&self) -> Instant {
        self.acquired_at
    }
}

impl PartialEq for LeadershipToken {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
    }
}

impl Eq for LeadershipToken {}

/// Leadership as seen by code that gates leader-only work.
#[async_trait]
pub trait LeaderElectionService: Send + Sync {
    /// Wait until this node leads and return a token for it.
    ///
    /// Only a local storage failure is an error; round failures are retried
    /// internally with backoff.
    async fn block_on_becoming_leader(&self) -> Result<LeadershipToken, PaxosError>;

    /// A token if this node leads right now, without campaigning.
    async fn current_token_if_leading(&self) -> Result<Option<LeadershipToken>, PaxosError>;

    /// Re-check a previously minted token.
    async fn is_still_leading(&self, token: &LeadershipToken) -> StillLeadingStatus;
}

/// Outcome of one pass through the election steps.
#[derive(Debug)]
enum Attempt {
    Leading(LeadershipToken),
    PeerLeads,
    LearnedNew,
    Retry,
}

/// Paxos-backed [`LeaderElectionService`].
pub struct PaxosLeaderElectionService {
    id: NodeId,
    paxos: Arc<Paxos>,
    peers: Vec<Arc<dyn PingableLeader>>,
    ping_broadcaster: QuorumBroadcaster,
    config: LeaderElectionConfig,
    status: watch::Sender<LeadershipStatus>,
    // One campaign at a time per node, so local callers never duel each other.
    campaign: Mutex<()>,
}

impl PaxosLeaderElectionService {
    /// Create the service.
    ///
    /// `peers` are the leadership endpoints of the *other* nodes.
    pub fn new(
        paxos: Arc<Paxos>,
        peers: Vec<Arc<dyn PingableLeader>>,
        config: LeaderElectionConfig,
    ) -> Self {
        let (status, _) = watch::channel(LeadershipStatus::Following);
        Self {
            id: paxos.id(),
            paxos,
            peers,
            ping_broadcaster: QuorumBroadcaster::new(config.ping_timeout),
            config,
            status,
            campaign: Mutex::new(()),
        }
    }

    /// This node's id.
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// The underlying Paxos façade.
    pub fn paxos(&self) -> &Arc<Paxos> {
        &self.paxos
    }

    /// Current state machine position.
    pub fn status(&self) -> LeadershipStatus {
        *self.status.borrow()
    }

    /// Watch status transitions.
    pub fn subscribe(&self) -> watch::Receiver<LeadershipStatus> {
        self.status.subscribe()
    }

    fn set_status(&self, next: LeadershipStatus) {
        let id = self.id;
        self.status.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            match (*current, next) {
                (_, LeadershipStatus::Leading) => info!(node = %id, "became leader"),
                (LeadershipStatus::Leading, _) => info!(node = %id, "lost leadership"),
                _ => debug!(node = %id, from = ?*current, to = ?next, "status change"),
            }
            *current = next;
            true
        });
    }

    fn leads(&self, value: Option<&PaxosValue>) -> bool {
        value.is_some_and(|value| value.leader() == self.id)
    }

    /// Check whether `value` is a live claim of leadership by this node.
    async fn leadership_status_for(&self, value: Option<&PaxosValue>) -> StillLeadingStatus {
        let value = match value {
            Some(value) if value.leader() == self.id => value,
            _ => return StillLeadingStatus::NotLeading,
        };

        match self.paxos.is_latest_round(value.sequence()).await {
            Ok(true) => StillLeadingStatus::Leading,
            Ok(false) => StillLeadingStatus::NotLeading,
            Err(e) => {
                debug!(node = %self.id, error = %e, "cannot verify leadership");
                StillLeadingStatus::NoQuorum
            }
        }
    }

    /// Whether any peer claims leadership for a round at least as recent as
    /// `greatest`.
    async fn peer_claims_leadership(&self, greatest: Option<&PaxosValue>) -> bool {
        if self.peers.is_empty() {
            return false;
        }
        let known = greatest.map(PaxosValue::sequence);

        let responses = self
            .ping_broadcaster
            .collect_quorum(
                &self.peers,
                1,
                |peer: Arc<dyn PingableLeader>| async move {
                    let reply = peer.ping().await;
                    if let Err(e) = &reply {
                        debug!(peer = %peer.node_id(), error = %e, "ping failed");
                    }
                    reply
                },
                move |response: &PingResponse| {
                    response.is_leader
                        && match (response.current_round, known) {
                            (Some(round), Some(known)) => round.sequence >= known,
                            (Some(_), None) => true,
                            (None, _) => false,
                        }
                },
            )
            .await;

        if responses.has_quorum() {
            debug!(node = %self.id, "a peer claims leadership");
        }
        responses.has_quorum()
    }

    /// One pass through the election steps.
    async fn attempt_leadership(&self) -> Result<Attempt, PaxosError> {
        let _campaign = self.campaign.lock().await;

        let greatest = self.paxos.greatest_learned_local_value().await?;
        let status = self.leadership_status_for(greatest.as_ref()).await;
        match (status, greatest.as_ref()) {
            (StillLeadingStatus::Leading, Some(value)) => {
                self.set_status(LeadershipStatus::Leading);
                return Ok(Attempt::Leading(LeadershipToken::new(value.clone())));
            }
            (StillLeadingStatus::NoQuorum, _) => {
                // Unverifiable: stop claiming, but do not propose without a quorum.
                self.set_status(LeadershipStatus::SeekingLeadership);
                return Ok(Attempt::Retry);
            }
            _ => {}
        }

        if self.peer_claims_leadership(greatest.as_ref()).await {
            self.set_status(LeadershipStatus::Following);
            return Ok(Attempt::PeerLeads);
        }

        if self
            .paxos
            .update_learned_state_from_peers(greatest.as_ref())
            .await?
        {
            return Ok(Attempt::LearnedNew);
        }

        self.set_status(LeadershipStatus::SeekingLeadership);
        let sequence = greatest.as_ref().map_or(0, |value| value.sequence() + 1);
        match self.paxos.propose(sequence, None).await {
            Ok(chosen) if chosen.leader() == self.id => {
                // Verified and tokenized on the next pass.
                Ok(Attempt::LearnedNew)
            }
            Ok(chosen) => {
                info!(
                    node = %self.id,
                    sequence,
                    leader = %chosen.leader(),
                    "another node's claim was chosen"
                );
                self.set_status(LeadershipStatus::Following);
                Ok(Attempt::Retry)
            }
            Err(e) if e.is_round_failure() => {
                debug!(node = %self.id, sequence, error = %e, "leadership attempt failed");
                self.set_status(LeadershipStatus::Following);
                Ok(Attempt::Retry)
            }
            Err(e) => {
                warn!(node = %self.id, sequence, error = %e, "leadership attempt aborted");
                self.set_status(LeadershipStatus::Following);
                Err(e)
            }
        }
    }

    /// Run the election loop until `cancel` fires.
    ///
    /// Every `ping_rate` the node catches up from peers and then either
    /// re-verifies its leadership or campaigns for it. Storage failures are
    /// logged and retried on the next tick.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut retries = 0u32;
        loop {
            let delay = if retries == 0 {
                self.config.ping_rate
            } else {
                self.config.backoff.delay_for_attempt(retries - 1)
            };
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }

            match self.tick().await {
                Ok(true) => retries = retries.saturating_add(1),
                Ok(false) => retries = 0,
                Err(e) => {
                    warn!(node = %self.id, error = %e, "election tick failed");
                    retries = 0;
                }
            }
        }
        self.set_status(LeadershipStatus::Following);
        debug!(node = %self.id, "election loop stopped");
    }

    /// One background check. Returns whether the next check should back off.
    async fn tick(&self) -> Result<bool, PaxosError> {
        let greatest = self.paxos.greatest_learned_local_value().await?;
        self.paxos
            .update_learned_state_from_peers(greatest.as_ref())
            .await?;

        loop {
            match self.attempt_leadership().await? {
                Attempt::Leading(_) | Attempt::PeerLeads => return Ok(false),
                Attempt::LearnedNew => continue,
                Attempt::Retry => return Ok(true),
            }
        }
    }
}

#[async_trait]
impl LeaderElectionService for PaxosLeaderElectionService {
    async fn block_on_becoming_leader(&self) -> Result<LeadershipToken, PaxosError> {
        let mut retries = 0u32;
        loop {
            match self.attempt_leadership().await? {
                Attempt::Leading(token) => return Ok(token),
                Attempt::LearnedNew => continue,
                Attempt::PeerLeads => {
                    retries = 0;
                    tokio::time::sleep(self.config.ping_rate).await;
                }
                Attempt::Retry => {
                    tokio::time::sleep(self.config.backoff.delay_for_attempt(retries)).await;
                    retries = retries.saturating_add(1);
                }
            }
        }
    }

    async fn current_token_if_leading(&self) -> Result<Option<LeadershipToken>, PaxosError> {
        let greatest = self.paxos.greatest_learned_local_value().await?;
        if !self.leads(greatest.as_ref()) {
            return Ok(None);
        }
        match self.leadership_status_for(greatest.as_ref()).await {
            StillLeadingStatus::Leading => Ok(greatest.map(LeadershipToken::new)),
            StillLeadingStatus::NotLeading => {
                self.set_status(LeadershipStatus::Following);
                Ok(None)
            }
            StillLeadingStatus::NoQuorum => Ok(None),
        }
    }

    async fn is_still_leading(&self, token: &LeadershipToken) -> StillLeadingStatus {
        let greatest = match self.paxos.greatest_learned_local_value().await {
            Ok(greatest) => greatest,
            Err(e) => {
                warn!(node = %self.id, error = %e, "cannot read learned state");
                return StillLeadingStatus::NotLeading;
            }
        };

        if greatest.as_ref() != Some(token.value()) {
            self.set_status(LeadershipStatus::Following);
            return StillLeadingStatus::NotLeading;
        }

        let status = self.leadership_status_for(greatest.as_ref()).await;
        if status == StillLeadingStatus::NotLeading {
            self.set_status(LeadershipStatus::Following);
        }
        status
    }
}

#[async_trait]
impl PingableLeader for PaxosLeaderElectionService {
    async fn ping(&self) -> Result<PingResponse, PaxosError> {
        let greatest = self.paxos.greatest_learned_local_value().await?;
        Ok(PingResponse {
            is_leader: self.status() == LeadershipStatus::Leading && self.leads(greatest.as_ref()),
            current_round: greatest.map(|value| value.round),
        })
    }

    fn node_id(&self) -> NodeId {
        self.id
    }
}
