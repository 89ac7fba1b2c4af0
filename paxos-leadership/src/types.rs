//! Core types for the Paxos engine and the leadership layer built on it.
//!
//! - [`NodeId`]: Opaque, comparable identity of a peer node
//! - [`Round`]: A consensus instance (sequence number) tagged with the node
//!   whose value it carries
//! - [`ProposalNumber`]: The number an acceptor promises on (like Raft's "term")
//! - [`PaxosValue`]: The payload chosen for a round
//! - [`PaxosError`]: Error type for all Paxos and leadership operations

use serde::{Deserialize, Serialize};

/// Opaque identity of a node in the fixed peer set.
///
/// Ids are only ever compared and displayed. Every node picks its id once at
/// startup and keeps it for the lifetime of the process.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct NodeId(pub u64);

impl NodeId {
    /// Create a node id from a raw value.
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Pick a fresh random node id.
    pub fn random() -> Self {
        Self(rand::random())
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "node({:016x})", self.0)
    }
}

/// A consensus instance.
///
/// Rounds are totally ordered by `sequence`. The `proposer` records which
/// node's value the round carries; for leadership rounds this is the node that
/// claims leadership. It only disambiguates, it never makes one round "win"
/// over another with the same sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Round {
    /// Position in the learned log.
    pub sequence: u64,
    /// Node whose value this round carries.
    pub proposer: NodeId,
}

impl Round {
    /// Create a new round.
    pub const fn new(sequence: u64, proposer: NodeId) -> Self {
        Self { sequence, proposer }
    }
}

impl std::fmt::Display for Round {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "round({}, {})", self.sequence, self.proposer)
    }
}

/// Proposal number used by acceptors to order competing proposals.
///
/// Ordered by `number` first; `proposer` breaks ties between two proposers
/// that picked the same number so that no two proposals ever compare equal.
///
/// # Invariants
///
/// - An acceptor never promises a number lower than or equal to one it has
///   already promised.
/// - A proposer never reuses a number: it only moves its counter forward.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct ProposalNumber {
    /// Monotonic counter.
    pub number: u64,
    /// The proposer that issued this number.
    pub proposer: NodeId,
}

impl ProposalNumber {
    /// Create a proposal number.
    pub const fn new(number: u64, proposer: NodeId) -> Self {
        Self { number, proposer }
    }
}

impl std::fmt::Display for ProposalNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "proposal({}, {})", self.number, self.proposer)
    }
}

/// A value chosen (or proposed) for a round.
///
/// Once a quorum of acceptors has accepted a value for a round, the pair is
/// immutable: no other value is ever chosen for that sequence number.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PaxosValue {
    /// The round this value belongs to.
    pub round: Round,
    /// Opaque payload. Leadership rounds carry no payload.
    pub payload: Option<Vec<u8>>,
}

impl PaxosValue {
    /// Create a value for the given round.
    pub fn new(round: Round, payload: Option<Vec<u8>>) -> Self {
        Self { round, payload }
    }

    /// Sequence number of the round.
    pub fn sequence(&self) -> u64 {
        self.round.sequence
    }

    /// The node whose value this is.
    pub fn leader(&self) -> NodeId {
        self.round.proposer
    }
}

/// A proposal: a value paired with the number it was accepted under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaxosProposal {
    /// Number the proposal was issued with.
    pub number: ProposalNumber,
    /// The proposed value.
    pub value: PaxosValue,
}

/// Durable per-sequence state of one acceptor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptorState {
    /// Highest proposal number promised, if any.
    pub promised: Option<ProposalNumber>,
    /// Highest proposal accepted, if any.
    pub accepted: Option<PaxosProposal>,
}

/// Reply to a prepare request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaxosPromise {
    /// Whether the acceptor promised.
    pub promised: bool,
    /// The highest number the acceptor has promised, after handling the request.
    ///
    /// On rejection this is larger than the requested number, so the proposer
    /// can move its counter past it.
    pub highest_seen: ProposalNumber,
    /// Any proposal this acceptor accepted earlier for the same sequence.
    pub previously_accepted: Option<PaxosProposal>,
}

/// Reply to an accept request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaxosAck {
    /// Whether the acceptor accepted the proposal.
    pub accepted: bool,
    /// The highest number the acceptor has promised.
    pub highest_seen: ProposalNumber,
}

/// Reply to a leadership ping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingResponse {
    /// Whether the pinged node currently believes it is the leader.
    pub is_leader: bool,
    /// The greatest round the pinged node has learned.
    pub current_round: Option<Round>,
}

/// Which step of the protocol a quorum was gathered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    /// Phase 1: prepare / promise.
    Prepare,
    /// Phase 2: accept / acknowledge.
    Accept,
    /// Pulling learned values from peer learners.
    CatchUp,
    /// Asking acceptors whether a newer round exists.
    Verify,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Phase::Prepare => "prepare",
            Phase::Accept => "accept",
            Phase::CatchUp => "catch-up",
            Phase::Verify => "verify",
        };
        f.write_str(name)
    }
}

/// Errors that can occur during Paxos and leadership operations.
///
/// | Error | Handled by | When it happens |
/// |-------|-----------|-----------------|
/// | `RoundConflict` | proposer's caller | An acceptor already promised a higher number |
/// | `QuorumNotReached` | proposer's caller | Too many peers rejected or did not answer |
/// | `Storage` | node operator | Durable state is unavailable; the node stops answering |
/// | `Codec` / `Network` / `Timeout` | broadcaster | A single peer call failed |
#[derive(Debug, thiserror::Error)]
pub enum PaxosError {
    /// An acceptor rejected the proposal because it promised a higher number.
    #[error("round {sequence} conflict: acceptor has seen {seen}")]
    RoundConflict {
        /// Sequence of the contested round.
        sequence: u64,
        /// The higher number the acceptor reported.
        seen: ProposalNumber,
    },

    /// Not enough peers answered successfully.
    #[error("{phase} quorum not reached: got {got} of {needed} responses")]
    QuorumNotReached {
        /// The step that failed.
        phase: Phase,
        /// Successful responses received.
        got: usize,
        /// Successful responses required.
        needed: usize,
    },

    /// Durable storage failed or is unavailable.
    #[error("storage error: {0}")]
    Storage(String),

    /// Serialization or deserialization error.
    #[error("codec error: {0}")]
    Codec(String),

    /// Transport-level error talking to a peer.
    #[error("network error: {0}")]
    Network(String),

    /// A peer call timed out.
    #[error("operation timed out")]
    Timeout,
}

impl PaxosError {
    /// Whether this error is a recoverable round failure.
    ///
    /// Round failures are retried by the layer that started the proposal and
    /// never escape it.
    pub fn is_round_failure(&self) -> bool {
        matches!(
            self,
            PaxosError::RoundConflict { .. } | PaxosError::QuorumNotReached { .. }
        )
    }
}

impl From<serde_json::Error> for PaxosError {
    fn from(err: serde_json::Error) -> Self {
        PaxosError::Codec(err.to_string())
    }
}

impl From<std::io::Error> for PaxosError {
    fn from(err: std::io::Error) -> Self {
        PaxosError::Storage(err.to_string())
    }
}
