//! # Paxos Leadership: Consensus and Leader Election for a Fixed Peer Set
//!
//! This crate implements classic multi-instance Paxos and a leader election
//! service on top of it. A small, fixed set of nodes agrees on an ordered
//! sequence of values, and on which node currently leads. Leader-only services
//! (timestamp issuance, lock granting) sit behind a gate that only lets calls
//! through while the local node holds verified leadership.
//!
//! ## Paxos vs Raft: A Mental Model
//!
//! | Paxos Concept | Raft Equivalent | Notes |
//! |---|---|---|
//! | **Round sequence** | Log index | One independent Paxos instance per sequence |
//! | **Proposal number** | Term | Orders competing proposals within one sequence |
//! | **Acceptor** | Voter | Durably promises and accepts |
//! | **Learner** | Applied log | Append-only record of chosen values |
//! | **Leadership round** | Election | A value with no payload naming the new leader |
//! | **Catch-up** | AppendEntries backfill | Pull chosen values from peer learners |
//!
//! Unlike Raft, there is no distinguished leader inside the protocol: any node
//! may propose at any sequence. Leadership is layered on top as "the node named
//! by the latest chosen leadership round".
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │              AwaitingLeadershipProxy<S>                  │
//! │     gates leader-only calls on a verified token          │
//! └──────────────────────┬───────────────────────────────────┘
//!                        │ block_on_becoming_leader / is_still_leading
//!                        ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │               PaxosLeaderElectionService                 │
//! │   verify · ping peers · catch up · propose · back off    │
//! └──────────────────────┬───────────────────────────────────┘
//!                        │
//!                        ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │                         Paxos                            │
//! │        local proposer + learner, peer role lists         │
//! └───────────┬──────────────────────────────┬───────────────┘
//!             │ prepare / accept              │ learn / since
//!             ▼                              ▼
//! ┌───────────────────┐          ┌───────────────────────────┐
//! │    Acceptors      │          │        Learners           │
//! │  local + remote   │          │     local + remote        │
//! └───────────────────┘          └───────────────────────────┘
//! ```
//!
//! ## Crate Organization
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`types`] | Core types: `NodeId`, `Round`, `ProposalNumber`, `PaxosValue`, `PaxosError` |
//! | [`storage`] | `PaxosStateLog` trait, in-memory and file-backed logs |
//! | [`acceptor`] | Acceptor role: prepare / accept handlers |
//! | [`learner`] | Learner role: idempotent learned-value log |
//! | [`quorum`] | Parallel fan-out with quorum-aware early exit |
//! | [`proposer`] | Two-phase proposer |
//! | [`paxos`] | Per-node façade: propose, catch up, verify latest round |
//! | [`ping`] | Leadership status endpoint |
//! | [`election`] | Leader election service and leadership tokens |
//! | [`proxy`] | Leadership-gated service wrapper |
//! | [`rpc`] | JSON wire messages, remote stubs and dispatchers |
//! | [`config`] | Timeouts, ping rate and backoff |

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

pub mod acceptor;
pub mod config;
pub mod election;
pub mod learner;
pub mod paxos;
pub mod ping;
pub mod proposer;
pub mod proxy;
pub mod quorum;
pub mod rpc;
pub mod storage;
pub mod types;

// Re-export key types at crate root for convenience
pub use acceptor::{LocalAcceptor, PaxosAcceptor};
pub use config::{BackoffConfig, LeaderElectionConfig, PaxosConfig};
pub use election::{
    LeaderElectionService, LeadershipStatus, LeadershipToken, PaxosLeaderElectionService,
    StillLeadingStatus,
};
pub use learner::{LocalLearner, PaxosLearner};
pub use paxos::Paxos;
pub use ping::PingableLeader;
pub use proposer::PaxosProposer;
pub use proxy::{AwaitingLeadershipProxy, GatedCallError};
pub use quorum::{QuorumBroadcaster, QuorumResponses};
pub use rpc::{
    AcceptorEndpoint, LearnerEndpoint, PeerTransport, PingEndpoint, RemoteAcceptor,
    RemoteLearner, RemotePingable, RequestHandler,
};
pub use storage::{FileStateLog, InMemoryStateLog, PaxosStateLog};
pub use types::{
    AcceptorState, NodeId, PaxosAck, PaxosError, PaxosPromise, PaxosProposal, PaxosValue,
    PingResponse, ProposalNumber, Round,
};
