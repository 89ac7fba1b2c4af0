//! Peer-to-peer RPC surface for the three endpoint groups.
//!
//! Requests and replies are serde enums encoded as JSON. The byte transport
//! is supplied by the embedding service through [`PeerTransport`]; this module
//! only defines what travels over it.
//!
//! ## Client and Server Sides
//!
//! | Role | Client stub | Server dispatcher |
//! |------|-------------|-------------------|
//! | Acceptor | [`RemoteAcceptor`] | [`AcceptorEndpoint`] |
//! | Learner | [`RemoteLearner`] | [`LearnerEndpoint`] |
//! | Leadership | [`RemotePingable`] | [`PingEndpoint`] |
//!
//! Client stubs implement the same role traits as the in-process roles, so a
//! node's peer lists mix local and remote entries freely.
//!
//! A dispatcher that hits a local failure (storage down) returns the error
//! instead of encoding a reply. The transport should surface that as a failed
//! call; the caller then counts this peer as unavailable.

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::acceptor::PaxosAcceptor;
use crate::learner::PaxosLearner;
use crate::ping::PingableLeader;
use crate::types::{
    NodeId, PaxosAck, PaxosError, PaxosPromise, PaxosProposal, PaxosValue, PingResponse,
    ProposalNumber,
};

// ============================================================================
// Codec
// ============================================================================

/// Encode a message as JSON bytes.
pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>, PaxosError> {
    Ok(serde_json::to_vec(message)?)
}

/// Decode a message from JSON bytes.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, PaxosError> {
    Ok(serde_json::from_slice(bytes)?)
}

fn unexpected(what: &str) -> PaxosError {
    PaxosError::Codec(format!("unexpected response to {what}"))
}

// ============================================================================
// Wire messages
// ============================================================================

/// Request to an acceptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AcceptorRequest {
    /// Phase 1.
    Prepare {
        /// Round sequence.
        sequence: u64,
        /// Proposal number to promise.
        number: ProposalNumber,
    },
    /// Phase 2.
    Accept {
        /// Round sequence.
        sequence: u64,
        /// Proposal to accept.
        proposal: PaxosProposal,
    },
    /// Highest sequence prepared or accepted.
    LatestSequence,
}

/// Reply from an acceptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AcceptorResponse {
    /// Reply to [`AcceptorRequest::Prepare`].
    Promise(PaxosPromise),
    /// Reply to [`AcceptorRequest::Accept`].
    Ack(PaxosAck),
    /// Reply to [`AcceptorRequest::LatestSequence`].
    LatestSequence(Option<u64>),
}

/// Request to a learner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LearnerRequest {
    /// Record a chosen value.
    Learn {
        /// Round sequence.
        sequence: u64,
        /// The chosen value.
        value: PaxosValue,
    },
    /// Fetch the value learned for one sequence.
    LearnedValue {
        /// Round sequence.
        sequence: u64,
    },
    /// Fetch the value with the highest learned sequence.
    GreatestLearnedValue,
    /// Fetch every value at or after a sequence.
    LearnedValuesSince {
        /// First sequence wanted.
        sequence: u64,
    },
}

/// Reply from a learner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LearnerResponse {
    /// The value was recorded (or already present).
    Learned,
    /// A single value, if present.
    Value(Option<PaxosValue>),
    /// Values in ascending sequence order.
    Values(Vec<PaxosValue>),
}

/// Request to a leadership endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PingRequest {
    /// Ask for leadership status.
    Ping,
}

// ============================================================================
// Transport seams
// ============================================================================

/// Delivers one request to one peer and returns its reply.
///
/// Implementations need not apply a timeout; the quorum broadcaster bounds
/// every call.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Send `request` and wait for the reply bytes.
    async fn call(&self, request: Vec<u8>) -> Result<Vec<u8>, PaxosError>;
}

/// Server side of an endpoint group: decodes a request, runs it, encodes the
/// reply.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    /// Handle one encoded request.
    async fn handle(&self, request: &[u8]) -> Result<Vec<u8>, PaxosError>;
}

async fn round_trip<Req, Resp>(
    transport: &dyn PeerTransport,
    request: &Req,
) -> Result<Resp, PaxosError>
where
    Req: Serialize + Sync,
    Resp: DeserializeOwned,
{
    let reply = transport.call(encode(request)?).await?;
    decode(&reply)
}

// ============================================================================
// Client stubs
// ============================================================================

/// A peer's acceptor reached over a [`PeerTransport`].
pub struct RemoteAcceptor {
    transport: Arc<dyn PeerTransport>,
}

impl RemoteAcceptor {
    /// Create a stub over the given transport.
    pub fn new(transport: Arc<dyn PeerTransport>) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl PaxosAcceptor for RemoteAcceptor {
    async fn prepare(
        &self,
        sequence: u64,
        number: ProposalNumber,
    ) -> Result<PaxosPromise, PaxosError> {
        let request = AcceptorRequest::Prepare { sequence, number };
        match round_trip(self.transport.as_ref(), &request).await? {
            AcceptorResponse::Promise(promise) => Ok(promise),
            _ => Err(unexpected("prepare")),
        }
    }

    async fn accept(&self, sequence: u64, proposal: PaxosProposal) -> Result<PaxosAck, PaxosError> {
        let request = AcceptorRequest::Accept { sequence, proposal };
        match round_trip(self.transport.as_ref(), &request).await? {
            AcceptorResponse::Ack(ack) => Ok(ack),
            _ => Err(unexpected("accept")),
        }
    }

    async fn latest_sequence_prepared_or_accepted(&self) -> Result<Option<u64>, PaxosError> {
        match round_trip(self.transport.as_ref(), &AcceptorRequest::LatestSequence).await? {
            AcceptorResponse::LatestSequence(latest) => Ok(latest),
            _ => Err(unexpected("latest sequence")),
        }
    }
}

/// A peer's learner reached over a [`PeerTransport`].
pub struct RemoteLearner {
    transport: Arc<dyn PeerTransport>,
}

impl RemoteLearner {
    /// Create a stub over the given transport.
    pub fn new(transport: Arc<dyn PeerTransport>) -> Self {
        Self { transport }
    }

    async fn value_request(
        &self,
        request: LearnerRequest,
    ) -> Result<Option<PaxosValue>, PaxosError> {
        match round_trip(self.transport.as_ref(), &request).await? {
            LearnerResponse::Value(value) => Ok(value),
            _ => Err(unexpected("value query")),
        }
    }
}

#[async_trait]
impl PaxosLearner for RemoteLearner {
    async fn learn(&self, sequence: u64, value: PaxosValue) -> Result<(), PaxosError> {
        let request = LearnerRequest::Learn { sequence, value };
        match round_trip(self.transport.as_ref(), &request).await? {
            LearnerResponse::Learned => Ok(()),
            _ => Err(unexpected("learn")),
        }
    }

    async fn learned_value(&self, sequence: u64) -> Result<Option<PaxosValue>, PaxosError> {
        self.value_request(LearnerRequest::LearnedValue { sequence }).await
    }

    async fn greatest_learned_value(&self) -> Result<Option<PaxosValue>, PaxosError> {
        self.value_request(LearnerRequest::GreatestLearnedValue).await
    }

    async fn learned_values_since(&self, sequence: u64) -> Result<Vec<PaxosValue>, PaxosError> {
        let request = LearnerRequest::LearnedValuesSince { sequence };
        match round_trip(self.transport.as_ref(), &request).await? {
            LearnerResponse::Values(values) => Ok(values),
            _ => Err(unexpected("learned values since")),
        }
    }
}

/// A peer's leadership endpoint reached over a [`PeerTransport`].
pub struct RemotePingable {
    node: NodeId,
    transport: Arc<dyn PeerTransport>,
}

impl RemotePingable {
    /// Create a stub for `node` over the given transport.
    pub fn new(node: NodeId, transport: Arc<dyn PeerTransport>) -> Self {
        Self { node, transport }
    }
}

#[async_trait]
impl PingableLeader for RemotePingable {
    async fn ping(&self) -> Result<PingResponse, PaxosError> {
        round_trip(self.transport.as_ref(), &PingRequest::Ping).await
    }

    fn node_id(&self) -> NodeId {
        self.node
    }
}

// ============================================================================
// Server dispatchers
// ============================================================================

/// Serves [`AcceptorRequest`]s against a local acceptor.
pub struct AcceptorEndpoint {
    acceptor: Arc<dyn PaxosAcceptor>,
}

impl AcceptorEndpoint {
    /// Serve the given acceptor.
    pub fn new(acceptor: Arc<dyn PaxosAcceptor>) -> Self {
        Self { acceptor }
    }
}

#[async_trait]
impl RequestHandler for AcceptorEndpoint {
    async fn handle(&self, request: &[u8]) -> Result<Vec<u8>, PaxosError> {
        let response = match decode(request)? {
            AcceptorRequest::Prepare { sequence, number } => {
                AcceptorResponse::Promise(self.acceptor.prepare(sequence, number).await?)
            }
            AcceptorRequest::Accept { sequence, proposal } => {
                AcceptorResponse::Ack(self.acceptor.accept(sequence, proposal).await?)
            }
            AcceptorRequest::LatestSequence => AcceptorResponse::LatestSequence(
                self.acceptor.latest_sequence_prepared_or_accepted().await?,
            ),
        };
        encode(&response)
    }
}

/// Serves [`LearnerRequest`]s against a local learner.
pub struct LearnerEndpoint {
    learner: Arc<dyn PaxosLearner>,
}

impl LearnerEndpoint {
    /// Serve the given learner.
    pub fn new(learner: Arc<dyn PaxosLearner>) -> Self {
        Self { learner }
    }
}

#[async_trait]
impl RequestHandler for LearnerEndpoint {
    async fn handle(&self, request: &[u8]) -> Result<Vec<u8>, PaxosError> {
        let response = match decode(request)? {
            LearnerRequest::Learn { sequence, value } => {
                self.learner.learn(sequence, value).await?;
                LearnerResponse::Learned
            }
            LearnerRequest::LearnedValue { sequence } => {
                LearnerResponse::Value(self.learner.learned_value(sequence).await?)
            }
            LearnerRequest::GreatestLearnedValue => {
                LearnerResponse::Value(self.learner.greatest_learned_value().await?)
            }
            LearnerRequest::LearnedValuesSince { sequence } => {
                LearnerResponse::Values(self.learner.learned_values_since(sequence).await?)
            }
        };
        encode(&response)
    }
}

/// Serves [`PingRequest`]s against a local leadership endpoint.
pub struct PingEndpoint {
    pingable: Arc<dyn PingableLeader>,
}

impl PingEndpoint {
    /// Serve the given endpoint.
    pub fn new(pingable: Arc<dyn PingableLeader>) -> Self {
        Self { pingable }
    }
}

#[async_trait]
impl RequestHandler for PingEndpoint {
    async fn handle(&self, request: &[u8]) -> Result<Vec<u8>, PaxosError> {
        let PingRequest::Ping = decode(request)?;
        encode(&self.pingable.ping().await?)
    }
}
