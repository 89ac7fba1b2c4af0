//! Leadership status endpoint.

use async_trait::async_trait;

use crate::types::{NodeId, PaxosError, PingResponse};

/// A node that can be asked whether it currently leads.
///
/// Implemented in-process by
/// [`PaxosLeaderElectionService`](crate::election::PaxosLeaderElectionService)
/// and for peers by [`RemotePingable`](crate::rpc::RemotePingable).
#[async_trait]
pub trait PingableLeader: Send + Sync {
    /// Ask the node for its leadership status.
    async fn ping(&self) -> Result<PingResponse, PaxosError>;

    /// Identity of the node behind this endpoint.
    fn node_id(&self) -> NodeId;
}
