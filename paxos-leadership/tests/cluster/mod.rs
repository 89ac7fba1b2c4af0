//! In-process cluster harness for integration tests.
//!
//! Every node gets its own acceptor, learner, Paxos façade and election
//! service. Peers talk to each other through [`SimNetwork`], which routes
//! JSON-encoded requests to the target's endpoint dispatchers. It can cut links
//! to simulate partitions, delay calls so replies arrive out of order, and
//! deliver a request twice.
//!
//! ```text
//!   node 1 ──┐                       ┌── AcceptorEndpoint
//!   node 2 ──┼── SimLink (cut? jitter) ──┼── LearnerEndpoint
//!   node 3 ──┘                       └── PingEndpoint
//! ```
//!
//! A node reaches its own roles in-process, never through the network.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio_util::sync::CancellationToken;

use paxos_leadership::{
    AcceptorEndpoint, AcceptorState, InMemoryStateLog, LeaderElectionConfig, LearnerEndpoint,
    LocalAcceptor, LocalLearner, NodeId, Paxos, PaxosAcceptor, PaxosConfig,
    PaxosLeaderElectionService, PaxosError, PaxosLearner, PaxosValue, PeerTransport, PingEndpoint,
    PingableLeader, RemoteAcceptor, RemoteLearner, RemotePingable, RequestHandler,
};

pub type MemAcceptor = LocalAcceptor<InMemoryStateLog<AcceptorState>>;
pub type MemLearner = LocalLearner<InMemoryStateLog<PaxosValue>>;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .try_init();
}

// ============================================================================
// Network
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Acceptor,
    Learner,
    Ping,
}

/// Routes requests between nodes and injects faults.
pub struct SimNetwork {
    handlers: RwLock<HashMap<(NodeId, Role), Arc<dyn RequestHandler>>>,
    cut: RwLock<HashSet<(NodeId, NodeId)>>,
    max_delay_ms: u64,
    duplicate: AtomicBool,
}

impl SimNetwork {
    pub fn new(max_delay_ms: u64) -> Arc<Self> {
        Arc::new(Self {
            handlers: RwLock::new(HashMap::new()),
            cut: RwLock::new(HashSet::new()),
            max_delay_ms,
            duplicate: AtomicBool::new(false),
        })
    }

    pub fn register(&self, node: NodeId, role: Role, handler: Arc<dyn RequestHandler>) {
        self.handlers
            .write()
            .expect("handlers lock")
            .insert((node, role), handler);
    }

    /// Drop all traffic between `a` and `b`, both directions.
    pub fn cut(&self, a: NodeId, b: NodeId) {
        let mut cut = self.cut.write().expect("cut lock");
        cut.insert((a, b));
        cut.insert((b, a));
    }

    /// Deliver about half of all requests twice. The caller gets the reply to
    /// either copy.
    pub fn set_duplication(&self, enabled: bool) {
        self.duplicate.store(enabled, Ordering::SeqCst);
    }

    pub fn heal(&self) {
        self.cut.write().expect("cut lock").clear();
    }

    fn is_cut(&self, from: NodeId, to: NodeId) -> bool {
        self.cut.read().expect("cut lock").contains(&(from, to))
    }

    fn handler(&self, node: NodeId, role: Role) -> Option<Arc<dyn RequestHandler>> {
        self.handlers
            .read()
            .expect("handlers lock")
            .get(&(node, role))
            .cloned()
    }

    pub fn link(self: &Arc<Self>, from: NodeId, to: NodeId, role: Role) -> Arc<dyn PeerTransport> {
        Arc::new(SimLink {
            net: Arc::clone(self),
            from,
            to,
            role,
        })
    }
}

struct SimLink {
    net: Arc<SimNetwork>,
    from: NodeId,
    to: NodeId,
    role: Role,
}

#[async_trait]
impl PeerTransport for SimLink {
    async fn call(&self, request: Vec<u8>) -> Result<Vec<u8>, PaxosError> {
        if self.net.max_delay_ms > 0 {
            let delay = rand::rng().random_range(0..=self.net.max_delay_ms);
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.net.is_cut(self.from, self.to) {
            return Err(PaxosError::Network(format!(
                "{} -> {} is cut",
                self.from, self.to
            )));
        }
        let handler = self
            .net
            .handler(self.to, self.role)
            .ok_or_else(|| PaxosError::Network(format!("{} has no {:?}", self.to, self.role)))?;
        let (duplicate, keep_second) = {
            let mut rng = rand::rng();
            (
                self.net.duplicate.load(Ordering::SeqCst) && rng.random_bool(0.5),
                rng.random_bool(0.5),
            )
        };
        let mut reply = handler.handle(&request).await?;
        if duplicate {
            if let Ok(second) = handler.handle(&request).await {
                if keep_second {
                    reply = second;
                }
            }
        }
        // The reply travels back over the same link.
        if self.net.is_cut(self.to, self.from) {
            return Err(PaxosError::Network("reply lost".to_string()));
        }
        Ok(reply)
    }
}

// ============================================================================
// Cluster
// ============================================================================

pub struct Node {
    pub id: NodeId,
    pub acceptor: Arc<MemAcceptor>,
    pub learner: Arc<MemLearner>,
    pub paxos: Arc<Paxos>,
    pub election: Arc<PaxosLeaderElectionService>,
}

pub struct Cluster {
    pub net: Arc<SimNetwork>,
    pub nodes: Vec<Node>,
}

impl Cluster {
    /// Build a cluster of `size` nodes with ids 1..=size.
    pub fn new(size: u64, max_delay_ms: u64) -> Self {
        let net = SimNetwork::new(max_delay_ms);
        let ids: Vec<NodeId> = (1..=size).map(NodeId::new).collect();

        let roles: Vec<(Arc<MemAcceptor>, Arc<MemLearner>)> = ids
            .iter()
            .map(|_| {
                (
                    Arc::new(LocalAcceptor::new(InMemoryStateLog::new())),
                    Arc::new(LocalLearner::new(InMemoryStateLog::new())),
                )
            })
            .collect();

        let mut nodes = Vec::new();
        for (index, &id) in ids.iter().enumerate() {
            let (acceptor, learner) = &roles[index];

            let mut acceptors: Vec<Arc<dyn PaxosAcceptor>> = Vec::new();
            let mut learners: Vec<Arc<dyn PaxosLearner>> = Vec::new();
            let mut pingables: Vec<Arc<dyn PingableLeader>> = Vec::new();
            for &peer in &ids {
                if peer == id {
                    acceptors.push(Arc::clone(acceptor) as Arc<dyn PaxosAcceptor>);
                    learners.push(Arc::clone(learner) as Arc<dyn PaxosLearner>);
                } else {
                    acceptors.push(Arc::new(RemoteAcceptor::new(
                        net.link(id, peer, Role::Acceptor),
                    )));
                    learners.push(Arc::new(RemoteLearner::new(
                        net.link(id, peer, Role::Learner),
                    )));
                    pingables.push(Arc::new(RemotePingable::new(
                        peer,
                        net.link(id, peer, Role::Ping),
                    )));
                }
            }

            let paxos = Arc::new(Paxos::new(
                id,
                Arc::clone(learner) as Arc<dyn PaxosLearner>,
                acceptors,
                learners,
                &PaxosConfig::for_simulation(),
            ));
            let election = Arc::new(PaxosLeaderElectionService::new(
                Arc::clone(&paxos),
                pingables,
                LeaderElectionConfig::for_simulation(),
            ));

            net.register(
                id,
                Role::Acceptor,
                Arc::new(AcceptorEndpoint::new(
                    Arc::clone(acceptor) as Arc<dyn PaxosAcceptor>
                )),
            );
            net.register(
                id,
                Role::Learner,
                Arc::new(LearnerEndpoint::new(
                    Arc::clone(learner) as Arc<dyn PaxosLearner>
                )),
            );
            net.register(
                id,
                Role::Ping,
                Arc::new(PingEndpoint::new(
                    Arc::clone(&election) as Arc<dyn PingableLeader>
                )),
            );

            nodes.push(Node {
                id,
                acceptor: Arc::clone(acceptor),
                learner: Arc::clone(learner),
                paxos,
                election,
            });
        }

        Self { net, nodes }
    }

    /// Start every node's election loop.
    pub fn start(&self) -> CancellationToken {
        let cancel = CancellationToken::new();
        for node in &self.nodes {
            tokio::spawn(Arc::clone(&node.election).run(cancel.child_token()));
        }
        cancel
    }

    /// Cut `node` off from every other node.
    pub fn isolate(&self, node: NodeId) {
        for other in &self.nodes {
            if other.id != node {
                self.net.cut(node, other.id);
            }
        }
    }

    pub fn node(&self, id: NodeId) -> &Node {
        self.nodes
            .iter()
            .find(|node| node.id == id)
            .expect("unknown node")
    }

    /// Nodes that currently answer a ping with `is_leader = true`.
    pub async fn claimed_leaders(&self) -> Vec<NodeId> {
        let mut leaders = Vec::new();
        for node in &self.nodes {
            if node.election.ping().await.expect("ping").is_leader {
                leaders.push(node.id);
            }
        }
        leaders
    }

    /// Wait until exactly one node among `candidates` claims leadership.
    pub async fn wait_for_leader(&self, candidates: &[NodeId], timeout: Duration) -> NodeId {
        tokio::time::timeout(timeout, async {
            loop {
                let leaders: Vec<NodeId> = self
                    .claimed_leaders()
                    .await
                    .into_iter()
                    .filter(|id| candidates.contains(id))
                    .collect();
                if let [leader] = leaders.as_slice() {
                    return *leader;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("no leader elected in time")
    }

    pub fn ids(&self) -> Vec<NodeId> {
        self.nodes.iter().map(|node| node.id).collect()
    }
}

// ============================================================================
// Invariants
// ============================================================================

/// Check that no sequence has two different learned values across nodes.
///
/// Returns every learned (sequence, value) pair for further assertions.
pub async fn assert_learners_agree(cluster: &Cluster) -> BTreeMap<u64, PaxosValue> {
    let mut chosen: BTreeMap<u64, PaxosValue> = BTreeMap::new();
    for node in &cluster.nodes {
        let learned = node.learner.learned_values_since(0).await.expect("since");
        for value in learned {
            match chosen.get(&value.sequence()) {
                Some(existing) => assert_eq!(
                    existing,
                    &value,
                    "SAFETY VIOLATION: sequence {} learned differently on {}",
                    value.sequence(),
                    node.id
                ),
                None => {
                    chosen.insert(value.sequence(), value);
                }
            }
        }
    }
    chosen
}
