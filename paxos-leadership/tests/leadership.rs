//! Leader election and leadership gating over a simulated 3-node cluster.

mod cluster;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use paxos_leadership::{
    AwaitingLeadershipProxy, LeaderElectionService, LeadershipStatus, NodeId, StillLeadingStatus,
};

use cluster::{assert_learners_agree, init_tracing, Cluster};

const ELECTION_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-term timestamp issuer used as the gated service.
struct TimestampService {
    next: AtomicU64,
}

impl TimestampService {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            next: AtomicU64::new(1),
        })
    }

    async fn fresh_timestamp(&self) -> Result<u64, String> {
        Ok(self.next.fetch_add(1, Ordering::SeqCst))
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_at_most_one_leader_after_stabilization() {
    init_tracing();
    let cluster = Cluster::new(3, 2);
    let cancel = cluster.start();

    let leader = cluster.wait_for_leader(&cluster.ids(), ELECTION_TIMEOUT).await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    for _ in 0..20 {
        let leaders = cluster.claimed_leaders().await;
        assert_eq!(leaders, vec![leader], "leadership must be stable and exclusive");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    for node in &cluster.nodes {
        let expected = if node.id == leader {
            LeadershipStatus::Leading
        } else {
            LeadershipStatus::Following
        };
        assert_eq!(node.election.status(), expected, "status of {}", node.id);
    }

    cancel.cancel();
    assert_learners_agree(&cluster).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_isolated_leader_is_replaced() {
    init_tracing();
    let cluster = Cluster::new(3, 0);
    let cancel = cluster.start();

    let old_leader = cluster.wait_for_leader(&cluster.ids(), ELECTION_TIMEOUT).await;
    let token = cluster
        .node(old_leader)
        .election
        .current_token_if_leading()
        .await
        .expect("token")
        .expect("leader has a token");

    cluster.isolate(old_leader);
    let survivors: Vec<NodeId> = cluster
        .ids()
        .into_iter()
        .filter(|id| *id != old_leader)
        .collect();
    let new_leader = cluster.wait_for_leader(&survivors, ELECTION_TIMEOUT).await;
    assert_ne!(new_leader, old_leader);

    // Cut off from the acceptors, the old leader cannot vouch for its token.
    assert_ne!(
        cluster.node(old_leader).election.is_still_leading(&token).await,
        StillLeadingStatus::Leading
    );

    cluster.net.heal();
    let settled = cluster.wait_for_leader(&cluster.ids(), ELECTION_TIMEOUT).await;
    assert_eq!(
        cluster.node(old_leader).election.is_still_leading(&token).await,
        StillLeadingStatus::NotLeading
    );
    assert_ne!(settled, old_leader);

    cancel.cancel();
    assert_learners_agree(&cluster).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_gated_service_only_runs_on_leader() {
    init_tracing();
    let cluster = Cluster::new(3, 0);
    let cancel = cluster.start();
    let leader = cluster.wait_for_leader(&cluster.ids(), ELECTION_TIMEOUT).await;

    let proxies: Vec<(NodeId, AwaitingLeadershipProxy<TimestampService>)> = cluster
        .nodes
        .iter()
        .map(|node| {
            let election = Arc::clone(&node.election) as Arc<dyn LeaderElectionService>;
            (
                node.id,
                AwaitingLeadershipProxy::new(
                    election,
                    Duration::from_millis(300),
                    TimestampService::new,
                ),
            )
        })
        .collect();

    for (id, proxy) in &proxies {
        let result = proxy
            .call(|service| async move { service.fresh_timestamp().await })
            .await;
        if *id == leader {
            assert_eq!(result.expect("leader serves"), 1);
        } else {
            let err = result.expect_err("follower must refuse");
            assert!(err.is_not_current_leader(), "unexpected error: {err}");
        }
    }

    cancel.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_block_on_becoming_leader_without_background_loop() {
    init_tracing();
    let cluster = Cluster::new(3, 0);
    let node = &cluster.nodes[1];

    let token = tokio::time::timeout(ELECTION_TIMEOUT, node.election.block_on_becoming_leader())
        .await
        .expect("timed out")
        .expect("leader");

    assert_eq!(token.round().proposer, node.id);
    assert_eq!(
        node.election.is_still_leading(&token).await,
        StillLeadingStatus::Leading
    );

    // A second node defers to the live leader instead of taking over.
    let other = &cluster.nodes[2];
    let waited = tokio::time::timeout(
        Duration::from_millis(300),
        other.election.block_on_becoming_leader(),
    )
    .await;
    assert!(waited.is_err(), "follower must not usurp a live leader");
    assert_eq!(
        node.election.is_still_leading(&token).await,
        StillLeadingStatus::Leading
    );
}
