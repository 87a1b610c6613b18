//! Log repair tests.
//!
//! These tests verify that the leader walks `nextIndex` back over a
//! divergent or short follower log and then overwrites the follower's
//! suffix with its own.

mod test_harness;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use raft_replica::error::TransportError;
use raft_replica::raft::{AppendEntriesArgs, AppendEntriesReply, LocalNetwork, NodeId, RaftTransport};
use test_harness::{assert_eventually, TestCluster};

/// Passes traffic through to the network and counts rejected replies per
/// target
struct CountingTransport {
    inner: Arc<LocalNetwork>,
    rejected: Mutex<HashMap<NodeId, usize>>,
}

impl CountingTransport {
    fn new(inner: Arc<LocalNetwork>) -> Self {
        Self {
            inner,
            rejected: Mutex::new(HashMap::new()),
        }
    }

    fn rejected(&self, target: NodeId) -> usize {
        self.rejected
            .lock()
            .unwrap()
            .get(&target)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl RaftTransport for CountingTransport {
    async fn append_entries(
        &self,
        target: NodeId,
        args: AppendEntriesArgs,
    ) -> Result<AppendEntriesReply, TransportError> {
        let reply = self.inner.append_entries(target, args).await?;
        if !reply.success {
            *self.rejected.lock().unwrap().entry(target).or_insert(0) += 1;
        }
        Ok(reply)
    }
}

/// Test 1: A follower with entries from a deposed leader converges
#[tokio::test]
async fn test_divergent_follower_converges() {
    let cluster = TestCluster::new(3).await;

    cluster.node(1).seed(4, &[1, 1, 2, 2, 2]).await;
    cluster.node(2).seed(3, &[1, 1, 3, 3]).await;
    cluster.node(3).seed(4, &[1, 1, 2, 2, 2]).await;

    cluster
        .node(1)
        .raft_node
        .become_leader(4)
        .await
        .expect("Node 1 should accept leadership");

    assert!(
        cluster
            .wait_for_matching_logs(&[1, 2, 3], Duration::from_secs(3))
            .await,
        "Divergent follower should be overwritten with the leader's log"
    );
    assert_eq!(cluster.node(2).log_terms().await, vec![1, 1, 2, 2, 2]);
    assert_eq!(cluster.node(2).current_term().await, 4);

    // Nothing from term 4 yet, so nothing commits
    assert_eq!(cluster.node(1).commit_index().await, 0);

    let index = cluster.submit(1, "x").await;
    assert_eq!(index, 6);

    assert!(
        cluster
            .wait_for_commit_on_all(6, Duration::from_secs(3))
            .await,
        "A current-term entry should commit everything beneath it"
    );
    assert!(cluster.verify_log_matching().await);
}

/// Test 2: A follower longer than the leader has its extra suffix removed
#[tokio::test]
async fn test_follower_with_extra_entries_is_trimmed() {
    let cluster = TestCluster::new(3).await;

    cluster.node(1).seed(3, &[1, 1]).await;
    cluster.node(2).seed(2, &[1, 1, 2, 2, 2]).await;
    cluster.node(3).seed(3, &[1, 1]).await;

    cluster
        .node(1)
        .raft_node
        .become_leader(3)
        .await
        .expect("Node 1 should accept leadership");

    cluster.submit(1, "y").await;

    assert!(
        cluster
            .wait_for_matching_logs(&[1, 2, 3], Duration::from_secs(3))
            .await,
        "Follower should end up with the leader's log"
    );
    assert_eq!(cluster.node(2).log_terms().await, vec![1, 1, 3]);
    assert!(
        cluster
            .wait_for_commit_on_all(3, Duration::from_secs(3))
            .await
    );
}

/// Test 3: A lagging follower is caught up by heartbeats alone
#[tokio::test]
async fn test_lagging_follower_caught_up_without_new_commands() {
    let cluster = TestCluster::with_leader(3).await;

    cluster.network.isolate(3).await;
    for i in 0..5 {
        cluster.submit(1, &format!("cmd-{}", i)).await;
    }

    assert!(
        cluster
            .wait_for_commit_on_nodes(&[1, 2], 5, Duration::from_secs(3))
            .await,
        "Leader and connected follower form a majority"
    );
    assert_eq!(cluster.node(3).log_len().await, 0);

    cluster.network.heal(3).await;

    assert!(
        cluster
            .wait_for_commit_on_all(5, Duration::from_secs(3))
            .await,
        "Healed follower should catch up and learn the commit index"
    );
    assert!(cluster.logs_match(&[1, 2, 3]).await);

    let leader = cluster.node(1);
    assert_eventually(
        || async {
            let state = leader.raft_node.state.read().await;
            state
                .leader
                .as_ref()
                .is_some_and(|l| l.match_index_of(3) == 5 && l.next_index_of(3) == 6)
        },
        Duration::from_secs(2),
        "Leader should record the follower's progress",
    )
    .await;
}

/// Test 4: Leader bookkeeping matches the replicated prefix
#[tokio::test]
async fn test_match_index_tracks_replication() {
    let cluster = TestCluster::with_leader(3).await;

    for i in 0..3 {
        cluster.submit(1, &format!("cmd-{}", i)).await;
    }
    assert!(
        cluster
            .wait_for_commit_on_all(3, Duration::from_secs(3))
            .await
    );

    let leader = cluster.node(1);
    assert_eventually(
        || async {
            let state = leader.raft_node.state.read().await;
            let Some(l) = state.leader.as_ref() else {
                return false;
            };
            [2, 3]
                .iter()
                .all(|&p| l.match_index_of(p) == 3 && l.next_index_of(p) == 4)
        },
        Duration::from_secs(2),
        "matchIndex and nextIndex should reflect the follower logs",
    )
    .await;
}

/// Test 5: Repair costs at most one rejection per divergent entry, plus the
/// heartbeat that uncovers the divergence
#[tokio::test]
async fn test_backtracking_bounded_by_divergence() {
    let mut counting = None;
    let cluster = TestCluster::with_transport(3, |network| {
        let transport = Arc::new(CountingTransport::new(network));
        counting = Some(transport.clone());
        transport as Arc<dyn RaftTransport>
    })
    .await;
    let counting = counting.expect("transport is built with the cluster");

    // Logs agree on the first two entries and differ on the last four
    cluster.node(1).seed(4, &[1, 1, 2, 2, 2, 2]).await;
    cluster.node(2).seed(3, &[1, 1, 3, 3, 3, 3]).await;
    cluster.node(3).seed(4, &[1, 1, 2, 2, 2, 2]).await;
    let divergence = 4;

    cluster
        .node(1)
        .raft_node
        .become_leader(4)
        .await
        .expect("Node 1 should accept leadership");

    assert!(
        cluster
            .wait_for_matching_logs(&[1, 2, 3], Duration::from_secs(3))
            .await,
        "Divergent follower should converge"
    );

    let rejected = counting.rejected(2);
    assert!(rejected >= 1, "Divergence should be detected at least once");
    assert!(
        rejected <= divergence + 1,
        "Follower rejected {} requests for a divergence of {}",
        rejected,
        divergence
    );
    assert_eq!(counting.rejected(3), 0, "Matching follower never rejects");

    cluster.submit(1, "x").await;
    assert!(
        cluster
            .wait_for_commit_on_all(7, Duration::from_secs(3))
            .await
    );
    assert_eq!(cluster.node(2).log_terms().await, vec![1, 1, 2, 2, 2, 2, 4]);
}
