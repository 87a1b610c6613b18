//! Test harness for multi-node replication tests.
//!
//! Nodes talk over an in-process `LocalNetwork`. No node campaigns on its own;
//! tests install leaders explicitly through `become_leader`, standing in for
//! the election component.

#![allow(dead_code)]

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use raft_replica::config::NodeConfig;
use raft_replica::node::Node;
use raft_replica::raft::{LocalNetwork, LogEntry, NodeId, RaftNode, RaftRole, RaftTransport};

/// Test node configuration with shorter timeouts for faster tests
pub fn test_node_config(node_id: NodeId, peers: Vec<NodeId>) -> NodeConfig {
    NodeConfig {
        node_id,
        peers,
        heartbeat_interval_ms: 20,
        election_timeout_min_ms: 60,
        election_timeout_max_ms: 120,
        probe_retry_backoff_ms: 5,
        message_buffer: 100,
    }
}

/// Deterministic command for a seeded entry, so equal (index, term) pairs
/// carry equal payloads on every node.
pub fn seeded_command(term: u64, index: u64) -> Vec<u8> {
    format!("t{}-i{}", term, index).into_bytes()
}

/// Handle to a running test node
pub struct TestNode {
    pub node_id: NodeId,
    pub raft_node: Arc<RaftNode>,
    pub applied: Arc<Mutex<Vec<LogEntry>>>,
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

impl TestNode {
    pub async fn is_leader(&self) -> bool {
        self.raft_node.is_leader().await
    }

    pub async fn role(&self) -> RaftRole {
        self.raft_node.role().await
    }

    pub async fn current_term(&self) -> u64 {
        self.raft_node.current_term().await
    }

    pub async fn log_len(&self) -> usize {
        self.raft_node.state.read().await.log.len()
    }

    pub async fn commit_index(&self) -> u64 {
        self.raft_node.commit_index().await
    }

    pub async fn log(&self) -> Vec<LogEntry> {
        self.raft_node.state.read().await.log.clone()
    }

    pub async fn log_terms(&self) -> Vec<u64> {
        self.raft_node
            .state
            .read()
            .await
            .log
            .iter()
            .map(|e| e.term)
            .collect()
    }

    pub fn applied_indexes(&self) -> Vec<u64> {
        self.applied.lock().unwrap().iter().map(|e| e.index).collect()
    }

    /// Replace this node's log and term. Only for setting up a scenario
    /// before a leader is installed.
    pub async fn seed(&self, current_term: u64, entry_terms: &[u64]) {
        let mut state = self.raft_node.state.write().await;
        state.current_term = current_term;
        state.log = entry_terms
            .iter()
            .enumerate()
            .map(|(i, &term)| LogEntry::new(term, i as u64 + 1, seeded_command(term, i as u64 + 1)))
            .collect();
    }
}

impl Drop for TestNode {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.handle.abort();
    }
}

/// Test cluster managing multiple nodes
pub struct TestCluster {
    pub nodes: HashMap<NodeId, TestNode>,
    pub network: Arc<LocalNetwork>,
}

impl TestCluster {
    /// Create and start a cluster of `num_nodes` followers with ids 1..=n
    pub async fn new(num_nodes: u64) -> Self {
        Self::with_transport(num_nodes, |network| network as Arc<dyn RaftTransport>).await
    }

    /// Create a cluster whose nodes send through `wrap(network)` instead of
    /// the bare network, e.g. to observe or rewrite traffic
    pub async fn with_transport<F>(num_nodes: u64, wrap: F) -> Self
    where
        F: FnOnce(Arc<LocalNetwork>) -> Arc<dyn RaftTransport>,
    {
        let network = LocalNetwork::new();
        let transport = wrap(network.clone());
        let mut nodes = HashMap::new();

        for node_id in 1..=num_nodes {
            let peers = (1..=num_nodes).filter(|&id| id != node_id).collect();
            let config = test_node_config(node_id, peers);
            let node = start_node(config, transport.clone()).await;
            network.register(&node.raft_node).await;
            nodes.insert(node_id, node);
        }

        Self { nodes, network }
    }

    /// Create a cluster and install node 1 as leader of term 1
    pub async fn with_leader(num_nodes: u64) -> Self {
        let cluster = Self::new(num_nodes).await;
        cluster
            .node(1)
            .raft_node
            .become_leader(1)
            .await
            .expect("node 1 should accept leadership");
        cluster
    }

    /// Get a reference to a specific node
    pub fn node(&self, node_id: NodeId) -> &TestNode {
        self.nodes.get(&node_id).expect("node not found")
    }

    /// Submit a command directly to a specific node (must be leader)
    pub async fn submit(&self, node_id: NodeId, command: &str) -> u64 {
        self.node(node_id)
            .raft_node
            .submit(command)
            .await
            .expect("submit should succeed on the leader")
    }

    /// Stop a node and remove it from the network (simulates crash)
    pub async fn shutdown_node(&mut self, node_id: NodeId) -> bool {
        self.network.deregister(node_id).await;
        self.nodes.remove(&node_id).is_some()
    }

    /// Wait until every node's commit index reaches `min_commit`
    pub async fn wait_for_commit_on_all(&self, min_commit: u64, timeout: Duration) -> bool {
        let ids: Vec<NodeId> = self.nodes.keys().copied().collect();
        self.wait_for_commit_on_nodes(&ids, min_commit, timeout).await
    }

    /// Wait until the listed nodes' commit index reaches `min_commit`
    pub async fn wait_for_commit_on_nodes(
        &self,
        node_ids: &[NodeId],
        min_commit: u64,
        timeout: Duration,
    ) -> bool {
        wait_for(
            || async {
                for &node_id in node_ids {
                    match self.nodes.get(&node_id) {
                        Some(node) if node.commit_index().await >= min_commit => {}
                        _ => return false,
                    }
                }
                true
            },
            timeout,
            Duration::from_millis(10),
        )
        .await
    }

    /// Wait until the listed nodes hold identical logs
    pub async fn wait_for_matching_logs(&self, node_ids: &[NodeId], timeout: Duration) -> bool {
        wait_for(|| self.logs_match(node_ids), timeout, Duration::from_millis(10)).await
    }

    /// Whether the listed nodes hold identical logs
    pub async fn logs_match(&self, node_ids: &[NodeId]) -> bool {
        let mut logs = Vec::new();
        for &node_id in node_ids {
            match self.nodes.get(&node_id) {
                Some(node) => logs.push(node.log().await),
                None => return false,
            }
        }
        logs.windows(2).all(|w| w[0] == w[1])
    }

    /// Check the log matching property across every pair of nodes: wherever
    /// two logs agree on the term at an index, they agree on everything up
    /// to it.
    pub async fn verify_log_matching(&self) -> bool {
        let mut logs = Vec::new();
        for node in self.nodes.values() {
            logs.push(node.log().await);
        }

        for a in &logs {
            for b in &logs {
                for i in 0..a.len().min(b.len()) {
                    if a[i].term == b[i].term && a[..=i] != b[..=i] {
                        return false;
                    }
                }
            }
        }
        true
    }

    /// Count the number of leaders in the cluster
    pub async fn count_leaders(&self) -> usize {
        let mut count = 0;
        for node in self.nodes.values() {
            if node.is_leader().await {
                count += 1;
            }
        }
        count
    }
}

/// Start a node that sends through `transport`. The caller decides whether
/// anything can reach it.
pub async fn start_node(config: NodeConfig, transport: Arc<dyn RaftTransport>) -> TestNode {
    let node_id = config.node_id;
    let applied = Arc::new(Mutex::new(Vec::new()));
    let sink = applied.clone();

    let (node, inbox) = Node::new(config, transport, move |entry: &LogEntry| {
        sink.lock().unwrap().push(entry.clone());
    })
    .expect("test config is valid");

    let raft_node = node.raft_node.clone();
    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(node.run(inbox, shutdown.clone()));

    TestNode {
        node_id,
        raft_node,
        applied,
        shutdown,
        handle,
    }
}

/// Wait for a condition to become true with timeout
pub async fn wait_for<F, Fut>(condition: F, timeout: Duration, poll_interval: Duration) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < timeout {
        if condition().await {
            return true;
        }
        tokio::time::sleep(poll_interval).await;
    }
    false
}

/// Assert a condition eventually becomes true
pub async fn assert_eventually<F, Fut>(condition: F, timeout: Duration, message: &str)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let result = wait_for(condition, timeout, Duration::from_millis(10)).await;
    assert!(result, "{}", message);
}

/// Assert a condition holds at every poll for the whole duration
pub async fn assert_holds<F, Fut>(condition: F, duration: Duration, message: &str)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < duration {
        assert!(condition().await, "{}", message);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
