use std::collections::HashSet;
use std::time::Duration;

use crate::error::{RaftError, Result};
use crate::raft::state::NodeId;

/// Timing and membership configuration for a single replication node.
///
/// Peers are identified by id only; how a peer id maps onto an address is the
/// transport's business.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub node_id: NodeId,
    /// Every other member of the cluster (never includes `node_id`)
    pub peers: Vec<NodeId>,
    /// Interval between leader heartbeat rounds
    pub heartbeat_interval_ms: u64,
    /// Lower bound of the randomized election timeout
    pub election_timeout_min_ms: u64,
    /// Upper bound of the randomized election timeout (inclusive)
    pub election_timeout_max_ms: u64,
    /// Pause between probe retries after a transport failure
    pub probe_retry_backoff_ms: u64,
    /// Capacity of the role coordinator's message queue
    pub message_buffer: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            peers: Vec::new(),
            heartbeat_interval_ms: 100,
            election_timeout_min_ms: 300,
            election_timeout_max_ms: 500,
            probe_retry_backoff_ms: 10,
            message_buffer: 100,
        }
    }
}

impl NodeConfig {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            ..Default::default()
        }
    }

    pub fn with_peer(mut self, node_id: NodeId) -> Self {
        self.peers.push(node_id);
        self
    }

    pub fn with_peers(mut self, peers: impl IntoIterator<Item = NodeId>) -> Self {
        self.peers.extend(peers);
        self
    }

    /// Number of voting members, self included.
    pub fn cluster_size(&self) -> usize {
        self.peers.len() + 1
    }

    /// Smallest number of members that forms a strict majority.
    pub fn majority(&self) -> usize {
        self.cluster_size() / 2 + 1
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn probe_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.probe_retry_backoff_ms)
    }

    /// Reject configurations that would break replication or cause spurious
    /// elections under normal operation.
    pub fn validate(&self) -> Result<()> {
        if self.peers.contains(&self.node_id) {
            return Err(RaftError::InvalidConfig(format!(
                "node {} lists itself as a peer",
                self.node_id
            )));
        }

        let mut seen = HashSet::new();
        if let Some(dup) = self.peers.iter().find(|p| !seen.insert(**p)) {
            return Err(RaftError::InvalidConfig(format!(
                "peer {} listed more than once",
                dup
            )));
        }

        if self.heartbeat_interval_ms == 0 {
            return Err(RaftError::InvalidConfig(
                "heartbeat interval must be non-zero".to_string(),
            ));
        }

        if self.election_timeout_min_ms > self.election_timeout_max_ms {
            return Err(RaftError::InvalidConfig(format!(
                "election timeout range {}..={} is empty",
                self.election_timeout_min_ms, self.election_timeout_max_ms
            )));
        }

        if self.election_timeout_min_ms < self.heartbeat_interval_ms.saturating_mul(2) {
            return Err(RaftError::InvalidConfig(format!(
                "election timeout {}ms must be at least twice the heartbeat interval {}ms",
                self.election_timeout_min_ms, self.heartbeat_interval_ms
            )));
        }

        if self.message_buffer == 0 {
            return Err(RaftError::InvalidConfig(
                "message buffer must be non-zero".to_string(),
            ));
        }

        Ok(())
    }
}
