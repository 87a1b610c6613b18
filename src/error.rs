use thiserror::Error;

use crate::raft::state::NodeId;

#[derive(Error, Debug)]
pub enum RaftError {
    #[error("Not the leader, current leader is node {0:?}")]
    NotLeader(Option<NodeId>),

    #[error("Leadership rejected: {0}")]
    LeadershipRejected(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Replication invariant violated for peer {peer}: {reason}")]
    InvariantViolation { peer: NodeId, reason: String },

    #[error("Node is shutting down")]
    Shutdown,
}

/// Failure of an RPC to complete. Distinct from a completed call whose reply
/// carries `success = false`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("peer {0} is unreachable")]
    Unreachable(NodeId),

    #[error("peer {0} is not registered")]
    UnknownPeer(NodeId),
}

pub type Result<T> = std::result::Result<T, RaftError>;
