use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::TransportError;
use crate::raft::node::RaftNode;
use crate::raft::rpc::{AppendEntriesArgs, AppendEntriesReply};
use crate::raft::state::NodeId;

/// Call-with-reply primitive used to reach peers.
///
/// `Err` means the call did not complete. A completed call that the peer
/// rejected comes back as `Ok` with `success == false`.
#[async_trait]
pub trait RaftTransport: Send + Sync + 'static {
    async fn append_entries(
        &self,
        target: NodeId,
        args: AppendEntriesArgs,
    ) -> Result<AppendEntriesReply, TransportError>;
}

/// In-process transport that hands requests straight to the target node's
/// handler. Links can be cut and restored to simulate partitions.
#[derive(Default)]
pub struct LocalNetwork {
    nodes: RwLock<HashMap<NodeId, Weak<RaftNode>>>,
    // Directed (from, to) pairs that currently drop traffic
    blocked: RwLock<HashSet<(NodeId, NodeId)>>,
}

impl LocalNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn register(&self, node: &Arc<RaftNode>) {
        self.nodes
            .write()
            .await
            .insert(node.id, Arc::downgrade(node));
    }

    /// Remove a node entirely, as if it crashed.
    pub async fn deregister(&self, node_id: NodeId) {
        self.nodes.write().await.remove(&node_id);
    }

    /// Cut the link between `a` and `b` in both directions
    pub async fn disconnect(&self, a: NodeId, b: NodeId) {
        let mut blocked = self.blocked.write().await;
        blocked.insert((a, b));
        blocked.insert((b, a));
    }

    /// Restore the link between `a` and `b` in both directions
    pub async fn reconnect(&self, a: NodeId, b: NodeId) {
        let mut blocked = self.blocked.write().await;
        blocked.remove(&(a, b));
        blocked.remove(&(b, a));
    }

    /// Cut `node_id` off from every other registered node
    pub async fn isolate(&self, node_id: NodeId) {
        for other in self.other_nodes(node_id).await {
            self.disconnect(node_id, other).await;
        }
    }

    /// Undo [`LocalNetwork::isolate`]
    pub async fn heal(&self, node_id: NodeId) {
        for other in self.other_nodes(node_id).await {
            self.reconnect(node_id, other).await;
        }
    }

    pub async fn is_connected(&self, from: NodeId, to: NodeId) -> bool {
        !self.blocked.read().await.contains(&(from, to))
    }

    async fn other_nodes(&self, node_id: NodeId) -> Vec<NodeId> {
        self.nodes
            .read()
            .await
            .keys()
            .filter(|&&id| id != node_id)
            .copied()
            .collect()
    }
}

#[async_trait]
impl RaftTransport for LocalNetwork {
    async fn append_entries(
        &self,
        target: NodeId,
        args: AppendEntriesArgs,
    ) -> Result<AppendEntriesReply, TransportError> {
        if !self.is_connected(args.leader_id, target).await {
            return Err(TransportError::Unreachable(target));
        }

        let node = self
            .nodes
            .read()
            .await
            .get(&target)
            .and_then(Weak::upgrade)
            .ok_or(TransportError::UnknownPeer(target))?;

        let from = args.leader_id;
        let reply = node.handle_append_entries(args).await;

        // The reply travels back over the same link
        if !self.is_connected(target, from).await {
            return Err(TransportError::Unreachable(target));
        }
        Ok(reply)
    }
}
