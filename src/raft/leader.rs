use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::raft::broadcaster::run_heartbeat_broadcaster;
use crate::raft::commit::run_commit_advancer;
use crate::raft::node::NodeContext;
use crate::raft::replicator::run_follower_replicator;
use crate::raft::state::NodeId;

/// Wake-ups shared by the tasks of one leadership term. `Notify` keeps at
/// most one pending permit, so bursts of triggers coalesce.
pub(crate) struct LeaderSignals {
    replicate: HashMap<NodeId, Notify>,
    pub commit_check: Notify,
}

impl LeaderSignals {
    fn new(peers: &[NodeId]) -> Self {
        Self {
            replicate: peers.iter().map(|&p| (p, Notify::new())).collect(),
            commit_check: Notify::new(),
        }
    }

    pub fn trigger(&self, peer_id: NodeId) -> Option<&Notify> {
        self.replicate.get(&peer_id)
    }

    /// Ask the replicator for `peer_id` to run a catch-up cycle
    pub fn replicate(&self, peer_id: NodeId) {
        if let Some(trigger) = self.trigger(peer_id) {
            trigger.notify_one();
        }
    }

    pub fn replicate_all(&self) {
        for trigger in self.replicate.values() {
            trigger.notify_one();
        }
    }
}

/// Background tasks of one leadership term: the heartbeat broadcaster, one
/// replicator per peer and the commit advancer.
pub(crate) struct LeaderTasks {
    pub term: u64,
    pub signals: Arc<LeaderSignals>,
    stop: CancellationToken,
}

impl LeaderTasks {
    pub fn spawn(ctx: &NodeContext, term: u64, shutdown: &CancellationToken) -> Self {
        let stop = shutdown.child_token();
        let signals = Arc::new(LeaderSignals::new(&ctx.config.peers));

        tokio::spawn(run_heartbeat_broadcaster(
            ctx.clone(),
            term,
            signals.clone(),
            shutdown.clone(),
            stop.clone(),
        ));

        for &peer_id in &ctx.config.peers {
            tokio::spawn(run_follower_replicator(
                ctx.clone(),
                peer_id,
                term,
                signals.clone(),
                shutdown.clone(),
                stop.clone(),
            ));
        }

        tokio::spawn(run_commit_advancer(
            ctx.clone(),
            term,
            signals.clone(),
            shutdown.clone(),
            stop.clone(),
        ));

        Self {
            term,
            signals,
            stop,
        }
    }

    /// Signal every task of this term to exit. In-flight RPCs are left to
    /// finish; their replies are discarded by the term checks.
    pub fn stop(self) {
        tracing::debug!(term = self.term, "Stopping leader tasks");
        self.stop.cancel();
    }
}
