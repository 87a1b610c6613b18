use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::NodeConfig;
use crate::error::Result;
use crate::raft::{LogEntry, RaftInbox, RaftNode, RaftTransport};

/// Consumer of committed entries, i.e. the replicated state machine.
pub trait Applier: Send + 'static {
    fn apply(&mut self, entry: &LogEntry);
}

impl<F> Applier for F
where
    F: FnMut(&LogEntry) + Send + 'static,
{
    fn apply(&mut self, entry: &LogEntry) {
        self(entry)
    }
}

/// Main node that wires the Raft core to an apply pipeline
pub struct Node {
    pub config: NodeConfig,
    pub raft_node: Arc<RaftNode>,
    applier: Box<dyn Applier>,
}

impl Node {
    pub fn new(
        config: NodeConfig,
        transport: Arc<dyn RaftTransport>,
        applier: impl Applier,
    ) -> Result<(Self, RaftInbox)> {
        let (raft_node, inbox) = RaftNode::new(config.clone(), transport)?;

        let node = Self {
            config,
            raft_node: Arc::new(raft_node),
            applier: Box::new(applier),
        };

        Ok((node, inbox))
    }

    /// Run the node with all components until `shutdown` is cancelled.
    ///
    /// Spawns the Raft coordinator (which in turn owns the heartbeat monitor
    /// and, while leading, the replication tasks) and drives the apply loop
    /// on the current task.
    pub async fn run(self, inbox: RaftInbox, shutdown: CancellationToken) {
        let raft_node = self.raft_node.clone();
        let raft_shutdown = shutdown.clone();
        let raft_handle = tokio::spawn(async move {
            raft_node.run(inbox, raft_shutdown).await;
        });

        Self::apply_loop(self.raft_node.clone(), self.applier, shutdown).await;

        if let Err(e) = raft_handle.await {
            tracing::error!(node_id = self.config.node_id, error = %e, "Raft task panicked");
        }
    }

    /// Apply loop that hands committed entries to the applier in log order.
    ///
    /// Runs on every node: followers learn the commit watermark from the
    /// leader's AppendEntries, the leader from its own commit advancer.
    async fn apply_loop(
        raft_node: Arc<RaftNode>,
        mut applier: Box<dyn Applier>,
        shutdown: CancellationToken,
    ) {
        let mut commit_rx = raft_node.subscribe_commits();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                result = commit_rx.changed() => {
                    if result.is_err() {
                        // Channel closed, exit loop
                        break;
                    }

                    for entry in raft_node.committed_entries().await {
                        tracing::trace!(node_id = raft_node.id, index = entry.index, "Applying entry");
                        applier.apply(&entry);
                    }
                }
            }
        }
    }
}
