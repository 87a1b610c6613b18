use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::error::{RaftError, Result};
use crate::raft::leader::LeaderSignals;
use crate::raft::node::NodeContext;
use crate::raft::rpc::AppendEntriesArgs;
use crate::raft::state::NodeId;

/// Drive one follower's log towards the leader's. Runs one probe/catch-up
/// cycle per trigger; triggers that arrive mid-cycle collapse into a single
/// follow-up cycle.
pub(crate) async fn run_follower_replicator(
    ctx: NodeContext,
    peer_id: NodeId,
    term: u64,
    signals: Arc<LeaderSignals>,
    shutdown: CancellationToken,
    stop: CancellationToken,
) {
    let Some(trigger) = signals.trigger(peer_id) else {
        return;
    };
    tracing::debug!(node_id = ctx.id, peer_id, term, "Follower replicator started");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = stop.cancelled() => break,
            _ = trigger.notified() => {
                let cycle = FollowerReplicator {
                    ctx: &ctx,
                    peer_id,
                    term,
                    signals: &signals,
                    shutdown: &shutdown,
                    stop: &stop,
                };
                if let Err(e) = cycle.run().await {
                    tracing::error!(
                        node_id = ctx.id,
                        peer_id,
                        term,
                        error = %e,
                        "Follower replicator halted"
                    );
                    break;
                }
            }
        }
    }

    tracing::debug!(node_id = ctx.id, peer_id, term, "Follower replicator stopped");
}

/// Result of the probe phase
enum Probe {
    /// Follower agrees with us up to and including this index
    Matched(u64),
    /// Nothing to do, or no longer our business
    Done,
}

struct FollowerReplicator<'a> {
    ctx: &'a NodeContext,
    peer_id: NodeId,
    term: u64,
    signals: &'a LeaderSignals,
    shutdown: &'a CancellationToken,
    stop: &'a CancellationToken,
}

impl FollowerReplicator<'_> {
    async fn run(&self) -> Result<()> {
        match self.probe().await? {
            Probe::Matched(matched) => self.catch_up(matched).await,
            Probe::Done => Ok(()),
        }
    }

    fn cancelled(&self) -> bool {
        self.shutdown.is_cancelled() || self.stop.is_cancelled()
    }

    /// Walk `nextIndex` back one entry at a time until the follower accepts
    /// an empty AppendEntries anchored just before it.
    async fn probe(&self) -> Result<Probe> {
        loop {
            if self.cancelled() {
                return Ok(Probe::Done);
            }

            let args = {
                let state = self.ctx.state.read().await;
                let Some(leader) = state.leader_state(self.term) else {
                    return Ok(Probe::Done);
                };
                let next_index = leader.next_index_of(self.peer_id);
                if next_index > state.last_log_index() {
                    return Ok(Probe::Done);
                }
                match AppendEntriesArgs::anchored_at(&state, self.term, self.ctx.id, next_index, false) {
                    Some(args) => args,
                    None => return Ok(Probe::Done),
                }
            };
            let prev_log_index = args.prev_log_index;

            let reply = match self.ctx.transport.append_entries(self.peer_id, args).await {
                Ok(reply) => reply,
                Err(e) => {
                    tracing::trace!(
                        node_id = self.ctx.id,
                        peer_id = self.peer_id,
                        error = %e,
                        "Probe failed, retrying"
                    );
                    self.backoff().await;
                    continue;
                }
            };

            if reply.term > self.term {
                self.ctx.step_down_to(reply.term).await;
                return Ok(Probe::Done);
            }
            if reply.success {
                return Ok(Probe::Matched(prev_log_index));
            }
            if prev_log_index == 0 {
                return Err(RaftError::InvariantViolation {
                    peer: self.peer_id,
                    reason: "follower rejected the empty-log anchor".to_string(),
                });
            }

            let mut state = self.ctx.state.write().await;
            let Some(leader) = state.leader_state_mut(self.term) else {
                return Ok(Probe::Done);
            };
            let next_index = leader.next_index.entry(self.peer_id).or_insert(1);
            // Someone else may have moved it while the probe was in flight
            if *next_index == prev_log_index + 1 {
                *next_index = prev_log_index;
            }
            tracing::debug!(
                node_id = self.ctx.id,
                peer_id = self.peer_id,
                next_index = *next_index,
                "Probe rejected, backtracking"
            );
        }
    }

    /// Ship everything after `matched` in one AppendEntries.
    async fn catch_up(&self, matched: u64) -> Result<()> {
        let args = {
            let state = self.ctx.state.read().await;
            if !state.is_leader_for(self.term) {
                return Ok(());
            }
            match AppendEntriesArgs::anchored_at(&state, self.term, self.ctx.id, matched + 1, true) {
                Some(args) => args,
                None => return Ok(()),
            }
        };
        let sent_through = args.last_index();
        let entries = args.entries.len();

        let reply = match self.ctx.transport.append_entries(self.peer_id, args).await {
            Ok(reply) => reply,
            Err(e) => {
                tracing::debug!(
                    node_id = self.ctx.id,
                    peer_id = self.peer_id,
                    error = %e,
                    "Catch-up send failed, will retry"
                );
                if !self.cancelled() {
                    self.backoff().await;
                    self.signals.replicate(self.peer_id);
                }
                return Ok(());
            }
        };

        if reply.term > self.term {
            self.ctx.step_down_to(reply.term).await;
            return Ok(());
        }
        if !reply.success {
            return Err(RaftError::InvariantViolation {
                peer: self.peer_id,
                reason: format!(
                    "catch-up after index {} rejected although the probe matched",
                    matched
                ),
            });
        }

        {
            let mut state = self.ctx.state.write().await;
            let Some(leader) = state.leader_state_mut(self.term) else {
                return Ok(());
            };
            let match_index = leader.match_index.entry(self.peer_id).or_insert(0);
            if sent_through > *match_index {
                *match_index = sent_through;
            }
            leader.next_index.insert(self.peer_id, sent_through + 1);
        }

        tracing::debug!(
            node_id = self.ctx.id,
            peer_id = self.peer_id,
            entries,
            match_index = sent_through,
            "Follower caught up"
        );
        self.signals.commit_check.notify_one();
        Ok(())
    }

    async fn backoff(&self) {
        tokio::select! {
            _ = self.shutdown.cancelled() => {}
            _ = self.stop.cancelled() => {}
            _ = tokio::time::sleep(self.ctx.config.probe_retry_backoff()) => {}
        }
    }
}
