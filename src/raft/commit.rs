use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::raft::broadcaster::broadcast_heartbeats;
use crate::raft::leader::LeaderSignals;
use crate::raft::node::NodeContext;
use crate::raft::state::RaftState;

/// Highest index past `commit_index` that at least `majority` members
/// (self included) hold and that was written in the leader's current
/// term. Entries of earlier terms only ever commit underneath such an index.
///
/// Returns `None` if this node does not lead `term` or nothing qualifies.
pub fn majority_commit_index(state: &RaftState, term: u64, majority: usize) -> Option<u64> {
    let leader = state.leader_state(term)?;

    let mut index = state.last_log_index();
    while index > state.commit_index {
        let entry_term = state.term_at(index)?;
        // Terms only grow along the log
        if entry_term < state.current_term {
            return None;
        }

        // The leader always holds its own entries
        let replicas = 1 + leader.match_index.values().filter(|&&m| m >= index).count();
        if replicas >= majority && entry_term == state.current_term {
            return Some(index);
        }
        index -= 1;
    }
    None
}

/// Recompute the commit watermark whenever a replicator reports progress.
/// A raised watermark is pushed to followers with an immediate heartbeat
/// round and announced to the apply pipeline.
pub(crate) async fn run_commit_advancer(
    ctx: NodeContext,
    term: u64,
    signals: Arc<LeaderSignals>,
    shutdown: CancellationToken,
    stop: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = stop.cancelled() => break,
            _ = signals.commit_check.notified() => {
                let advanced = {
                    let mut state = ctx.state.write().await;
                    if !state.is_leader_for(term) {
                        break;
                    }
                    match majority_commit_index(&state, term, ctx.config.majority()) {
                        Some(index) if state.advance_commit(index) => Some(index),
                        _ => None,
                    }
                };

                if let Some(commit_index) = advanced {
                    tracing::info!(node_id = ctx.id, term, commit_index, "Commit index advanced");
                    ctx.notify_commit(commit_index);
                    broadcast_heartbeats(&ctx, term, &signals).await;
                }
            }
        }
    }
}
