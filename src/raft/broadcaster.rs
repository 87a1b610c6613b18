use std::sync::Arc;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::raft::leader::LeaderSignals;
use crate::raft::node::NodeContext;
use crate::raft::rpc::{AppendEntriesArgs, AppendEntriesReply};
use crate::raft::state::NodeId;

/// Send a heartbeat round every heartbeat interval for as long as this node
/// leads `term`. The first round goes out immediately.
pub(crate) async fn run_heartbeat_broadcaster(
    ctx: NodeContext,
    term: u64,
    signals: Arc<LeaderSignals>,
    shutdown: CancellationToken,
    stop: CancellationToken,
) {
    tracing::debug!(node_id = ctx.id, term, "Heartbeat broadcaster started");

    let mut ticker = tokio::time::interval(ctx.config.heartbeat_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {
                if !broadcast_heartbeats(&ctx, term, &signals).await {
                    break;
                }
            }
        }
    }

    tracing::debug!(node_id = ctx.id, term, "Heartbeat broadcaster stopped");
}

/// Fan one empty AppendEntries out to every peer without waiting for the
/// replies. Returns `false` once this node no longer leads `term`.
pub(crate) async fn broadcast_heartbeats(
    ctx: &NodeContext,
    term: u64,
    signals: &Arc<LeaderSignals>,
) -> bool {
    let args = {
        let state = ctx.state.read().await;
        if !state.is_leader_for(term) {
            return false;
        }
        AppendEntriesArgs::heartbeat(&state, term, ctx.id)
    };

    for &peer_id in &ctx.config.peers {
        let ctx = ctx.clone();
        let args = args.clone();
        let signals = signals.clone();

        tokio::spawn(async move {
            match ctx.transport.append_entries(peer_id, args).await {
                Ok(reply) => on_heartbeat_reply(&ctx, peer_id, term, reply, &signals).await,
                Err(e) => {
                    tracing::trace!(node_id = ctx.id, peer_id, error = %e, "Heartbeat failed");
                }
            }
        });
    }

    true
}

async fn on_heartbeat_reply(
    ctx: &NodeContext,
    peer_id: NodeId,
    term: u64,
    reply: AppendEntriesReply,
    signals: &LeaderSignals,
) {
    if reply.term > term {
        ctx.step_down_to(reply.term).await;
        return;
    }
    if reply.success {
        return;
    }

    // The follower does not hold our last entry. Make sure its replicator
    // has something to probe for, then wake it.
    {
        let mut state = ctx.state.write().await;
        let last_log_index = state.last_log_index();
        let Some(leader) = state.leader_state_mut(term) else {
            return;
        };
        let next_index = leader.next_index.entry(peer_id).or_insert(last_log_index + 1);
        if *next_index > last_log_index {
            *next_index = last_log_index.max(1);
        }
    }

    tracing::debug!(node_id = ctx.id, peer_id, term, "Heartbeat rejected, scheduling catch-up");
    signals.replicate(peer_id);
}
