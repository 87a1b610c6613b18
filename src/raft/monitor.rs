use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::raft::node::{NodeContext, RaftMessage};
use crate::raft::state::RaftRole;
use crate::raft::timer::random_election_timeout;

/// Watch for leader silence. Each round waits for a heartbeat notification
/// or a freshly drawn election timeout, whichever comes first; on timeout a
/// non-leader asks the coordinator to become candidate.
pub(crate) async fn run_heartbeat_monitor(
    ctx: NodeContext,
    mut heartbeats: mpsc::Receiver<()>,
    shutdown: CancellationToken,
    stop: CancellationToken,
) {
    tracing::debug!(node_id = ctx.id, "Heartbeat monitor started");

    loop {
        let election_timeout = random_election_timeout(
            ctx.config.election_timeout_min_ms,
            ctx.config.election_timeout_max_ms,
        );

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = stop.cancelled() => break,
            Some(()) = heartbeats.recv() => continue,
            _ = tokio::time::sleep(election_timeout) => {
                let role = ctx.state.read().await.role;
                if role == RaftRole::Leader {
                    continue;
                }
                tracing::debug!(
                    node_id = ctx.id,
                    timeout_ms = election_timeout.as_millis() as u64,
                    "Election timeout elapsed without heartbeat"
                );
                if ctx.message_tx.send(RaftMessage::BecomeCandidate).await.is_err() {
                    break;
                }
            }
        }
    }

    tracing::debug!(node_id = ctx.id, "Heartbeat monitor stopped");
}
