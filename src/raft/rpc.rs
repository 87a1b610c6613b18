use serde::{Deserialize, Serialize};

use crate::raft::state::{LogEntry, NodeId, RaftRole, RaftState};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesArgs {
    pub term: u64,
    pub leader_id: NodeId,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub entries: Vec<LogEntry>,
    pub leader_commit: u64,
}

impl AppendEntriesArgs {
    /// Empty AppendEntries anchored at the leader's last log position.
    pub fn heartbeat(state: &RaftState, term: u64, leader_id: NodeId) -> Self {
        Self {
            term,
            leader_id,
            prev_log_index: state.last_log_index(),
            prev_log_term: state.last_log_term(),
            entries: Vec::new(),
            leader_commit: state.commit_index,
        }
    }

    /// AppendEntries anchored just before `next_index`, carrying either
    /// nothing (a probe) or every entry from `next_index` on.
    ///
    /// Returns `None` if the leader's log no longer reaches `next_index - 1`.
    pub fn anchored_at(
        state: &RaftState,
        term: u64,
        leader_id: NodeId,
        next_index: u64,
        with_entries: bool,
    ) -> Option<Self> {
        let prev_log_index = next_index.saturating_sub(1);
        let prev_log_term = state.term_at(prev_log_index)?;
        let entries = if with_entries {
            state.entries_from(prev_log_index + 1)
        } else {
            Vec::new()
        };
        Some(Self {
            term,
            leader_id,
            prev_log_index,
            prev_log_term,
            entries,
            leader_commit: state.commit_index,
        })
    }

    /// Index of the last entry this request vouches for.
    pub fn last_index(&self) -> u64 {
        self.prev_log_index + self.entries.len() as u64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesReply {
    pub term: u64,
    pub success: bool,
}

/// What the receiving node has to signal after handling an AppendEntries.
/// The state itself is already updated when this is returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendOutcome {
    pub reply: AppendEntriesReply,
    /// Sender is a legitimate leader; reset the election timer
    pub heartbeat: bool,
    /// This node must fall back to follower
    pub step_down: bool,
    /// New commit watermark, if it moved
    pub committed: Option<u64>,
}

/// Handle AppendEntries RPC.
///
/// Must run under the node-wide lock: the consistency check, any truncation,
/// the append and the commit update happen as one step before the reply is
/// handed back.
pub fn handle_append_entries(
    state: &mut RaftState,
    args: AppendEntriesArgs,
    my_id: NodeId,
) -> AppendOutcome {
    let mut outcome = AppendOutcome {
        reply: AppendEntriesReply {
            term: state.current_term,
            success: false,
        },
        heartbeat: false,
        step_down: false,
        committed: None,
    };

    // Stale leader; leave our election timer alone
    if args.term < state.current_term {
        tracing::debug!(
            node_id = my_id,
            leader_id = args.leader_id,
            req_term = args.term,
            current_term = state.current_term,
            "AppendEntries rejected: stale term"
        );
        return outcome;
    }

    outcome.heartbeat = true;

    if state.observe_term(args.term) {
        tracing::info!(
            node_id = my_id,
            term = args.term,
            leader_id = args.leader_id,
            "Observed newer term in AppendEntries"
        );
        outcome.step_down = true;
    } else if state.role == RaftRole::Candidate {
        // Someone already won this term
        outcome.step_down = true;
    } else if state.role == RaftRole::Leader && args.leader_id != my_id {
        tracing::error!(
            node_id = my_id,
            other_leader = args.leader_id,
            term = args.term,
            "Two leaders in the same term"
        );
    }
    state.leader_id = Some(args.leader_id);
    outcome.reply.term = state.current_term;

    if state.last_log_index() < args.prev_log_index {
        tracing::debug!(
            node_id = my_id,
            prev_log_index = args.prev_log_index,
            last_log_index = state.last_log_index(),
            "AppendEntries rejected: log too short"
        );
        return outcome;
    }

    if state.term_at(args.prev_log_index) != Some(args.prev_log_term) {
        tracing::debug!(
            node_id = my_id,
            prev_log_index = args.prev_log_index,
            prev_log_term = args.prev_log_term,
            actual_term = ?state.term_at(args.prev_log_index),
            "AppendEntries rejected: prev_log_term mismatch, truncating"
        );
        state.truncate_from(args.prev_log_index);
        return outcome;
    }

    let verified_through = args.last_index();

    // Skip entries we already hold; cut our suffix at the first conflict.
    // Matching entries are kept so a delayed, shorter request cannot erase
    // entries acknowledged to a later one.
    let mut insert_at = args.prev_log_index + 1;
    let mut incoming = args.entries.into_iter().peekable();
    while let Some(entry_term) = incoming.peek().map(|e| e.term) {
        match state.term_at(insert_at) {
            Some(term) if term == entry_term => {
                incoming.next();
                insert_at += 1;
            }
            Some(term) => {
                tracing::debug!(
                    node_id = my_id,
                    conflict_index = insert_at,
                    old_term = term,
                    new_term = entry_term,
                    "Truncating conflicting suffix"
                );
                state.truncate_from(insert_at);
                break;
            }
            None => break,
        }
    }

    outcome.reply.success = true;

    let before = state.last_log_index();
    state.append_entries(incoming);
    if state.last_log_index() > before {
        tracing::debug!(
            node_id = my_id,
            entries_appended = state.last_log_index() - before,
            new_last_index = state.last_log_index(),
            "Appended entries"
        );
    }

    if args.leader_commit > state.commit_index
        && state.advance_commit(args.leader_commit.min(verified_through))
    {
        outcome.committed = Some(state.commit_index);
    }

    outcome
}
