use std::collections::HashMap;

use serde::{Deserialize, Serialize};

pub type NodeId = u64;

/// Raft node role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RaftRole {
    Follower,
    Candidate,
    Leader,
}

impl std::fmt::Display for RaftRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RaftRole::Follower => write!(f, "follower"),
            RaftRole::Candidate => write!(f, "candidate"),
            RaftRole::Leader => write!(f, "leader"),
        }
    }
}

/// A single entry in the replicated log. The command is opaque to this crate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: u64,
    pub index: u64,
    pub command: Vec<u8>,
}

impl LogEntry {
    pub fn new(term: u64, index: u64, command: impl Into<Vec<u8>>) -> Self {
        Self {
            term,
            index,
            command: command.into(),
        }
    }
}

/// Replication bookkeeping that only exists while this node leads `term`.
#[derive(Debug, Clone)]
pub struct LeaderState {
    pub term: u64,
    pub next_index: HashMap<NodeId, u64>,
    pub match_index: HashMap<NodeId, u64>,
}

impl LeaderState {
    pub fn new(term: u64, last_log_index: u64, peers: &[NodeId]) -> Self {
        let mut next_index = HashMap::with_capacity(peers.len());
        let mut match_index = HashMap::with_capacity(peers.len());
        for &peer_id in peers {
            next_index.insert(peer_id, last_log_index + 1);
            match_index.insert(peer_id, 0);
        }
        Self {
            term,
            next_index,
            match_index,
        }
    }

    pub fn next_index_of(&self, peer_id: NodeId) -> u64 {
        self.next_index.get(&peer_id).copied().unwrap_or(1)
    }

    pub fn match_index_of(&self, peer_id: NodeId) -> u64 {
        self.match_index.get(&peer_id).copied().unwrap_or(0)
    }
}

/// All mutable state of one node. Every field is read and written under the
/// node-wide lock held by [`crate::raft::RaftNode`].
///
/// Log indexes are 1-based; index 0 is a sentinel with term 0 that every log
/// contains implicitly.
///
/// # Invariants
///
/// - `current_term` never decreases.
/// - `commit_index <= last_log_index()` and `commit_index` never decreases.
/// - `last_applied <= commit_index`.
/// - `log[i].index == i + 1` for every stored entry.
/// - `leader` is `Some` only while `role == Leader`, and its `term` names the
///   term that allocated it.
#[derive(Debug)]
pub struct RaftState {
    pub current_term: u64,
    pub log: Vec<LogEntry>,

    pub commit_index: u64,
    pub last_applied: u64,

    pub role: RaftRole,
    pub leader_id: Option<NodeId>,

    // Volatile state on leaders (reinitialized on every accession)
    pub leader: Option<LeaderState>,
}

impl RaftState {
    pub fn new() -> Self {
        Self {
            current_term: 0,
            log: Vec::new(),
            commit_index: 0,
            last_applied: 0,
            role: RaftRole::Follower,
            leader_id: None,
            leader: None,
        }
    }

    pub fn last_log_index(&self) -> u64 {
        self.log.len() as u64
    }

    pub fn last_log_term(&self) -> u64 {
        self.log.last().map(|e| e.term).unwrap_or(0)
    }

    /// Term of the entry at `index`, with the sentinel at index 0.
    pub fn term_at(&self, index: u64) -> Option<u64> {
        if index == 0 {
            return Some(0);
        }
        self.get_entry(index).map(|e| e.term)
    }

    /// Get log entry at index (1-indexed)
    pub fn get_entry(&self, index: u64) -> Option<&LogEntry> {
        if index == 0 {
            return None;
        }
        self.log.get((index - 1) as usize)
    }

    /// Get entries starting from index (inclusive) through the end of the log
    pub fn entries_from(&self, start_index: u64) -> Vec<LogEntry> {
        let start = start_index.saturating_sub(1) as usize;
        if start >= self.log.len() {
            return Vec::new();
        }
        self.log[start..].to_vec()
    }

    /// Append a locally originated command at the current term.
    pub fn append_command(&mut self, command: Vec<u8>) -> u64 {
        let index = self.last_log_index() + 1;
        self.log.push(LogEntry {
            term: self.current_term,
            index,
            command,
        });
        index
    }

    /// Append replicated entries after the current last entry.
    pub fn append_entries(&mut self, entries: impl IntoIterator<Item = LogEntry>) {
        for mut entry in entries {
            entry.index = self.last_log_index() + 1;
            self.log.push(entry);
        }
    }

    /// Drop every entry at `index` and beyond. The sentinel is never dropped.
    pub fn truncate_from(&mut self, index: u64) {
        let keep = index.saturating_sub(1) as usize;
        if keep < self.log.len() {
            self.log.truncate(keep);
        }
        // Committed entries are never truncated under a correct leader
        if self.commit_index > self.last_log_index() {
            tracing::error!(
                commit_index = self.commit_index,
                last_log_index = self.last_log_index(),
                "Log truncated below commit index"
            );
        }
    }

    /// Adopt `term` if it is newer than ours. Returns whether the term moved.
    pub fn observe_term(&mut self, term: u64) -> bool {
        if term > self.current_term {
            self.current_term = term;
            self.leader_id = None;
            true
        } else {
            false
        }
    }

    /// Whether this node still leads `term` with live leader bookkeeping.
    pub fn is_leader_for(&self, term: u64) -> bool {
        self.role == RaftRole::Leader
            && self.current_term == term
            && self.leader.as_ref().map(|l| l.term) == Some(term)
    }

    /// Leader bookkeeping for `term`, or `None` once that term is over.
    pub fn leader_state_mut(&mut self, term: u64) -> Option<&mut LeaderState> {
        if !self.is_leader_for(term) {
            return None;
        }
        self.leader.as_mut()
    }

    pub fn leader_state(&self, term: u64) -> Option<&LeaderState> {
        if !self.is_leader_for(term) {
            return None;
        }
        self.leader.as_ref()
    }

    /// Transition to follower state, adopting `term` if newer
    pub fn become_follower(&mut self, term: u64) {
        self.observe_term(term);
        self.role = RaftRole::Follower;
        self.leader = None;
    }

    /// Transition to candidate state. Campaigning itself belongs to the
    /// election component.
    pub fn become_candidate(&mut self) {
        self.role = RaftRole::Candidate;
        self.leader = None;
        self.leader_id = None;
    }

    /// Transition to leader state for `term`
    pub fn become_leader(&mut self, my_id: NodeId, term: u64, peer_ids: &[NodeId]) {
        self.observe_term(term);
        self.role = RaftRole::Leader;
        self.leader_id = Some(my_id);
        self.leader = Some(LeaderState::new(term, self.last_log_index(), peer_ids));
    }

    /// Raise the commit watermark to `min(index, last_log_index)`. Returns
    /// whether it moved.
    pub fn advance_commit(&mut self, index: u64) -> bool {
        let target = index.min(self.last_log_index());
        if target > self.commit_index {
            self.commit_index = target;
            true
        } else {
            false
        }
    }

    /// Entries committed since the last call, in log order.
    pub fn take_committed(&mut self) -> Vec<LogEntry> {
        let mut entries = Vec::new();
        while self.last_applied < self.commit_index {
            self.last_applied += 1;
            if let Some(entry) = self.get_entry(self.last_applied) {
                entries.push(entry.clone());
            }
        }
        entries
    }
}

impl Default for RaftState {
    fn default() -> Self {
        Self::new()
    }
}
