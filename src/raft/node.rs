use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch, RwLock};
use tokio_util::sync::CancellationToken;

use crate::config::NodeConfig;
use crate::error::{RaftError, Result};
use crate::raft::leader::LeaderTasks;
use crate::raft::monitor::run_heartbeat_monitor;
use crate::raft::rpc::{handle_append_entries, AppendEntriesArgs, AppendEntriesReply};
use crate::raft::state::{LogEntry, NodeId, RaftRole, RaftState};
use crate::raft::transport::RaftTransport;

/// Requests handled by the role coordinator. Every role transition goes
/// through here; no other task writes `RaftState::role`.
#[derive(Debug)]
pub enum RaftMessage {
    /// Append a command to the leader's log
    AppendCommand {
        command: Vec<u8>,
        response_tx: oneshot::Sender<Result<u64>>,
    },
    /// The election component won `term` for this node
    BecomeLeader {
        term: u64,
        response_tx: oneshot::Sender<Result<()>>,
    },
    /// A newer term was observed; fall back to follower
    StepDown { term: u64 },
    /// No leader contact within the election timeout
    BecomeCandidate,
}

/// Role and term as last published by the coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RoleStatus {
    pub role: RaftRole,
    pub term: u64,
}

/// Receiving ends handed to [`RaftNode::run`].
pub struct RaftInbox {
    messages: mpsc::Receiver<RaftMessage>,
    heartbeats: mpsc::Receiver<()>,
}

/// Handles shared by the coordinator and every background task of a node.
#[derive(Clone)]
pub(crate) struct NodeContext {
    pub id: NodeId,
    pub config: Arc<NodeConfig>,
    pub state: Arc<RwLock<RaftState>>,
    pub transport: Arc<dyn RaftTransport>,
    pub message_tx: mpsc::Sender<RaftMessage>,
    pub commit_tx: Arc<watch::Sender<u64>>,
}

impl NodeContext {
    /// Record a term seen in a reply and ask the coordinator to demote us.
    pub async fn step_down_to(&self, term: u64) {
        if self.state.write().await.observe_term(term) {
            tracing::info!(node_id = self.id, term, "Observed newer term in reply");
        }
        if self
            .message_tx
            .send(RaftMessage::StepDown { term })
            .await
            .is_err()
        {
            tracing::trace!(node_id = self.id, "Coordinator gone, dropping step-down");
        }
    }

    pub fn notify_commit(&self, commit_index: u64) {
        self.commit_tx.send_replace(commit_index);
    }
}

/// One member of the cluster: owns the node state, answers AppendEntries and
/// runs the role coordinator.
pub struct RaftNode {
    pub id: NodeId,
    pub state: Arc<RwLock<RaftState>>,
    ctx: NodeContext,
    heartbeat_tx: mpsc::Sender<()>,
    role_tx: watch::Sender<RoleStatus>,
}

impl RaftNode {
    pub fn new(
        config: NodeConfig,
        transport: Arc<dyn RaftTransport>,
    ) -> Result<(Self, RaftInbox)> {
        config.validate()?;

        let (message_tx, message_rx) = mpsc::channel(config.message_buffer);
        // One slot: a pending reset already covers any later heartbeat
        let (heartbeat_tx, heartbeat_rx) = mpsc::channel(1);
        let (commit_tx, _) = watch::channel(0);
        let (role_tx, _) = watch::channel(RoleStatus {
            role: RaftRole::Follower,
            term: 0,
        });

        let state = Arc::new(RwLock::new(RaftState::new()));
        let ctx = NodeContext {
            id: config.node_id,
            config: Arc::new(config),
            state: state.clone(),
            transport,
            message_tx,
            commit_tx: Arc::new(commit_tx),
        };

        let node = Self {
            id: ctx.id,
            state,
            ctx,
            heartbeat_tx,
            role_tx,
        };
        let inbox = RaftInbox {
            messages: message_rx,
            heartbeats: heartbeat_rx,
        };

        Ok((node, inbox))
    }

    /// Run the role coordinator and the heartbeat monitor until `shutdown`
    /// is cancelled.
    pub async fn run(&self, inbox: RaftInbox, shutdown: CancellationToken) {
        let RaftInbox {
            mut messages,
            heartbeats,
        } = inbox;

        let monitor_stop = shutdown.child_token();
        let monitor = tokio::spawn(run_heartbeat_monitor(
            self.ctx.clone(),
            heartbeats,
            shutdown.clone(),
            monitor_stop.clone(),
        ));

        tracing::info!(node_id = self.id, peers = ?self.ctx.config.peers, "Raft node started");

        let mut leader: Option<LeaderTasks> = None;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                msg = messages.recv() => {
                    let Some(msg) = msg else { break };
                    self.handle_message(msg, &mut leader, &shutdown).await;
                }
            }
        }

        if let Some(tasks) = leader.take() {
            tasks.stop();
        }
        monitor_stop.cancel();
        if let Err(e) = monitor.await {
            tracing::warn!(node_id = self.id, error = %e, "Heartbeat monitor panicked");
        }
        tracing::info!(node_id = self.id, "Raft node stopped");
    }

    async fn handle_message(
        &self,
        msg: RaftMessage,
        leader: &mut Option<LeaderTasks>,
        shutdown: &CancellationToken,
    ) {
        match msg {
            RaftMessage::AppendCommand {
                command,
                response_tx,
            } => {
                let result = self.append_command(command, leader.as_ref()).await;
                let _ = response_tx.send(result);
            }
            RaftMessage::BecomeLeader { term, response_tx } => {
                let result = self.assume_leadership(term, leader, shutdown).await;
                let _ = response_tx.send(result);
            }
            RaftMessage::StepDown { term } => {
                self.step_down(term, leader).await;
            }
            RaftMessage::BecomeCandidate => {
                let mut state = self.state.write().await;
                if state.role == RaftRole::Leader {
                    return;
                }
                if state.role != RaftRole::Candidate {
                    tracing::info!(
                        node_id = self.id,
                        term = state.current_term,
                        "Leader silent, becoming candidate"
                    );
                }
                state.become_candidate();
                self.publish_role(&state);
            }
        }
    }

    async fn append_command(&self, command: Vec<u8>, leader: Option<&LeaderTasks>) -> Result<u64> {
        let mut state = self.state.write().await;

        let Some(tasks) = leader.filter(|t| state.is_leader_for(t.term)) else {
            return Err(RaftError::NotLeader(state.leader_id));
        };

        let index = state.append_command(command);
        tracing::debug!(node_id = self.id, index, term = state.current_term, "Appended command to log");
        drop(state);

        tasks.signals.replicate_all();
        tasks.signals.commit_check.notify_one();
        Ok(index)
    }

    async fn assume_leadership(
        &self,
        term: u64,
        leader: &mut Option<LeaderTasks>,
        shutdown: &CancellationToken,
    ) -> Result<()> {
        let mut state = self.state.write().await;

        if state.is_leader_for(term) {
            return Ok(());
        }
        if term < state.current_term {
            return Err(RaftError::LeadershipRejected(format!(
                "term {} is older than current term {}",
                term, state.current_term
            )));
        }
        if term == state.current_term {
            if let Some(other) = state.leader_id.filter(|&l| l != self.id) {
                return Err(RaftError::LeadershipRejected(format!(
                    "node {} already leads term {}",
                    other, term
                )));
            }
        }

        if let Some(old) = leader.take() {
            old.stop();
        }

        state.become_leader(self.id, term, &self.ctx.config.peers);
        self.publish_role(&state);
        drop(state);

        tracing::info!(node_id = self.id, term, "Became leader");
        *leader = Some(LeaderTasks::spawn(&self.ctx, term, shutdown));
        Ok(())
    }

    async fn step_down(&self, term: u64, leader: &mut Option<LeaderTasks>) {
        let mut state = self.state.write().await;

        // Late request from a task of an older leadership
        if state.role == RaftRole::Leader && state.leader.as_ref().is_some_and(|l| l.term >= term) {
            return;
        }

        let was = state.role;
        state.become_follower(term);
        if let Some(tasks) = leader.take() {
            tasks.stop();
        }
        if was != RaftRole::Follower {
            tracing::info!(
                node_id = self.id,
                from = %was,
                term = state.current_term,
                "Stepped down to follower"
            );
        }
        self.publish_role(&state);
    }

    fn publish_role(&self, state: &RaftState) {
        let status = RoleStatus {
            role: state.role,
            term: state.current_term,
        };
        self.role_tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }

    /// Handle incoming AppendEntries RPC
    pub async fn handle_append_entries(&self, args: AppendEntriesArgs) -> AppendEntriesReply {
        let outcome = {
            let mut state = self.state.write().await;
            handle_append_entries(&mut state, args, self.id)
        };

        if outcome.heartbeat {
            // Full means a reset is already pending
            let _ = self.heartbeat_tx.try_send(());
        }
        if let Some(commit_index) = outcome.committed {
            self.ctx.notify_commit(commit_index);
        }
        if outcome.step_down
            && self
                .ctx
                .message_tx
                .send(RaftMessage::StepDown {
                    term: outcome.reply.term,
                })
                .await
                .is_err()
        {
            tracing::trace!(node_id = self.id, "Coordinator gone, dropping step-down");
        }

        outcome.reply
    }

    /// Append a command through the leader. Resolves to its log index once
    /// appended locally, not once committed.
    pub async fn submit(&self, command: impl Into<Vec<u8>>) -> Result<u64> {
        let (response_tx, response_rx) = oneshot::channel();
        self.ctx
            .message_tx
            .send(RaftMessage::AppendCommand {
                command: command.into(),
                response_tx,
            })
            .await
            .map_err(|_| RaftError::Shutdown)?;
        response_rx.await.map_err(|_| RaftError::Shutdown)?
    }

    /// Acknowledge that the election component made this node leader of
    /// `term`. Starts the leader tasks.
    pub async fn become_leader(&self, term: u64) -> Result<()> {
        let (response_tx, response_rx) = oneshot::channel();
        self.ctx
            .message_tx
            .send(RaftMessage::BecomeLeader { term, response_tx })
            .await
            .map_err(|_| RaftError::Shutdown)?;
        response_rx.await.map_err(|_| RaftError::Shutdown)?
    }

    /// Commit watermark notifications for the apply pipeline
    pub fn subscribe_commits(&self) -> watch::Receiver<u64> {
        self.ctx.commit_tx.subscribe()
    }

    /// Role changes, for the election component
    pub fn subscribe_roles(&self) -> watch::Receiver<RoleStatus> {
        self.role_tx.subscribe()
    }

    /// Get entries that have been committed but not yet applied
    pub async fn committed_entries(&self) -> Vec<LogEntry> {
        self.state.write().await.take_committed()
    }

    /// Check if this node is the leader
    pub async fn is_leader(&self) -> bool {
        self.state.read().await.role == RaftRole::Leader
    }

    pub async fn role(&self) -> RaftRole {
        self.state.read().await.role
    }

    pub async fn current_term(&self) -> u64 {
        self.state.read().await.current_term
    }

    pub async fn commit_index(&self) -> u64 {
        self.state.read().await.commit_index
    }

    /// Get the current leader ID
    pub async fn leader_id(&self) -> Option<NodeId> {
        self.state.read().await.leader_id
    }
}
