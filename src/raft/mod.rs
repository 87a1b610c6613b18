mod broadcaster;
pub mod commit;
mod leader;
mod monitor;
pub mod node;
mod replicator;
pub mod rpc;
pub mod state;
pub mod timer;
pub mod transport;

pub use node::{RaftInbox, RaftMessage, RaftNode, RoleStatus};
pub use rpc::{AppendEntriesArgs, AppendEntriesReply};
pub use state::{LogEntry, NodeId, RaftRole, RaftState};
pub use transport::{LocalNetwork, RaftTransport};
