pub mod config;
pub mod error;
pub mod node;
pub mod raft;
pub mod shutdown;
