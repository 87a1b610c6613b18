use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use raft_replica::config::NodeConfig;
use raft_replica::node::Node;
use raft_replica::raft::{LocalNetwork, LogEntry, NodeId, RaftNode, RaftRole};
use raft_replica::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "raft-replica")]
#[command(version)]
#[command(about = "Raft log replication core")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run an in-process cluster and replicate a batch of commands through it
    Simulate(SimulateArgs),
}

#[derive(Parser, Debug)]
struct SimulateArgs {
    /// Number of nodes in the cluster (node 1 leads)
    #[arg(long, default_value = "3")]
    nodes: u64,

    /// Number of commands to submit to the leader
    #[arg(long, default_value = "10")]
    commands: usize,

    /// Follower to keep partitioned away while the first half of the
    /// commands is submitted
    #[arg(long)]
    lagging: Option<NodeId>,

    /// Leader heartbeat interval
    #[arg(long, default_value = "100")]
    heartbeat_ms: u64,

    /// Lower bound of the randomized election timeout
    #[arg(long, default_value = "300")]
    election_min_ms: u64,

    /// Upper bound of the randomized election timeout
    #[arg(long, default_value = "500")]
    election_max_ms: u64,

    /// Give up waiting for the cluster to converge after this long
    #[arg(long, default_value = "10")]
    timeout_secs: u64,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Debug, Serialize)]
struct NodeReport {
    node_id: NodeId,
    role: RaftRole,
    term: u64,
    log_len: usize,
    commit_index: u64,
    applied: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    match args.command {
        Commands::Simulate(sim) => run_simulation(sim).await,
    }
}

async fn run_simulation(args: SimulateArgs) -> Result<(), Box<dyn std::error::Error>> {
    if args.nodes == 0 {
        return Err("cluster needs at least one node".into());
    }
    if let Some(lagging) = args.lagging {
        if lagging == 1 || lagging > args.nodes {
            return Err(format!("--lagging must name a follower in 2..={}", args.nodes).into());
        }
    }

    let root = CancellationToken::new();
    let shutdown = install_shutdown_handler(&root)?;
    let network = LocalNetwork::new();

    let mut raft_nodes: Vec<Arc<RaftNode>> = Vec::new();
    let mut applied: Vec<Arc<AtomicU64>> = Vec::new();
    let mut handles = Vec::new();

    for node_id in 1..=args.nodes {
        let config = NodeConfig {
            node_id,
            peers: (1..=args.nodes).filter(|&id| id != node_id).collect(),
            heartbeat_interval_ms: args.heartbeat_ms,
            election_timeout_min_ms: args.election_min_ms,
            election_timeout_max_ms: args.election_max_ms,
            ..NodeConfig::default()
        };

        let counter = Arc::new(AtomicU64::new(0));
        let applier_counter = counter.clone();
        let (node, inbox) = Node::new(config, network.clone(), move |entry: &LogEntry| {
            tracing::debug!(node_id, index = entry.index, term = entry.term, "Applied entry");
            applier_counter.fetch_add(1, Ordering::Relaxed);
        })?;

        network.register(&node.raft_node).await;
        raft_nodes.push(node.raft_node.clone());
        applied.push(counter);
        handles.push(tokio::spawn(node.run(inbox, shutdown.child_token())));
    }

    if let Some(lagging) = args.lagging {
        tracing::info!(node_id = lagging, "Isolating follower");
        network.isolate(lagging).await;
    }

    let leader = raft_nodes[0].clone();
    leader.become_leader(1).await?;

    for i in 0..args.commands {
        if shutdown.is_cancelled() {
            break;
        }
        let index = leader.submit(format!("cmd-{}", i)).await?;
        tracing::debug!(index, "Submitted command");

        if let Some(lagging) = args.lagging {
            if i + 1 == args.commands / 2 {
                tracing::info!(node_id = lagging, "Healing follower");
                network.heal(lagging).await;
            }
        }
    }
    if let Some(lagging) = args.lagging {
        network.heal(lagging).await;
    }

    let target = args.commands as u64;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(args.timeout_secs);
    let mut converged = false;
    while tokio::time::Instant::now() < deadline && !shutdown.is_cancelled() {
        let mut all = true;
        for node in &raft_nodes {
            if node.commit_index().await < target {
                all = false;
                break;
            }
        }
        if all {
            converged = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let mut reports = Vec::with_capacity(raft_nodes.len());
    for (node, counter) in raft_nodes.iter().zip(&applied) {
        let state = node.state.read().await;
        reports.push(NodeReport {
            node_id: node.id,
            role: state.role,
            term: state.current_term,
            log_len: state.log.len(),
            commit_index: state.commit_index,
            applied: counter.load(Ordering::Relaxed),
        });
    }

    match args.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&reports)?),
        OutputFormat::Table => {
            println!(
                "{:<8} {:<10} {:<6} {:<8} {:<8} {:<8}",
                "NODE", "ROLE", "TERM", "LOG", "COMMIT", "APPLIED"
            );
            for r in &reports {
                println!(
                    "{:<8} {:<10} {:<6} {:<8} {:<8} {:<8}",
                    r.node_id,
                    r.role.to_string(),
                    r.term,
                    r.log_len,
                    r.commit_index,
                    r.applied
                );
            }
        }
    }

    root.cancel();
    for handle in handles {
        let _ = handle.await;
    }

    if !converged {
        return Err(format!("cluster did not commit {} entries in time", target).into());
    }
    Ok(())
}
