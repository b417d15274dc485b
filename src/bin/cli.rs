//! Operator CLI for dynamic configuration changes

use anyhow::{bail, Context as _, Result};
use clap::{Parser, Subcommand};
use dynconf::common::{Config, LogicalServerState};
use dynconf::coordinator::{ConsistencyReport, NodeAddress};
use dynconf::model::{Change, Cluster, Node, SettingOp, SettingTarget};
use dynconf::ops::{self, Context};
use dynconf::protocol::ChangeRequestState;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "dynconf")]
#[command(about = "dynconf cluster reconfiguration CLI")]
#[command(version)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Discover nodes and classify the cluster state
    Discover {
        /// Any node of the cluster; its peers are discovered too
        #[arg(short = 's', long)]
        node: NodeAddress,
    },

    /// Activate unconfigured nodes with a topology
    Activate {
        /// Topology file (TOML or JSON)
        #[arg(short, long)]
        topology: PathBuf,
    },

    /// Add a node to a stripe
    Attach {
        /// Any node of the cluster
        #[arg(short = 's', long)]
        node: NodeAddress,

        /// Stripe receiving the node
        #[arg(long)]
        stripe: String,

        /// Name of the new node
        #[arg(long)]
        name: String,

        /// Address of the new node
        #[arg(long)]
        address: NodeAddress,

        /// Offheap resources, `name:MB`
        #[arg(long, value_parser = parse_offheap)]
        offheap: Vec<(String, u64)>,
    },

    /// Remove a node from a stripe
    Detach {
        /// Any node of the cluster
        #[arg(short = 's', long)]
        node: NodeAddress,

        /// Stripe holding the node
        #[arg(long)]
        stripe: String,

        /// Address of the node to remove
        #[arg(long)]
        address: NodeAddress,
    },

    /// Set a setting, `name=value`
    Set {
        #[arg(short = 's', long)]
        node: NodeAddress,

        #[arg(short = 'c', long)]
        setting: String,

        /// Node scope; cluster-wide if omitted
        #[arg(long)]
        target: Option<NodeAddress>,
    },

    /// Unset a setting
    Unset {
        #[arg(short = 's', long)]
        node: NodeAddress,

        #[arg(short = 'c', long)]
        setting: String,

        #[arg(long)]
        target: Option<NodeAddress>,
    },

    /// Resolve a change left half-way
    Repair {
        #[arg(short = 's', long)]
        node: NodeAddress,

        /// Force COMMIT or ROLLBACK instead of the suggested direction
        #[arg(long)]
        force: Option<ChangeRequestState>,
    },

    /// Wait for restarted nodes to come back online
    WaitRestart {
        /// Nodes to wait for
        #[arg(long, value_delimiter = ',', required = true)]
        nodes: Vec<NodeAddress>,

        /// Maximum wait, e.g. `2m`
        #[arg(long)]
        max_wait: Option<String>,
    },
}

fn parse_offheap(s: &str) -> std::result::Result<(String, u64), String> {
    let (name, size) = s
        .split_once(':')
        .ok_or_else(|| format!("expected name:MB, got {}", s))?;
    let size = size
        .parse::<u64>()
        .map_err(|e| format!("invalid size {}: {}", size, e))?;
    Ok((name.to_string(), size))
}

fn parse_setting(s: &str) -> Result<(String, Option<String>)> {
    match s.split_once('=') {
        Some((name, value)) => Ok((name.to_string(), Some(value.to_string()))),
        None => Ok((s.to_string(), None)),
    }
}

fn split_address(address: &NodeAddress) -> Result<(String, u16)> {
    let (host, port) = address
        .as_str()
        .rsplit_once(':')
        .with_context(|| format!("invalid address {}", address))?;
    Ok((host.to_string(), port.parse()?))
}

fn print_report(report: &ConsistencyReport) {
    println!("Cluster state: {}", report.state);
    for (address, response) in &report.responses {
        println!(
            "  {} mode={} version={} highest={} mutations={} latest={}",
            address,
            response.mode,
            response.current_version,
            response.highest_version,
            response.mutative_message_count,
            response
                .latest_change
                .as_ref()
                .map(|c| format!("{} {} ({})", c.uuid, c.state, c.change.summary()))
                .unwrap_or_else(|| "-".into())
        );
    }
    for (address, error) in &report.unreachable {
        println!("  {} UNREACHABLE ({})", address, error);
    }
    if let Some(target) = report.suggested_repair() {
        println!("Suggested repair: --force {}", target);
    }
}

// === Command handlers ===

async fn discover(ctx: &Context, node: &NodeAddress) -> Result<()> {
    let peers = ops::find_runtime_peers(ctx, node).await?;
    let report = ops::analyze(ctx, &peers).await;
    print_report(&report);
    Ok(())
}

async fn activate(ctx: &Context, topology: &PathBuf) -> Result<()> {
    let cluster = Cluster::from_file(topology)?;
    let addresses: Vec<NodeAddress> = cluster
        .node_addresses()
        .into_iter()
        .map(NodeAddress::new)
        .collect();
    if ops::are_all_nodes_activated(ctx, &addresses).await? {
        bail!("cluster {} is already activated", cluster.name);
    }

    let nodes = ops::logical_states(ctx, &addresses).await;
    let offline: Vec<String> = nodes
        .iter()
        .filter(|(_, s)| !s.is_online())
        .map(|(a, _)| a.to_string())
        .collect();
    if !offline.is_empty() {
        bail!("nodes not online: {}", offline.join(", "));
    }

    let name = cluster.name.clone();
    let outcome = ops::run_change(ctx, &nodes, Change::ClusterActivation { cluster }).await?;
    println!(
        "Cluster {} activated on {} node(s) (change {})",
        name,
        outcome.nodes.len(),
        outcome.uuid
    );
    Ok(())
}

async fn change_cluster(ctx: &Context, node: &NodeAddress, change: Change) -> Result<()> {
    let summary = change.summary();
    let nodes = ops::find_runtime_peers_status(ctx, node).await?;
    let outcome = ops::run_change(ctx, &nodes, change).await?;
    println!(
        "{}: committed as version {} (change {})",
        summary, outcome.version, outcome.uuid
    );
    Ok(())
}

async fn detach(
    ctx: &Context,
    node: &NodeAddress,
    stripe: String,
    address: &NodeAddress,
) -> Result<()> {
    if node == address {
        bail!("run detach through another node than the one removed");
    }
    let nodes: Vec<(NodeAddress, LogicalServerState)> = ops::find_runtime_peers_status(ctx, node)
        .await?
        .into_iter()
        .filter(|(a, _)| a != address)
        .collect();
    let change = Change::NodeRemoval {
        stripe,
        address: address.to_string(),
    };
    let summary = change.summary();
    let outcome = ops::run_change(ctx, &nodes, change).await?;
    println!("{}: committed as version {}", summary, outcome.version);
    Ok(())
}

async fn repair(ctx: &Context, node: &NodeAddress, force: Option<ChangeRequestState>) -> Result<()> {
    let nodes = ops::find_runtime_peers_status(ctx, node).await?;
    let outcome = ops::run_repair(ctx, &nodes, force).await?;
    match outcome.uuid {
        Some(uuid) => println!(
            "Change {} forced to {} on {} node(s)",
            uuid,
            outcome.target,
            outcome.forced.len()
        ),
        None => println!("Nothing to repair"),
    }
    if !outcome.skipped.is_empty() {
        println!("Skipped unreachable nodes: {:?}", outcome.skipped);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let ctx = Context::http(&config.coordinator)?;

    match cli.command {
        Commands::Discover { node } => discover(&ctx, &node).await?,

        Commands::Activate { topology } => activate(&ctx, &topology).await?,

        Commands::Attach {
            node,
            stripe,
            name,
            address,
            offheap,
        } => {
            let (hostname, port) = split_address(&address)?;
            let mut new_node = Node::new(name, hostname, port);
            for (resource, size) in offheap {
                new_node = new_node.with_offheap(resource, size);
            }
            change_cluster(
                &ctx,
                &node,
                Change::NodeAddition {
                    stripe,
                    node: new_node,
                },
            )
            .await?
        }

        Commands::Detach {
            node,
            stripe,
            address,
        } => detach(&ctx, &node, stripe, &address).await?,

        Commands::Set {
            node,
            setting,
            target,
        } => {
            let (name, value) = parse_setting(&setting)?;
            if value.is_none() {
                bail!("expected name=value, got {}", setting);
            }
            let change = Change::SettingChange {
                op: SettingOp::Set,
                target: target
                    .map(|t| SettingTarget::Node(t.to_string()))
                    .unwrap_or(SettingTarget::Cluster),
                name,
                value,
            };
            change_cluster(&ctx, &node, change).await?
        }

        Commands::Unset {
            node,
            setting,
            target,
        } => {
            let (name, _) = parse_setting(&setting)?;
            let change = Change::SettingChange {
                op: SettingOp::Unset,
                target: target
                    .map(|t| SettingTarget::Node(t.to_string()))
                    .unwrap_or(SettingTarget::Cluster),
                name,
                value: None,
            };
            change_cluster(&ctx, &node, change).await?
        }

        Commands::Repair { node, force } => repair(&ctx, &node, force).await?,

        Commands::WaitRestart { nodes, max_wait } => {
            let max_wait = max_wait
                .as_deref()
                .map(dynconf::common::parse_duration)
                .transpose()?;
            ops::wait_for_restart(&ctx, &nodes, max_wait).await?;
            println!("All {} node(s) are online", nodes.len());
        }
    }

    Ok(())
}
