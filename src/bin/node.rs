use anyhow::Result;
use clap::Parser;
use dynconf::common::{Config, NodeRole, SyncPolicy};
use dynconf::node::{NodeDaemon, StartupOptions};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "dynconf-node")]
#[command(about = "dynconf node daemon - serves the change protocol for one cluster node")]
#[command(version)]
struct Args {
    /// Configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Node name, overrides the configuration
    #[arg(short, long)]
    name: Option<String>,

    /// HTTP address to listen on
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// Repository directory holding the change log
    #[arg(short, long)]
    repository: Option<PathBuf>,

    /// Logical role announced to coordinators
    #[arg(long, value_parser = parse_role)]
    role: Option<NodeRole>,

    /// Topology file naming this node
    #[arg(short, long)]
    topology: Option<PathBuf>,

    /// Activate from the topology file without a coordinator
    #[arg(long, requires = "topology")]
    auto_activate: bool,

    /// Skip fsync on the change log
    #[arg(long)]
    no_sync: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,
}

fn parse_role(s: &str) -> std::result::Result<NodeRole, String> {
    match s.to_ascii_lowercase().as_str() {
        "active" => Ok(NodeRole::Active),
        "passive" => Ok(NodeRole::Passive),
        other => Err(format!("unknown role: {}", other)),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut config = Config::load(args.config.as_deref())?;

    let log_level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.log_level().to_string());
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Some(name) = args.name {
        config.node.name = name;
    }
    if let Some(bind) = args.bind {
        config.node.bind_addr = bind;
    }
    if let Some(repository) = args.repository {
        config.node.repository_dir = repository;
    }
    if let Some(role) = args.role {
        config.node.role = role;
    }
    if args.no_sync {
        config.node.sync_policy = SyncPolicy::Never;
    }
    config.node.validate()?;

    let daemon = NodeDaemon::new(StartupOptions {
        config: config.node,
        topology_file: args.topology,
        auto_activate: args.auto_activate,
    });
    daemon.serve().await?;

    Ok(())
}
