//! Node startup strategies
//!
//! Strategies are tried in `STARTUP_STRATEGIES` order and the first one
//! that applies starts the node.

use crate::common::{Error, NodeConfig, Result};
use crate::model::{Change, Cluster};
use crate::protocol::{
    ChangeProcessor, CommitMessage, MutationContext, NomadServer, PrepareMessage,
    TopologyProcessor,
};
use crate::store::{ChangeLogStore, ObjectStore};
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartupStrategy {
    /// A change log already exists in the repository directory
    ExistingRepository,
    /// A topology file names this node
    ConfigFile,
    /// Fresh node waiting for activation
    Unconfigured,
}

pub const STARTUP_STRATEGIES: &[StartupStrategy] = &[
    StartupStrategy::ExistingRepository,
    StartupStrategy::ConfigFile,
    StartupStrategy::Unconfigured,
];

#[derive(Debug, Clone)]
pub struct StartupOptions {
    pub config: NodeConfig,
    /// Topology document listing this node
    pub topology_file: Option<PathBuf>,
    /// Activate from the topology file without waiting for a coordinator
    pub auto_activate: bool,
}

/// A started node
pub struct NodeRuntime {
    pub server: Arc<NomadServer>,
    pub processor: Arc<TopologyProcessor>,
    pub strategy: StartupStrategy,
}

impl StartupStrategy {
    pub fn applies(&self, options: &StartupOptions) -> bool {
        match self {
            StartupStrategy::ExistingRepository => {
                ChangeLogStore::exists(&options.config.repository_dir)
            }
            StartupStrategy::ConfigFile => options.topology_file.is_some(),
            StartupStrategy::Unconfigured => true,
        }
    }

    pub fn start(&self, options: &StartupOptions) -> Result<NodeRuntime> {
        let config = &options.config;
        match self {
            StartupStrategy::ExistingRepository => {
                tracing::info!(
                    "Starting {} from repository {}",
                    config.name,
                    config.repository_dir.display()
                );
                self.open(config)
            }
            StartupStrategy::ConfigFile => {
                let path = options
                    .topology_file
                    .as_deref()
                    .ok_or_else(|| Error::InvalidConfig("no topology file".into()))?;
                tracing::info!("Starting {} from topology file {}", config.name, path.display());
                let cluster = Cluster::from_file(path)?;
                if !cluster.nodes().any(|n| n.name == config.name) {
                    return Err(Error::InvalidConfig(format!(
                        "node {} is not part of cluster {} in {}",
                        config.name,
                        cluster.name,
                        path.display()
                    )));
                }
                let runtime = self.open(config)?;
                if options.auto_activate {
                    activate_locally(&runtime.server, cluster)?;
                }
                Ok(runtime)
            }
            StartupStrategy::Unconfigured => {
                tracing::info!("Starting {} unconfigured", config.name);
                self.open(config)
            }
        }
    }

    fn open(&self, config: &NodeConfig) -> Result<NodeRuntime> {
        let store: Arc<dyn ObjectStore> = Arc::new(ChangeLogStore::open(
            &config.repository_dir,
            config.sync_policy,
        )?);
        let processor = Arc::new(TopologyProcessor::new(config.limits.clone()));
        let dyn_processor: Arc<dyn ChangeProcessor> = processor.clone();
        let server = Arc::new(NomadServer::new(&config.name, store, dyn_processor)?);
        Ok(NodeRuntime {
            server,
            processor,
            strategy: *self,
        })
    }
}

/// Start with the first applicable strategy
pub fn start_node(strategies: &[StartupStrategy], options: &StartupOptions) -> Result<NodeRuntime> {
    for strategy in strategies {
        if strategy.applies(options) {
            return strategy.start(options);
        }
        tracing::debug!("Startup strategy {:?} does not apply", strategy);
    }
    Err(Error::InvalidConfig("no startup strategy applies".into()))
}

/// Commit an activation on this node alone
fn activate_locally(server: &NomadServer, cluster: Cluster) -> Result<()> {
    let state = server.discover()?;
    if state.latest_change.is_some() {
        tracing::info!("{} is already activated", server.name());
        return Ok(());
    }

    let uuid = Uuid::new_v4();
    let context = |count| MutationContext {
        expected_mutative_message_count: count,
        host: crate::common::local_host(),
        user: crate::common::local_user(),
    };
    server
        .prepare(&PrepareMessage {
            context: context(state.mutative_message_count),
            change_uuid: uuid,
            version_number: state.current_version + 1,
            change: Change::ClusterActivation { cluster },
        })
        .map_err(|r| Error::InvalidChange(r.to_string()))?;
    server
        .commit(&CommitMessage {
            context: context(state.mutative_message_count + 1),
            change_uuid: uuid,
        })
        .map_err(|r| Error::InvalidChange(r.to_string()))?;
    tracing::info!("{} activated from its topology file", server.name());
    Ok(())
}
