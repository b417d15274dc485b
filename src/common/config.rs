//! Configuration for dynconf components
//!
//! Loading order: built-in defaults, then an optional TOML file, then
//! `DYNCONF_*` environment variables (`DYNCONF_NODE__NAME=node-1`).
//! Binaries apply their CLI flags on top.

use crate::common::utils::{local_host, local_user, parse_duration};
use crate::model::validation::CapacityLimits;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Global configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Node daemon configuration
    pub node: NodeConfig,

    /// Coordinator (CLI side) configuration
    pub coordinator: CoordinatorConfig,

    /// Logging level
    pub log_level: Option<String>,
}

impl Config {
    /// Load configuration from an optional file plus the environment
    pub fn load(path: Option<&Path>) -> crate::Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        } else if let Ok(path) = std::env::var("DYNCONF_CONFIG") {
            builder = builder.add_source(config::File::with_name(&path).required(false));
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix("DYNCONF")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        let config: Config = settings.try_deserialize()?;
        config.node.validate()?;
        Ok(config)
    }

    pub fn log_level(&self) -> &str {
        self.log_level.as_deref().unwrap_or("info")
    }
}

/// Role a node announces to coordinators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    Active,
    Passive,
}

/// Change log durability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncPolicy {
    /// fsync after every committed change-set
    Always,
    /// Leave flushing to the OS (tests only)
    Never,
}

/// Node daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Node name (unique within the cluster)
    pub name: String,

    /// Bind address for the HTTP protocol surface
    pub bind_addr: SocketAddr,

    /// Directory holding the change log
    pub repository_dir: PathBuf,

    /// Role announced as logical server state
    pub role: NodeRole,

    /// Capacity limits checked when validating a change
    pub limits: CapacityLimits,

    /// Change log sync policy
    pub sync_policy: SyncPolicy,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: "node-1".to_string(),
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 9410)),
            repository_dir: PathBuf::from("./dynconf-repo"),
            role: NodeRole::Passive,
            limits: CapacityLimits::default(),
            sync_policy: SyncPolicy::Always,
        }
    }
}

impl NodeConfig {
    pub fn validate(&self) -> crate::Result<()> {
        if self.name.trim().is_empty() {
            return Err(crate::Error::InvalidConfig("node name cannot be empty".into()));
        }
        if self.bind_addr.port() == 0 {
            tracing::debug!("Node {} binds an ephemeral port", self.name);
        }
        Ok(())
    }
}

/// Coordinator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Host recorded as mutation provenance
    pub host: String,

    /// User recorded as mutation provenance
    pub user: String,

    /// Timeout for a single prepare/commit/rollback call
    pub call_timeout: String,

    /// Timeout for a single discover call
    pub discovery_timeout: String,

    /// Maximum time to wait for restarted nodes
    pub restart_wait: String,

    /// Poll interval while waiting for restarted nodes
    pub restart_poll: String,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            host: local_host(),
            user: local_user(),
            call_timeout: "30s".to_string(),
            discovery_timeout: "10s".to_string(),
            restart_wait: "2m".to_string(),
            restart_poll: "1s".to_string(),
        }
    }
}

impl CoordinatorConfig {
    pub fn call_timeout(&self) -> crate::Result<Duration> {
        parse_duration(&self.call_timeout)
    }

    pub fn discovery_timeout(&self) -> crate::Result<Duration> {
        parse_duration(&self.discovery_timeout)
    }

    pub fn restart_wait(&self) -> crate::Result<Duration> {
        parse_duration(&self.restart_wait)
    }

    pub fn restart_poll(&self) -> crate::Result<Duration> {
        parse_duration(&self.restart_poll)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.node.role, NodeRole::Passive);
        assert_eq!(config.node.sync_policy, SyncPolicy::Always);
        assert_eq!(
            config.coordinator.call_timeout().unwrap(),
            Duration::from_secs(30)
        );
        assert_eq!(config.log_level(), "info");
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dynconf.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            r#"
log_level = "debug"

[node]
name = "node-7"
bind_addr = "127.0.0.1:9999"
role = "active"

[node.limits]
max_offheap_mb = 4096

[coordinator]
call_timeout = "5s"
"#
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.node.name, "node-7");
        assert_eq!(config.node.role, NodeRole::Active);
        assert_eq!(config.node.limits.max_offheap_mb, Some(4096));
        assert_eq!(
            config.coordinator.call_timeout().unwrap(),
            Duration::from_secs(5)
        );
        assert_eq!(config.log_level(), "debug");
    }

    #[test]
    fn test_empty_name_rejected() {
        let node = NodeConfig {
            name: " ".into(),
            ..Default::default()
        };
        assert!(node.validate().is_err());
    }
}
