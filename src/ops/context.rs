//! Command context shared by every operator command

use crate::common::{CoordinatorConfig, Result};
use crate::coordinator::{LogicalStateProbe, NodeClient, Orchestrator, OrchestratorSettings, RestartWaiter};
use crate::node::HttpNodeClient;
use std::sync::Arc;
use std::time::Duration;

/// Built once at process start and handed to every command handler
pub struct Context {
    pub orchestrator: Orchestrator,
    pub client: Arc<dyn NodeClient>,
    pub probe: Arc<dyn LogicalStateProbe>,
    pub restart_wait: Duration,
    pub restart_poll: Duration,
}

impl Context {
    pub fn new(
        client: Arc<dyn NodeClient>,
        probe: Arc<dyn LogicalStateProbe>,
        config: &CoordinatorConfig,
    ) -> Result<Self> {
        Ok(Self {
            orchestrator: Orchestrator::new(
                client.clone(),
                OrchestratorSettings::from_config(config)?,
            ),
            client,
            probe,
            restart_wait: config.restart_wait()?,
            restart_poll: config.restart_poll()?,
        })
    }

    /// Context over HTTP to real node daemons
    pub fn http(config: &CoordinatorConfig) -> Result<Self> {
        let client = Arc::new(HttpNodeClient::new(config.call_timeout()?)?);
        Self::new(client.clone(), client, config)
    }

    pub fn restart_waiter(&self) -> RestartWaiter {
        RestartWaiter::new(self.probe.clone(), self.restart_poll)
    }
}
