//! Change orchestration: prepare everywhere, then commit everywhere
//!
//! Calls go out one node at a time, passives first and actives last.
//! The first prepare failure rolls back the nodes that already accepted
//! and stops. Commit failures do not stop the pass: every node is tried
//! and the failures come back together, leaving the rest to repair.

use crate::common::{CoordinatorConfig, Error, LogicalServerState, Result};
use crate::coordinator::analyzer::{check_consistency, ClusterState, ConsistencyReport};
use crate::coordinator::client::{CallError, CallResult, NodeAddress, NodeClient};
use crate::coordinator::failures::{FailureReceiver, Phase};
use crate::model::Change;
use crate::protocol::{
    CommitMessage, DiscoverResponse, MutationContext, PrepareMessage, RollbackMessage, ServerMode,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Timeouts and provenance used by orchestration passes
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub host: String,
    pub user: String,
    pub call_timeout: Duration,
    pub discovery_timeout: Duration,
}

impl OrchestratorSettings {
    pub fn from_config(config: &CoordinatorConfig) -> Result<Self> {
        Ok(Self {
            host: config.host.clone(),
            user: config.user.clone(),
            call_timeout: config.call_timeout()?,
            discovery_timeout: config.discovery_timeout()?,
        })
    }
}

/// A committed change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeOutcome {
    pub uuid: Uuid,
    pub version: u64,
    pub nodes: Vec<NodeAddress>,
}

/// Passives (and every non-active role) first, actives last. Relative
/// order inside each group is kept.
pub fn keep_passives_first(nodes: &[(NodeAddress, LogicalServerState)]) -> Vec<NodeAddress> {
    let (actives, others): (Vec<_>, Vec<_>) = nodes.iter().partition(|(_, s)| s.is_active());
    others
        .into_iter()
        .chain(actives)
        .map(|(a, _)| a.clone())
        .collect()
}

/// Bound a remote call by `timeout`
pub(crate) async fn bounded<T, F>(timeout: Duration, call: F) -> CallResult<T>
where
    F: Future<Output = CallResult<T>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(CallError::Timeout),
    }
}

/// Drives changes and repairs over a set of nodes
pub struct Orchestrator {
    pub(crate) client: Arc<dyn NodeClient>,
    pub(crate) settings: OrchestratorSettings,
}

impl Orchestrator {
    pub fn new(client: Arc<dyn NodeClient>, settings: OrchestratorSettings) -> Self {
        Self { client, settings }
    }

    pub fn client(&self) -> &Arc<dyn NodeClient> {
        &self.client
    }

    pub(crate) fn context(&self, expected_mutative_message_count: u64) -> MutationContext {
        MutationContext {
            expected_mutative_message_count,
            host: self.settings.host.clone(),
            user: self.settings.user.clone(),
        }
    }

    /// Discover and classify `nodes`
    pub async fn check(&self, nodes: &[NodeAddress]) -> ConsistencyReport {
        check_consistency(self.client.as_ref(), nodes, self.settings.discovery_timeout).await
    }

    /// Apply `change` to every node, or to none of them
    pub async fn run_change(
        &self,
        nodes: &[(NodeAddress, LogicalServerState)],
        change: Change,
    ) -> Result<ChangeOutcome> {
        let order = keep_passives_first(nodes);
        if order.is_empty() {
            return Err(Error::InvalidConfig("no node to change".into()));
        }

        let report = self.check(&order).await;
        let version = Self::ready_version(&report)?;
        let discovered: Vec<&DiscoverResponse> = order
            .iter()
            .map(|a| {
                report
                    .response(a)
                    .ok_or_else(|| Error::NodesUnreachable(a.to_string()))
            })
            .collect::<Result<_>>()?;

        let uuid = Uuid::new_v4();
        tracing::info!(
            "Running change {} (v{}) on {} node(s): {}",
            uuid,
            version,
            order.len(),
            change.summary()
        );

        // === Prepare ===
        let mut prepared: Vec<(&NodeAddress, u64)> = Vec::new();
        for (address, response) in order.iter().zip(&discovered) {
            let message = PrepareMessage {
                context: self.context(response.mutative_message_count),
                change_uuid: uuid,
                version_number: version,
                change: change.clone(),
            };
            match bounded(
                self.settings.call_timeout,
                self.client.prepare(address, &message),
            )
            .await
            {
                Ok(()) => {
                    tracing::debug!("{} prepared {}", address, uuid);
                    prepared.push((address, response.mutative_message_count + 1));
                }
                Err(e) => {
                    tracing::error!("Prepare of {} failed on {}: {}", uuid, address, e);
                    self.rollback_prepared(uuid, &prepared).await;
                    return Err(Error::PrepareFailed {
                        node: address.to_string(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        // === Commit ===
        let mut failures = FailureReceiver::new();
        for (address, count) in &prepared {
            let message = CommitMessage {
                context: self.context(*count),
                change_uuid: uuid,
            };
            match bounded(
                self.settings.call_timeout,
                self.client.commit(address, &message),
            )
            .await
            {
                Ok(()) => tracing::debug!("{} committed {}", address, uuid),
                Err(e) => failures.record(address, Phase::Commit, e),
            }
        }
        failures.into_commit_result(uuid)?;

        tracing::info!("Change {} committed on all nodes (v{})", uuid, version);
        Ok(ChangeOutcome {
            uuid,
            version,
            nodes: order,
        })
    }

    /// Version the next change gets, if the cluster can take one
    fn ready_version(report: &ConsistencyReport) -> Result<u64> {
        if !report.all_reachable() {
            let names: Vec<String> = report
                .unreachable
                .iter()
                .map(|(a, e)| format!("{} ({})", a, e))
                .collect();
            return Err(Error::NodesUnreachable(names.join(", ")));
        }

        let busy: Vec<String> = report
            .responses
            .iter()
            .filter(|(_, r)| r.mode != ServerMode::Accepting)
            .map(|(a, r)| match r.latest_uuid() {
                Some(uuid) => format!("{} ({})", a, uuid),
                None => a.to_string(),
            })
            .collect();
        if !busy.is_empty() {
            return Err(Error::ChangeInProgress(busy.join(", ")));
        }

        match &report.state {
            ClusterState::Consistent { version, .. } => Ok(version + 1),
            ClusterState::Unrecoverable { reason } => Err(Error::Unrecoverable(reason.clone())),
            other => Err(Error::Inconsistent(other.to_string())),
        }
    }

    /// Best effort: failures are logged, not returned
    async fn rollback_prepared(&self, uuid: Uuid, prepared: &[(&NodeAddress, u64)]) {
        for (address, count) in prepared {
            let message = RollbackMessage {
                context: self.context(*count),
                change_uuid: uuid,
            };
            match bounded(
                self.settings.call_timeout,
                self.client.rollback(address, &message),
            )
            .await
            {
                Ok(()) => tracing::info!("Rolled back {} on {}", uuid, address),
                Err(e) => tracing::warn!(
                    "Rollback of {} failed on {}, repair required: {}",
                    uuid,
                    address,
                    e
                ),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keep_passives_first() {
        let nodes = vec![
            (NodeAddress::new("a:1"), LogicalServerState::Active),
            (NodeAddress::new("b:1"), LogicalServerState::Passive),
            (NodeAddress::new("c:1"), LogicalServerState::Starting),
            (NodeAddress::new("d:1"), LogicalServerState::Passive),
        ];
        let order: Vec<String> = keep_passives_first(&nodes)
            .iter()
            .map(|a| a.to_string())
            .collect();
        assert_eq!(order, vec!["b:1", "c:1", "d:1", "a:1"]);
    }
}
