//! Repair of changes left half-way by an interrupted orchestration

use crate::common::{Error, Result};
use crate::coordinator::analyzer::ClusterState;
use crate::coordinator::client::NodeAddress;
use crate::coordinator::failures::{FailureReceiver, Phase};
use crate::coordinator::orchestrator::{bounded, Orchestrator};
use crate::protocol::{ChangeRequestState, ForceStateMessage, ServerMode};
use uuid::Uuid;

/// What a repair pass did
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryOutcome {
    /// Change that was repaired, `None` if nothing was in flight
    pub uuid: Option<Uuid>,
    pub target: ChangeRequestState,
    /// Nodes forced to `target`
    pub forced: Vec<NodeAddress>,
    /// Nodes that did not answer discovery
    pub skipped: Vec<NodeAddress>,
}

impl Orchestrator {
    /// Force every node still holding the in-flight change to `target`.
    ///
    /// `target` is the caller's decision; see
    /// `ClusterState::suggested_repair` for the usual choice. Forcing a
    /// rollback of a change some node already committed is refused, and so
    /// is committing a change some reachable node never prepared.
    pub async fn run_recovery(
        &self,
        nodes: &[NodeAddress],
        target: ChangeRequestState,
    ) -> Result<RecoveryOutcome> {
        if target == ChangeRequestState::Prepared {
            return Err(Error::InvalidConfig(
                "repair target must be COMMITTED or ROLLED_BACK".into(),
            ));
        }

        let report = self.check(nodes).await;
        let skipped: Vec<NodeAddress> = report.unreachable.iter().map(|(a, _)| a.clone()).collect();
        if !skipped.is_empty() {
            tracing::warn!(
                "Repairing without {} unreachable node(s): {:?}",
                skipped.len(),
                skipped
            );
        }

        let uuid = match &report.state {
            ClusterState::Consistent { .. } => {
                tracing::info!("Nothing to repair: {}", report.state);
                return Ok(RecoveryOutcome {
                    uuid: None,
                    target,
                    forced: Vec::new(),
                    skipped,
                });
            }
            ClusterState::Unrecoverable { reason } => {
                return Err(Error::Unrecoverable(reason.clone()));
            }
            ClusterState::Undetermined => {
                return Err(Error::NodesUnreachable(
                    "no node answered discovery".into(),
                ));
            }
            ClusterState::Lagging { .. } => {
                return Err(Error::Inconsistent(report.state.to_string()));
            }
            ClusterState::PartiallyCommitted { uuid } | ClusterState::PartiallyRolledBack { uuid }
                if target != Self::direction(&report.state) =>
            {
                return Err(Error::Inconsistent(format!(
                    "{}: cannot force change {} to {}",
                    report.state, uuid, target
                )));
            }
            ClusterState::PartiallyPrepared { uuid } if target == ChangeRequestState::Committed => {
                let missing: Vec<String> = report
                    .responses
                    .iter()
                    .filter(|(_, r)| r.latest_uuid() != Some(*uuid))
                    .map(|(a, _)| a.to_string())
                    .collect();
                if !missing.is_empty() {
                    return Err(Error::Inconsistent(format!(
                        "{}: cannot commit change {}, never prepared on {}",
                        report.state,
                        uuid,
                        missing.join(", ")
                    )));
                }
                *uuid
            }
            ClusterState::PartiallyCommitted { uuid }
            | ClusterState::PartiallyPrepared { uuid }
            | ClusterState::PartiallyRolledBack { uuid } => *uuid,
        };

        tracing::info!("Repairing change {} by forcing {}", uuid, target);

        let mut failures = FailureReceiver::new();
        let mut forced = Vec::new();
        for (address, response) in &report.responses {
            if response.mode != ServerMode::Prepared || response.latest_uuid() != Some(uuid) {
                continue;
            }
            let message = ForceStateMessage {
                context: self.context(response.mutative_message_count),
                change_uuid: uuid,
                target,
            };
            match bounded(
                self.settings.call_timeout,
                self.client.force_state(address, &message),
            )
            .await
            {
                Ok(()) => {
                    tracing::info!("Forced {} to {} on {}", uuid, target, address);
                    forced.push(address.clone());
                }
                Err(e) => failures.record(address, Phase::Force, e),
            }
        }
        failures.into_result()?;

        Ok(RecoveryOutcome {
            uuid: Some(uuid),
            target,
            forced,
            skipped,
        })
    }

    /// Only resolution compatible with nodes that already closed the change
    fn direction(state: &ClusterState) -> ChangeRequestState {
        match state {
            ClusterState::PartiallyRolledBack { .. } => ChangeRequestState::RolledBack,
            _ => ChangeRequestState::Committed,
        }
    }
}
