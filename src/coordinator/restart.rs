//! Waiting for restarted nodes to come back in an expected logical state

use crate::common::{Error, LogicalServerState, Result};
use crate::coordinator::client::{LogicalStateProbe, NodeAddress};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

pub struct RestartWaiter {
    probe: Arc<dyn LogicalStateProbe>,
    poll_interval: Duration,
}

impl RestartWaiter {
    pub fn new(probe: Arc<dyn LogicalStateProbe>, poll_interval: Duration) -> Self {
        Self {
            probe,
            poll_interval,
        }
    }

    /// Poll until every node reports one of `targets` or `max_wait`
    /// elapses. Returns the nodes still missing, empty on success.
    pub async fn wait_for(
        &self,
        nodes: &[NodeAddress],
        targets: &[LogicalServerState],
        max_wait: Duration,
    ) -> Vec<NodeAddress> {
        let deadline = Instant::now() + max_wait;
        let mut missing: BTreeSet<NodeAddress> = nodes.iter().cloned().collect();

        loop {
            let mut reached = Vec::new();
            for node in &missing {
                let state = self.probe.logical_state(node).await;
                if targets.contains(&state) {
                    tracing::info!("{} is {}", node, state);
                    reached.push(node.clone());
                }
            }
            for node in reached {
                missing.remove(&node);
            }

            if missing.is_empty() || Instant::now() >= deadline {
                break;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            tokio::time::sleep(self.poll_interval.min(remaining)).await;
        }

        missing.into_iter().collect()
    }

    /// Like `wait_for`, with the missing nodes as `Error::RestartTimeout`
    pub async fn wait_until(
        &self,
        nodes: &[NodeAddress],
        targets: &[LogicalServerState],
        max_wait: Duration,
    ) -> Result<()> {
        let missing = self.wait_for(nodes, targets, max_wait).await;
        if missing.is_empty() {
            return Ok(());
        }
        let target = targets
            .iter()
            .map(|s| s.to_string())
            .collect::<Vec<_>>()
            .join("|");
        Err(Error::RestartTimeout {
            target,
            waited_secs: max_wait.as_secs(),
            missing: missing.iter().map(|a| a.to_string()).collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::client::LocalNodeClient;

    #[tokio::test]
    async fn test_reports_missing_nodes() {
        let client = Arc::new(LocalNodeClient::new());
        let a = NodeAddress::new("a:9410");
        let b = NodeAddress::new("b:9410");
        client.set_state(&a, LogicalServerState::Passive);
        client.set_state(&b, LogicalServerState::Starting);

        let waiter = RestartWaiter::new(client.clone(), Duration::from_millis(5));
        let online = [LogicalServerState::Active, LogicalServerState::Passive];
        let missing = waiter
            .wait_for(&[a.clone(), b.clone()], &online, Duration::from_millis(30))
            .await;
        assert_eq!(missing, vec![b.clone()]);

        client.set_state(&b, LogicalServerState::Active);
        waiter
            .wait_until(&[a, b], &online, Duration::from_millis(30))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_timeout_error_names_nodes() {
        let client = Arc::new(LocalNodeClient::new());
        let waiter = RestartWaiter::new(client, Duration::from_millis(5));
        let err = waiter
            .wait_until(
                &[NodeAddress::new("gone:1")],
                &[LogicalServerState::Active],
                Duration::from_millis(10),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RestartTimeout { ref missing, .. } if missing == &vec!["gone:1".to_string()]));
    }
}
