//! Caller-facing operations over a set of remote nodes

use crate::common::{Error, LogicalServerState, Result};
use crate::coordinator::{ChangeOutcome, ConsistencyReport, NodeAddress, RecoveryOutcome};
use crate::model::{Change, Cluster};
use crate::ops::context::Context;
use crate::protocol::ChangeRequestState;
use futures_util::future::join_all;
use std::time::Duration;

/// Drop nodes that cannot take part in a change
pub fn filter_online(
    nodes: &[(NodeAddress, LogicalServerState)],
) -> Vec<(NodeAddress, LogicalServerState)> {
    nodes
        .iter()
        .filter(|(address, state)| {
            if !state.is_online() {
                tracing::warn!("Skipping {} ({})", address, state);
            }
            state.is_online()
        })
        .cloned()
        .collect()
}

pub async fn logical_states(
    ctx: &Context,
    nodes: &[NodeAddress],
) -> Vec<(NodeAddress, LogicalServerState)> {
    let probes = nodes.iter().map(|node| async move {
        let state = ctx.probe.logical_state(node).await;
        (node.clone(), state)
    });
    join_all(probes).await
}

/// Topology the node is running with
pub async fn runtime_cluster(ctx: &Context, node: &NodeAddress) -> Result<Cluster> {
    ctx.client
        .topology(node)
        .await
        .map_err(|e| Error::ConnectionFailed(format!("{}: {}", node, e)))?
        .runtime
        .ok_or_else(|| Error::NotFound(format!("{} is not activated", node)))
}

/// Result of the node's latest change, committed or not
pub async fn upcoming_cluster(ctx: &Context, node: &NodeAddress) -> Result<Cluster> {
    ctx.client
        .topology(node)
        .await
        .map_err(|e| Error::ConnectionFailed(format!("{}: {}", node, e)))?
        .upcoming
        .ok_or_else(|| Error::NotFound(format!("{} has no configuration", node)))
}

pub async fn is_activated(ctx: &Context, node: &NodeAddress) -> Result<bool> {
    let view = ctx
        .client
        .topology(node)
        .await
        .map_err(|e| Error::ConnectionFailed(format!("{}: {}", node, e)))?;
    Ok(view.is_activated())
}

/// All activated, none activated, or an error for a mix
pub async fn are_all_nodes_activated(ctx: &Context, nodes: &[NodeAddress]) -> Result<bool> {
    let mut activated = Vec::new();
    let mut unconfigured = Vec::new();
    for node in nodes {
        if is_activated(ctx, node).await? {
            activated.push(node.to_string());
        } else {
            unconfigured.push(node.to_string());
        }
    }
    if !activated.is_empty() && !unconfigured.is_empty() {
        return Err(Error::Inconsistent(format!(
            "activated: {}; not activated: {}",
            activated.join(", "),
            unconfigured.join(", ")
        )));
    }
    Ok(unconfigured.is_empty())
}

/// Does the node hold a change it has not closed yet?
pub async fn has_incomplete_change(ctx: &Context, node: &NodeAddress) -> Result<bool> {
    let state = ctx
        .client
        .discover(node)
        .await
        .map_err(|e| Error::ConnectionFailed(format!("{}: {}", node, e)))?;
    Ok(state.has_incomplete_change())
}

/// Every node of the cluster `node` runs in
pub async fn find_runtime_peers(ctx: &Context, node: &NodeAddress) -> Result<Vec<NodeAddress>> {
    let cluster = runtime_cluster(ctx, node).await?;
    Ok(cluster
        .node_addresses()
        .into_iter()
        .map(NodeAddress::new)
        .collect())
}

/// Peers of `node` with their logical state
pub async fn find_runtime_peers_status(
    ctx: &Context,
    node: &NodeAddress,
) -> Result<Vec<(NodeAddress, LogicalServerState)>> {
    let peers = find_runtime_peers(ctx, node).await?;
    Ok(logical_states(ctx, &peers).await)
}

pub async fn find_online_runtime_peers(
    ctx: &Context,
    node: &NodeAddress,
) -> Result<Vec<(NodeAddress, LogicalServerState)>> {
    Ok(filter_online(&find_runtime_peers_status(ctx, node).await?))
}

pub async fn analyze(ctx: &Context, nodes: &[NodeAddress]) -> ConsistencyReport {
    ctx.orchestrator.check(nodes).await
}

/// Run `change` on the online subset of `nodes`
pub async fn run_change(
    ctx: &Context,
    nodes: &[(NodeAddress, LogicalServerState)],
    change: Change,
) -> Result<ChangeOutcome> {
    let online = filter_online(nodes);
    ctx.orchestrator.run_change(&online, change).await
}

/// Repair the in-flight change; `forced` overrides the suggested direction
pub async fn run_repair(
    ctx: &Context,
    nodes: &[(NodeAddress, LogicalServerState)],
    forced: Option<ChangeRequestState>,
) -> Result<RecoveryOutcome> {
    let online: Vec<NodeAddress> = filter_online(nodes).into_iter().map(|(a, _)| a).collect();
    let target = match forced {
        Some(target) => target,
        None => {
            let report = analyze(ctx, &online).await;
            match (report.suggested_repair(), &report.state) {
                (Some(target), _) => target,
                (None, crate::coordinator::ClusterState::Consistent { .. }) => {
                    // nothing in flight; recovery reports it
                    ChangeRequestState::Committed
                }
                (None, state) => {
                    return Err(Error::Inconsistent(format!(
                        "{}: choose a repair direction explicitly",
                        state
                    )))
                }
            }
        }
    };
    ctx.orchestrator.run_recovery(&online, target).await
}

/// Wait until every node is online again
pub async fn wait_for_restart(
    ctx: &Context,
    nodes: &[NodeAddress],
    max_wait: Option<Duration>,
) -> Result<()> {
    ctx.restart_waiter()
        .wait_until(
            nodes,
            &[LogicalServerState::Active, LogicalServerState::Passive],
            max_wait.unwrap_or(ctx.restart_wait),
        )
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_online() {
        let nodes = vec![
            (NodeAddress::new("a:1"), LogicalServerState::Active),
            (NodeAddress::new("b:1"), LogicalServerState::Unreachable),
            (NodeAddress::new("c:1"), LogicalServerState::Passive),
            (NodeAddress::new("d:1"), LogicalServerState::Unknown),
        ];
        let online: Vec<String> = filter_online(&nodes)
            .into_iter()
            .map(|(a, _)| a.to_string())
            .collect();
        assert_eq!(online, vec!["a:1", "c:1"]);
    }
}
