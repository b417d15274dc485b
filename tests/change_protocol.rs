//! End-to-end change orchestration over in-process nodes

use dynconf::common::{Error, LogicalServerState};
use dynconf::coordinator::{
    ClusterState, Fault, LocalNodeClient, NodeAddress, Orchestrator, OrchestratorSettings, Phase,
};
use dynconf::model::{CapacityLimits, Change, Cluster, Node, SettingOp, SettingTarget, Stripe};
use dynconf::protocol::{
    ChangeRequestState, MutationContext, NomadServer, PrepareMessage, RejectionReason, ServerMode,
    TopologyProcessor,
};
use dynconf::store::MemoryStore;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

fn settings() -> OrchestratorSettings {
    OrchestratorSettings {
        host: "ops-host".into(),
        user: "ops".into(),
        call_timeout: Duration::from_millis(200),
        discovery_timeout: Duration::from_millis(200),
    }
}

fn cluster_of(hosts: &[&str]) -> Cluster {
    let nodes = hosts
        .iter()
        .map(|h| Node::new(*h, *h, 9410).with_offheap("main", 512))
        .collect();
    Cluster::new("prod", vec![Stripe::new("stripe-1", nodes)])
}

fn set(name: &str, value: &str) -> Change {
    Change::SettingChange {
        op: SettingOp::Set,
        target: SettingTarget::Cluster,
        name: name.into(),
        value: Some(value.into()),
    }
}

/// In-process nodes `host:9410`, each with its own limits
fn setup(
    nodes: &[(&str, LogicalServerState, CapacityLimits)],
) -> (Arc<LocalNodeClient>, Vec<(NodeAddress, LogicalServerState)>) {
    let client = Arc::new(LocalNodeClient::new());
    let mut addresses = Vec::new();
    for (host, state, limits) in nodes {
        let server = NomadServer::new(
            *host,
            Arc::new(MemoryStore::new()),
            Arc::new(TopologyProcessor::new(limits.clone())),
        )
        .unwrap();
        let address = NodeAddress::new(format!("{}:9410", host));
        client.add_node(address.clone(), Arc::new(server), *state);
        addresses.push((address, *state));
    }
    (client, addresses)
}

async fn activated(
    nodes: &[(&str, LogicalServerState, CapacityLimits)],
) -> (
    Arc<LocalNodeClient>,
    Orchestrator,
    Vec<(NodeAddress, LogicalServerState)>,
) {
    let (client, addresses) = setup(nodes);
    let orchestrator = Orchestrator::new(client.clone(), settings());
    let hosts: Vec<&str> = nodes.iter().map(|(h, _, _)| *h).collect();
    orchestrator
        .run_change(
            &addresses,
            Change::ClusterActivation {
                cluster: cluster_of(&hosts),
            },
        )
        .await
        .unwrap();
    (client, orchestrator, addresses)
}

fn server(client: &LocalNodeClient, address: &NodeAddress) -> Arc<NomadServer> {
    client.server(address).unwrap()
}

#[tokio::test]
async fn test_change_commits_everywhere() {
    let (client, orchestrator, nodes) = activated(&[
        ("a", LogicalServerState::Active, CapacityLimits::default()),
        ("b", LogicalServerState::Passive, CapacityLimits::default()),
    ])
    .await;

    let outcome = orchestrator
        .run_change(&nodes, set("lease", "20s"))
        .await
        .unwrap();
    assert_eq!(outcome.version, 2);

    for (address, _) in &nodes {
        let node = server(&client, address);
        let state = node.discover().unwrap();
        assert_eq!(state.mode, ServerMode::Accepting);
        assert_eq!(state.current_version, 2);
        assert_eq!(state.highest_version, 2);
        let latest = state.latest_change.unwrap();
        assert_eq!(latest.uuid, outcome.uuid);
        assert_eq!(latest.state, ChangeRequestState::Committed);
        assert_eq!(latest.creation_host, "ops-host");
        assert_eq!(state.last_mutation_user.as_deref(), Some("ops"));

        let runtime = node.runtime_topology().unwrap().unwrap();
        assert_eq!(runtime.settings.get("lease").map(String::as_str), Some("20s"));
    }

    let report = orchestrator
        .check(&nodes.iter().map(|(a, _)| a.clone()).collect::<Vec<_>>())
        .await;
    assert_eq!(
        report.state,
        ClusterState::Consistent {
            version: 2,
            uuid: Some(outcome.uuid)
        }
    );
}

#[tokio::test]
async fn test_passives_prepared_and_committed_before_active() {
    let (client, orchestrator, nodes) = activated(&[
        ("a", LogicalServerState::Active, CapacityLimits::default()),
        ("b", LogicalServerState::Passive, CapacityLimits::default()),
        ("c", LogicalServerState::Passive, CapacityLimits::default()),
    ])
    .await;

    let expected: Vec<NodeAddress> = ["b:9410", "c:9410", "a:9410"]
        .iter()
        .map(|a| NodeAddress::new(*a))
        .collect();
    // activation already went through once
    let prepares = client.calls_for(Phase::Prepare);
    assert_eq!(prepares, expected);

    orchestrator
        .run_change(&nodes, set("lease", "5s"))
        .await
        .unwrap();
    assert_eq!(client.calls_for(Phase::Prepare)[3..], expected[..]);
    assert_eq!(client.calls_for(Phase::Commit)[3..], expected[..]);
}

#[tokio::test]
async fn test_rejected_prepare_rolls_back_prepared_nodes() {
    let tight = CapacityLimits {
        max_offheap_mb: Some(1500),
    };
    let (client, orchestrator, nodes) = activated(&[
        ("a", LogicalServerState::Passive, CapacityLimits::default()),
        ("b", LogicalServerState::Active, tight),
    ])
    .await;

    let change = Change::NodeAddition {
        stripe: "stripe-1".into(),
        node: Node::new("c", "c", 9410).with_offheap("main", 1024),
    };
    let err = orchestrator.run_change(&nodes, change).await.unwrap_err();
    match err {
        Error::PrepareFailed { node, reason } => {
            assert_eq!(node, "b:9410");
            assert!(reason.contains("validation failed"), "{}", reason);
        }
        other => panic!("unexpected error: {}", other),
    }

    assert_eq!(client.calls_for(Phase::Rollback), vec![NodeAddress::new("a:9410")]);

    let a = server(&client, &NodeAddress::new("a:9410")).discover().unwrap();
    assert_eq!(a.mode, ServerMode::Accepting);
    assert_eq!(a.current_version, 1);
    assert_eq!(a.latest_state(), Some(ChangeRequestState::RolledBack));

    let b = server(&client, &NodeAddress::new("b:9410")).discover().unwrap();
    assert_eq!(b.mode, ServerMode::Accepting);
    assert_eq!(b.current_version, 1);
    assert_eq!(b.latest_state(), Some(ChangeRequestState::Committed));

    // the rolled-back tail does not block the next change
    let outcome = orchestrator.run_change(&nodes, set("k", "v")).await.unwrap();
    assert_eq!(outcome.version, 2);
}

#[tokio::test]
async fn test_unreachable_node_aborts_before_prepare() {
    let (client, orchestrator, nodes) = activated(&[
        ("a", LogicalServerState::Active, CapacityLimits::default()),
        ("b", LogicalServerState::Passive, CapacityLimits::default()),
    ])
    .await;
    let prepares = client.calls_for(Phase::Prepare).len();

    client.inject(&NodeAddress::new("b:9410"), Phase::Discover, Fault::Unreachable);
    let err = orchestrator.run_change(&nodes, set("k", "v")).await.unwrap_err();
    assert!(matches!(err, Error::NodesUnreachable(_)), "{}", err);
    assert_eq!(client.calls_for(Phase::Prepare).len(), prepares);

    client.clear_faults();
    let state = server(&client, &NodeAddress::new("a:9410")).discover().unwrap();
    assert_eq!(state.current_version, 1);
}

#[tokio::test]
async fn test_prepared_node_blocks_new_change() {
    let (client, orchestrator, nodes) = activated(&[
        ("a", LogicalServerState::Active, CapacityLimits::default()),
        ("b", LogicalServerState::Passive, CapacityLimits::default()),
    ])
    .await;

    let b = server(&client, &NodeAddress::new("b:9410"));
    let state = b.discover().unwrap();
    b.prepare(&PrepareMessage {
        context: MutationContext {
            expected_mutative_message_count: state.mutative_message_count,
            host: "other-host".into(),
            user: "other".into(),
        },
        change_uuid: Uuid::new_v4(),
        version_number: 2,
        change: set("k", "1"),
    })
    .unwrap();

    let err = orchestrator.run_change(&nodes, set("k", "2")).await.unwrap_err();
    assert!(matches!(err, Error::ChangeInProgress(_)), "{}", err);
}

#[tokio::test]
async fn test_mutative_count_fences_stale_coordinators() {
    let (client, orchestrator, nodes) = activated(&[
        ("a", LogicalServerState::Active, CapacityLimits::default()),
    ])
    .await;
    let a = server(&client, &NodeAddress::new("a:9410"));

    let before = a.discover().unwrap().mutative_message_count;
    orchestrator.run_change(&nodes, set("k", "1")).await.unwrap();
    let after = a.discover().unwrap().mutative_message_count;
    // one prepare, one commit
    assert_eq!(after, before + 2);

    let rejection = a
        .prepare(&PrepareMessage {
            context: MutationContext {
                expected_mutative_message_count: before,
                host: "stale".into(),
                user: "stale".into(),
            },
            change_uuid: Uuid::new_v4(),
            version_number: 3,
            change: set("k", "2"),
        })
        .unwrap_err();
    assert_eq!(
        rejection.reason,
        RejectionReason::Dead {
            expected: before,
            actual: after
        }
    );
    assert_eq!(a.discover().unwrap().mutative_message_count, after);
}

#[tokio::test]
async fn test_prepare_timeout_rolls_back_earlier_nodes() {
    let (client, orchestrator, nodes) = activated(&[
        ("a", LogicalServerState::Active, CapacityLimits::default()),
        ("b", LogicalServerState::Passive, CapacityLimits::default()),
        ("c", LogicalServerState::Passive, CapacityLimits::default()),
    ])
    .await;
    let commits = client.calls_for(Phase::Commit).len();

    // the active node is prepared last
    let a = NodeAddress::new("a:9410");
    client.inject(&a, Phase::Prepare, Fault::Delay(Duration::from_millis(500)));

    let err = orchestrator.run_change(&nodes, set("k", "v")).await.unwrap_err();
    match err {
        Error::PrepareFailed { node, .. } => assert_eq!(node, "a:9410"),
        other => panic!("unexpected error: {}", other),
    }
    assert_eq!(
        client.calls_for(Phase::Rollback),
        vec![NodeAddress::new("b:9410"), NodeAddress::new("c:9410")]
    );
    assert_eq!(client.calls_for(Phase::Commit).len(), commits);

    client.clear_faults();
    for (address, _) in &nodes {
        let state = server(&client, address).discover().unwrap();
        assert_eq!(state.mode, ServerMode::Accepting, "{}", address);
        assert_eq!(state.current_version, 1, "{}", address);
        assert_ne!(state.latest_state(), Some(ChangeRequestState::Prepared));
        let runtime = server(&client, address).runtime_topology().unwrap().unwrap();
        assert!(runtime.settings.get("k").is_none());
    }
}
