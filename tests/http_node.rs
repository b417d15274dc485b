//! Node daemons over real HTTP, driven by the HTTP client

use dynconf::common::{CoordinatorConfig, LogicalServerState, NodeConfig, SyncPolicy};
use dynconf::coordinator::{CallError, LogicalStateProbe, NodeAddress, NodeClient, RestartWaiter};
use dynconf::model::{Change, Cluster, Node, SettingOp, SettingTarget, Stripe};
use dynconf::node::{
    build_router, start_node, startup_router, HttpNodeClient, StartupOptions, STARTUP_STRATEGIES,
};
use dynconf::ops::{self, Context};
use dynconf::protocol::{MutationContext, PrepareMessage, RejectionReason};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpListener;
use uuid::Uuid;

/// Start a node on an ephemeral port
async fn spawn_node(dir: &TempDir, name: &str, state: LogicalServerState) -> NodeAddress {
    let options = StartupOptions {
        config: NodeConfig {
            name: name.into(),
            repository_dir: dir.path().join(name),
            sync_policy: SyncPolicy::Never,
            ..Default::default()
        },
        topology_file: None,
        auto_activate: false,
    };
    let runtime = start_node(STARTUP_STRATEGIES, &options).unwrap();
    let (router, registrations) = build_router(&runtime, state).unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = NodeAddress::new(listener.local_addr().unwrap().to_string());
    tokio::spawn(async move {
        let _registrations = registrations;
        axum::serve(listener, router).await.unwrap();
    });
    address
}

fn context() -> Context {
    let config = CoordinatorConfig {
        host: "ops-host".into(),
        user: "ops".into(),
        call_timeout: "2s".into(),
        discovery_timeout: "2s".into(),
        restart_wait: "2s".into(),
        restart_poll: "50ms".into(),
    };
    Context::http(&config).unwrap()
}

fn cluster_for(addresses: &[NodeAddress]) -> Cluster {
    let nodes = addresses
        .iter()
        .enumerate()
        .map(|(i, a)| {
            let (host, port) = a.as_str().rsplit_once(':').unwrap();
            Node::new(format!("node-{}", i + 1), host, port.parse().unwrap())
        })
        .collect();
    Cluster::new("prod", vec![Stripe::new("stripe-1", nodes)])
}

#[tokio::test]
async fn test_activate_and_change_over_http() {
    let dir = TempDir::new().unwrap();
    let a = spawn_node(&dir, "node-1", LogicalServerState::Active).await;
    let b = spawn_node(&dir, "node-2", LogicalServerState::Passive).await;
    let addresses = vec![a.clone(), b.clone()];
    let ctx = context();

    assert!(!ops::are_all_nodes_activated(&ctx, &addresses).await.unwrap());

    let nodes = ops::logical_states(&ctx, &addresses).await;
    assert_eq!(nodes[0].1, LogicalServerState::Active);
    assert_eq!(nodes[1].1, LogicalServerState::Passive);

    let outcome = ops::run_change(
        &ctx,
        &nodes,
        Change::ClusterActivation {
            cluster: cluster_for(&addresses),
        },
    )
    .await
    .unwrap();
    assert_eq!(outcome.version, 1);
    assert!(ops::are_all_nodes_activated(&ctx, &addresses).await.unwrap());

    // peers are found through the runtime topology of any node
    let peers = ops::find_runtime_peers_status(&ctx, &b).await.unwrap();
    assert_eq!(peers.len(), 2);

    let outcome = ops::run_change(
        &ctx,
        &peers,
        Change::SettingChange {
            op: SettingOp::Set,
            target: SettingTarget::Node(a.to_string()),
            name: "log-dir".into(),
            value: Some("/var/log/dynconf".into()),
        },
    )
    .await
    .unwrap();
    assert_eq!(outcome.version, 2);

    let runtime = ops::runtime_cluster(&ctx, &b).await.unwrap();
    assert_eq!(
        runtime
            .find_node(a.as_str())
            .and_then(|n| n.settings.get("log-dir"))
            .map(String::as_str),
        Some("/var/log/dynconf")
    );
    assert!(!ops::has_incomplete_change(&ctx, &a).await.unwrap());

    let report = ops::analyze(&ctx, &addresses).await;
    assert!(report.is_consistent());
}

#[tokio::test]
async fn test_rejection_survives_the_wire() {
    let dir = TempDir::new().unwrap();
    let a = spawn_node(&dir, "node-1", LogicalServerState::Passive).await;
    let client = HttpNodeClient::new(Duration::from_secs(2)).unwrap();

    let state = client.discover(&a).await.unwrap();
    let err = client
        .prepare(
            &a,
            &PrepareMessage {
                context: MutationContext {
                    expected_mutative_message_count: state.mutative_message_count,
                    host: "ops-host".into(),
                    user: "ops".into(),
                },
                change_uuid: Uuid::new_v4(),
                version_number: 7,
                change: Change::ClusterActivation {
                    cluster: cluster_for(&[a.clone()]),
                },
            },
        )
        .await
        .unwrap_err();
    match err {
        CallError::Rejected(rejection) => assert_eq!(
            rejection.reason,
            RejectionReason::StaleVersion {
                expected: 1,
                received: 7
            }
        ),
        other => panic!("unexpected error: {}", other),
    }
}

#[tokio::test]
async fn test_unreachable_node_over_http() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = NodeAddress::new(listener.local_addr().unwrap().to_string());
    drop(listener);

    let client = Arc::new(HttpNodeClient::new(Duration::from_millis(500)).unwrap());
    assert_eq!(
        client.logical_state(&address).await,
        LogicalServerState::Unreachable
    );
    assert!(matches!(
        client.discover(&address).await,
        Err(CallError::Unreachable(_))
    ));
}

#[tokio::test]
async fn test_wait_for_restart_over_http() {
    let dir = TempDir::new().unwrap();
    let a = spawn_node(&dir, "node-1", LogicalServerState::Passive).await;
    let ctx = context();

    ops::wait_for_restart(&ctx, &[a], Some(Duration::from_secs(1)))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_loading_node_reports_starting() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = NodeAddress::new(listener.local_addr().unwrap().to_string());
    tokio::spawn(async move {
        axum::serve(listener, startup_router("node-1")).await.unwrap();
    });

    let client = Arc::new(HttpNodeClient::new(Duration::from_millis(500)).unwrap());
    assert_eq!(
        client.logical_state(&address).await,
        LogicalServerState::Starting
    );

    let waiter = RestartWaiter::new(client, Duration::from_millis(20));
    let missing = waiter
        .wait_for(
            &[address.clone()],
            &[LogicalServerState::Active, LogicalServerState::Passive],
            Duration::from_millis(150),
        )
        .await;
    assert_eq!(missing, vec![address]);
}
