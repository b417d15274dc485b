//! Cluster-wide discovery and consistency analysis
//!
//! Discovery fans out to every node at once; the analysis is a pure
//! function of the snapshots that came back. There is no quorum: every
//! reachable node has to agree, unreachable ones are listed on the side.

use crate::coordinator::client::{CallError, NodeAddress, NodeClient};
use crate::protocol::{ChangeRequestState, DiscoverResponse, ServerMode};
use futures_util::future::join_all;
use std::collections::BTreeSet;
use std::time::Duration;
use uuid::Uuid;

/// Classification of the reachable nodes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterState {
    /// Everyone idle on the same committed history
    Consistent { version: u64, uuid: Option<Uuid> },
    /// Some nodes committed `uuid`, others still hold it prepared
    PartiallyCommitted { uuid: Uuid },
    /// `uuid` is prepared somewhere and committed nowhere
    PartiallyPrepared { uuid: Uuid },
    /// Some nodes rolled `uuid` back, others still hold it prepared
    PartiallyRolledBack { uuid: Uuid },
    /// Shared history, but these nodes are behind the newest committed change
    Lagging { behind: Vec<NodeAddress> },
    /// Histories that cannot be reconciled automatically
    Unrecoverable { reason: String },
    /// No node answered
    Undetermined,
}

impl ClusterState {
    /// Force target that converges this state, if repair may be automatic
    pub fn suggested_repair(&self) -> Option<ChangeRequestState> {
        match self {
            ClusterState::PartiallyCommitted { .. } => Some(ChangeRequestState::Committed),
            ClusterState::PartiallyPrepared { .. } | ClusterState::PartiallyRolledBack { .. } => {
                Some(ChangeRequestState::RolledBack)
            }
            _ => None,
        }
    }

    /// Change stuck in the middle of the protocol, if any
    pub fn change_under_repair(&self) -> Option<Uuid> {
        match self {
            ClusterState::PartiallyCommitted { uuid }
            | ClusterState::PartiallyPrepared { uuid }
            | ClusterState::PartiallyRolledBack { uuid } => Some(*uuid),
            _ => None,
        }
    }
}

impl std::fmt::Display for ClusterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClusterState::Consistent { version, uuid } => match uuid {
                Some(uuid) => write!(f, "CONSISTENT (version {}, change {})", version, uuid),
                None => write!(f, "CONSISTENT (version {}, no change)", version),
            },
            ClusterState::PartiallyCommitted { uuid } => write!(f, "PARTIALLY_COMMITTED ({})", uuid),
            ClusterState::PartiallyPrepared { uuid } => write!(f, "PARTIALLY_PREPARED ({})", uuid),
            ClusterState::PartiallyRolledBack { uuid } => {
                write!(f, "PARTIALLY_ROLLED_BACK ({})", uuid)
            }
            ClusterState::Lagging { behind } => {
                let names: Vec<&str> = behind.iter().map(|a| a.as_str()).collect();
                write!(f, "LAGGING ({})", names.join(", "))
            }
            ClusterState::Unrecoverable { reason } => write!(f, "UNRECOVERABLE ({})", reason),
            ClusterState::Undetermined => write!(f, "UNDETERMINED"),
        }
    }
}

/// Analysis outcome plus the snapshots it was computed from
#[derive(Debug, Clone)]
pub struct ConsistencyReport {
    pub state: ClusterState,
    pub responses: Vec<(NodeAddress, DiscoverResponse)>,
    pub unreachable: Vec<(NodeAddress, CallError)>,
}

impl ConsistencyReport {
    pub fn is_consistent(&self) -> bool {
        matches!(self.state, ClusterState::Consistent { .. })
    }

    pub fn all_reachable(&self) -> bool {
        self.unreachable.is_empty()
    }

    pub fn suggested_repair(&self) -> Option<ChangeRequestState> {
        self.state.suggested_repair()
    }

    pub fn response(&self, address: &NodeAddress) -> Option<&DiscoverResponse> {
        self.responses
            .iter()
            .find(|(a, _)| a == address)
            .map(|(_, r)| r)
    }
}

/// Discover every node concurrently, each call bounded by `timeout`
pub async fn discover_all<C: NodeClient + ?Sized>(
    client: &C,
    nodes: &[NodeAddress],
    timeout: Duration,
) -> (
    Vec<(NodeAddress, DiscoverResponse)>,
    Vec<(NodeAddress, CallError)>,
) {
    let calls = nodes.iter().map(|node| async move {
        let outcome = match tokio::time::timeout(timeout, client.discover(node)).await {
            Ok(result) => result,
            Err(_) => Err(CallError::Timeout),
        };
        (node.clone(), outcome)
    });

    let mut responses = Vec::new();
    let mut unreachable = Vec::new();
    for (node, outcome) in join_all(calls).await {
        match outcome {
            Ok(response) => responses.push((node, response)),
            Err(e) => {
                tracing::warn!("Discovery of {} failed: {}", node, e);
                unreachable.push((node, e));
            }
        }
    }
    (responses, unreachable)
}

/// Discover and classify
pub async fn check_consistency<C: NodeClient + ?Sized>(
    client: &C,
    nodes: &[NodeAddress],
    timeout: Duration,
) -> ConsistencyReport {
    let (responses, unreachable) = discover_all(client, nodes, timeout).await;
    let state = analyze(&responses);
    tracing::info!(
        "Cluster state over {} reachable node(s): {}",
        responses.len(),
        state
    );
    ConsistencyReport {
        state,
        responses,
        unreachable,
    }
}

/// State recorded for `uuid` in a node's lineage
fn state_of(response: &DiscoverResponse, uuid: Uuid) -> Option<ChangeRequestState> {
    response
        .lineage
        .iter()
        .find(|e| e.uuid == uuid)
        .map(|e| e.state)
}

/// Classify a set of discovery snapshots
pub fn analyze(responses: &[(NodeAddress, DiscoverResponse)]) -> ClusterState {
    if responses.is_empty() {
        return ClusterState::Undetermined;
    }

    let prepared: BTreeSet<Uuid> = responses
        .iter()
        .filter(|(_, r)| r.mode == ServerMode::Prepared)
        .filter_map(|(_, r)| r.latest_uuid())
        .collect();

    match prepared.len() {
        0 => analyze_idle(responses),
        1 => match prepared.into_iter().next() {
            Some(uuid) => analyze_in_flight(responses, uuid),
            None => ClusterState::Undetermined,
        },
        _ => ClusterState::Unrecoverable {
            reason: format!("{} different changes are prepared", prepared.len()),
        },
    }
}

fn analyze_in_flight(responses: &[(NodeAddress, DiscoverResponse)], uuid: Uuid) -> ClusterState {
    let mut committed = 0;
    let mut rolled_back = 0;
    let mut heads = BTreeSet::new();

    for (_, response) in responses {
        match state_of(response, uuid) {
            Some(ChangeRequestState::Committed) => committed += 1,
            Some(ChangeRequestState::RolledBack) => rolled_back += 1,
            Some(ChangeRequestState::Prepared) => {
                heads.insert(response.committed_head());
            }
            // never received the change
            None => {
                heads.insert(response.committed_head());
            }
        }
    }

    if committed > 0 && rolled_back > 0 {
        return ClusterState::Unrecoverable {
            reason: format!("change {} is committed on some nodes and rolled back on others", uuid),
        };
    }
    if committed > 0 {
        return ClusterState::PartiallyCommitted { uuid };
    }
    if rolled_back > 0 {
        return ClusterState::PartiallyRolledBack { uuid };
    }
    if heads.len() > 1 {
        return ClusterState::Unrecoverable {
            reason: format!("change {} was prepared over different histories", uuid),
        };
    }
    ClusterState::PartiallyPrepared { uuid }
}

fn analyze_idle(responses: &[(NodeAddress, DiscoverResponse)]) -> ClusterState {
    // node with the newest committed change
    let Some((_, newest)) = responses.iter().max_by_key(|(_, r)| r.current_version) else {
        return ClusterState::Undetermined;
    };
    let newest_head = newest.committed_head();
    let newest_chain: BTreeSet<Uuid> = newest.committed_chain().collect();

    let mut behind = Vec::new();
    for (address, response) in responses {
        let head = response.committed_head();
        if head == newest_head && response.current_version == newest.current_version {
            continue;
        }
        let shares_history = match head {
            Some(uuid) => newest_chain.contains(&uuid),
            None => true,
        };
        if !shares_history || response.current_version >= newest.current_version {
            return ClusterState::Unrecoverable {
                reason: format!(
                    "{} committed history diverges from the newest node (version {})",
                    address, newest.current_version
                ),
            };
        }
        behind.push(address.clone());
    }

    if behind.is_empty() {
        ClusterState::Consistent {
            version: newest.current_version,
            uuid: newest_head,
        }
    } else {
        ClusterState::Lagging { behind }
    }
}
