//! Operator-facing operations for cluster reconfiguration

pub mod context;
pub mod remote;

pub use context::Context;
pub use remote::{
    analyze, are_all_nodes_activated, filter_online, find_online_runtime_peers,
    find_runtime_peers, find_runtime_peers_status, has_incomplete_change, is_activated,
    logical_states, run_change, run_repair, runtime_cluster, upcoming_cluster, wait_for_restart,
};
