//! Coordinator side of the change protocol
//!
//! The coordinator is responsible for:
//! - Discovery and consistency analysis across an explicit node list
//! - Change orchestration (prepare everywhere, then commit, passives first)
//! - Repair of changes interrupted half-way
//! - Waiting for restarted nodes

pub mod analyzer;
pub mod client;
pub mod failures;
pub mod orchestrator;
pub mod recovery;
pub mod restart;

pub use analyzer::{analyze, check_consistency, discover_all, ClusterState, ConsistencyReport};
pub use client::{
    CallError, CallResult, Fault, LocalNodeClient, LogicalStateProbe, NodeAddress, NodeClient,
};
pub use failures::{FailureReceiver, NodeFailure, Phase};
pub use orchestrator::{keep_passives_first, ChangeOutcome, Orchestrator, OrchestratorSettings};
pub use recovery::RecoveryOutcome;
pub use restart::RestartWaiter;
