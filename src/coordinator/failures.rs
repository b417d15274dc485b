//! Per-node failure collection across orchestration passes

use crate::common::Error;
use crate::coordinator::client::{CallError, NodeAddress};
use uuid::Uuid;

/// Protocol step a failure happened in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Discover,
    Prepare,
    Commit,
    Rollback,
    Force,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Phase::Discover => "discover",
            Phase::Prepare => "prepare",
            Phase::Commit => "commit",
            Phase::Rollback => "rollback",
            Phase::Force => "force",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct NodeFailure {
    pub address: NodeAddress,
    pub phase: Phase,
    pub error: CallError,
}

impl std::fmt::Display for NodeFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}): {}", self.address, self.phase, self.error)
    }
}

/// One line per failure, joined with "; "
pub fn describe(failures: &[NodeFailure]) -> String {
    failures
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Collects failures instead of stopping at the first one
#[derive(Debug, Default)]
pub struct FailureReceiver {
    failures: Vec<NodeFailure>,
}

impl FailureReceiver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, address: &NodeAddress, phase: Phase, error: CallError) {
        tracing::warn!("{} failed on {}: {}", phase, address, error);
        self.failures.push(NodeFailure {
            address: address.clone(),
            phase,
            error,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn failures(&self) -> &[NodeFailure] {
        &self.failures
    }

    /// Addresses that failed, in recording order
    pub fn failed_nodes(&self) -> Vec<NodeAddress> {
        let mut nodes: Vec<NodeAddress> = Vec::new();
        for failure in &self.failures {
            if !nodes.contains(&failure.address) {
                nodes.push(failure.address.clone());
            }
        }
        nodes
    }

    /// `Error::Aggregate` if anything was recorded
    pub fn into_result(self) -> crate::Result<()> {
        if self.failures.is_empty() {
            Ok(())
        } else {
            Err(Error::Aggregate(self.failures))
        }
    }

    /// `Error::PartialCommit` if anything was recorded during a commit pass
    pub fn into_commit_result(self, uuid: Uuid) -> crate::Result<()> {
        if self.failures.is_empty() {
            Ok(())
        } else {
            Err(Error::PartialCommit {
                uuid,
                failures: self.failures,
            })
        }
    }
}
