//! Coordinator-side view of a node's protocol surface
//!
//! `NodeClient` is the seam between orchestration and transport:
//! `HttpNodeClient` talks to real daemons, `LocalNodeClient` drives
//! in-process `NomadServer`s with scripted faults.

use crate::common::LogicalServerState;
use crate::coordinator::failures::Phase;
use crate::protocol::{
    CommitMessage, DiscoverResponse, ForceStateMessage, NomadServer, PrepareMessage, Rejection,
    RollbackMessage, TopologyView,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// `host:port` of a node's protocol endpoint
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeAddress(String);

impl NodeAddress {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for NodeAddress {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| crate::Error::InvalidConfig(format!("expected host:port, got {}", s)))?;
        if host.is_empty() || port.parse::<u16>().is_err() {
            return Err(crate::Error::InvalidConfig(format!(
                "invalid node address: {}",
                s
            )));
        }
        Ok(Self(s.to_string()))
    }
}

impl From<&str> for NodeAddress {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Why a remote call did not produce an answer
#[derive(Debug, Clone, thiserror::Error)]
pub enum CallError {
    #[error("rejected: {0}")]
    Rejected(Rejection),
    #[error("unreachable: {0}")]
    Unreachable(String),
    #[error("timed out")]
    Timeout,
}

pub type CallResult<T> = std::result::Result<T, CallError>;

/// Protocol calls addressed to a node
#[async_trait]
pub trait NodeClient: Send + Sync {
    async fn discover(&self, node: &NodeAddress) -> CallResult<DiscoverResponse>;

    async fn prepare(&self, node: &NodeAddress, message: &PrepareMessage) -> CallResult<()>;

    async fn commit(&self, node: &NodeAddress, message: &CommitMessage) -> CallResult<()>;

    async fn rollback(&self, node: &NodeAddress, message: &RollbackMessage) -> CallResult<()>;

    async fn force_state(&self, node: &NodeAddress, message: &ForceStateMessage)
        -> CallResult<()>;

    async fn topology(&self, node: &NodeAddress) -> CallResult<TopologyView>;
}

/// Source of node-reported logical state
#[async_trait]
pub trait LogicalStateProbe: Send + Sync {
    async fn logical_state(&self, node: &NodeAddress) -> LogicalServerState;
}

/// Scripted misbehaviour of an in-process node
#[derive(Debug, Clone)]
pub enum Fault {
    Unreachable,
    /// Sleep before answering
    Delay(Duration),
}

/// In-process client over `NomadServer`s, with fault injection and call
/// capture
#[derive(Default)]
pub struct LocalNodeClient {
    nodes: Mutex<HashMap<NodeAddress, Arc<NomadServer>>>,
    states: Mutex<HashMap<NodeAddress, LogicalServerState>>,
    faults: Mutex<HashMap<(NodeAddress, Phase), Fault>>,
    calls: Mutex<Vec<(NodeAddress, Phase)>>,
}

impl LocalNodeClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&self, address: NodeAddress, server: Arc<NomadServer>, state: LogicalServerState) {
        if let Ok(mut nodes) = self.nodes.lock() {
            nodes.insert(address.clone(), server);
        }
        self.set_state(&address, state);
    }

    pub fn server(&self, address: &NodeAddress) -> Option<Arc<NomadServer>> {
        self.nodes.lock().ok()?.get(address).cloned()
    }

    pub fn set_state(&self, address: &NodeAddress, state: LogicalServerState) {
        if let Ok(mut states) = self.states.lock() {
            states.insert(address.clone(), state);
        }
    }

    pub fn inject(&self, address: &NodeAddress, phase: Phase, fault: Fault) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.insert((address.clone(), phase), fault);
        }
    }

    pub fn clear_faults(&self) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.clear();
        }
    }

    /// Every call made so far, in order
    pub fn calls(&self) -> Vec<(NodeAddress, Phase)> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Nodes that received `phase`, in call order
    pub fn calls_for(&self, phase: Phase) -> Vec<NodeAddress> {
        self.calls()
            .into_iter()
            .filter(|(_, p)| *p == phase)
            .map(|(a, _)| a)
            .collect()
    }

    async fn enter(&self, node: &NodeAddress, phase: Phase) -> CallResult<Arc<NomadServer>> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push((node.clone(), phase));
        }

        let fault = self
            .faults
            .lock()
            .ok()
            .and_then(|f| f.get(&(node.clone(), phase)).cloned());
        match fault {
            Some(Fault::Unreachable) => {
                return Err(CallError::Unreachable(format!("{} is down", node)));
            }
            Some(Fault::Delay(delay)) => tokio::time::sleep(delay).await,
            None => {}
        }

        self.server(node)
            .ok_or_else(|| CallError::Unreachable(format!("unknown node {}", node)))
    }
}

#[async_trait]
impl NodeClient for LocalNodeClient {
    async fn discover(&self, node: &NodeAddress) -> CallResult<DiscoverResponse> {
        let server = self.enter(node, Phase::Discover).await?;
        server
            .discover()
            .map_err(|e| CallError::Unreachable(e.to_string()))
    }

    async fn prepare(&self, node: &NodeAddress, message: &PrepareMessage) -> CallResult<()> {
        let server = self.enter(node, Phase::Prepare).await?;
        server.prepare(message).map_err(CallError::Rejected)
    }

    async fn commit(&self, node: &NodeAddress, message: &CommitMessage) -> CallResult<()> {
        let server = self.enter(node, Phase::Commit).await?;
        server.commit(message).map_err(CallError::Rejected)
    }

    async fn rollback(&self, node: &NodeAddress, message: &RollbackMessage) -> CallResult<()> {
        let server = self.enter(node, Phase::Rollback).await?;
        server.rollback(message).map_err(CallError::Rejected)
    }

    async fn force_state(
        &self,
        node: &NodeAddress,
        message: &ForceStateMessage,
    ) -> CallResult<()> {
        let server = self.enter(node, Phase::Force).await?;
        server.force_state(message).map_err(CallError::Rejected)
    }

    async fn topology(&self, node: &NodeAddress) -> CallResult<TopologyView> {
        let server = self
            .server(node)
            .ok_or_else(|| CallError::Unreachable(format!("unknown node {}", node)))?;
        server
            .topology_view()
            .map_err(|e| CallError::Unreachable(e.to_string()))
    }
}

#[async_trait]
impl LogicalStateProbe for LocalNodeClient {
    async fn logical_state(&self, node: &NodeAddress) -> LogicalServerState {
        self.states
            .lock()
            .ok()
            .and_then(|s| s.get(node).copied())
            .unwrap_or(LogicalServerState::Unknown)
    }
}
