//! Protocol messages exchanged between a coordinator and a node

use crate::model::{Change, Cluster};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Node protocol mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerMode {
    /// Idle, ready to prepare a new change
    Accepting,
    /// One change in flight
    Prepared,
}

impl ServerMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerMode::Accepting => "ACCEPTING",
            ServerMode::Prepared => "PREPARED",
        }
    }
}

impl std::str::FromStr for ServerMode {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "ACCEPTING" => Ok(ServerMode::Accepting),
            "PREPARED" => Ok(ServerMode::Prepared),
            other => Err(crate::Error::Corrupted(format!("unknown mode {}", other))),
        }
    }
}

impl std::fmt::Display for ServerMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State of a persisted change request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeRequestState {
    Prepared,
    Committed,
    RolledBack,
}

impl ChangeRequestState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeRequestState::Prepared => "PREPARED",
            ChangeRequestState::Committed => "COMMITTED",
            ChangeRequestState::RolledBack => "ROLLED_BACK",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ChangeRequestState::Prepared)
    }
}

impl std::str::FromStr for ChangeRequestState {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "PREPARED" => Ok(ChangeRequestState::Prepared),
            "COMMITTED" | "COMMIT" => Ok(ChangeRequestState::Committed),
            "ROLLED_BACK" | "ROLLBACK" => Ok(ChangeRequestState::RolledBack),
            other => Err(crate::Error::InvalidConfig(format!(
                "unknown change state {}",
                other
            ))),
        }
    }
}

impl std::fmt::Display for ChangeRequestState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Full details of a change request as stored by a node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeDetails {
    pub uuid: Uuid,
    pub state: ChangeRequestState,
    pub version: u64,
    pub prev_change_uuid: Option<Uuid>,
    pub change: Change,
    pub result: Cluster,
    pub result_hash: String,
    pub creation_host: String,
    pub creation_user: String,
    pub creation_timestamp: DateTime<Utc>,
}

/// One link of a node's change history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineageEntry {
    pub uuid: Uuid,
    pub version: u64,
    pub state: ChangeRequestState,
    pub prev_change_uuid: Option<Uuid>,
}

/// Snapshot of a node's protocol state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoverResponse {
    pub mode: ServerMode,
    pub mutative_message_count: u64,
    pub last_mutation_host: Option<String>,
    pub last_mutation_user: Option<String>,
    pub last_mutation_timestamp: Option<DateTime<Utc>>,
    pub current_version: u64,
    pub highest_version: u64,
    pub latest_change: Option<ChangeDetails>,
    /// Change chain, newest first
    #[serde(default)]
    pub lineage: Vec<LineageEntry>,
}

impl DiscoverResponse {
    pub fn latest_uuid(&self) -> Option<Uuid> {
        self.latest_change.as_ref().map(|c| c.uuid)
    }

    pub fn latest_state(&self) -> Option<ChangeRequestState> {
        self.latest_change.as_ref().map(|c| c.state)
    }

    /// Most recent committed change
    pub fn committed_head(&self) -> Option<Uuid> {
        self.lineage
            .iter()
            .find(|e| e.state == ChangeRequestState::Committed)
            .map(|e| e.uuid)
    }

    /// Committed changes, newest first
    pub fn committed_chain(&self) -> impl Iterator<Item = Uuid> + '_ {
        self.lineage
            .iter()
            .filter(|e| e.state == ChangeRequestState::Committed)
            .map(|e| e.uuid)
    }

    pub fn has_committed(&self, uuid: Uuid) -> bool {
        self.committed_chain().any(|u| u == uuid)
    }

    pub fn has_incomplete_change(&self) -> bool {
        self.mode == ServerMode::Prepared
    }
}

/// Topologies known to a node
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TopologyView {
    /// Result of the latest prepared or committed change
    pub upcoming: Option<Cluster>,
    /// Topology in effect
    pub runtime: Option<Cluster>,
}

impl TopologyView {
    pub fn is_activated(&self) -> bool {
        self.runtime.is_some()
    }
}

/// Fence and provenance carried by every mutating message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationContext {
    pub expected_mutative_message_count: u64,
    pub host: String,
    pub user: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrepareMessage {
    pub context: MutationContext,
    pub change_uuid: Uuid,
    pub version_number: u64,
    pub change: Change,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitMessage {
    pub context: MutationContext,
    pub change_uuid: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackMessage {
    pub context: MutationContext,
    pub change_uuid: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForceStateMessage {
    pub context: MutationContext,
    pub change_uuid: Uuid,
    pub target: ChangeRequestState,
}

/// Why a node refused a mutating message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RejectionReason {
    /// Another change is already prepared
    ConcurrentChange { in_flight: Option<Uuid> },
    /// Caller's view of the version is out of date
    StaleVersion { expected: u64, received: u64 },
    /// The change does not produce a valid topology
    ValidationFailed,
    /// Another client mutated the node since the caller discovered it
    Dead { expected: u64, actual: u64 },
    /// Nothing is prepared
    NotPrepared,
    /// A different change is prepared
    UuidMismatch { prepared: Option<Uuid> },
    UnknownChange,
    /// Commit side effects failed, the node stays prepared
    ApplyFailed,
    /// Force target must be COMMITTED or ROLLED_BACK
    InvalidTarget,
    Storage,
}

impl std::fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectionReason::ConcurrentChange { .. } => write!(f, "concurrent change"),
            RejectionReason::StaleVersion { expected, received } => write!(
                f,
                "stale version (expected {}, received {})",
                expected, received
            ),
            RejectionReason::ValidationFailed => write!(f, "validation failed"),
            RejectionReason::Dead { expected, actual } => write!(
                f,
                "mutative message count is {} not {}",
                actual, expected
            ),
            RejectionReason::NotPrepared => write!(f, "no prepared change"),
            RejectionReason::UuidMismatch { .. } => write!(f, "change uuid mismatch"),
            RejectionReason::UnknownChange => write!(f, "unknown change"),
            RejectionReason::ApplyFailed => write!(f, "apply failed"),
            RejectionReason::InvalidTarget => write!(f, "invalid target state"),
            RejectionReason::Storage => write!(f, "storage failure"),
        }
    }
}

/// A typed refusal returned by a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    pub reason: RejectionReason,
    pub message: String,
    pub last_mutation_host: Option<String>,
    pub last_mutation_user: Option<String>,
}

impl Rejection {
    pub fn new(reason: RejectionReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
            last_mutation_host: None,
            last_mutation_user: None,
        }
    }

    /// Safe to retry after re-discovery?
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.reason,
            RejectionReason::StaleVersion { .. }
                | RejectionReason::Dead { .. }
                | RejectionReason::ConcurrentChange { .. }
        )
    }
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.reason, self.message)?;
        if let Some(host) = &self.last_mutation_host {
            write!(
                f,
                " (last mutation by {}@{})",
                self.last_mutation_user.as_deref().unwrap_or("?"),
                host
            )?;
        }
        Ok(())
    }
}

/// Result of a mutating message at a node
pub type AcceptRejectResponse = std::result::Result<(), Rejection>;

/// Wire form of `AcceptRejectResponse`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptRejectBody {
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejection: Option<Rejection>,
}

impl From<AcceptRejectResponse> for AcceptRejectBody {
    fn from(response: AcceptRejectResponse) -> Self {
        match response {
            Ok(()) => Self {
                accepted: true,
                rejection: None,
            },
            Err(rejection) => Self {
                accepted: false,
                rejection: Some(rejection),
            },
        }
    }
}

impl From<AcceptRejectBody> for AcceptRejectResponse {
    fn from(body: AcceptRejectBody) -> Self {
        match (body.accepted, body.rejection) {
            (true, _) => Ok(()),
            (false, Some(rejection)) => Err(rejection),
            (false, None) => Err(Rejection::new(
                RejectionReason::Storage,
                "rejected without a reason",
            )),
        }
    }
}
