//! Durable protocol state of a node
//!
//! Layout inside the object store:
//! - fixed keys for the node state (`mode`, `mutativeMessageCount`, ...)
//! - one object per change request, keyed by its uuid
//!
//! Every protocol operation builds one `StateChange` and commits it as a
//! single change-set.

use crate::common::{hash_json, Error, Result};
use crate::model::{Change, Cluster};
use crate::protocol::messages::{ChangeDetails, ChangeRequestState, LineageEntry, ServerMode};
use crate::store::{ChangeSet, ObjectStore, StoreObject};
use chrono::{DateTime, Utc};
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

const MODE: &str = "mode";
const MUTATIVE_MESSAGE_COUNT: &str = "mutativeMessageCount";
const CURRENT_VERSION: &str = "currentVersion";
const HIGHEST_VERSION: &str = "highestVersion";
const LATEST_CHANGE_UUID: &str = "latestChangeUuid";
const LAST_MUTATION_HOST: &str = "lastMutationHost";
const LAST_MUTATION_USER: &str = "lastMutationUser";
const LAST_MUTATION_TIMESTAMP: &str = "lastMutationTimestamp";
const LAST_REQUEST: &str = "lastRequest";

const CHANGE_STATE: &str = "state";
const CHANGE_VERSION: &str = "version";
const PREV_CHANGE_UUID: &str = "prevChangeUuid";
const CHANGE_OPERATION: &str = "operation";
const CHANGE_RESULT: &str = "result";
const CHANGE_RESULT_HASH: &str = "resultHash";
const CHANGE_CREATION_HOST: &str = "creationHost";
const CHANGE_CREATION_USER: &str = "creationUser";
const CHANGE_CREATION_TIMESTAMP: &str = "creationTimestamp";

/// Protocol request that produced the last mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerRequest {
    Prepare,
    Commit,
    Rollback,
    Force,
}

impl ServerRequest {
    fn as_str(&self) -> &'static str {
        match self {
            ServerRequest::Prepare => "PREPARE",
            ServerRequest::Commit => "COMMIT",
            ServerRequest::Rollback => "ROLLBACK",
            ServerRequest::Force => "FORCE",
        }
    }
}

/// Node-wide protocol state
#[derive(Debug, Clone, PartialEq)]
pub struct NodeProtocolState {
    pub mode: ServerMode,
    pub mutative_message_count: u64,
    pub current_version: u64,
    pub highest_version: u64,
    pub latest_change_uuid: Option<Uuid>,
    pub last_mutation_host: Option<String>,
    pub last_mutation_user: Option<String>,
    pub last_mutation_timestamp: Option<DateTime<Utc>>,
}

/// Reads and writes protocol state through an `ObjectStore`
#[derive(Clone)]
pub struct StateRepository {
    store: Arc<dyn ObjectStore>,
}

impl StateRepository {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    pub fn is_initialized(&self) -> Result<bool> {
        Ok(self.store.get_string(MODE)?.is_some())
    }

    /// Write the initial ACCEPTING state of a fresh node
    pub fn initialize(&self) -> Result<()> {
        let mut change = self.begin();
        change
            .set_mode(ServerMode::Accepting)
            .set_mutative_message_count(0)
            .set_current_version(0)
            .set_highest_version(0);
        self.apply(change)
    }

    pub fn load(&self) -> Result<NodeProtocolState> {
        let mode = self
            .store
            .get_string(MODE)?
            .ok_or_else(|| Error::Corrupted("protocol state is not initialized".into()))?;
        let latest_change_uuid = self
            .store
            .get_string(LATEST_CHANGE_UUID)?
            .map(|s| parse_uuid(&s))
            .transpose()?;
        let last_mutation_timestamp = self
            .store
            .get_string(LAST_MUTATION_TIMESTAMP)?
            .map(|s| parse_timestamp(&s))
            .transpose()?;

        Ok(NodeProtocolState {
            mode: ServerMode::from_str(&mode)?,
            mutative_message_count: self.store.get_long(MUTATIVE_MESSAGE_COUNT)?.unwrap_or(0),
            current_version: self.store.get_long(CURRENT_VERSION)?.unwrap_or(0),
            highest_version: self.store.get_long(HIGHEST_VERSION)?.unwrap_or(0),
            latest_change_uuid,
            last_mutation_host: self.store.get_string(LAST_MUTATION_HOST)?,
            last_mutation_user: self.store.get_string(LAST_MUTATION_USER)?,
            last_mutation_timestamp,
        })
    }

    /// Load a change request, verifying its result hash
    pub fn get_change(&self, uuid: Uuid) -> Result<Option<ChangeDetails>> {
        let Some(obj) = self.store.get_object(&uuid.to_string())? else {
            return Ok(None);
        };
        let owner = format!("change {}", uuid);

        let change: Change = obj
            .get_external(CHANGE_OPERATION)?
            .ok_or_else(|| Error::Corrupted(format!("{}: missing operation", owner)))?;
        let result: Cluster = obj
            .get_external(CHANGE_RESULT)?
            .ok_or_else(|| Error::Corrupted(format!("{}: missing result", owner)))?;
        let result_hash = obj.require_string(CHANGE_RESULT_HASH, &owner)?.to_string();
        let computed = hash_json(&result)?;
        if computed != result_hash {
            return Err(Error::ChecksumMismatch {
                expected: result_hash,
                actual: computed,
            });
        }

        Ok(Some(ChangeDetails {
            uuid,
            state: ChangeRequestState::from_str(obj.require_string(CHANGE_STATE, &owner)?)?,
            version: obj.require_long(CHANGE_VERSION, &owner)?,
            prev_change_uuid: obj.get_string(PREV_CHANGE_UUID).map(parse_uuid).transpose()?,
            change,
            result,
            result_hash,
            creation_host: obj.require_string(CHANGE_CREATION_HOST, &owner)?.to_string(),
            creation_user: obj.require_string(CHANGE_CREATION_USER, &owner)?.to_string(),
            creation_timestamp: parse_timestamp(
                obj.require_string(CHANGE_CREATION_TIMESTAMP, &owner)?,
            )?,
        }))
    }

    /// Walk the previous-change chain starting at `from`, newest first
    pub fn lineage(&self, from: Option<Uuid>) -> Result<Vec<LineageEntry>> {
        let mut entries = Vec::new();
        let mut next = from;
        while let Some(uuid) = next {
            let obj = self
                .store
                .get_object(&uuid.to_string())?
                .ok_or_else(|| Error::Corrupted(format!("broken change chain at {}", uuid)))?;
            let owner = format!("change {}", uuid);
            let prev = obj.get_string(PREV_CHANGE_UUID).map(parse_uuid).transpose()?;
            entries.push(LineageEntry {
                uuid,
                version: obj.require_long(CHANGE_VERSION, &owner)?,
                state: ChangeRequestState::from_str(obj.require_string(CHANGE_STATE, &owner)?)?,
                prev_change_uuid: prev,
            });
            if entries.len() > 1_000_000 {
                return Err(Error::Corrupted("change chain loops".into()));
            }
            next = prev;
        }
        Ok(entries)
    }

    /// Result of the most recent committed change
    pub fn committed_topology(&self, latest: Option<Uuid>) -> Result<Option<Cluster>> {
        let head = self
            .lineage(latest)?
            .into_iter()
            .find(|e| e.state == ChangeRequestState::Committed);
        match head {
            Some(entry) => Ok(self.get_change(entry.uuid)?.map(|c| c.result)),
            None => Ok(None),
        }
    }

    pub fn begin(&self) -> StateChange {
        StateChange {
            store: self.store.clone(),
            builder: ChangeSet::new(),
        }
    }

    pub fn apply(&self, change: StateChange) -> Result<()> {
        self.store.commit(change.builder)
    }
}

/// Pending mutation of the protocol state, committed in one piece
pub struct StateChange {
    store: Arc<dyn ObjectStore>,
    builder: ChangeSet,
}

impl StateChange {
    pub fn set_mode(&mut self, mode: ServerMode) -> &mut Self {
        self.builder.set_string(MODE, mode.as_str());
        self
    }

    pub fn set_request(&mut self, request: ServerRequest) -> &mut Self {
        self.builder.set_string(LAST_REQUEST, request.as_str());
        self
    }

    pub fn set_mutative_message_count(&mut self, count: u64) -> &mut Self {
        self.builder.set_long(MUTATIVE_MESSAGE_COUNT, count);
        self
    }

    pub fn set_latest_change_uuid(&mut self, uuid: Uuid) -> &mut Self {
        self.builder.set_string(LATEST_CHANGE_UUID, uuid.to_string());
        self
    }

    pub fn set_current_version(&mut self, version: u64) -> &mut Self {
        self.builder.set_long(CURRENT_VERSION, version);
        self
    }

    pub fn set_highest_version(&mut self, version: u64) -> &mut Self {
        self.builder.set_long(HIGHEST_VERSION, version);
        self
    }

    pub fn set_last_mutation(&mut self, host: &str, user: &str, at: DateTime<Utc>) -> &mut Self {
        self.builder
            .set_string(LAST_MUTATION_HOST, host)
            .set_string(LAST_MUTATION_USER, user)
            .set_string(LAST_MUTATION_TIMESTAMP, at.to_rfc3339());
        self
    }

    /// Persist a new change request
    pub fn create_change(&mut self, details: &ChangeDetails) -> Result<&mut Self> {
        let mut child = self.store.new_mutable_object();
        child
            .set_string(CHANGE_STATE, details.state.as_str())
            .set_long(CHANGE_VERSION, details.version)
            .set_string(CHANGE_RESULT_HASH, details.result_hash.clone())
            .set_string(CHANGE_CREATION_HOST, details.creation_host.clone())
            .set_string(CHANGE_CREATION_USER, details.creation_user.clone())
            .set_string(
                CHANGE_CREATION_TIMESTAMP,
                details.creation_timestamp.to_rfc3339(),
            );
        if let Some(prev) = details.prev_change_uuid {
            child.set_string(PREV_CHANGE_UUID, prev.to_string());
        }
        child.set_external(CHANGE_OPERATION, &details.change)?;
        child.set_external(CHANGE_RESULT, &details.result)?;

        self.builder.set_object(details.uuid.to_string(), child);
        Ok(self)
    }

    /// Rewrite the state field of an existing change request
    pub fn update_change_state(
        &mut self,
        uuid: Uuid,
        state: ChangeRequestState,
    ) -> Result<&mut Self> {
        let key = uuid.to_string();
        let mut updated: StoreObject = self
            .store
            .get_object(&key)?
            .ok_or_else(|| Error::NotFound(format!("change {}", uuid)))?;
        updated.set_string(CHANGE_STATE, state.as_str());
        self.builder.set_object(key, updated);
        Ok(self)
    }
}

fn parse_uuid(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).map_err(|e| Error::Corrupted(format!("invalid uuid {}: {}", s, e)))
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| Error::Corrupted(format!("invalid timestamp {}: {}", s, e)))
}
