//! Node protocol state machine
//!
//! ```text
//!              prepare
//!   ACCEPTING ─────────▶ PREPARED
//!       ▲                   │
//!       └───────────────────┘
//!        commit / rollback / force
//! ```
//!
//! Every mutating call is fenced by the mutative message count the caller
//! discovered, serialized by one lock, and persisted as a single
//! change-set.

use crate::common::{hash_json, Error, Result};
use crate::model::Cluster;
use crate::protocol::messages::{
    AcceptRejectResponse, ChangeDetails, ChangeRequestState, CommitMessage, DiscoverResponse,
    ForceStateMessage, MutationContext, PrepareMessage, Rejection, RejectionReason,
    RollbackMessage, ServerMode, TopologyView,
};
use crate::protocol::processor::ChangeProcessor;
use crate::protocol::state::{NodeProtocolState, ServerRequest, StateRepository};
use crate::store::ObjectStore;
use chrono::Utc;
use std::sync::{Arc, Mutex, MutexGuard};

/// Protocol endpoint of one node
pub struct NomadServer {
    name: String,
    repository: StateRepository,
    processor: Arc<dyn ChangeProcessor>,
    lock: Mutex<()>,
}

impl NomadServer {
    /// Open the protocol state in `store`, initializing a fresh one
    pub fn new(
        name: impl Into<String>,
        store: Arc<dyn ObjectStore>,
        processor: Arc<dyn ChangeProcessor>,
    ) -> Result<Self> {
        let name = name.into();
        let repository = StateRepository::new(store);
        if !repository.is_initialized()? {
            tracing::info!("Initializing protocol state of {}", name);
            repository.initialize()?;
        }

        let state = repository.load()?;
        let committed = repository.committed_topology(state.latest_change_uuid)?;
        processor.load(committed.as_ref())?;

        tracing::info!(
            "Node {} loaded: mode={}, version={}, mutations={}",
            name,
            state.mode,
            state.current_version,
            state.mutative_message_count
        );

        Ok(Self {
            name,
            repository,
            processor,
            lock: Mutex::new(()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn guard(&self) -> Result<MutexGuard<'_, ()>> {
        self.lock
            .lock()
            .map_err(|_| Error::Internal("protocol lock poisoned".into()))
    }

    // === Queries ===

    /// Snapshot of the protocol state; never cached
    pub fn discover(&self) -> Result<DiscoverResponse> {
        let _guard = self.guard()?;
        let state = self.repository.load()?;
        let latest_change = match state.latest_change_uuid {
            Some(uuid) => self.repository.get_change(uuid)?,
            None => None,
        };
        let lineage = self.repository.lineage(state.latest_change_uuid)?;

        Ok(DiscoverResponse {
            mode: state.mode,
            mutative_message_count: state.mutative_message_count,
            last_mutation_host: state.last_mutation_host,
            last_mutation_user: state.last_mutation_user,
            last_mutation_timestamp: state.last_mutation_timestamp,
            current_version: state.current_version,
            highest_version: state.highest_version,
            latest_change,
            lineage,
        })
    }

    /// Result of the last committed change
    pub fn committed_topology(&self) -> Result<Option<Cluster>> {
        let _guard = self.guard()?;
        let state = self.repository.load()?;
        self.repository.committed_topology(state.latest_change_uuid)
    }

    /// Result of the latest change, prepared or committed
    pub fn upcoming_topology(&self) -> Result<Option<Cluster>> {
        let _guard = self.guard()?;
        let state = self.repository.load()?;
        match state.latest_change_uuid {
            Some(uuid) => match self.repository.get_change(uuid)? {
                Some(details) if details.state != ChangeRequestState::RolledBack => {
                    Ok(Some(details.result))
                }
                _ => self.repository.committed_topology(Some(uuid)),
            },
            None => Ok(None),
        }
    }

    /// Topology the node is running with
    pub fn runtime_topology(&self) -> Result<Option<Cluster>> {
        self.processor.runtime()
    }

    pub fn topology_view(&self) -> Result<TopologyView> {
        Ok(TopologyView {
            upcoming: self.upcoming_topology()?,
            runtime: self.runtime_topology()?,
        })
    }

    // === Mutations ===

    pub fn prepare(&self, message: &PrepareMessage) -> AcceptRejectResponse {
        self.run("prepare", |state| self.try_prepare(state, message))
    }

    pub fn commit(&self, message: &CommitMessage) -> AcceptRejectResponse {
        self.run("commit", |state| self.try_commit(state, message))
    }

    pub fn rollback(&self, message: &RollbackMessage) -> AcceptRejectResponse {
        self.run("rollback", |state| self.try_rollback(state, message))
    }

    /// Administrative resolution of a prepared change, used by repair
    pub fn force_state(&self, message: &ForceStateMessage) -> AcceptRejectResponse {
        self.run("force", |state| self.try_force(state, message))
    }

    /// Serialize, load state, run `op`, and turn storage errors into
    /// rejections carrying the last mutation provenance
    fn run<F>(&self, op: &str, f: F) -> AcceptRejectResponse
    where
        F: FnOnce(&NodeProtocolState) -> Result<std::result::Result<(), RejectionReason>>,
    {
        let outcome = self.guard().and_then(|_guard| {
            let state = self.repository.load()?;
            let outcome = f(&state)?;
            Ok((state, outcome))
        });

        match outcome {
            Ok((_, Ok(()))) => Ok(()),
            Ok((state, Err(reason))) => {
                let message = format!("{} rejected by {}", op, self.name);
                tracing::warn!("{}: {}", message, reason);
                let mut rejection = Rejection::new(reason, message);
                rejection.last_mutation_host = state.last_mutation_host;
                rejection.last_mutation_user = state.last_mutation_user;
                Err(rejection)
            }
            Err(e) => {
                tracing::error!("{} failed on {}: {}", op, self.name, e);
                let reason = match &e {
                    Error::InvalidChange(_)
                    | Error::InvalidTopology(_)
                    | Error::CapacityExceeded(_) => RejectionReason::ValidationFailed,
                    _ => RejectionReason::Storage,
                };
                Err(Rejection::new(reason, e.to_string()))
            }
        }
    }

    fn check_fence(
        state: &NodeProtocolState,
        context: &MutationContext,
    ) -> std::result::Result<(), RejectionReason> {
        if state.mutative_message_count != context.expected_mutative_message_count {
            return Err(RejectionReason::Dead {
                expected: context.expected_mutative_message_count,
                actual: state.mutative_message_count,
            });
        }
        Ok(())
    }

    fn check_prepared(
        state: &NodeProtocolState,
        change_uuid: uuid::Uuid,
    ) -> std::result::Result<(), RejectionReason> {
        if state.mode != ServerMode::Prepared {
            return Err(RejectionReason::NotPrepared);
        }
        if state.latest_change_uuid != Some(change_uuid) {
            return Err(RejectionReason::UuidMismatch {
                prepared: state.latest_change_uuid,
            });
        }
        Ok(())
    }

    fn try_prepare(
        &self,
        state: &NodeProtocolState,
        message: &PrepareMessage,
    ) -> Result<std::result::Result<(), RejectionReason>> {
        if let Err(reason) = Self::check_fence(state, &message.context) {
            return Ok(Err(reason));
        }
        if state.mode != ServerMode::Accepting {
            return Ok(Err(RejectionReason::ConcurrentChange {
                in_flight: state.latest_change_uuid,
            }));
        }
        let expected_version = state.current_version + 1;
        if message.version_number != expected_version {
            return Ok(Err(RejectionReason::StaleVersion {
                expected: expected_version,
                received: message.version_number,
            }));
        }
        if self.repository.get_change(message.change_uuid)?.is_some() {
            tracing::warn!("Change {} was already used on {}", message.change_uuid, self.name);
            return Ok(Err(RejectionReason::ValidationFailed));
        }

        let current = self
            .repository
            .committed_topology(state.latest_change_uuid)?;
        let result = match self.processor.validate(current.as_ref(), &message.change) {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(
                    "Change {} is invalid on {}: {}",
                    message.change_uuid,
                    self.name,
                    e
                );
                return Ok(Err(RejectionReason::ValidationFailed));
            }
        };

        let now = Utc::now();
        let details = ChangeDetails {
            uuid: message.change_uuid,
            state: ChangeRequestState::Prepared,
            version: message.version_number,
            prev_change_uuid: state.latest_change_uuid,
            change: message.change.clone(),
            result_hash: hash_json(&result)?,
            result,
            creation_host: message.context.host.clone(),
            creation_user: message.context.user.clone(),
            creation_timestamp: now,
        };

        let mut change = self.repository.begin();
        change
            .create_change(&details)?
            .set_mode(ServerMode::Prepared)
            .set_request(ServerRequest::Prepare)
            .set_latest_change_uuid(message.change_uuid)
            .set_highest_version(message.version_number)
            .set_mutative_message_count(state.mutative_message_count + 1)
            .set_last_mutation(&message.context.host, &message.context.user, now);
        self.repository.apply(change)?;

        tracing::info!(
            "Node {} prepared {} (v{}): {}",
            self.name,
            message.change_uuid,
            message.version_number,
            message.change.summary()
        );
        Ok(Ok(()))
    }

    fn try_commit(
        &self,
        state: &NodeProtocolState,
        message: &CommitMessage,
    ) -> Result<std::result::Result<(), RejectionReason>> {
        if let Err(reason) = Self::check_fence(state, &message.context)
            .and_then(|_| Self::check_prepared(state, message.change_uuid))
        {
            return Ok(Err(reason));
        }
        self.resolve(
            state,
            &message.context,
            message.change_uuid,
            ChangeRequestState::Committed,
            ServerRequest::Commit,
        )
    }

    fn try_rollback(
        &self,
        state: &NodeProtocolState,
        message: &RollbackMessage,
    ) -> Result<std::result::Result<(), RejectionReason>> {
        if let Err(reason) = Self::check_fence(state, &message.context)
            .and_then(|_| Self::check_prepared(state, message.change_uuid))
        {
            return Ok(Err(reason));
        }
        self.resolve(
            state,
            &message.context,
            message.change_uuid,
            ChangeRequestState::RolledBack,
            ServerRequest::Rollback,
        )
    }

    fn try_force(
        &self,
        state: &NodeProtocolState,
        message: &ForceStateMessage,
    ) -> Result<std::result::Result<(), RejectionReason>> {
        if let Err(reason) = Self::check_fence(state, &message.context) {
            return Ok(Err(reason));
        }
        if message.target == ChangeRequestState::Prepared {
            return Ok(Err(RejectionReason::InvalidTarget));
        }
        match self.repository.get_change(message.change_uuid)? {
            None => return Ok(Err(RejectionReason::UnknownChange)),
            Some(details) if details.state != ChangeRequestState::Prepared => {
                return Ok(Err(RejectionReason::NotPrepared));
            }
            Some(_) => {}
        }
        self.resolve(
            state,
            &message.context,
            message.change_uuid,
            message.target,
            ServerRequest::Force,
        )
    }

    /// Close the prepared change as COMMITTED or ROLLED_BACK
    fn resolve(
        &self,
        state: &NodeProtocolState,
        context: &MutationContext,
        change_uuid: uuid::Uuid,
        target: ChangeRequestState,
        request: ServerRequest,
    ) -> Result<std::result::Result<(), RejectionReason>> {
        let details = self
            .repository
            .get_change(change_uuid)?
            .ok_or_else(|| Error::NotFound(format!("change {}", change_uuid)))?;

        let mut change = self.repository.begin();
        if target == ChangeRequestState::Committed {
            if let Err(e) = self.processor.apply(&details.change, &details.result) {
                tracing::error!(
                    "Node {} failed to apply {}, staying prepared: {}",
                    self.name,
                    change_uuid,
                    e
                );
                return Ok(Err(RejectionReason::ApplyFailed));
            }
            change.set_current_version(details.version);
        }

        change
            .update_change_state(change_uuid, target)?
            .set_mode(ServerMode::Accepting)
            .set_request(request)
            .set_mutative_message_count(state.mutative_message_count + 1)
            .set_last_mutation(&context.host, &context.user, Utc::now());
        self.repository.apply(change)?;

        tracing::info!(
            "Node {} moved {} (v{}) to {}",
            self.name,
            change_uuid,
            details.version,
            target
        );
        Ok(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CapacityLimits, Change, Node, Stripe};
    use crate::protocol::processor::{TopologyListener, TopologyProcessor};
    use crate::store::MemoryStore;
    use std::sync::atomic::{AtomicBool, Ordering};
    use uuid::Uuid;

    /// Fails every notification while `failing` is set
    struct Flaky {
        failing: AtomicBool,
    }

    impl TopologyListener for Flaky {
        fn on_change(&self, _change: &Change, _topology: &Cluster) -> Result<()> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(Error::Internal("offheap resize failed".into()));
            }
            Ok(())
        }
    }

    fn server() -> NomadServer {
        NomadServer::new(
            "n1",
            Arc::new(MemoryStore::new()),
            Arc::new(TopologyProcessor::new(CapacityLimits::default())),
        )
        .unwrap()
    }

    fn ctx(count: u64) -> MutationContext {
        MutationContext {
            expected_mutative_message_count: count,
            host: "ops-1".into(),
            user: "alice".into(),
        }
    }

    fn activation() -> Change {
        Change::ClusterActivation {
            cluster: Cluster::new(
                "prod",
                vec![Stripe::new("stripe-1", vec![Node::new("n1", "host1", 9410)])],
            ),
        }
    }

    fn prepare(uuid: Uuid, count: u64, version: u64, change: Change) -> PrepareMessage {
        PrepareMessage {
            context: ctx(count),
            change_uuid: uuid,
            version_number: version,
            change,
        }
    }

    #[test]
    fn test_prepare_commit_cycle() {
        let server = server();
        let uuid = Uuid::new_v4();

        server.prepare(&prepare(uuid, 0, 1, activation())).unwrap();
        let prepared = server.discover().unwrap();
        assert_eq!(prepared.mode, ServerMode::Prepared);
        assert_eq!(prepared.highest_version, 1);
        assert_eq!(prepared.current_version, 0);
        assert_eq!(prepared.mutative_message_count, 1);
        assert_eq!(prepared.last_mutation_user.as_deref(), Some("alice"));

        server
            .commit(&CommitMessage {
                context: ctx(1),
                change_uuid: uuid,
            })
            .unwrap();
        let committed = server.discover().unwrap();
        assert_eq!(committed.mode, ServerMode::Accepting);
        assert_eq!(committed.current_version, 1);
        assert_eq!(committed.latest_state(), Some(ChangeRequestState::Committed));
        assert_eq!(committed.committed_head(), Some(uuid));
        assert_eq!(committed.mutative_message_count, 2);
        assert!(server.committed_topology().unwrap().is_some());
    }

    #[test]
    fn test_prepare_rejections() {
        let server = server();
        let first = Uuid::new_v4();

        let err = server.prepare(&prepare(first, 0, 2, activation())).unwrap_err();
        assert_eq!(
            err.reason,
            RejectionReason::StaleVersion {
                expected: 1,
                received: 2
            }
        );

        let err = server.prepare(&prepare(first, 7, 1, activation())).unwrap_err();
        assert_eq!(
            err.reason,
            RejectionReason::Dead {
                expected: 7,
                actual: 0
            }
        );

        server.prepare(&prepare(first, 0, 1, activation())).unwrap();
        let err = server
            .prepare(&prepare(Uuid::new_v4(), 1, 1, activation()))
            .unwrap_err();
        assert_eq!(
            err.reason,
            RejectionReason::ConcurrentChange {
                in_flight: Some(first)
            }
        );
        assert_eq!(err.last_mutation_host.as_deref(), Some("ops-1"));
    }

    #[test]
    fn test_invalid_change_is_rejected_without_writing() {
        let server = server();
        let removal = Change::StripeRemoval {
            stripe: "stripe-1".into(),
        };
        let err = server
            .prepare(&prepare(Uuid::new_v4(), 0, 1, removal))
            .unwrap_err();
        assert_eq!(err.reason, RejectionReason::ValidationFailed);
        assert_eq!(server.discover().unwrap().mutative_message_count, 0);
    }

    #[test]
    fn test_rollback_keeps_version() {
        let server = server();
        let uuid = Uuid::new_v4();
        server.prepare(&prepare(uuid, 0, 1, activation())).unwrap();

        let err = server
            .rollback(&RollbackMessage {
                context: ctx(1),
                change_uuid: Uuid::new_v4(),
            })
            .unwrap_err();
        assert!(matches!(err.reason, RejectionReason::UuidMismatch { .. }));

        server
            .rollback(&RollbackMessage {
                context: ctx(1),
                change_uuid: uuid,
            })
            .unwrap();
        let state = server.discover().unwrap();
        assert_eq!(state.mode, ServerMode::Accepting);
        assert_eq!(state.current_version, 0);
        assert_eq!(state.latest_state(), Some(ChangeRequestState::RolledBack));

        // the version number is reused by the next attempt
        server
            .prepare(&prepare(Uuid::new_v4(), 2, 1, activation()))
            .unwrap();
    }

    #[test]
    fn test_force_state() {
        let server = server();
        let uuid = Uuid::new_v4();

        let force = |count, target| ForceStateMessage {
            context: ctx(count),
            change_uuid: uuid,
            target,
        };
        assert_eq!(
            server
                .force_state(&force(0, ChangeRequestState::Committed))
                .unwrap_err()
                .reason,
            RejectionReason::UnknownChange
        );

        server.prepare(&prepare(uuid, 0, 1, activation())).unwrap();
        assert_eq!(
            server
                .force_state(&force(1, ChangeRequestState::Prepared))
                .unwrap_err()
                .reason,
            RejectionReason::InvalidTarget
        );
        server
            .force_state(&force(1, ChangeRequestState::Committed))
            .unwrap();

        let state = server.discover().unwrap();
        assert_eq!(state.current_version, 1);
        assert_eq!(state.latest_state(), Some(ChangeRequestState::Committed));
        assert_eq!(
            server
                .force_state(&force(2, ChangeRequestState::RolledBack))
                .unwrap_err()
                .reason,
            RejectionReason::NotPrepared
        );
    }

    #[test]
    fn test_mutative_count_strictly_increases() {
        let server = server();
        let mut last = server.discover().unwrap().mutative_message_count;
        for version in 1..=3 {
            let uuid = Uuid::new_v4();
            let change = if version == 1 {
                activation()
            } else {
                Change::SettingChange {
                    op: crate::model::SettingOp::Set,
                    target: crate::model::SettingTarget::Cluster,
                    name: "client-lease-duration".into(),
                    value: Some(format!("{}s", version)),
                }
            };
            server.prepare(&prepare(uuid, last, version, change)).unwrap();
            let after_prepare = server.discover().unwrap().mutative_message_count;
            assert!(after_prepare > last);
            server
                .commit(&CommitMessage {
                    context: ctx(after_prepare),
                    change_uuid: uuid,
                })
                .unwrap();
            last = server.discover().unwrap().mutative_message_count;
            assert!(last > after_prepare);
        }
        assert_eq!(server.discover().unwrap().lineage.len(), 3);
    }

    #[test]
    fn test_failed_apply_stays_prepared() {
        let processor = Arc::new(TopologyProcessor::new(CapacityLimits::default()));
        let listener = Arc::new(Flaky {
            failing: AtomicBool::new(true),
        });
        processor.add_listener(listener.clone()).unwrap();
        let server =
            NomadServer::new("n1", Arc::new(MemoryStore::new()), processor.clone()).unwrap();

        let uuid = Uuid::new_v4();
        server.prepare(&prepare(uuid, 0, 1, activation())).unwrap();
        let err = server
            .commit(&CommitMessage {
                context: ctx(1),
                change_uuid: uuid,
            })
            .unwrap_err();
        assert_eq!(err.reason, RejectionReason::ApplyFailed);

        let state = server.discover().unwrap();
        assert_eq!(state.mode, ServerMode::Prepared);
        assert_eq!(state.current_version, 0);
        assert_eq!(state.mutative_message_count, 1);
        assert_eq!(state.latest_state(), Some(ChangeRequestState::Prepared));
        assert_eq!(server.runtime_topology().unwrap(), None);

        listener.failing.store(false, Ordering::SeqCst);
        server
            .force_state(&ForceStateMessage {
                context: ctx(1),
                change_uuid: uuid,
                target: ChangeRequestState::Committed,
            })
            .unwrap();
        let state = server.discover().unwrap();
        assert_eq!(state.mode, ServerMode::Accepting);
        assert_eq!(state.current_version, 1);
        assert_eq!(state.latest_state(), Some(ChangeRequestState::Committed));
        assert!(server.runtime_topology().unwrap().is_some());
    }

    #[test]
    fn test_concurrent_prepares_accept_one() {
        let server = Arc::new(server());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let server = server.clone();
                std::thread::spawn(move || {
                    server.prepare(&prepare(Uuid::new_v4(), 0, 1, activation()))
                })
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        for rejection in results.iter().filter_map(|r| r.as_ref().err()) {
            assert!(
                matches!(
                    rejection.reason,
                    RejectionReason::Dead {
                        expected: 0,
                        actual: 1
                    } | RejectionReason::ConcurrentChange { .. }
                ),
                "{:?}",
                rejection.reason
            );
        }

        let state = server.discover().unwrap();
        assert_eq!(state.mutative_message_count, 1);
        assert_eq!(state.mode, ServerMode::Prepared);
    }
}
