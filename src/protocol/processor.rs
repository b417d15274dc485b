//! Change processors: validation before prepare, side effects on commit

use crate::common::{Error, Result};
use crate::model::{CapacityLimits, CapacityValidator, Change, Cluster, ClusterValidator};
use std::sync::{Arc, RwLock};

/// Validates and applies changes on behalf of a `NomadServer`
pub trait ChangeProcessor: Send + Sync {
    /// Compute and check the topology `change` produces from `current`.
    /// Must not have side effects.
    fn validate(&self, current: Option<&Cluster>, change: &Change) -> Result<Cluster>;

    /// Make a committed change effective. Called with the validated result.
    fn apply(&self, change: &Change, result: &Cluster) -> Result<()>;

    /// Restore runtime state from the last committed topology at startup
    fn load(&self, committed: Option<&Cluster>) -> Result<()>;

    /// Topology currently in effect
    fn runtime(&self) -> Result<Option<Cluster>>;
}

/// Notified after a topology change became effective
pub trait TopologyListener: Send + Sync {
    fn on_change(&self, change: &Change, topology: &Cluster) -> Result<()>;
}

/// Default processor: structural and capacity validation, runtime topology
pub struct TopologyProcessor {
    limits: CapacityLimits,
    runtime: RwLock<Option<Cluster>>,
    listeners: RwLock<Vec<Arc<dyn TopologyListener>>>,
}

impl TopologyProcessor {
    pub fn new(limits: CapacityLimits) -> Self {
        Self {
            limits,
            runtime: RwLock::new(None),
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn TopologyListener>) -> Result<()> {
        self.listeners
            .write()
            .map_err(|_| Error::Internal("listener lock poisoned".into()))?
            .push(listener);
        Ok(())
    }

    pub fn limits(&self) -> &CapacityLimits {
        &self.limits
    }
}

impl ChangeProcessor for TopologyProcessor {
    fn validate(&self, current: Option<&Cluster>, change: &Change) -> Result<Cluster> {
        let result = change.apply(current)?;
        ClusterValidator::new(&result).validate()?;
        CapacityValidator::new(&result, &self.limits).validate()?;
        Ok(result)
    }

    fn apply(&self, change: &Change, result: &Cluster) -> Result<()> {
        let mut runtime = self
            .runtime
            .write()
            .map_err(|_| Error::Internal("runtime topology lock poisoned".into()))?;

        if runtime.as_ref() == Some(result) {
            tracing::debug!("Topology already up to date, skipping: {}", change.summary());
            return Ok(());
        }

        let listeners = self
            .listeners
            .read()
            .map_err(|_| Error::Internal("listener lock poisoned".into()))?;
        for listener in listeners.iter() {
            listener.on_change(change, result)?;
        }

        *runtime = Some(result.clone());
        tracing::info!("Applied: {}", change.summary());
        Ok(())
    }

    fn load(&self, committed: Option<&Cluster>) -> Result<()> {
        let mut runtime = self
            .runtime
            .write()
            .map_err(|_| Error::Internal("runtime topology lock poisoned".into()))?;
        *runtime = committed.cloned();
        Ok(())
    }

    fn runtime(&self) -> Result<Option<Cluster>> {
        Ok(self
            .runtime
            .read()
            .map_err(|_| Error::Internal("runtime topology lock poisoned".into()))?
            .clone())
    }
}
