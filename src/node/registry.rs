//! Capability registry of a node daemon
//!
//! Capabilities are looked up by name. Registering one returns a
//! `Registration` handle; dropping the handle (or calling `close`)
//! removes every name it registered.

use crate::common::{Error, Result};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock, Weak};

/// Something a node exposes for inspection
pub trait Capability: Send + Sync {
    fn name(&self) -> &str;

    /// Current description, rendered on demand
    fn describe(&self) -> Value;
}

type Entries = RwLock<BTreeMap<String, Arc<dyn Capability>>>;

#[derive(Clone, Default)]
pub struct CapabilityRegistry {
    entries: Arc<Entries>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, capability: Arc<dyn Capability>) -> Result<Registration> {
        let name = capability.name().to_string();
        if !insert(&self.entries, &name, &capability)? {
            return Err(Error::InvalidConfig(format!(
                "capability {} is already registered",
                name
            )));
        }
        tracing::debug!("Registered capability {}", name);
        Ok(Registration {
            entries: Arc::downgrade(&self.entries),
            capability,
            names: vec![name],
            closed: false,
        })
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<dyn Capability>> {
        self.entries.read().ok()?.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.entries
            .read()
            .map(|e| e.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Name -> description of every registered capability
    pub fn describe(&self) -> Value {
        let entries = match self.entries.read() {
            Ok(entries) => entries,
            Err(_) => return json!({}),
        };
        let map: serde_json::Map<String, Value> = entries
            .iter()
            .map(|(name, cap)| (name.clone(), cap.describe()))
            .collect();
        Value::Object(map)
    }
}

fn insert(entries: &Entries, name: &str, capability: &Arc<dyn Capability>) -> Result<bool> {
    let mut entries = entries
        .write()
        .map_err(|_| Error::Internal("capability registry lock poisoned".into()))?;
    if entries.contains_key(name) {
        return Ok(false);
    }
    entries.insert(name.to_string(), capability.clone());
    Ok(true)
}

/// Live registration; unregisters on drop
pub struct Registration {
    entries: Weak<Entries>,
    capability: Arc<dyn Capability>,
    names: Vec<String>,
    closed: bool,
}

impl Registration {
    /// Also expose the capability under `name`. False if the name is taken
    /// or the registration is closed.
    pub fn alias(&mut self, name: &str) -> bool {
        if self.closed {
            return false;
        }
        let Some(entries) = self.entries.upgrade() else {
            return false;
        };
        match insert(&entries, name, &self.capability) {
            Ok(true) => {
                self.names.push(name.to_string());
                true
            }
            _ => false,
        }
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn close(mut self) {
        self.unregister();
    }

    fn unregister(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Some(entries) = self.entries.upgrade() {
            if let Ok(mut entries) = entries.write() {
                for name in &self.names {
                    entries.remove(name);
                }
            }
        }
        tracing::debug!("Unregistered capability {:?}", self.names);
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.unregister();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Static(&'static str);

    impl Capability for Static {
        fn name(&self) -> &str {
            self.0
        }

        fn describe(&self) -> Value {
            json!({ "kind": self.0 })
        }
    }

    #[test]
    fn test_register_lookup_and_drop() {
        let registry = CapabilityRegistry::new();
        assert!(registry.lookup("nomad").is_none());

        let capability: Arc<dyn Capability> = Arc::new(Static("nomad"));
        let mut registration = registry.register(capability.clone()).unwrap();
        assert!(registry.lookup("nomad").is_some());
        assert!(registration.alias("protocol"));
        assert!(!registration.alias("nomad"));
        assert_eq!(registry.names(), vec!["nomad", "protocol"]);
        assert_eq!(registry.describe()["protocol"]["kind"], "nomad");
        // held by the caller, two registry names and the registration
        assert_eq!(Arc::strong_count(&capability), 4);

        assert!(registry.register(Arc::new(Static("nomad"))).is_err());

        drop(registration);
        assert!(registry.names().is_empty());
        assert_eq!(Arc::strong_count(&capability), 1);
    }

    #[test]
    fn test_close_unregisters() {
        let registry = CapabilityRegistry::new();
        let registration = registry.register(Arc::new(Static("topology"))).unwrap();
        registration.close();
        assert!(registry.lookup("topology").is_none());
    }
}
