//! Transactional object store backing a node's protocol state
//!
//! Every mutation is expressed as a `ChangeSet` and committed in one
//! piece. Two backends:
//! - `MemoryStore` (tests, unconfigured diagnostic nodes)
//! - `ChangeLogStore` (append-only hash-chained log on disk)

pub mod changelog;
pub mod object;

pub use changelog::ChangeLogStore;
pub use object::{ChangeOp, ChangeSet, StoreObject, Value};

use crate::common::Result;
use std::collections::BTreeMap;
use std::sync::RwLock;

/// Trait for object store backends
pub trait ObjectStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Value>>;

    /// Commit all writes of the change-set, or none of them
    fn commit(&self, change: ChangeSet) -> Result<()>;

    fn new_mutable_object(&self) -> StoreObject {
        StoreObject::default()
    }

    fn get_object(&self, key: &str) -> Result<Option<StoreObject>> {
        Ok(match self.get(key)? {
            Some(Value::Object(obj)) => Some(obj),
            _ => None,
        })
    }

    fn get_string(&self, key: &str) -> Result<Option<String>> {
        Ok(match self.get(key)? {
            Some(Value::String(s)) => Some(s),
            _ => None,
        })
    }

    fn get_long(&self, key: &str) -> Result<Option<u64>> {
        Ok(match self.get(key)? {
            Some(Value::Long(v)) => Some(v),
            _ => None,
        })
    }
}

/// In-memory store (default for tests)
#[derive(Default)]
pub struct MemoryStore {
    map: RwLock<BTreeMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ObjectStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        let map = self
            .map
            .read()
            .map_err(|_| crate::Error::Internal("memory store lock poisoned".into()))?;
        Ok(map.get(key).cloned())
    }

    fn commit(&self, change: ChangeSet) -> Result<()> {
        let mut map = self
            .map
            .write()
            .map_err(|_| crate::Error::Internal("memory store lock poisoned".into()))?;
        change.apply_to(&mut map);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store() {
        let store = MemoryStore::new();
        assert!(store.get("mode").unwrap().is_none());

        let mut child = store.new_mutable_object();
        child.set_long("version", 1);

        let mut cs = ChangeSet::new();
        cs.set_string("mode", "ACCEPTING")
            .set_long("count", 3)
            .set_object("change-1", child);
        store.commit(cs).unwrap();

        assert_eq!(store.get_string("mode").unwrap().as_deref(), Some("ACCEPTING"));
        assert_eq!(store.get_long("count").unwrap(), Some(3));
        assert_eq!(
            store
                .get_object("change-1")
                .unwrap()
                .unwrap()
                .get_long("version"),
            Some(1)
        );
        // wrong type reads as absent
        assert_eq!(store.get_long("mode").unwrap(), None);
    }
}
