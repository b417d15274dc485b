//! Values, objects and change-sets of the transactional object store

use crate::common::{Error, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A stored value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum Value {
    String(String),
    Long(u64),
    Object(StoreObject),
    /// Opaque payload owned by a caller-defined type
    External(serde_json::Value),
}

/// A nested object: string keys to values
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreObject {
    entries: BTreeMap<String, Value>,
}

impl StoreObject {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    pub fn get_string(&self, key: &str) -> Option<&str> {
        match self.entries.get(key) {
            Some(Value::String(s)) => Some(s),
            _ => None,
        }
    }

    pub fn get_long(&self, key: &str) -> Option<u64> {
        match self.entries.get(key) {
            Some(Value::Long(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_external<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.entries.get(key) {
            Some(Value::External(v)) => Ok(Some(serde_json::from_value(v.clone())?)),
            Some(_) => Err(Error::Corrupted(format!("'{}' is not an external value", key))),
            None => Ok(None),
        }
    }

    pub fn set_string(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.entries
            .insert(key.into(), Value::String(value.into()));
        self
    }

    pub fn set_long(&mut self, key: impl Into<String>, value: u64) -> &mut Self {
        self.entries.insert(key.into(), Value::Long(value));
        self
    }

    pub fn set_object(&mut self, key: impl Into<String>, value: StoreObject) -> &mut Self {
        self.entries.insert(key.into(), Value::Object(value));
        self
    }

    pub fn set_external<T: Serialize>(
        &mut self,
        key: impl Into<String>,
        value: &T,
    ) -> Result<&mut Self> {
        self.entries
            .insert(key.into(), Value::External(serde_json::to_value(value)?));
        Ok(self)
    }

    /// Required string field, or a corruption error naming the object
    pub fn require_string(&self, key: &str, owner: &str) -> Result<&str> {
        self.get_string(key)
            .ok_or_else(|| Error::Corrupted(format!("{}: missing '{}'", owner, key)))
    }

    /// Required long field, or a corruption error naming the object
    pub fn require_long(&self, key: &str, owner: &str) -> Result<u64> {
        self.get_long(key)
            .ok_or_else(|| Error::Corrupted(format!("{}: missing '{}'", owner, key)))
    }
}

/// One write of a change-set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeOp {
    pub key: String,
    pub value: Value,
}

/// A group of writes committed atomically
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeSet {
    ops: Vec<ChangeOp>,
}

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, key: impl Into<String>, value: Value) -> &mut Self {
        self.ops.push(ChangeOp {
            key: key.into(),
            value,
        });
        self
    }

    pub fn set_string(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.push(key, Value::String(value.into()))
    }

    pub fn set_long(&mut self, key: impl Into<String>, value: u64) -> &mut Self {
        self.push(key, Value::Long(value))
    }

    pub fn set_object(&mut self, key: impl Into<String>, value: StoreObject) -> &mut Self {
        self.push(key, Value::Object(value))
    }

    pub fn set_external<T: Serialize>(
        &mut self,
        key: impl Into<String>,
        value: &T,
    ) -> Result<&mut Self> {
        let value = Value::External(serde_json::to_value(value)?);
        Ok(self.push(key, value))
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn ops(&self) -> &[ChangeOp] {
        &self.ops
    }

    /// Apply every write to an in-memory map
    pub(crate) fn apply_to(&self, map: &mut BTreeMap<String, Value>) {
        for op in &self.ops {
            map.insert(op.key.clone(), op.value.clone());
        }
    }
}
