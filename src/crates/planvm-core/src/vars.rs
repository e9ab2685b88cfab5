//! Per-VM variable store
//!
//! A mapping from variable name to JSON value. Keys are unique; insertion
//! creates or overwrites. Reads of absent keys are errors unless they go
//! through the interpolator, which substitutes the empty string and records
//! a warning instead.

use crate::error::{Result, VmError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Check that a name is non-empty and made of letters, digits or underscores
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Variable store backing a single VM
///
/// A `BTreeMap` keeps iteration order stable so state snapshots serialize
/// deterministically.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VariableStore {
    values: BTreeMap<String, Value>,
}

impl VariableStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Strict read. Absent keys are an error.
    pub fn get(&self, name: &str) -> Result<&Value> {
        self.values
            .get(name)
            .ok_or_else(|| VmError::UnresolvedVariable { name: name.to_string() })
    }

    /// Non-strict read for interpolation contexts.
    pub fn lookup(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    /// Create or overwrite a binding. The name must be well-formed.
    pub fn set(&mut self, name: impl Into<String>, value: Value) -> Result<()> {
        let name = name.into();
        if !is_valid_name(&name) {
            return Err(VmError::Malformed(format!(
                "invalid variable name '{}'",
                name
            )));
        }
        self.values.insert(name, value);
        Ok(())
    }

    /// Apply a batch of writes atomically. Either all writes land or none do.
    pub fn apply(&mut self, writes: BTreeMap<String, Value>) -> Result<()> {
        for name in writes.keys() {
            if !is_valid_name(name) {
                return Err(VmError::Malformed(format!(
                    "invalid variable name '{}'",
                    name
                )));
            }
        }
        self.values.extend(writes);
        Ok(())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.values.iter()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Entries of `self` that are new or different relative to `before`.
    ///
    /// Used to record `output_variables` on step commits.
    pub fn changed_since(&self, before: &VariableStore) -> BTreeMap<String, Value> {
        self.values
            .iter()
            .filter(|(k, v)| before.values.get(*k) != Some(*v))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}
