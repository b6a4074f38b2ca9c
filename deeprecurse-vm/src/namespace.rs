//! # Sandbox Namespace
//!
//! Variable bindings that persist across `run` calls of one sandbox
//! session. Values are JSON. Every write marks the binding dirty so a run
//! can report exactly which names it touched.

use crate::error::{self, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

/// Maximum number of bindings (prevents unbounded namespace growth)
pub const MAX_BINDINGS: usize = 1024;

#[derive(Debug, Clone, PartialEq)]
struct Binding {
    value: Value,
    dirty: bool,
}

/// Names written or removed since the last [`Namespace::take_diff`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BindingsDiff {
    pub set: BTreeMap<String, Value>,
    pub removed: Vec<String>,
}

impl BindingsDiff {
    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.removed.is_empty()
    }

    /// Names touched by the run, in order
    pub fn names(&self) -> Vec<&str> {
        self.set
            .keys()
            .map(String::as_str)
            .chain(self.removed.iter().map(String::as_str))
            .collect()
    }
}

#[derive(Debug, Clone, Default)]
pub struct Namespace {
    bindings: BTreeMap<String, Binding>,
    removed: BTreeSet<String>,
}

impl Namespace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.bindings.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.bindings.get(name).map(|b| &b.value)
    }

    /// Bind `name`, replacing any previous value
    pub fn set(&mut self, name: impl Into<String>, value: Value) -> Result<()> {
        let name = name.into();
        if !is_valid_name(&name) {
            return Err(error::sandbox_fault(format!("invalid variable name '{}'", name)));
        }

        if let Some(binding) = self.bindings.get_mut(&name) {
            binding.value = value;
            binding.dirty = true;
            return Ok(());
        }

        if self.bindings.len() >= MAX_BINDINGS {
            return Err(error::sandbox_fault(format!(
                "namespace full ({} bindings)",
                MAX_BINDINGS
            )));
        }
        self.removed.remove(&name);
        self.bindings.insert(name, Binding { value, dirty: true });
        Ok(())
    }

    pub fn remove(&mut self, name: &str) -> Result<Value> {
        let binding = self
            .bindings
            .remove(name)
            .ok_or_else(|| missing_binding(name, self.names()))?;
        self.removed.insert(name.to_string());
        Ok(binding.value)
    }

    /// Look up a binding or fail with the list of available names
    pub fn require(&self, name: &str) -> Result<&Value> {
        self.get(name).ok_or_else(|| missing_binding(name, self.names()))
    }

    pub fn names(&self) -> Vec<&str> {
        self.bindings.keys().map(String::as_str).collect()
    }

    /// Copy of every binding
    pub fn snapshot(&self) -> BTreeMap<String, Value> {
        self.bindings
            .iter()
            .map(|(name, binding)| (name.clone(), binding.value.clone()))
            .collect()
    }

    /// Collect the changes since the last call and mark everything clean
    pub fn take_diff(&mut self) -> BindingsDiff {
        let mut diff = BindingsDiff::default();
        for (name, binding) in self.bindings.iter_mut().filter(|(_, b)| b.dirty) {
            diff.set.insert(name.clone(), binding.value.clone());
            binding.dirty = false;
        }
        diff.removed = std::mem::take(&mut self.removed).into_iter().collect();
        diff
    }
}

fn missing_binding(name: &str, available: Vec<&str>) -> crate::error::Error {
    let listing = if available.is_empty() {
        "(none)".to_string()
    } else {
        available.join(", ")
    };
    error::sandbox_fault(format!(
        "variable '{}' not found; available: {}",
        name, listing
    ))
    .with_context("variable", name)
}

/// Identifier rule: letter or `_` first, then letters, digits, `_`
pub fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_alphabetic() || c == '_' => chars.all(|c| c.is_alphanumeric() || c == '_'),
        _ => false,
    }
}

/// Text form of a binding as it appears in prompts and output
pub fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
