//! Run-scoped variable pool
//!
//! Node outputs are published here under `(node_id, key-path)` selectors so
//! later nodes can reference them. Inserting a JSON object also inserts every
//! nested leaf at its extended path, so `add(["llm"], {"usage": {"tokens": 3}})`
//! makes both `["llm", "usage"]` and `["llm", "usage", "tokens"]` resolvable.
//!
//! The pool is shared across parallel branches; `add` takes a write lock per
//! insertion, so adds to disjoint paths from different branches never corrupt
//! each other and later inserts at the same path overwrite.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde_json::Value;

/// Selector into the pool: leading entry is the source node id.
pub type VariableSelector = Vec<String>;

/// Run-scoped key-value store of node outputs.
#[derive(Debug, Default)]
pub struct VariablePool {
    variables: RwLock<HashMap<VariableSelector, Value>>,
}

impl VariablePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed system-provided inputs (query, conversation id, files, ...)
    /// under the reserved `sys` node id.
    pub fn with_system_variables(
        self,
        variables: impl IntoIterator<Item = (String, Value)>,
    ) -> Self {
        for (key, value) in variables {
            self.add(&["sys".to_string(), key], value);
        }
        self
    }

    /// Insert `value` at `selector`, recursing into object values so every
    /// nested leaf is addressable. Later inserts at the same path overwrite.
    pub fn add(&self, selector: &[String], value: Value) {
        if let Value::Object(map) = &value {
            for (key, child) in map {
                let mut child_selector = selector.to_vec();
                child_selector.push(key.clone());
                self.add(&child_selector, child.clone());
            }
        }
        self.variables.write().insert(selector.to_vec(), value);
    }

    /// Value stored at `selector`, if any.
    pub fn get(&self, selector: &[String]) -> Option<Value> {
        self.variables.read().get(selector).cloned()
    }

    /// Number of addressable entries (nested paths included).
    pub fn len(&self) -> usize {
        self.variables.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.variables.read().is_empty()
    }
}
