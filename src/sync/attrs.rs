//! Attribute descriptor cache.
//!
//! The wire protocol references attributes by server-assigned identifier,
//! never by name. The cache maps `(namespace, attribute_name)` to that
//! identifier and back. It is populated from `init-ok` and augmented by
//! `add-attr` steps inside remote deltas; all writes happen on the receive
//! loop, reads happen on every encode and decode.

use dashmap::DashMap;
use serde_json::Value;
use std::collections::HashMap;
use tracing::debug;

use super::protocol::AttrDef;

/// Two-way `(namespace, name) <-> server id` map plus inference hints for
/// servers that omit attributes from session init.
#[derive(Debug, Default)]
pub struct AttributeCache {
    forward: DashMap<(String, String), String>,
    reverse: DashMap<String, (String, String)>,
    /// `{namespace -> {value_type -> attribute_name}}`
    hints: HashMap<String, HashMap<String, String>>,
}

impl AttributeCache {
    pub fn new(hints: HashMap<String, HashMap<String, String>>) -> Self {
        Self {
            forward: DashMap::new(),
            reverse: DashMap::new(),
            hints,
        }
    }

    pub fn register(&self, namespace: &str, name: &str, id: &str) {
        debug!(namespace, name, id, "registered attribute");
        self.forward
            .insert((namespace.to_string(), name.to_string()), id.to_string());
        self.reverse
            .insert(id.to_string(), (namespace.to_string(), name.to_string()));
    }

    pub fn register_all(&self, defs: &[AttrDef]) {
        for def in defs {
            self.register(&def.namespace, &def.name, &def.id);
        }
    }

    /// Server identifier for `(namespace, name)`, if known.
    pub fn resolve_id(&self, namespace: &str, name: &str) -> Option<String> {
        self.forward
            .get(&(namespace.to_string(), name.to_string()))
            .map(|entry| entry.value().clone())
    }

    /// `(namespace, name)` behind a server identifier, if known.
    pub fn resolve_name(&self, id: &str) -> Option<(String, String)> {
        self.reverse.get(id).map(|entry| entry.value().clone())
    }

    /// True when `namespace` appears in any registered attribute.
    pub fn knows_namespace(&self, namespace: &str) -> bool {
        self.forward
            .iter()
            .any(|entry| entry.key().0 == namespace)
    }

    /// Infer an attribute name for an unresolved identifier from the value
    /// type, consulting the configured hint table.
    pub fn infer_name(&self, namespace: Option<&str>, value: &Value) -> Option<String> {
        let value_type = match value {
            Value::Bool(_) => "boolean",
            Value::String(_) => "string",
            Value::Number(_) => "number",
            _ => return None,
        };

        if let Some(namespace) = namespace {
            if let Some(name) = self.hints.get(namespace).and_then(|h| h.get(value_type)) {
                return Some(name.clone());
            }
        }
        // a single-namespace hint table applies even without a namespace guess
        if self.hints.len() == 1 {
            return self
                .hints
                .values()
                .next()
                .and_then(|h| h.get(value_type))
                .cloned();
        }
        None
    }

    pub fn len(&self) -> usize {
        self.forward.len()
    }

    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }
}
