use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Reserved attribute recording an entity's collection/namespace.
pub const TYPE_ATTR: &str = "__type";

/// The atomic fact: (entity, attribute, value) plus provenance metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Triple {
    /// Canonical UUIDv4 text
    pub entity_id: String,
    /// Attribute name, scoped by entity type
    pub attribute: String,
    /// JSON-typed value (null, bool, number, string, array, object)
    pub value: Value,
    /// Transaction that produced this triple
    pub tx_id: String,
    /// Milliseconds since Unix epoch
    pub created_at: i64,
    /// Retracted triples no longer contribute to an entity's current state
    pub retracted: bool,
}

impl Triple {
    pub fn new(
        entity_id: impl Into<String>,
        attribute: impl Into<String>,
        value: Value,
        tx_id: impl Into<String>,
    ) -> Self {
        Self {
            entity_id: entity_id.into(),
            attribute: attribute.into(),
            value,
            tx_id: tx_id.into(),
            created_at: Utc::now().timestamp_millis(),
            retracted: false,
        }
    }

    /// True for the reserved `__type` triple.
    pub fn is_type(&self) -> bool {
        self.attribute == TYPE_ATTR
    }

    /// Entity type carried by a `__type` triple, if this is one.
    pub fn type_name(&self) -> Option<&str> {
        if self.is_type() {
            self.value.as_str()
        } else {
            None
        }
    }
}

/// Kind of a change event on the store's change stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Add,
    Retract,
}

/// One logical triple mutation, emitted after the owning transaction commits.
#[derive(Debug, Clone)]
pub struct TripleChange {
    pub kind: ChangeKind,
    pub triple: Triple,
}

impl TripleChange {
    pub fn added(triple: Triple) -> Self {
        Self {
            kind: ChangeKind::Add,
            triple,
        }
    }

    pub fn retracted(triple: Triple) -> Self {
        Self {
            kind: ChangeKind::Retract,
            triple,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn type_triple_accessors() {
        let t = Triple::new("e1", TYPE_ATTR, json!("todos"), "tx1");
        assert!(t.is_type());
        assert_eq!(t.type_name(), Some("todos"));

        let plain = Triple::new("e1", "text", json!("hello"), "tx1");
        assert!(!plain.is_type());
        assert_eq!(plain.type_name(), None);
    }
}
