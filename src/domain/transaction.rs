use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::triple::TYPE_ATTR;

/// Transaction status lifecycle.
///
/// Local transactions begin `Pending`, move to `Committed` once applied to
/// the store, then `Synced` on server acknowledgement or `Failed` on
/// rejection. Remote transactions are applied directly as `Synced`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxStatus {
    Pending,
    Committed,
    Synced,
    Failed,
}

impl TxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxStatus::Pending => "pending",
            TxStatus::Committed => "committed",
            TxStatus::Synced => "synced",
            TxStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TxStatus::Pending),
            "committed" => Some(TxStatus::Committed),
            "synced" => Some(TxStatus::Synced),
            "failed" => Some(TxStatus::Failed),
            _ => None,
        }
    }

    /// Terminal statuses are never re-sent to the server.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TxStatus::Synced | TxStatus::Failed)
    }
}

impl std::fmt::Display for TxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Where a transaction originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxOrigin {
    Local,
    Remote,
}

/// A single mutation inside a transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    /// Insert a new triple for an entity of `entity_type`
    Add {
        entity_type: String,
        entity_id: String,
        attr: String,
        value: Value,
    },
    /// Retract prior values of (entity, attr), then insert the new one
    Update {
        entity_id: String,
        attr: String,
        value: Value,
    },
    /// Retract every non-retracted triple of the entity
    Delete { entity_id: String },
    /// Retract a specific (entity, attr, value) triple
    Retract {
        entity_id: String,
        attr: String,
        value: Value,
    },
    /// Append `to_entity` to `relation`, treated as a multi-valued attribute
    Link {
        from_entity: String,
        relation: String,
        to_entity: String,
    },
    /// Remove `to_entity` from the `relation` list
    Unlink {
        from_entity: String,
        relation: String,
        to_entity: String,
    },
    /// Deep-merge `partial` into the entity's current attribute map;
    /// objects merge recursively, scalars and arrays replace
    Merge { entity_id: String, partial: Value },
}

impl Operation {
    /// Entity the operation targets (the `from` side for links).
    pub fn entity_id(&self) -> &str {
        match self {
            Operation::Add { entity_id, .. }
            | Operation::Update { entity_id, .. }
            | Operation::Delete { entity_id }
            | Operation::Retract { entity_id, .. }
            | Operation::Merge { entity_id, .. } => entity_id,
            Operation::Link { from_entity, .. } | Operation::Unlink { from_entity, .. } => {
                from_entity
            }
        }
    }

    /// All entity ids referenced by the operation.
    pub fn referenced_ids(&self) -> Vec<&str> {
        match self {
            Operation::Link {
                from_entity,
                to_entity,
                ..
            }
            | Operation::Unlink {
                from_entity,
                to_entity,
                ..
            } => vec![from_entity, to_entity],
            other => vec![other.entity_id()],
        }
    }
}

/// An atomic ordered set of operations carrying a client-chosen id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: String,
    pub timestamp_ms: i64,
    pub status: TxStatus,
    pub origin: TxOrigin,
    pub operations: Vec<Operation>,
}

impl Transaction {
    /// New local transaction with a fresh id, status `Pending`.
    pub fn new_local(operations: Vec<Operation>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp_ms: Utc::now().timestamp_millis(),
            status: TxStatus::Pending,
            origin: TxOrigin::Local,
            operations,
        }
    }

    /// Remote transaction decoded from a server delta, applied as `Synced`.
    pub fn new_remote(id: impl Into<String>, operations: Vec<Operation>) -> Self {
        Self {
            id: id.into(),
            timestamp_ms: Utc::now().timestamp_millis(),
            status: TxStatus::Synced,
            origin: TxOrigin::Remote,
            operations,
        }
    }

    /// Namespace this transaction writes into, taken from its `__type`
    /// operation or the first Add's entity type.
    pub fn namespace(&self) -> Option<&str> {
        for op in &self.operations {
            let (attr, value) = match op {
                Operation::Add { attr, value, .. } | Operation::Update { attr, value, .. } => {
                    (attr, value)
                }
                _ => continue,
            };
            if attr == TYPE_ATTR {
                if let Some(ns) = value.as_str() {
                    return Some(ns);
                }
            }
        }
        self.operations.iter().find_map(|op| match op {
            Operation::Add { entity_type, .. } => Some(entity_type.as_str()),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn status_round_trip() {
        for status in [
            TxStatus::Pending,
            TxStatus::Committed,
            TxStatus::Synced,
            TxStatus::Failed,
        ] {
            assert_eq!(TxStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(TxStatus::parse("bogus"), None);
    }

    #[test]
    fn namespace_prefers_type_operation() {
        let tx = Transaction::new_local(vec![
            Operation::Add {
                entity_type: "fallback".to_string(),
                entity_id: "e1".to_string(),
                attr: "text".to_string(),
                value: json!("hi"),
            },
            Operation::Add {
                entity_type: "fallback".to_string(),
                entity_id: "e1".to_string(),
                attr: TYPE_ATTR.to_string(),
                value: json!("todos"),
            },
        ]);
        assert_eq!(tx.namespace(), Some("todos"));
    }

    #[test]
    fn namespace_reads_type_updates_too() {
        let tx = Transaction::new_local(vec![
            Operation::Update {
                entity_id: "e1".to_string(),
                attr: TYPE_ATTR.to_string(),
                value: json!("todos"),
            },
            Operation::Update {
                entity_id: "e1".to_string(),
                attr: "text".to_string(),
                value: json!("hi"),
            },
        ]);
        assert_eq!(tx.namespace(), Some("todos"));
    }

    #[test]
    fn namespace_falls_back_to_entity_type() {
        let tx = Transaction::new_local(vec![Operation::Add {
            entity_type: "todos".to_string(),
            entity_id: "e1".to_string(),
            attr: "text".to_string(),
            value: json!("hi"),
        }]);
        assert_eq!(tx.namespace(), Some("todos"));
    }

    #[test]
    fn operation_serde_round_trip() {
        let op = Operation::Link {
            from_entity: "a".to_string(),
            relation: "member_ids".to_string(),
            to_entity: "b".to_string(),
        };
        let json = serde_json::to_string(&op).unwrap();
        let parsed: Operation = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, op);
        assert_eq!(op.referenced_ids(), vec!["a", "b"]);
    }
}
