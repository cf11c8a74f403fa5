//! Outbound transaction encoding.
//!
//! Operations become tx-step arrays referencing attributes by server
//! identifier. When an attribute has no identifier yet, the dotted
//! `{namespace}.{attr}` form is sent instead and the server returns the
//! assigned identifier with its next delta.

use serde_json::{json, Value};
use tracing::debug;

use crate::domain::{Operation, Transaction};

use super::attrs::AttributeCache;

/// Encode a local transaction into its wire steps.
pub fn encode_transaction(tx: &Transaction, attrs: &AttributeCache) -> Vec<Value> {
    let tx_namespace = tx.namespace().map(str::to_string);
    let mut steps = Vec::with_capacity(tx.operations.len());

    for op in &tx.operations {
        match op {
            Operation::Add {
                entity_type,
                entity_id,
                attr,
                value,
            } => {
                let namespace = tx_namespace
                    .as_deref()
                    .or(Some(entity_type.as_str()))
                    .filter(|t| !t.is_empty())
                    .unwrap_or_default()
                    .to_string();
                steps.push(add_triple(entity_id, &namespace, attr, value, attrs));
            }
            Operation::Update {
                entity_id,
                attr,
                value,
            } => {
                let namespace = tx_namespace.clone().unwrap_or_default();
                steps.push(add_triple(entity_id, &namespace, attr, value, attrs));
            }
            Operation::Merge { entity_id, partial } => {
                // merged values were computed at apply time; on the wire the
                // partial's top-level keys travel as plain attribute writes
                let namespace = tx_namespace.clone().unwrap_or_default();
                if let Some(patch) = partial.as_object() {
                    for (attr, value) in patch {
                        steps.push(add_triple(entity_id, &namespace, attr, value, attrs));
                    }
                }
            }
            Operation::Retract {
                entity_id,
                attr,
                value,
            } => {
                let namespace = tx_namespace.clone().unwrap_or_default();
                steps.push(json!([
                    "retract-triple",
                    entity_id,
                    attr_ref(&namespace, attr, attrs),
                    value,
                ]));
            }
            Operation::Link {
                from_entity,
                relation,
                to_entity,
            } => {
                let namespace = tx_namespace.clone().unwrap_or_default();
                steps.push(add_triple(
                    from_entity,
                    &namespace,
                    relation,
                    &Value::String(to_entity.clone()),
                    attrs,
                ));
            }
            Operation::Unlink {
                from_entity,
                relation,
                to_entity,
            } => {
                let namespace = tx_namespace.clone().unwrap_or_default();
                steps.push(json!([
                    "retract-triple",
                    from_entity,
                    attr_ref(&namespace, relation, attrs),
                    to_entity,
                ]));
            }
            Operation::Delete { entity_id } => {
                let namespace = tx_namespace.clone().unwrap_or_default();
                steps.push(json!(["delete-entity", entity_id, namespace]));
            }
        }
    }

    debug!(tx_id = %tx.id, steps = steps.len(), "encoded transaction");
    steps
}

fn add_triple(
    entity_id: &str,
    namespace: &str,
    attr: &str,
    value: &Value,
    attrs: &AttributeCache,
) -> Value {
    json!([
        "add-triple",
        entity_id,
        attr_ref(namespace, attr, attrs),
        value,
    ])
}

/// Server identifier when known, dotted name otherwise.
fn attr_ref(namespace: &str, attr: &str, attrs: &AttributeCache) -> String {
    attrs
        .resolve_id(namespace, attr)
        .unwrap_or_else(|| format!("{namespace}.{attr}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TYPE_ATTR;

    fn create_tx(entity_id: &str) -> Transaction {
        Transaction::new_local(vec![
            Operation::Add {
                entity_type: "todos".to_string(),
                entity_id: entity_id.to_string(),
                attr: TYPE_ATTR.to_string(),
                value: json!("todos"),
            },
            Operation::Add {
                entity_type: "todos".to_string(),
                entity_id: entity_id.to_string(),
                attr: "text".to_string(),
                value: json!("hello"),
            },
        ])
    }

    #[test]
    fn resolved_attributes_use_server_ids() {
        let attrs = AttributeCache::default();
        attrs.register("todos", "text", "A-text");

        let tx = create_tx("e1");
        let steps = encode_transaction(&tx, &attrs);
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0], json!(["add-triple", "e1", "todos.__type", "todos"]));
        assert_eq!(steps[1], json!(["add-triple", "e1", "A-text", "hello"]));
    }

    #[test]
    fn update_uses_transaction_namespace() {
        let attrs = AttributeCache::default();
        let tx = Transaction {
            operations: vec![
                Operation::Add {
                    entity_type: "todos".to_string(),
                    entity_id: "e1".to_string(),
                    attr: TYPE_ATTR.to_string(),
                    value: json!("todos"),
                },
                Operation::Update {
                    entity_id: "e1".to_string(),
                    attr: "text".to_string(),
                    value: json!("v2"),
                },
            ],
            ..Transaction::new_local(vec![])
        };
        let steps = encode_transaction(&tx, &attrs);
        assert_eq!(steps[1], json!(["add-triple", "e1", "todos.text", "v2"]));
    }

    #[test]
    fn delete_encodes_namespace() {
        let attrs = AttributeCache::default();
        let tx = Transaction {
            operations: vec![
                Operation::Add {
                    entity_type: "todos".to_string(),
                    entity_id: "e1".to_string(),
                    attr: TYPE_ATTR.to_string(),
                    value: json!("todos"),
                },
                Operation::Delete {
                    entity_id: "e2".to_string(),
                },
            ],
            ..Transaction::new_local(vec![])
        };
        let steps = encode_transaction(&tx, &attrs);
        assert_eq!(steps[1], json!(["delete-entity", "e2", "todos"]));
    }

    #[test]
    fn link_and_unlink_travel_as_triple_writes() {
        let attrs = AttributeCache::default();
        attrs.register("teams", "member_ids", "A-members");
        let tx = Transaction {
            operations: vec![
                Operation::Add {
                    entity_type: "teams".to_string(),
                    entity_id: "t1".to_string(),
                    attr: TYPE_ATTR.to_string(),
                    value: json!("teams"),
                },
                Operation::Link {
                    from_entity: "t1".to_string(),
                    relation: "member_ids".to_string(),
                    to_entity: "u1".to_string(),
                },
                Operation::Unlink {
                    from_entity: "t1".to_string(),
                    relation: "member_ids".to_string(),
                    to_entity: "u2".to_string(),
                },
            ],
            ..Transaction::new_local(vec![])
        };
        let steps = encode_transaction(&tx, &attrs);
        assert_eq!(steps[1], json!(["add-triple", "t1", "A-members", "u1"]));
        assert_eq!(steps[2], json!(["retract-triple", "t1", "A-members", "u2"]));
    }
}
