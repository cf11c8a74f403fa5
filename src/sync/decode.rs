//! Inbound decoding: tx-steps from remote deltas and datalog join-rows
//! from query responses, both reconstructed into store operations.

use serde_json::{Map, Value};
use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use tracing::{debug, warn};

use crate::domain::{normalize_entity_id, Operation, TYPE_ATTR};

use super::attrs::AttributeCache;
use super::protocol::AttrDef;

/// Result of decoding a delta's tx-steps. `skipped` counts steps the
/// decoder could not resolve; the session tears down only past a threshold.
#[derive(Debug, Default)]
pub struct DecodedSteps {
    pub operations: Vec<Operation>,
    pub skipped: usize,
}

/// Decode tx-steps from a remote `transact`. `add-attr` steps register
/// attributes as a side effect and produce no operation.
pub fn decode_tx_steps(steps: &[Value], attrs: &AttributeCache) -> DecodedSteps {
    let mut out = DecodedSteps::default();
    // namespace seen in this batch, used to scope attribute inference
    let mut batch_namespace: Option<String> = None;

    for step in steps {
        let Some(parts) = step.as_array() else {
            warn!(?step, "tx-step is not an array");
            out.skipped += 1;
            continue;
        };
        let Some(kind) = parts.first().and_then(Value::as_str) else {
            warn!(?step, "tx-step without kind");
            out.skipped += 1;
            continue;
        };

        match kind {
            "add-attr" => match parts.get(1).and_then(AttrDef::parse) {
                Some(def) => {
                    batch_namespace.get_or_insert_with(|| def.namespace.clone());
                    attrs.register(&def.namespace, &def.name, &def.id);
                }
                None => {
                    warn!(?step, "malformed add-attr step");
                    out.skipped += 1;
                }
            },
            "add-triple" | "retract-triple" => {
                let Some((entity_id, namespace, attr, value)) =
                    decode_triple_step(parts, attrs, batch_namespace.as_deref())
                else {
                    out.skipped += 1;
                    continue;
                };
                if attr == TYPE_ATTR {
                    if let Some(ns) = value.as_str() {
                        batch_namespace.get_or_insert_with(|| ns.to_string());
                    }
                }
                let op = if kind == "add-triple" {
                    Operation::Add {
                        entity_type: namespace,
                        entity_id,
                        attr,
                        value,
                    }
                } else {
                    Operation::Retract {
                        entity_id,
                        attr,
                        value,
                    }
                };
                out.operations.push(op);
            }
            "delete-entity" => {
                let Some(entity_id) = parts.get(1).and_then(entity_id_of) else {
                    warn!(?step, "delete-entity without entity id");
                    out.skipped += 1;
                    continue;
                };
                out.operations.push(Operation::Delete { entity_id });
            }
            other => {
                warn!(kind = other, "unknown tx-step kind");
                out.skipped += 1;
            }
        }
    }
    out
}

/// `[kind, entity_id, attr_id, value, ...]` → (entity, namespace, attr, value).
fn decode_triple_step(
    parts: &[Value],
    attrs: &AttributeCache,
    batch_namespace: Option<&str>,
) -> Option<(String, String, String, Value)> {
    let entity_id = parts.get(1).and_then(entity_id_of)?;
    let attr_id = parts.get(2).and_then(Value::as_str)?;
    let value = parts.get(3).cloned().unwrap_or(Value::Null);

    let (namespace, attr) = resolve_attr(attr_id, &value, attrs, batch_namespace)?;
    Some((entity_id, namespace, attr, value))
}

/// Resolve a wire attribute reference to `(namespace, name)`.
///
/// Resolution order: the attribute cache, the dotted `{ns}.{attr}` fallback
/// form, then value-type inference (a string naming a known namespace is a
/// `__type` write; a boolean consults the hint table).
fn resolve_attr(
    attr_id: &str,
    value: &Value,
    attrs: &AttributeCache,
    batch_namespace: Option<&str>,
) -> Option<(String, String)> {
    if let Some((namespace, name)) = attrs.resolve_name(attr_id) {
        return Some((namespace, name));
    }

    if let Some((namespace, name)) = attr_id.split_once('.') {
        if !namespace.is_empty() && !name.is_empty() {
            return Some((namespace.to_string(), name.to_string()));
        }
    }

    if let Some(candidate) = value.as_str() {
        if attrs.knows_namespace(candidate) || batch_namespace == Some(candidate) {
            return Some((candidate.to_string(), TYPE_ATTR.to_string()));
        }
    }

    if let Some(name) = attrs.infer_name(batch_namespace, value) {
        return Some((batch_namespace.unwrap_or_default().to_string(), name));
    }

    warn!(attr_id, "unresolved attribute identifier, skipping triple");
    None
}

fn entity_id_of(raw: &Value) -> Option<String> {
    let candidate = match raw {
        Value::String(s) => s.clone(),
        // single-element wrapping arrays occur in join-rows
        Value::Array(items) => items.first()?.as_str()?.to_string(),
        _ => return None,
    };
    normalize_entity_id(&candidate)
}

/// Entities reconstructed from one datalog payload plus the payload hash
/// used for duplicate suppression.
#[derive(Debug)]
pub struct DatalogResult {
    pub entities: Vec<Map<String, Value>>,
    pub hash: u64,
}

/// Collect every `join-rows` array found anywhere in a payload.
pub fn extract_join_rows(body: &Value) -> Vec<&Vec<Value>> {
    let mut found = Vec::new();
    walk_join_rows(body, &mut found);
    found
}

fn walk_join_rows<'a>(value: &'a Value, found: &mut Vec<&'a Vec<Value>>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                if key == "join-rows" || key == "join_rows" {
                    if let Value::Array(rows) = child {
                        found.push(rows);
                        continue;
                    }
                }
                walk_join_rows(child, found);
            }
        }
        Value::Array(items) => {
            for item in items {
                walk_join_rows(item, found);
            }
        }
        _ => {}
    }
}

/// Decode one `join-rows` payload into grouped entity objects.
///
/// The rows are `[entity_id, attribute_id, value, timestamp]` tuples,
/// possibly nested one level deep. Entities that end up without a `__type`
/// take the requesting query's root type; with no root type known they are
/// dropped rather than guessed.
pub fn decode_join_rows(
    join_rows: &[Value],
    root_type: Option<&str>,
    attrs: &AttributeCache,
) -> DatalogResult {
    let mut rows: Vec<&Vec<Value>> = Vec::new();
    for item in join_rows {
        let Some(outer) = item.as_array() else {
            continue;
        };
        if is_row(outer) {
            rows.push(outer);
            continue;
        }
        // outer layer is itself a list of rows
        for inner in outer {
            if let Some(inner) = inner.as_array() {
                if is_row(inner) {
                    rows.push(inner);
                }
            }
        }
    }

    let mut grouped: BTreeMap<String, Map<String, Value>> = BTreeMap::new();
    for row in rows {
        let Some(entity_id) = row.first().and_then(entity_id_of) else {
            warn!(?row, "join-row without entity id");
            continue;
        };
        let Some(attr_id) = row.get(1).and_then(Value::as_str) else {
            warn!(?row, "join-row without attribute id");
            continue;
        };
        let value = row.get(2).cloned().unwrap_or(Value::Null);

        let Some((_, attr)) = resolve_attr(attr_id, &value, attrs, root_type) else {
            continue;
        };

        grouped
            .entry(entity_id.clone())
            .or_insert_with(|| {
                let mut map = Map::new();
                map.insert("id".to_string(), Value::String(entity_id.clone()));
                map
            })
            .insert(attr, value);
    }

    let mut entities = Vec::with_capacity(grouped.len());
    for (entity_id, mut entity) in grouped {
        if !entity.contains_key(TYPE_ATTR) {
            match root_type {
                Some(root) => {
                    entity.insert(TYPE_ATTR.to_string(), Value::String(root.to_string()));
                }
                None => {
                    debug!(entity_id = %entity_id, "untyped datalog entity dropped");
                    continue;
                }
            }
        }
        entities.push(entity);
    }

    let mut hasher = DefaultHasher::new();
    for entity in &entities {
        serde_json::to_string(entity).unwrap_or_default().hash(&mut hasher);
    }

    DatalogResult {
        hash: hasher.finish(),
        entities,
    }
}

/// A row is `[entity, attr_id, value, ts?]`: second element is the
/// attribute identifier string.
fn is_row(candidate: &[Value]) -> bool {
    candidate.len() >= 3 && candidate.get(1).map(Value::is_string).unwrap_or(false)
}

/// Wrap reconstructed entities into Add operations: `__type` first, then
/// every attribute.
pub fn entities_to_operations(entities: &[Map<String, Value>]) -> Vec<Operation> {
    let mut ops = Vec::new();
    for entity in entities {
        let Some(entity_id) = entity.get("id").and_then(Value::as_str) else {
            continue;
        };
        let entity_type = entity
            .get(TYPE_ATTR)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        ops.push(Operation::Add {
            entity_type: entity_type.clone(),
            entity_id: entity_id.to_string(),
            attr: TYPE_ATTR.to_string(),
            value: Value::String(entity_type.clone()),
        });
        for (attr, value) in entity {
            if attr == "id" || attr == TYPE_ATTR {
                continue;
            }
            ops.push(Operation::Add {
                entity_type: entity_type.clone(),
                entity_id: entity_id.to_string(),
                attr: attr.clone(),
                value: value.clone(),
            });
        }
    }
    ops
}
