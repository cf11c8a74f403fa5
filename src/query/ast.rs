//! Declarative query trees.
//!
//! A query is a JSON object keyed by entity type; each value holds optional
//! `where`, `order_by`, `limit`, `offset`, `aggregate`, `group_by` and
//! `include` clauses. Queries canonicalize to sorted-key JSON, which is the
//! cache key: two queries with the same canonical key share one cached
//! result and one subscription slot.

use serde_json::Value;
use std::collections::HashSet;

use crate::error::{DbError, Result};
use crate::store::{AggregateOp, AggregateSpec, Direction, EntityQuery};

/// Canonical serialization of a query tree.
///
/// `serde_json` object maps are key-sorted, so serializing the parsed value
/// yields the same string for structurally equal queries regardless of the
/// key order they were written in.
pub fn canonical_key(query: &Value) -> String {
    serde_json::to_string(query).unwrap_or_default()
}

/// How an `include` key resolves to related entities.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Relation {
    /// Plural key `foos`: fetch the `foo` entity type filtered by the
    /// foreign key `{parent_type}_id`.
    ToMany {
        entity_type: String,
        foreign_key: String,
    },
    /// Singular key `foo`: to-one lookup via the parent's `foo_id`.
    ToOne { foreign_key: String },
}

/// A nested relation under a query node.
#[derive(Debug, Clone, PartialEq)]
pub struct Include {
    pub key: String,
    pub relation: Relation,
    pub node: QueryNode,
}

/// One root (or nested) entity-type query.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryNode {
    pub entity_type: String,
    pub where_clause: Option<Value>,
    pub order_by: Vec<(String, Direction)>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    pub aggregate: Option<AggregateSpec>,
    pub group_by: Option<String>,
    pub includes: Vec<Include>,
}

impl QueryNode {
    /// Store-level materialization request for this node (ignores includes).
    pub fn entity_query(&self) -> EntityQuery {
        EntityQuery {
            entity_type: Some(self.entity_type.clone()),
            where_clause: self.where_clause.clone(),
            order_by: self.order_by.clone(),
            limit: self.limit,
            offset: self.offset,
            aggregate: self.aggregate.clone(),
            group_by: self.group_by.clone(),
        }
    }
}

/// Parse a full query tree: one [`QueryNode`] per root entity type.
pub fn parse_query(query: &Value) -> Result<Vec<QueryNode>> {
    let Some(roots) = query.as_object() else {
        return Err(DbError::InvalidQuery(
            "query must be an object keyed by entity type".to_string(),
        ));
    };
    if roots.is_empty() {
        return Err(DbError::InvalidQuery("query has no entity types".to_string()));
    }

    roots
        .iter()
        .map(|(entity_type, body)| parse_node(entity_type, body))
        .collect()
}

fn parse_node(entity_type: &str, body: &Value) -> Result<QueryNode> {
    let Some(body) = body.as_object() else {
        return Err(DbError::InvalidQuery(format!(
            "query body for \"{entity_type}\" must be an object"
        )));
    };

    let where_clause = body.get("where").cloned();
    if let Some(clause) = &where_clause {
        if !clause.is_object() {
            return Err(DbError::InvalidQuery(format!(
                "where clause for \"{entity_type}\" must be an object"
            )));
        }
    }

    let order_by = match body.get("order_by") {
        None => Vec::new(),
        Some(spec) => parse_order_by(entity_type, spec)?,
    };

    let limit = parse_bound(entity_type, body.get("limit"), "limit")?;
    let offset = parse_bound(entity_type, body.get("offset"), "offset")?;

    let aggregate = match body.get("aggregate") {
        None => None,
        Some(spec) => Some(parse_aggregate(entity_type, spec)?),
    };

    let group_by = match body.get("group_by") {
        None => None,
        Some(Value::String(field)) => Some(field.clone()),
        Some(_) => {
            return Err(DbError::InvalidQuery(format!(
                "group_by for \"{entity_type}\" must be a string"
            )))
        }
    };

    let mut includes = Vec::new();
    if let Some(include) = body.get("include") {
        let Some(include) = include.as_object() else {
            return Err(DbError::InvalidQuery(format!(
                "include for \"{entity_type}\" must be an object"
            )));
        };
        for (key, child_body) in include {
            let relation = resolve_relation(entity_type, key);
            let child_type = match &relation {
                Relation::ToMany { entity_type, .. } => entity_type.clone(),
                Relation::ToOne { .. } => key.clone(),
            };
            includes.push(Include {
                key: key.clone(),
                relation,
                node: parse_node(&child_type, child_body)?,
            });
        }
    }

    Ok(QueryNode {
        entity_type: entity_type.to_string(),
        where_clause,
        order_by,
        limit,
        offset,
        aggregate,
        group_by,
        includes,
    })
}

/// Relation convention: a plural key `foos` fetches the `foo` entity type
/// with foreign key `{parent_type}_id`; a singular key resolves to-one via
/// `{name}_id` on the parent.
fn resolve_relation(parent_type: &str, key: &str) -> Relation {
    match key.strip_suffix('s') {
        Some(singular) if !singular.is_empty() => Relation::ToMany {
            entity_type: singular.to_string(),
            foreign_key: format!("{parent_type}_id"),
        },
        _ => Relation::ToOne {
            foreign_key: format!("{key}_id"),
        },
    }
}

fn parse_order_by(entity_type: &str, spec: &Value) -> Result<Vec<(String, Direction)>> {
    let invalid = || {
        DbError::InvalidQuery(format!(
            "order_by for \"{entity_type}\" must be [[field, \"asc\"|\"desc\"], ...] or {{field: direction}}"
        ))
    };

    match spec {
        Value::Array(pairs) => pairs
            .iter()
            .map(|pair| {
                let items = pair.as_array().ok_or_else(invalid)?;
                let field = items.first().and_then(Value::as_str).ok_or_else(invalid)?;
                let direction = items
                    .get(1)
                    .and_then(Value::as_str)
                    .and_then(Direction::parse)
                    .ok_or_else(invalid)?;
                Ok((field.to_string(), direction))
            })
            .collect(),
        Value::Object(fields) => fields
            .iter()
            .map(|(field, direction)| {
                let direction = direction
                    .as_str()
                    .and_then(Direction::parse)
                    .ok_or_else(invalid)?;
                Ok((field.clone(), direction))
            })
            .collect(),
        _ => Err(invalid()),
    }
}

fn parse_bound(entity_type: &str, value: Option<&Value>, name: &str) -> Result<Option<usize>> {
    match value {
        None => Ok(None),
        Some(v) => v
            .as_u64()
            .map(|n| Some(n as usize))
            .ok_or_else(|| {
                DbError::InvalidQuery(format!(
                    "{name} for \"{entity_type}\" must be a non-negative integer"
                ))
            }),
    }
}

fn parse_aggregate(entity_type: &str, spec: &Value) -> Result<AggregateSpec> {
    let invalid = || {
        DbError::InvalidQuery(format!(
            "aggregate for \"{entity_type}\" must be \"count\" or {{\"op\": ..., \"field\": ...}}"
        ))
    };

    match spec {
        Value::String(op) => {
            let op = AggregateOp::parse(op).ok_or_else(invalid)?;
            if op != AggregateOp::Count {
                return Err(DbError::InvalidQuery(format!(
                    "aggregate \"{entity_type}\" needs a field for non-count operators"
                )));
            }
            Ok(AggregateSpec { op, field: None })
        }
        Value::Object(body) => {
            let op = body
                .get("op")
                .and_then(Value::as_str)
                .and_then(AggregateOp::parse)
                .ok_or_else(invalid)?;
            let field = body
                .get("field")
                .and_then(Value::as_str)
                .map(str::to_string);
            if op != AggregateOp::Count && field.is_none() {
                return Err(invalid());
            }
            Ok(AggregateSpec { op, field })
        }
        _ => Err(invalid()),
    }
}

/// Entity types a query tree mentions (root plus includes). Queries with a
/// to-one include return `(types, true)`: the target's type is not knowable
/// from the key alone, so such queries invalidate on every change.
pub fn mentioned_types(nodes: &[QueryNode]) -> (HashSet<String>, bool) {
    let mut types = HashSet::new();
    let mut any_type = false;
    for node in nodes {
        collect_types(node, &mut types, &mut any_type);
    }
    (types, any_type)
}

fn collect_types(node: &QueryNode, types: &mut HashSet<String>, any_type: &mut bool) {
    types.insert(node.entity_type.clone());
    for include in &node.includes {
        if matches!(include.relation, Relation::ToOne { .. }) {
            *any_type = true;
        }
        collect_types(&include.node, types, any_type);
    }
}
