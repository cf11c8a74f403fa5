//! Query materialization against the triple store.

use futures::future::BoxFuture;
use serde_json::{json, Map, Value};

use crate::error::Result;
use crate::store::TripleStore;

use super::ast::{QueryNode, Relation};

/// Materialize a parsed query tree into its result shape:
/// `{type: [entity_object, ...], ...}` (or a scalar/object for aggregates).
pub async fn materialize(store: &TripleStore, nodes: &[QueryNode]) -> Result<Value> {
    let mut out = Map::new();
    for node in nodes {
        let value = if node.aggregate.is_some() {
            store.aggregate_entities(&node.entity_query()).await?
        } else {
            let mut rows = store.query_entities(&node.entity_query()).await?;
            for row in &mut rows {
                attach_includes(store, node, row).await?;
            }
            Value::Array(rows.into_iter().map(Value::Object).collect())
        };
        out.insert(node.entity_type.clone(), value);
    }
    Ok(Value::Object(out))
}

fn attach_includes<'a>(
    store: &'a TripleStore,
    node: &'a QueryNode,
    row: &'a mut Map<String, Value>,
) -> BoxFuture<'a, Result<()>> {
    Box::pin(async move {
        for include in &node.includes {
            match &include.relation {
                Relation::ToMany { foreign_key, .. } => {
                    let parent_id = row
                        .get("id")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();

                    let mut query = include.node.entity_query();
                    let mut fk_clause = Map::new();
                    fk_clause.insert(foreign_key.clone(), Value::String(parent_id));
                    let fk_condition = Value::Object(fk_clause);
                    query.where_clause = Some(match query.where_clause.take() {
                        Some(existing) => json!({"$and": [existing, fk_condition]}),
                        None => fk_condition,
                    });

                    let mut children = store.query_entities(&query).await?;
                    for child in &mut children {
                        attach_includes(store, &include.node, child).await?;
                    }
                    row.insert(
                        include.key.clone(),
                        Value::Array(children.into_iter().map(Value::Object).collect()),
                    );
                }
                Relation::ToOne { foreign_key } => {
                    let target = match row.get(foreign_key).and_then(Value::as_str) {
                        Some(target_id) => store.current_entity(target_id).await?,
                        None => None,
                    };
                    let value = match target {
                        Some(mut entity) => {
                            attach_includes(store, &include.node, &mut entity).await?;
                            Value::Object(entity)
                        }
                        None => Value::Null,
                    };
                    row.insert(include.key.clone(), value);
                }
            }
        }
        Ok(())
    })
}
