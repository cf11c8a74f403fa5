//! Ordering, pagination and aggregation over materialized entities.

use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::collections::BTreeMap;

use super::filter::compare_same_type;

/// Sort direction for one `order_by` entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Asc,
    Desc,
}

impl Direction {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "asc" => Some(Direction::Asc),
            "desc" => Some(Direction::Desc),
            _ => None,
        }
    }
}

/// Aggregation operator applied after filtering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AggregateOp {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

impl AggregateOp {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "count" => Some(AggregateOp::Count),
            "sum" => Some(AggregateOp::Sum),
            "avg" => Some(AggregateOp::Avg),
            "min" => Some(AggregateOp::Min),
            "max" => Some(AggregateOp::Max),
            _ => None,
        }
    }
}

/// Aggregation request: `count` needs no field, the rest do.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateSpec {
    pub op: AggregateOp,
    pub field: Option<String>,
}

/// Sort entities in place by a list of `(field, direction)` pairs.
///
/// Nulls (absent or JSON null) sort before non-nulls ascending and after
/// them descending. Non-comparable types fall back to lexicographic
/// comparison of their canonical serialization.
pub fn sort_entities(entities: &mut [Map<String, Value>], order_by: &[(String, Direction)]) {
    if order_by.is_empty() {
        return;
    }
    entities.sort_by(|a, b| {
        for (field, direction) in order_by {
            let ordering = compare_fields(a.get(field), b.get(field));
            let ordering = match direction {
                Direction::Asc => ordering,
                Direction::Desc => ordering.reverse(),
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    });
}

fn compare_fields(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    let a_null = a.map(Value::is_null).unwrap_or(true);
    let b_null = b.map(Value::is_null).unwrap_or(true);

    match (a_null, b_null) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => {
            let (a, b) = (a.unwrap_or(&Value::Null), b.unwrap_or(&Value::Null));
            compare_same_type(a, b).unwrap_or_else(|| {
                let a = serde_json::to_string(a).unwrap_or_default();
                let b = serde_json::to_string(b).unwrap_or_default();
                a.cmp(&b)
            })
        }
    }
}

/// Apply `offset` then `limit`. `limit: 0` yields the empty list; an offset
/// past the end yields the empty list.
pub fn paginate(
    entities: Vec<Map<String, Value>>,
    limit: Option<usize>,
    offset: Option<usize>,
) -> Vec<Map<String, Value>> {
    let offset = offset.unwrap_or(0);
    entities
        .into_iter()
        .skip(offset)
        .take(limit.unwrap_or(usize::MAX))
        .collect()
}

/// Compute an aggregate over filtered entities, optionally partitioned by
/// `group_by`. Without grouping the result is a single number; with
/// grouping it is an object keyed by the serialized group value.
pub fn aggregate(
    entities: &[Map<String, Value>],
    spec: &AggregateSpec,
    group_by: Option<&str>,
) -> Value {
    match group_by {
        None => aggregate_partition(entities.iter(), spec),
        Some(group_field) => {
            let mut groups: BTreeMap<String, Vec<&Map<String, Value>>> = BTreeMap::new();
            for entity in entities {
                let key = entity
                    .get(group_field)
                    .map(group_key)
                    .unwrap_or_else(|| "null".to_string());
                groups.entry(key).or_default().push(entity);
            }

            let mut out = Map::new();
            for (key, members) in groups {
                out.insert(key, aggregate_partition(members.into_iter(), spec));
            }
            Value::Object(out)
        }
    }
}

fn group_key(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => serde_json::to_string(other).unwrap_or_else(|_| "null".to_string()),
    }
}

fn aggregate_partition<'a>(
    entities: impl Iterator<Item = &'a Map<String, Value>>,
    spec: &AggregateSpec,
) -> Value {
    match spec.op {
        AggregateOp::Count => Value::from(entities.count() as u64),
        AggregateOp::Sum | AggregateOp::Avg => {
            let field = spec.field.as_deref().unwrap_or_default();
            let values: Vec<f64> = entities
                .filter_map(|e| e.get(field).and_then(Value::as_f64))
                .collect();
            match spec.op {
                AggregateOp::Sum => number(values.iter().sum()),
                _ if values.is_empty() => Value::Null,
                _ => number(values.iter().sum::<f64>() / values.len() as f64),
            }
        }
        AggregateOp::Min | AggregateOp::Max => {
            let field = spec.field.as_deref().unwrap_or_default();
            let mut best: Option<Value> = None;
            for entity in entities {
                let Some(candidate) = entity.get(field) else {
                    continue;
                };
                if candidate.is_null() {
                    continue;
                }
                let replace = match &best {
                    None => true,
                    Some(current) => {
                        let ordering = compare_fields(Some(candidate), Some(current));
                        match spec.op {
                            AggregateOp::Min => ordering == Ordering::Less,
                            _ => ordering == Ordering::Greater,
                        }
                    }
                };
                if replace {
                    best = Some(candidate.clone());
                }
            }
            best.unwrap_or(Value::Null)
        }
    }
}

fn number(v: f64) -> Value {
    serde_json::Number::from_f64(v)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entities(values: Vec<Value>) -> Vec<Map<String, Value>> {
        values
            .into_iter()
            .map(|v| v.as_object().cloned().unwrap())
            .collect()
    }

    fn order(field: &str, direction: Direction) -> Vec<(String, Direction)> {
        vec![(field.to_string(), direction)]
    }

    #[test]
    fn sorts_with_nulls_first_ascending() {
        let mut rows = entities(vec![
            json!({"id": "a", "rank": 2}),
            json!({"id": "b"}),
            json!({"id": "c", "rank": 1}),
            json!({"id": "d", "rank": null}),
        ]);
        sort_entities(&mut rows, &order("rank", Direction::Asc));
        let ids: Vec<&str> = rows.iter().map(|r| r["id"].as_str().unwrap()).collect();
        assert_eq!(&ids[2..], ["c", "a"]);
        assert!(ids[..2].contains(&"b") && ids[..2].contains(&"d"));
    }

    #[test]
    fn sorts_with_nulls_last_descending() {
        let mut rows = entities(vec![
            json!({"id": "a", "rank": 2}),
            json!({"id": "b"}),
            json!({"id": "c", "rank": 1}),
        ]);
        sort_entities(&mut rows, &order("rank", Direction::Desc));
        let ids: Vec<&str> = rows.iter().map(|r| r["id"].as_str().unwrap()).collect();
        assert_eq!(ids, ["a", "c", "b"]);
    }

    #[test]
    fn mixed_types_fall_back_to_serialized_order() {
        let mut rows = entities(vec![
            json!({"id": "a", "v": "zz"}),
            json!({"id": "b", "v": 10}),
        ]);
        sort_entities(&mut rows, &order("v", Direction::Asc));
        // "10" < "\"zz\"" lexicographically
        assert_eq!(rows[0]["id"], "b");
    }

    #[test]
    fn multi_key_ordering() {
        let mut rows = entities(vec![
            json!({"id": "a", "group": "x", "rank": 2}),
            json!({"id": "b", "group": "x", "rank": 1}),
            json!({"id": "c", "group": "w", "rank": 9}),
        ]);
        sort_entities(
            &mut rows,
            &[
                ("group".to_string(), Direction::Asc),
                ("rank".to_string(), Direction::Asc),
            ],
        );
        let ids: Vec<&str> = rows.iter().map(|r| r["id"].as_str().unwrap()).collect();
        assert_eq!(ids, ["c", "b", "a"]);
    }

    #[test]
    fn pagination_boundaries() {
        let rows = entities(vec![
            json!({"id": "a"}),
            json!({"id": "b"}),
            json!({"id": "c"}),
        ]);
        assert!(paginate(rows.clone(), Some(0), None).is_empty());
        assert!(paginate(rows.clone(), None, Some(10)).is_empty());
        let page = paginate(rows, Some(1), Some(1));
        assert_eq!(page.len(), 1);
        assert_eq!(page[0]["id"], "b");
    }

    #[test]
    fn count_sum_avg() {
        let rows = entities(vec![
            json!({"n": 1}),
            json!({"n": 2}),
            json!({"n": 3}),
            json!({"other": true}),
        ]);
        let count = AggregateSpec {
            op: AggregateOp::Count,
            field: None,
        };
        assert_eq!(aggregate(&rows, &count, None), json!(4));

        let sum = AggregateSpec {
            op: AggregateOp::Sum,
            field: Some("n".to_string()),
        };
        assert_eq!(aggregate(&rows, &sum, None), json!(6.0));

        let avg = AggregateSpec {
            op: AggregateOp::Avg,
            field: Some("n".to_string()),
        };
        assert_eq!(aggregate(&rows, &avg, None), json!(2.0));
    }

    #[test]
    fn min_max_and_grouping() {
        let rows = entities(vec![
            json!({"kind": "a", "n": 5}),
            json!({"kind": "a", "n": 1}),
            json!({"kind": "b", "n": 9}),
        ]);
        let min = AggregateSpec {
            op: AggregateOp::Min,
            field: Some("n".to_string()),
        };
        assert_eq!(aggregate(&rows, &min, None), json!(1));

        let max = AggregateSpec {
            op: AggregateOp::Max,
            field: Some("n".to_string()),
        };
        assert_eq!(aggregate(&rows, &max, Some("kind")), json!({"a": 5, "b": 9}));

        let count = AggregateSpec {
            op: AggregateOp::Count,
            field: None,
        };
        assert_eq!(
            aggregate(&rows, &count, Some("kind")),
            json!({"a": 2, "b": 1})
        );
    }
}
