//! `where` clause evaluation over materialized entity maps.
//!
//! A clause is an object mapping attribute names to conditions. A condition
//! is either a bare JSON value (deep equality) or an operator map such as
//! `{"$gte": 3}`. `$and` / `$or` / `$not` combine whole sub-clauses and may
//! appear alongside attribute conditions; everything at one level ANDs.

use serde_json::{Map, Value};
use std::cmp::Ordering;

/// Evaluate a `where` clause against an entity's attribute map.
///
/// Malformed clauses match nothing rather than erroring; query validation
/// happens before materialization.
pub fn matches(entity: &Map<String, Value>, where_clause: &Value) -> bool {
    let Some(clause) = where_clause.as_object() else {
        return false;
    };

    for (key, condition) in clause {
        let ok = match key.as_str() {
            "$and" => condition
                .as_array()
                .map(|subs| subs.iter().all(|sub| matches(entity, sub)))
                .unwrap_or(false),
            "$or" => condition
                .as_array()
                .map(|subs| subs.iter().any(|sub| matches(entity, sub)))
                .unwrap_or(false),
            "$not" => !matches(entity, condition),
            attr => field_matches(entity, attr, condition),
        };
        if !ok {
            return false;
        }
    }
    true
}

fn field_matches(entity: &Map<String, Value>, attr: &str, condition: &Value) -> bool {
    let current = entity.get(attr);

    match condition {
        Value::Object(ops) if ops.keys().any(|k| k.starts_with('$')) => ops
            .iter()
            .all(|(op, operand)| operator_matches(attr, current, op, operand)),
        literal => current.map(|v| v == literal).unwrap_or(false),
    }
}

fn operator_matches(attr: &str, current: Option<&Value>, op: &str, operand: &Value) -> bool {
    match op {
        "$ne" => current.map(|v| v != operand).unwrap_or(true),
        "$gt" => ordered(current, operand, |o| o == Ordering::Greater),
        "$gte" => ordered(current, operand, |o| o != Ordering::Less),
        "$lt" => ordered(current, operand, |o| o == Ordering::Less),
        "$lte" => ordered(current, operand, |o| o != Ordering::Greater),
        "$in" => match (current, operand.as_array()) {
            (Some(v), Some(list)) => list.contains(v),
            _ => false,
        },
        "$nin" => match (current, operand.as_array()) {
            (Some(v), Some(list)) => !list.contains(v),
            (None, Some(_)) => true,
            _ => false,
        },
        "$like" => like_matches(current, operand, true),
        "$ilike" => like_matches(current, operand, false),
        "$contains" => match current.and_then(Value::as_array) {
            Some(items) => items.contains(operand),
            None => false,
        },
        "$size" => {
            let Some(len) = current.and_then(collection_len) else {
                return false;
            };
            let len = Value::from(len as u64);
            match operand {
                Value::Object(_) => field_matches(&single(attr, &len), attr, operand),
                expected => &len == expected,
            }
        }
        "$exists" => match operand.as_bool() {
            Some(true) => current.is_some(),
            Some(false) => current.is_none(),
            None => false,
        },
        // `$isNull: true` matches attribute-absent as well as
        // present-and-null; `false` requires a present non-null value.
        "$isNull" => match operand.as_bool() {
            Some(true) => current.map(Value::is_null).unwrap_or(true),
            Some(false) => current.map(|v| !v.is_null()).unwrap_or(false),
            None => false,
        },
        _ => false,
    }
}

fn single(attr: &str, value: &Value) -> Map<String, Value> {
    let mut m = Map::new();
    m.insert(attr.to_string(), value.clone());
    m
}

fn collection_len(value: &Value) -> Option<usize> {
    match value {
        Value::Array(items) => Some(items.len()),
        Value::String(s) => Some(s.chars().count()),
        _ => None,
    }
}

fn ordered(current: Option<&Value>, operand: &Value, pred: impl Fn(Ordering) -> bool) -> bool {
    match current.and_then(|v| compare_same_type(v, operand)) {
        Some(ordering) => pred(ordering),
        None => false,
    }
}

/// Ordering between two values of the same comparable type.
/// Mismatched or null types are incomparable.
pub fn compare_same_type(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            x.as_f64().and_then(|x| y.as_f64().and_then(|y| x.partial_cmp(&y)))
        }
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// SQL-style wildcard match: `%` matches any run of characters.
fn like_matches(current: Option<&Value>, operand: &Value, case_sensitive: bool) -> bool {
    let (Some(Value::String(text)), Value::String(pattern)) = (current, operand) else {
        return false;
    };

    let (text, pattern) = if case_sensitive {
        (text.clone(), pattern.clone())
    } else {
        (text.to_lowercase(), pattern.to_lowercase())
    };

    wildcard_match(&text, &pattern)
}

fn wildcard_match(text: &str, pattern: &str) -> bool {
    let segments: Vec<&str> = pattern.split('%').collect();
    if segments.len() == 1 {
        return text == pattern;
    }

    let mut rest = text;

    let first = segments[0];
    if !first.is_empty() {
        let Some(stripped) = rest.strip_prefix(first) else {
            return false;
        };
        rest = stripped;
    }

    let last = *segments.last().unwrap_or(&"");
    let middle = &segments[1..segments.len() - 1];

    for segment in middle {
        if segment.is_empty() {
            continue;
        }
        match rest.find(segment) {
            Some(pos) => rest = &rest[pos + segment.len()..],
            None => return false,
        }
    }

    if last.is_empty() {
        true
    } else {
        rest.ends_with(last) && rest.len() >= last.len()
    }
}
