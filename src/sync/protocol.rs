//! Wire protocol: JSON text frames with an `op` discriminator.
//!
//! Outbound messages are built as `serde_json::Value` (tx-steps are
//! heterogeneous arrays); inbound messages are routed by `op` and field
//! access is lenient about kebab- vs snake-case spellings, which both occur
//! in the wild.

use serde_json::{json, Map, Value};

use crate::error::{DbError, Result};

/// Client library version sent with session init.
pub const CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Lenient field access: `client-event-id` or `client_event_id`.
pub fn field<'a>(obj: &'a Value, name: &str) -> Option<&'a Value> {
    let map = obj.as_object()?;
    if let Some(v) = map.get(name) {
        return Some(v);
    }
    let alt = if name.contains('-') {
        name.replace('-', "_")
    } else {
        name.replace('_', "-")
    };
    map.get(&alt)
}

pub fn field_str<'a>(obj: &'a Value, name: &str) -> Option<&'a str> {
    field(obj, name).and_then(Value::as_str)
}

/// Session init, sent once per connection.
pub fn init_message(
    app_id: &str,
    refresh_token: Option<&str>,
    event_id: &str,
) -> Value {
    let mut msg = Map::new();
    msg.insert("op".to_string(), json!("init"));
    msg.insert("app-id".to_string(), json!(app_id));
    msg.insert("event-id".to_string(), json!(event_id));
    msg.insert("client-version".to_string(), json!(CLIENT_VERSION));
    if let Some(token) = refresh_token {
        msg.insert("refresh-token".to_string(), json!(token));
    }
    Value::Object(msg)
}

/// Local transaction on the wire.
pub fn transact_message(tx_steps: Vec<Value>, client_event_id: &str, created_ms: i64) -> Value {
    json!({
        "op": "transact",
        "tx-steps": tx_steps,
        "client-event-id": client_event_id,
        "created-ms": created_ms,
    })
}

/// Query subscription request.
pub fn add_query_message(query: &Value, event_id: &str) -> Value {
    json!({
        "op": "add-query",
        "q": query,
        "event-id": event_id,
    })
}

/// Attribute definition delivered by `init-ok` and `add-attr` steps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttrDef {
    pub id: String,
    pub namespace: String,
    pub name: String,
}

impl AttrDef {
    /// Parse `{id, forward-identity: [_, namespace, attr_name], ...}`.
    pub fn parse(value: &Value) -> Option<Self> {
        let id = field_str(value, "id")?.to_string();
        let identity = field(value, "forward-identity")?.as_array()?;
        let namespace = identity.get(1)?.as_str()?.to_string();
        let name = identity.get(2)?.as_str()?.to_string();
        Some(Self {
            id,
            namespace,
            name,
        })
    }
}

/// Parsed inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    InitOk {
        session_id: String,
        attrs: Vec<AttrDef>,
    },
    InitError {
        message: String,
    },
    TransactOk {
        client_event_id: String,
    },
    Transact {
        client_event_id: Option<String>,
        tx_steps: Vec<Value>,
    },
    /// `add-query-ok` / `query-response` / `refresh` / `refresh-ok`:
    /// carries materialized results in datalog form somewhere in `body`.
    QueryPayload {
        op: String,
        query: Option<Value>,
        body: Value,
    },
    InvalidateQuery {
        query: Option<Value>,
        body: Value,
    },
    ServerError {
        client_event_id: Option<String>,
        message: String,
    },
    Unknown {
        op: String,
    },
}

impl ServerMessage {
    pub fn parse(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)?;
        let op = field_str(&value, "op")
            .ok_or_else(|| DbError::Decode("message without op discriminator".to_string()))?
            .to_string();

        let msg = match op.as_str() {
            "init-ok" => {
                let session_id = field_str(&value, "session-id")
                    .ok_or_else(|| DbError::Decode("init-ok without session-id".to_string()))?
                    .to_string();
                let attrs = field(&value, "attrs")
                    .and_then(Value::as_array)
                    .map(|items| items.iter().filter_map(AttrDef::parse).collect())
                    .unwrap_or_default();
                ServerMessage::InitOk { session_id, attrs }
            }
            "init-error" => ServerMessage::InitError {
                message: field_str(&value, "message").unwrap_or("init rejected").to_string(),
            },
            "transact-ok" => {
                let client_event_id = field_str(&value, "client-event-id")
                    .ok_or_else(|| {
                        DbError::Decode("transact-ok without client-event-id".to_string())
                    })?
                    .to_string();
                ServerMessage::TransactOk { client_event_id }
            }
            "transact" => {
                let tx_steps = field(&value, "tx-steps")
                    .and_then(Value::as_array)
                    .cloned()
                    .ok_or_else(|| DbError::Decode("transact without tx-steps".to_string()))?;
                ServerMessage::Transact {
                    client_event_id: field_str(&value, "client-event-id").map(str::to_string),
                    tx_steps,
                }
            }
            "add-query-ok" | "query-response" | "refresh" | "refresh-ok" => {
                ServerMessage::QueryPayload {
                    op,
                    query: field(&value, "q").cloned(),
                    body: value,
                }
            }
            "invalidate-query" => ServerMessage::InvalidateQuery {
                query: field(&value, "q").cloned(),
                body: value,
            },
            "error" => ServerMessage::ServerError {
                client_event_id: field_str(&value, "client-event-id").map(str::to_string),
                message: field_str(&value, "message").unwrap_or("server error").to_string(),
            },
            _ => ServerMessage::Unknown { op },
        };
        Ok(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_message_shape() {
        let msg = init_message("app-1", Some("tok"), "ev-1");
        assert_eq!(msg["op"], json!("init"));
        assert_eq!(msg["app-id"], json!("app-1"));
        assert_eq!(msg["refresh-token"], json!("tok"));
        assert_eq!(msg["client-version"], json!(CLIENT_VERSION));

        let without_token = init_message("app-1", None, "ev-1");
        assert!(without_token.get("refresh-token").is_none());
    }

    #[test]
    fn parses_init_ok_with_attrs() {
        let text = r#"{
            "op": "init-ok",
            "session-id": "s-1",
            "attrs": [
                {"id": "A1", "forward-identity": ["u", "todos", "done"]},
                {"id": "broken"}
            ]
        }"#;
        let msg = ServerMessage::parse(text).unwrap();
        let ServerMessage::InitOk { session_id, attrs } = msg else {
            panic!("wrong variant");
        };
        assert_eq!(session_id, "s-1");
        assert_eq!(attrs.len(), 1);
        assert_eq!(attrs[0].id, "A1");
        assert_eq!(attrs[0].namespace, "todos");
        assert_eq!(attrs[0].name, "done");
    }

    #[test]
    fn accepts_snake_case_spellings() {
        let text = r#"{"op": "transact-ok", "client_event_id": "e-1", "tx_id": "t-1"}"#;
        let msg = ServerMessage::parse(text).unwrap();
        assert_eq!(
            msg,
            ServerMessage::TransactOk {
                client_event_id: "e-1".to_string(),
            }
        );
    }

    #[test]
    fn routes_query_payload_ops() {
        for op in ["add-query-ok", "query-response", "refresh", "refresh-ok"] {
            let text = format!(r#"{{"op": "{op}", "result": []}}"#);
            let msg = ServerMessage::parse(&text).unwrap();
            assert!(matches!(msg, ServerMessage::QueryPayload { .. }));
        }
    }

    #[test]
    fn unknown_op_is_not_an_error() {
        let msg = ServerMessage::parse(r#"{"op": "totally-new"}"#).unwrap();
        assert_eq!(
            msg,
            ServerMessage::Unknown {
                op: "totally-new".to_string()
            }
        );
    }

    #[test]
    fn missing_op_is_a_decode_error() {
        assert!(ServerMessage::parse(r#"{"hello": 1}"#).is_err());
        assert!(ServerMessage::parse("not json").is_err());
    }
}
