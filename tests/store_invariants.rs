//! Store-level invariants and wire round-trips.

use serde_json::json;
use uuid::Uuid;

use tripledb::sync::{decode, encode};
use tripledb::{
    AttributeCache, EntityQuery, Operation, Transaction, TripleStore, TxStatus, TYPE_ATTR,
};

fn id() -> String {
    Uuid::new_v4().to_string()
}

fn create_tx(entity_type: &str, entity_id: &str, attrs: serde_json::Value) -> Transaction {
    let mut ops = vec![Operation::Add {
        entity_type: entity_type.to_string(),
        entity_id: entity_id.to_string(),
        attr: TYPE_ATTR.to_string(),
        value: json!(entity_type),
    }];
    for (attr, value) in attrs.as_object().unwrap() {
        ops.push(Operation::Add {
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            attr: attr.clone(),
            value: value.clone(),
        });
    }
    Transaction::new_local(ops)
}

#[tokio::test]
async fn current_value_is_newest_non_retracted() {
    let store = TripleStore::in_memory().await.unwrap();
    let e = id();
    store.apply(&create_tx("todos", &e, json!({"text": "v1"}))).await.unwrap();

    let update = Transaction::new_local(vec![Operation::Update {
        entity_id: e.clone(),
        attr: "text".to_string(),
        value: json!("v2"),
    }]);
    store.apply(&update).await.unwrap();

    let entity = store.current_entity(&e).await.unwrap().unwrap();
    assert_eq!(entity["text"], json!("v2"));

    // retracting the newest value re-exposes nothing (prior was retracted
    // by the update)
    store.rollback(&update.id).await.unwrap();
    let entity = store.current_entity(&e).await.unwrap().unwrap();
    assert!(entity.get("text").is_none());
}

#[tokio::test]
async fn failed_transactions_leave_no_visible_triples() {
    let store = TripleStore::in_memory().await.unwrap();
    let e = id();
    let tx = create_tx("todos", &e, json!({"text": "x", "rank": 1}));
    store.apply(&tx).await.unwrap();
    store.rollback(&tx.id).await.unwrap();

    assert_eq!(store.txlog().status(&tx.id).await.unwrap(), Some(TxStatus::Failed));
    assert!(store.current_entity(&e).await.unwrap().is_none());
    assert!(store.entities_of_type("todos").await.unwrap().is_empty());
}

#[tokio::test]
async fn live_entities_have_exactly_one_type() {
    let store = TripleStore::in_memory().await.unwrap();
    let e = id();
    store.apply(&create_tx("todos", &e, json!({"text": "x"}))).await.unwrap();

    // a second type write must replace, not accumulate
    let retype = Transaction::new_local(vec![Operation::Update {
        entity_id: e.clone(),
        attr: TYPE_ATTR.to_string(),
        value: json!("todos"),
    }]);
    store.apply(&retype).await.unwrap();

    assert_eq!(store.entities_of_type("todos").await.unwrap(), vec![e.clone()]);
    assert_eq!(store.entity_type_of(&e).await.unwrap(), Some("todos".to_string()));
}

#[tokio::test]
async fn double_apply_is_identical_to_single_apply() {
    let store = TripleStore::in_memory().await.unwrap();
    let e = id();
    let tx = create_tx("todos", &e, json!({"text": "once"}));
    store.apply(&tx).await.unwrap();
    let before = store
        .query_entities(&EntityQuery {
            entity_type: Some("todos".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();

    store.apply(&tx).await.unwrap();
    let after = store
        .query_entities(&EntityQuery {
            entity_type: Some("todos".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(before, after);
}

#[tokio::test]
async fn encode_decode_round_trip_reproduces_state() {
    let source = TripleStore::in_memory().await.unwrap();
    let e = id();
    let tx = create_tx("todos", &e, json!({"text": "hello", "rank": 3}));
    source.apply(&tx).await.unwrap();

    // encode against an empty attribute cache: dotted fallback names
    let attrs = AttributeCache::default();
    let steps = encode::encode_transaction(&tx, &attrs);

    // decode on the other side and apply to a fresh store
    let decoded = decode::decode_tx_steps(&steps, &attrs);
    assert_eq!(decoded.skipped, 0);
    let replayed = Transaction::new_remote(id(), decoded.operations);
    let target = TripleStore::in_memory().await.unwrap();
    target.apply(&replayed).await.unwrap();

    let q = EntityQuery {
        entity_type: Some("todos".to_string()),
        ..Default::default()
    };
    let source_rows = source.query_entities(&q).await.unwrap();
    let target_rows = target.query_entities(&q).await.unwrap();
    assert_eq!(source_rows, target_rows);
}

#[tokio::test]
async fn datalog_decode_matches_query_results() {
    let attrs = AttributeCache::default();
    attrs.register("todos", "done", "A1");
    attrs.register("todos", "text", "A2");

    let e = id();
    let rows = vec![
        json!([e, "A1", true, 0]),
        json!([e, "A2", "from server", 0]),
    ];
    let result = decode::decode_join_rows(&rows, Some("todos"), &attrs);
    let ops = decode::entities_to_operations(&result.entities);

    let store = TripleStore::in_memory().await.unwrap();
    store
        .apply(&Transaction::new_remote(id(), ops))
        .await
        .unwrap();

    let queried = store
        .query_entities(&EntityQuery {
            entity_type: Some("todos".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    let queried_ids: Vec<&str> = queried
        .iter()
        .map(|r| r["id"].as_str().unwrap())
        .collect();
    let payload_ids: Vec<&str> = result
        .entities
        .iter()
        .map(|r| r["id"].as_str().unwrap())
        .collect();
    assert_eq!(queried_ids, payload_ids);
    assert_eq!(queried[0]["done"], json!(true));
    assert_eq!(queried[0]["text"], json!("from server"));
}

#[tokio::test]
async fn remote_transactions_record_as_synced() {
    let store = TripleStore::in_memory().await.unwrap();
    let e = id();
    let remote = Transaction::new_remote(
        id(),
        vec![Operation::Add {
            entity_type: "todos".to_string(),
            entity_id: e,
            attr: TYPE_ATTR.to_string(),
            value: json!("todos"),
        }],
    );
    store.apply(&remote).await.unwrap();

    assert_eq!(
        store.txlog().status(&remote.id).await.unwrap(),
        Some(TxStatus::Synced)
    );
    // synced transactions never appear in the replay set
    assert!(store.pending_transactions().await.unwrap().is_empty());
}
