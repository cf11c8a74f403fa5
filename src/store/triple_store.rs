//! Durable triple store over SQLite.
//!
//! All persisted facts flow through [`TripleStore::apply`]; the store emits
//! one change event per logical triple mutation after the owning database
//! transaction commits, and the query engine consumes those events to
//! invalidate cached results.

use chrono::Utc;
use serde_json::{Map, Value};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{Row, SqliteConnection};
use std::path::Path;
use std::str::FromStr;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::domain::{
    deep_merge, normalize_entity_id, Operation, Transaction, Triple, TripleChange, TxOrigin,
    TxStatus, TYPE_ATTR,
};
use crate::error::{DbError, Result};

use super::filter;
use super::ordering::{self, AggregateSpec, Direction};
use super::txlog::TransactionLog;

const CHANGE_CHANNEL_CAPACITY: usize = 4096;
const SCHEMA_VERSION: i64 = 1;

/// Materialization request against the store.
#[derive(Debug, Clone, Default)]
pub struct EntityQuery {
    pub entity_type: Option<String>,
    pub where_clause: Option<Value>,
    pub order_by: Vec<(String, Direction)>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    pub aggregate: Option<AggregateSpec>,
    pub group_by: Option<String>,
}

/// SQLite-backed triple store plus collocated transaction log.
pub struct TripleStore {
    pool: SqlitePool,
    txlog: TransactionLog,
    changes_tx: broadcast::Sender<TripleChange>,
}

impl TripleStore {
    /// Open (or create) the store at `path`; `None` opens an in-memory
    /// database. The pool is capped at one connection so every write
    /// serializes through the same handle.
    pub async fn open(path: Option<&Path>) -> Result<Self> {
        let options = match path {
            Some(path) => SqliteConnectOptions::new()
                .filename(path)
                .create_if_missing(true)
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal),
            None => SqliteConnectOptions::from_str("sqlite::memory:")
                .map_err(DbError::Storage)?,
        };

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let txlog = TransactionLog::new(pool.clone());
        let (changes_tx, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);

        let store = Self {
            pool,
            txlog,
            changes_tx,
        };
        store.init_schema().await?;

        info!(path = ?path, "triple store opened");
        Ok(store)
    }

    /// In-memory store for tests and ephemeral clients.
    pub async fn in_memory() -> Result<Self> {
        Self::open(None).await
    }

    async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS triples (
                entity_id TEXT NOT NULL,
                attribute TEXT NOT NULL,
                value TEXT NOT NULL,
                tx_id TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                retracted INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        for ddl in [
            "CREATE INDEX IF NOT EXISTS idx_triples_entity ON triples(entity_id)",
            "CREATE INDEX IF NOT EXISTS idx_triples_attribute ON triples(attribute)",
            "CREATE INDEX IF NOT EXISTS idx_triples_tx ON triples(tx_id)",
            "CREATE INDEX IF NOT EXISTS idx_triples_created ON triples(created_at)",
        ] {
            sqlx::query(ddl).execute(&self.pool).await?;
        }

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS metadata (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("INSERT INTO metadata (key, value) VALUES ('schema_version', ?) ON CONFLICT(key) DO NOTHING")
            .bind(SCHEMA_VERSION.to_string())
            .execute(&self.pool)
            .await?;

        self.txlog.init_schema().await?;
        Ok(())
    }

    /// Schema version recorded in the metadata table.
    pub async fn schema_version(&self) -> Result<i64> {
        let row = sqlx::query("SELECT value FROM metadata WHERE key = 'schema_version'")
            .fetch_optional(&self.pool)
            .await?;
        Ok(row
            .and_then(|r| r.get::<String, _>("value").parse().ok())
            .unwrap_or(SCHEMA_VERSION))
    }

    /// Subscribe to the change stream. Events are emitted in apply order,
    /// after commit.
    pub fn changes(&self) -> broadcast::Receiver<TripleChange> {
        self.changes_tx.subscribe()
    }

    /// Transaction log accessor (point lookups, status reads).
    pub fn txlog(&self) -> &TransactionLog {
        &self.txlog
    }

    /// Apply a transaction atomically. Idempotent on `tx.id`: a second
    /// apply is a no-op. Change events are emitted after commit, in
    /// operation order.
    pub async fn apply(&self, tx: &Transaction) -> Result<()> {
        let mut db = self.pool.begin().await?;

        if self.txlog.exists(&mut db, &tx.id).await? {
            debug!(tx_id = %tx.id, "transaction already applied, skipping");
            return Ok(());
        }

        let recorded = match tx.origin {
            TxOrigin::Local => TxStatus::Committed,
            TxOrigin::Remote => TxStatus::Synced,
        };
        self.txlog.record(&mut db, tx, recorded).await?;

        let now = Utc::now().timestamp_millis();
        let mut changes: Vec<TripleChange> = Vec::new();

        for op in &tx.operations {
            self.apply_operation(&mut db, op, &tx.id, now, &mut changes)
                .await?;
        }

        db.commit().await?;

        debug!(tx_id = %tx.id, events = changes.len(), "transaction applied");
        for change in changes {
            let _ = self.changes_tx.send(change);
        }
        Ok(())
    }

    async fn apply_operation(
        &self,
        conn: &mut SqliteConnection,
        op: &Operation,
        tx_id: &str,
        now: i64,
        changes: &mut Vec<TripleChange>,
    ) -> Result<()> {
        match op {
            Operation::Add {
                entity_id,
                attr,
                value,
                ..
            } => {
                let entity_id = valid_id(entity_id)?;
                self.insert_triple(conn, &entity_id, attr, value, tx_id, now, changes)
                    .await?;
            }
            Operation::Update {
                entity_id,
                attr,
                value,
            } => {
                let entity_id = valid_id(entity_id)?;
                self.retract_attribute(conn, &entity_id, attr, None, now, changes)
                    .await?;
                self.insert_triple(conn, &entity_id, attr, value, tx_id, now, changes)
                    .await?;
            }
            Operation::Delete { entity_id } => {
                let entity_id = valid_id(entity_id)?;
                self.retract_entity(conn, &entity_id, now, changes).await?;
            }
            Operation::Retract {
                entity_id,
                attr,
                value,
            } => {
                let entity_id = valid_id(entity_id)?;
                self.retract_attribute(conn, &entity_id, attr, Some(value), now, changes)
                    .await?;
            }
            Operation::Link {
                from_entity,
                relation,
                to_entity,
            } => {
                let from = valid_id(from_entity)?;
                let to = valid_id(to_entity)?;
                let current = self.current_value_in(conn, &from, relation).await?;
                let next = match current {
                    None => Value::String(to),
                    Some(Value::Array(mut items)) => {
                        if items.iter().any(|v| v.as_str() == Some(to.as_str())) {
                            return Ok(());
                        }
                        items.push(Value::String(to));
                        Value::Array(items)
                    }
                    // scalar promotes to a list on the second link
                    Some(existing) => {
                        if existing.as_str() == Some(to.as_str()) {
                            return Ok(());
                        }
                        Value::Array(vec![existing, Value::String(to)])
                    }
                };
                self.retract_attribute(conn, &from, relation, None, now, changes)
                    .await?;
                self.insert_triple(conn, &from, relation, &next, tx_id, now, changes)
                    .await?;
            }
            Operation::Unlink {
                from_entity,
                relation,
                to_entity,
            } => {
                let from = valid_id(from_entity)?;
                let to = valid_id(to_entity)?;
                let current = self.current_value_in(conn, &from, relation).await?;
                match current {
                    Some(Value::Array(items)) => {
                        let remaining: Vec<Value> = items
                            .into_iter()
                            .filter(|v| v.as_str() != Some(to.as_str()))
                            .collect();
                        self.retract_attribute(conn, &from, relation, None, now, changes)
                            .await?;
                        if !remaining.is_empty() {
                            self.insert_triple(
                                conn,
                                &from,
                                relation,
                                &Value::Array(remaining),
                                tx_id,
                                now,
                                changes,
                            )
                            .await?;
                        }
                    }
                    Some(existing) if existing.as_str() == Some(to.as_str()) => {
                        self.retract_attribute(conn, &from, relation, None, now, changes)
                            .await?;
                    }
                    _ => {}
                }
            }
            Operation::Merge { entity_id, partial } => {
                let entity_id = valid_id(entity_id)?;
                let Some(patch) = partial.as_object() else {
                    return Err(DbError::Validation(
                        "merge payload must be an object".to_string(),
                    ));
                };
                let current = self.entity_map_in(conn, &entity_id).await?;
                for (attr, patch_value) in patch {
                    let merged = match current.get(attr) {
                        Some(existing) => deep_merge(existing, patch_value),
                        None => patch_value.clone(),
                    };
                    self.retract_attribute(conn, &entity_id, attr, None, now, changes)
                        .await?;
                    self.insert_triple(conn, &entity_id, attr, &merged, tx_id, now, changes)
                        .await?;
                }
            }
        }
        Ok(())
    }

    async fn insert_triple(
        &self,
        conn: &mut SqliteConnection,
        entity_id: &str,
        attr: &str,
        value: &Value,
        tx_id: &str,
        now: i64,
        changes: &mut Vec<TripleChange>,
    ) -> Result<()> {
        let encoded = serde_json::to_string(value)?;
        sqlx::query(
            r#"
            INSERT INTO triples (entity_id, attribute, value, tx_id, created_at, retracted)
            VALUES (?, ?, ?, ?, ?, 0)
            "#,
        )
        .bind(entity_id)
        .bind(attr)
        .bind(&encoded)
        .bind(tx_id)
        .bind(now)
        .execute(&mut *conn)
        .await?;

        changes.push(TripleChange::added(Triple {
            entity_id: entity_id.to_string(),
            attribute: attr.to_string(),
            value: value.clone(),
            tx_id: tx_id.to_string(),
            created_at: now,
            retracted: false,
        }));
        Ok(())
    }

    /// Retract non-retracted triples of (entity, attr), optionally only
    /// those carrying a specific value.
    async fn retract_attribute(
        &self,
        conn: &mut SqliteConnection,
        entity_id: &str,
        attr: &str,
        value: Option<&Value>,
        now: i64,
        changes: &mut Vec<TripleChange>,
    ) -> Result<()> {
        let rows = sqlx::query(
            r#"
            SELECT rowid, entity_id, attribute, value, tx_id, created_at
            FROM triples
            WHERE entity_id = ? AND attribute = ? AND retracted = 0
            ORDER BY created_at ASC, rowid ASC
            "#,
        )
        .bind(entity_id)
        .bind(attr)
        .fetch_all(&mut *conn)
        .await?;

        let target = value.map(|v| serde_json::to_string(v)).transpose()?;

        for row in rows {
            let encoded: String = row.get("value");
            if let Some(target) = &target {
                if &encoded != target {
                    continue;
                }
            }
            let rowid: i64 = row.get("rowid");
            sqlx::query("UPDATE triples SET retracted = 1 WHERE rowid = ?")
                .bind(rowid)
                .execute(&mut *conn)
                .await?;
            changes.push(TripleChange::retracted(triple_from_row(&row, true)?));
        }
        Ok(())
    }

    async fn retract_entity(
        &self,
        conn: &mut SqliteConnection,
        entity_id: &str,
        now: i64,
        changes: &mut Vec<TripleChange>,
    ) -> Result<()> {
        let rows = sqlx::query(
            r#"
            SELECT rowid, entity_id, attribute, value, tx_id, created_at
            FROM triples
            WHERE entity_id = ? AND retracted = 0
            ORDER BY created_at ASC, rowid ASC
            "#,
        )
        .bind(entity_id)
        .fetch_all(&mut *conn)
        .await?;

        for row in rows {
            let rowid: i64 = row.get("rowid");
            sqlx::query("UPDATE triples SET retracted = 1 WHERE rowid = ?")
                .bind(rowid)
                .execute(&mut *conn)
                .await?;
            changes.push(TripleChange::retracted(triple_from_row(&row, true)?));
        }
        Ok(())
    }

    async fn current_value_in(
        &self,
        conn: &mut SqliteConnection,
        entity_id: &str,
        attr: &str,
    ) -> Result<Option<Value>> {
        let row = sqlx::query(
            r#"
            SELECT value FROM triples
            WHERE entity_id = ? AND attribute = ? AND retracted = 0
            ORDER BY created_at DESC, rowid DESC
            LIMIT 1
            "#,
        )
        .bind(entity_id)
        .bind(attr)
        .fetch_optional(&mut *conn)
        .await?;

        row.map(|r| serde_json::from_str(&r.get::<String, _>("value")).map_err(DbError::Json))
            .transpose()
    }

    async fn entity_map_in(
        &self,
        conn: &mut SqliteConnection,
        entity_id: &str,
    ) -> Result<Map<String, Value>> {
        let rows = sqlx::query(
            r#"
            SELECT attribute, value FROM triples
            WHERE entity_id = ? AND retracted = 0
            ORDER BY created_at ASC, rowid ASC
            "#,
        )
        .bind(entity_id)
        .fetch_all(&mut *conn)
        .await?;

        fold_attribute_rows(entity_id, rows)
    }

    /// The current attribute map of an entity, or `None` when the entity
    /// has no non-retracted triples.
    pub async fn current_entity(&self, entity_id: &str) -> Result<Option<Map<String, Value>>> {
        let rows = sqlx::query(
            r#"
            SELECT attribute, value FROM triples
            WHERE entity_id = ? AND retracted = 0
            ORDER BY created_at ASC, rowid ASC
            "#,
        )
        .bind(entity_id)
        .fetch_all(&self.pool)
        .await?;

        if rows.is_empty() {
            return Ok(None);
        }
        Ok(Some(fold_attribute_rows(entity_id, rows)?))
    }

    /// Current `__type` of an entity, if any.
    pub async fn entity_type_of(&self, entity_id: &str) -> Result<Option<String>> {
        let row = sqlx::query(
            r#"
            SELECT value FROM triples
            WHERE entity_id = ? AND attribute = ? AND retracted = 0
            ORDER BY created_at DESC, rowid DESC
            LIMIT 1
            "#,
        )
        .bind(entity_id)
        .bind(TYPE_ATTR)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.and_then(|r| {
            serde_json::from_str::<Value>(&r.get::<String, _>("value"))
                .ok()
                .and_then(|v| v.as_str().map(str::to_string))
        }))
    }

    /// Ids of entities whose current `__type` equals `entity_type`.
    pub async fn entities_of_type(&self, entity_type: &str) -> Result<Vec<String>> {
        let encoded = serde_json::to_string(&Value::String(entity_type.to_string()))?;
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT entity_id FROM triples
            WHERE attribute = ? AND retracted = 0 AND value = ?
            ORDER BY entity_id ASC
            "#,
        )
        .bind(TYPE_ATTR)
        .bind(encoded)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(|r| r.get("entity_id")).collect())
    }

    async fn all_entity_ids(&self) -> Result<Vec<String>> {
        let rows = sqlx::query(
            "SELECT DISTINCT entity_id FROM triples WHERE retracted = 0 ORDER BY entity_id ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(|r| r.get("entity_id")).collect())
    }

    /// Materialize entities: collect current attribute maps, filter, sort,
    /// paginate. Aggregation mode ignores limit/offset and returns via
    /// [`TripleStore::aggregate_entities`].
    pub async fn query_entities(&self, query: &EntityQuery) -> Result<Vec<Map<String, Value>>> {
        let ids = match &query.entity_type {
            Some(t) => self.entities_of_type(t).await?,
            None => self.all_entity_ids().await?,
        };

        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            let Some(entity) = self.current_entity(&id).await? else {
                continue;
            };
            if let Some(clause) = &query.where_clause {
                if !filter::matches(&entity, clause) {
                    continue;
                }
            }
            out.push(entity);
        }

        ordering::sort_entities(&mut out, &query.order_by);
        Ok(ordering::paginate(out, query.limit, query.offset))
    }

    /// Aggregate over filtered entities; limit/offset do not apply.
    pub async fn aggregate_entities(&self, query: &EntityQuery) -> Result<Value> {
        let Some(spec) = &query.aggregate else {
            return Err(DbError::InvalidQuery(
                "aggregate_entities requires an aggregate spec".to_string(),
            ));
        };

        let flat = EntityQuery {
            entity_type: query.entity_type.clone(),
            where_clause: query.where_clause.clone(),
            ..Default::default()
        };
        let rows = self.query_entities(&flat).await?;
        Ok(ordering::aggregate(&rows, spec, query.group_by.as_deref()))
    }

    /// Mark the transaction failed and retract every triple bearing its id.
    pub async fn rollback(&self, tx_id: &str) -> Result<()> {
        let mut db = self.pool.begin().await?;

        self.txlog
            .set_status_in(&mut db, tx_id, TxStatus::Failed)
            .await?;

        let now = Utc::now().timestamp_millis();
        let rows = sqlx::query(
            r#"
            SELECT rowid, entity_id, attribute, value, tx_id, created_at
            FROM triples
            WHERE tx_id = ? AND retracted = 0
            ORDER BY created_at ASC, rowid ASC
            "#,
        )
        .bind(tx_id)
        .fetch_all(&mut *db)
        .await?;

        let mut changes = Vec::with_capacity(rows.len());
        for row in rows {
            let rowid: i64 = row.get("rowid");
            sqlx::query("UPDATE triples SET retracted = 1 WHERE rowid = ?")
                .bind(rowid)
                .execute(&mut *db)
                .await?;
            changes.push(TripleChange::retracted(triple_from_row(&row, true)?));
        }

        db.commit().await?;

        warn!(tx_id = %tx_id, retracted = changes.len(), "transaction rolled back");
        for change in changes {
            let _ = self.changes_tx.send(change);
        }
        Ok(())
    }

    /// All non-synced, non-failed transactions in timestamp order.
    pub async fn pending_transactions(&self) -> Result<Vec<Transaction>> {
        self.txlog.pending().await
    }

    pub async fn mark_synced(&self, tx_id: &str) -> Result<()> {
        self.txlog.set_status(tx_id, TxStatus::Synced).await
    }

    pub async fn mark_failed(&self, tx_ids: &[String]) -> Result<()> {
        for tx_id in tx_ids {
            self.txlog.set_status(tx_id, TxStatus::Failed).await?;
        }
        Ok(())
    }

    /// Publish a synthetic change for `entity_type` so subscribers
    /// re-materialize without any underlying triple mutation. Used when the
    /// server invalidates a query without inline data.
    pub fn notify_refresh(&self, entity_type: &str) {
        let _ = self.changes_tx.send(TripleChange::added(Triple {
            entity_id: String::new(),
            attribute: TYPE_ATTR.to_string(),
            value: Value::String(entity_type.to_string()),
            tx_id: String::new(),
            created_at: Utc::now().timestamp_millis(),
            retracted: false,
        }));
    }
}

fn valid_id(raw: &str) -> Result<String> {
    normalize_entity_id(raw)
        .ok_or_else(|| DbError::Validation(format!("invalid entity id: {raw:?}")))
}

fn triple_from_row(row: &sqlx::sqlite::SqliteRow, retracted: bool) -> Result<Triple> {
    let encoded: String = row.get("value");
    Ok(Triple {
        entity_id: row.get("entity_id"),
        attribute: row.get("attribute"),
        value: serde_json::from_str(&encoded)?,
        tx_id: row.get("tx_id"),
        created_at: row.get("created_at"),
        retracted,
    })
}

fn fold_attribute_rows(
    entity_id: &str,
    rows: Vec<sqlx::sqlite::SqliteRow>,
) -> Result<Map<String, Value>> {
    let mut map = Map::new();
    map.insert("id".to_string(), Value::String(entity_id.to_string()));
    for row in rows {
        let attr: String = row.get("attribute");
        let encoded: String = row.get("value");
        let value: Value = serde_json::from_str(&encoded)?;
        map.insert(attr, value);
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ChangeKind;
    use serde_json::json;
    use uuid::Uuid;

    fn id() -> String {
        Uuid::new_v4().to_string()
    }

    fn create_ops(entity_type: &str, entity_id: &str, attrs: Value) -> Vec<Operation> {
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
        ops
    }

    async fn seeded_store() -> (TripleStore, String) {
        let store = TripleStore::in_memory().await.unwrap();
        let e1 = id();
        let tx = Transaction::new_local(create_ops("todos", &e1, json!({"text": "hello"})));
        store.apply(&tx).await.unwrap();
        (store, e1)
    }

    #[tokio::test]
    async fn apply_is_idempotent() {
        let store = TripleStore::in_memory().await.unwrap();
        let e = id();
        let tx = Transaction::new_local(create_ops("todos", &e, json!({"text": "once"})));
        store.apply(&tx).await.unwrap();

        let mut replay = tx.clone();
        replay.operations.push(Operation::Update {
            entity_id: e.clone(),
            attr: "text".to_string(),
            value: json!("mutated"),
        });
        // same id, different payload: second apply must be a no-op
        store.apply(&replay).await.unwrap();

        let entity = store.current_entity(&e).await.unwrap().unwrap();
        assert_eq!(entity["text"], json!("once"));
    }

    #[tokio::test]
    async fn update_retracts_prior_values() {
        let (store, e1) = seeded_store().await;
        let tx = Transaction::new_local(vec![Operation::Update {
            entity_id: e1.clone(),
            attr: "text".to_string(),
            value: json!("updated"),
        }]);
        store.apply(&tx).await.unwrap();

        let entity = store.current_entity(&e1).await.unwrap().unwrap();
        assert_eq!(entity["text"], json!("updated"));

        let q = EntityQuery {
            entity_type: Some("todos".to_string()),
            ..Default::default()
        };
        let rows = store.query_entities(&q).await.unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn delete_retracts_everything() {
        let (store, e1) = seeded_store().await;
        let tx = Transaction::new_local(vec![Operation::Delete {
            entity_id: e1.clone(),
        }]);
        store.apply(&tx).await.unwrap();

        assert!(store.current_entity(&e1).await.unwrap().is_none());
        assert!(store.entities_of_type("todos").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rollback_retracts_transaction_triples() {
        let (store, e1) = seeded_store().await;
        let update = Transaction::new_local(vec![Operation::Update {
            entity_id: e1.clone(),
            attr: "text".to_string(),
            value: json!("doomed"),
        }]);
        store.apply(&update).await.unwrap();
        store.rollback(&update.id).await.unwrap();

        assert_eq!(
            store.txlog().status(&update.id).await.unwrap(),
            Some(TxStatus::Failed)
        );
        // prior value was retracted by the update, so the attribute is gone;
        // no triple of the failed tx survives
        let entity = store.current_entity(&e1).await.unwrap().unwrap();
        assert!(entity.get("text").is_none());
    }

    #[tokio::test]
    async fn link_promotes_scalar_to_list() {
        let store = TripleStore::in_memory().await.unwrap();
        let (a, b, c) = (id(), id(), id());
        let setup = Transaction::new_local(create_ops("teams", &a, json!({})));
        store.apply(&setup).await.unwrap();

        let l1 = Transaction::new_local(vec![Operation::Link {
            from_entity: a.clone(),
            relation: "member_ids".to_string(),
            to_entity: b.clone(),
        }]);
        store.apply(&l1).await.unwrap();
        let entity = store.current_entity(&a).await.unwrap().unwrap();
        assert_eq!(entity["member_ids"], json!(b));

        let l2 = Transaction::new_local(vec![Operation::Link {
            from_entity: a.clone(),
            relation: "member_ids".to_string(),
            to_entity: c.clone(),
        }]);
        store.apply(&l2).await.unwrap();
        let entity = store.current_entity(&a).await.unwrap().unwrap();
        assert_eq!(entity["member_ids"], json!([b, c]));

        let u = Transaction::new_local(vec![Operation::Unlink {
            from_entity: a.clone(),
            relation: "member_ids".to_string(),
            to_entity: b.clone(),
        }]);
        store.apply(&u).await.unwrap();
        let entity = store.current_entity(&a).await.unwrap().unwrap();
        assert_eq!(entity["member_ids"], json!([c]));
    }

    #[tokio::test]
    async fn merge_deep_merges_objects_and_replaces_scalars() {
        let store = TripleStore::in_memory().await.unwrap();
        let e = id();
        let setup = Transaction::new_local(create_ops(
            "todos",
            &e,
            json!({"meta": {"a": 1, "b": 2}, "text": "x"}),
        ));
        store.apply(&setup).await.unwrap();

        let merge = Transaction::new_local(vec![Operation::Merge {
            entity_id: e.clone(),
            partial: json!({"meta": {"b": 3, "c": 4}, "text": "y"}),
        }]);
        store.apply(&merge).await.unwrap();

        let entity = store.current_entity(&e).await.unwrap().unwrap();
        assert_eq!(entity["meta"], json!({"a": 1, "b": 3, "c": 4}));
        assert_eq!(entity["text"], json!("y"));
    }

    #[tokio::test]
    async fn invalid_entity_id_fails_whole_transaction() {
        let store = TripleStore::in_memory().await.unwrap();
        let tx = Transaction::new_local(vec![Operation::Add {
            entity_type: "todos".to_string(),
            entity_id: "not-a-uuid".to_string(),
            attr: "text".to_string(),
            value: json!("x"),
        }]);
        assert!(matches!(
            store.apply(&tx).await,
            Err(DbError::Validation(_))
        ));
        assert!(store.all_entity_ids().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn stringified_array_entity_id_is_normalized() {
        let store = TripleStore::in_memory().await.unwrap();
        let real = id();
        let mangled = format!("[\"{}\", \"{}\"]", real, id());
        let tx = Transaction::new_local(create_ops("todos", &mangled, json!({"text": "x"})));
        store.apply(&tx).await.unwrap();

        let entity = store.current_entity(&real).await.unwrap().unwrap();
        assert_eq!(entity["text"], json!("x"));
    }

    #[tokio::test]
    async fn change_events_arrive_after_commit_in_order() {
        let (store, e1) = seeded_store().await;
        let mut rx = store.changes();

        let tx = Transaction::new_local(vec![Operation::Update {
            entity_id: e1.clone(),
            attr: "text".to_string(),
            value: json!("v2"),
        }]);
        store.apply(&tx).await.unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!(first.kind, ChangeKind::Retract);
        assert_eq!(first.triple.attribute, "text");
        let second = rx.recv().await.unwrap();
        assert_eq!(second.kind, ChangeKind::Add);
        assert_eq!(second.triple.value, json!("v2"));
    }

    #[tokio::test]
    async fn pending_transactions_in_timestamp_order() {
        let (store, e1) = seeded_store().await;
        let t2 = Transaction::new_local(vec![Operation::Update {
            entity_id: e1.clone(),
            attr: "text".to_string(),
            value: json!("two"),
        }]);
        store.apply(&t2).await.unwrap();

        let pending = store.pending_transactions().await.unwrap();
        assert_eq!(pending.len(), 2);
        assert!(pending[0].timestamp_ms <= pending[1].timestamp_ms);

        store.mark_synced(&pending[0].id).await.unwrap();
        let pending = store.pending_transactions().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, t2.id);
    }

    #[tokio::test]
    async fn query_filters_orders_and_paginates() {
        let store = TripleStore::in_memory().await.unwrap();
        for (text, rank) in [("a", 3), ("b", 1), ("c", 2)] {
            let e = id();
            let tx = Transaction::new_local(create_ops(
                "todos",
                &e,
                json!({"text": text, "rank": rank}),
            ));
            store.apply(&tx).await.unwrap();
        }

        let q = EntityQuery {
            entity_type: Some("todos".to_string()),
            where_clause: Some(json!({"rank": {"$gte": 2}})),
            order_by: vec![("rank".to_string(), Direction::Desc)],
            ..Default::default()
        };
        let rows = store.query_entities(&q).await.unwrap();
        let texts: Vec<&str> = rows.iter().map(|r| r["text"].as_str().unwrap()).collect();
        assert_eq!(texts, ["a", "c"]);

        let q = EntityQuery {
            entity_type: Some("todos".to_string()),
            aggregate: Some(AggregateSpec {
                op: ordering::AggregateOp::Count,
                field: None,
            }),
            ..Default::default()
        };
        assert_eq!(store.aggregate_entities(&q).await.unwrap(), json!(3));
    }
}
