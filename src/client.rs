//! Client facade: id generation, transaction construction, query
//! subscription, and lifecycle.

use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::sync::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ClientConfig;
use crate::domain::{
    is_valid_entity_id, Operation, Transaction, TxStatus, TYPE_ATTR,
};
use crate::error::{DbError, Result};
use crate::query::{QueryEngine, QueryHandle};
use crate::store::TripleStore;
use crate::sync::{Connector, SyncConfig, SyncEngine, WsConnector};

/// Outcome of `transact`: the transaction is applied optimistically and
/// returned as `Pending`; poll [`Client::transaction_status`] to observe
/// the `Synced` or `Failed` outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionResult {
    pub tx_id: String,
    pub status: TxStatus,
}

/// A batch of operations built fluently, one entity at a time.
#[derive(Debug, Clone, Default)]
pub struct TxChunk {
    operations: Vec<Operation>,
}

impl TxChunk {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scope the following calls to one entity of one type.
    pub fn entity(&mut self, entity_type: &str, entity_id: &str) -> EntityTx<'_> {
        EntityTx {
            operations: &mut self.operations,
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            typed: false,
        }
    }

    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    pub fn into_operations(self) -> Vec<Operation> {
        self.operations
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

/// Operation builder for one entity. Purely compositional: it only
/// constructs [`Operation`] values.
pub struct EntityTx<'a> {
    operations: &'a mut Vec<Operation>,
    entity_type: String,
    entity_id: String,
    typed: bool,
}

impl EntityTx<'_> {
    /// Writes carry the entity's type so a fresh entity ends up with its
    /// `__type` triple.
    fn ensure_type(&mut self) {
        if !self.typed {
            self.operations.push(Operation::Update {
                entity_id: self.entity_id.clone(),
                attr: TYPE_ATTR.to_string(),
                value: Value::String(self.entity_type.clone()),
            });
            self.typed = true;
        }
    }

    /// Set attributes, replacing prior values.
    pub fn update(mut self, attrs: Value) -> Self {
        self.ensure_type();
        if let Some(attrs) = attrs.as_object() {
            for (attr, value) in attrs {
                self.operations.push(Operation::Update {
                    entity_id: self.entity_id.clone(),
                    attr: attr.clone(),
                    value: value.clone(),
                });
            }
        }
        self
    }

    /// Deep-merge a partial object into the entity.
    pub fn merge(mut self, partial: Value) -> Self {
        self.ensure_type();
        self.operations.push(Operation::Merge {
            entity_id: self.entity_id.clone(),
            partial,
        });
        self
    }

    /// Append a related entity id to a multi-valued relation.
    pub fn link(mut self, relation: &str, to_entity: &str) -> Self {
        self.ensure_type();
        self.operations.push(Operation::Link {
            from_entity: self.entity_id.clone(),
            relation: relation.to_string(),
            to_entity: to_entity.to_string(),
        });
        self
    }

    /// Remove a related entity id from a relation.
    pub fn unlink(mut self, relation: &str, to_entity: &str) -> Self {
        self.ensure_type();
        self.operations.push(Operation::Unlink {
            from_entity: self.entity_id.clone(),
            relation: relation.to_string(),
            to_entity: to_entity.to_string(),
        });
        self
    }

    /// Retract every triple of the entity.
    pub fn delete(self) {
        self.operations.push(Operation::Delete {
            entity_id: self.entity_id.clone(),
        });
    }
}

/// The database client. Owns the store, the query engine and the sync
/// engine; all state lives behind this instance and is torn down by
/// [`Client::dispose`].
pub struct Client {
    app_id: String,
    store: Arc<TripleStore>,
    queries: Arc<QueryEngine>,
    sync: Option<Arc<SyncEngine>>,
    offline_status: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    read_only: AtomicBool,
    disposed: AtomicBool,
}

impl Client {
    /// Initialize a client for `app_id` with the production WebSocket
    /// connector.
    pub async fn init(app_id: &str, config: ClientConfig) -> Result<Arc<Self>> {
        Self::init_with_connector(app_id, config, Box::new(WsConnector)).await
    }

    /// Initialize with a custom transport connector (tests, platform
    /// shims).
    pub async fn init_with_connector(
        app_id: &str,
        config: ClientConfig,
        connector: Box<dyn Connector>,
    ) -> Result<Arc<Self>> {
        let problems = config.validate();
        if !problems.is_empty() {
            return Err(DbError::Validation(problems.join("; ")));
        }
        if config.verbose_logging {
            crate::logging::init(true);
        }

        if let Some(dir) = &config.persistence_dir {
            std::fs::create_dir_all(dir)?;
        }
        let db_path = config.database_path(app_id);
        let store = Arc::new(TripleStore::open(db_path.as_deref()).await?);
        debug!(
            schema_version = store.schema_version().await?,
            "store ready"
        );

        let queries = Arc::new(QueryEngine::new(
            Arc::clone(&store),
            config.invalidation_debounce_ms,
            config.max_cached_queries,
            config.max_cache_size_bytes,
        ));

        let mut tasks = vec![queries.start()];

        let sync = if config.sync_enabled {
            let engine = SyncEngine::new(
                Arc::clone(&store),
                connector,
                SyncConfig::from_client(&config, app_id),
                config.attr_hints.clone(),
            );
            queries.set_sink(Arc::clone(&engine) as Arc<dyn crate::query::QuerySink>);
            tasks.push(tokio::spawn(Arc::clone(&engine).run()));
            Some(engine)
        } else {
            None
        };

        let (offline_status, _) = watch::channel(false);
        info!(app_id = %app_id, sync = config.sync_enabled, "client initialized");

        Ok(Arc::new(Self {
            app_id: app_id.to_string(),
            store,
            queries,
            sync,
            offline_status,
            tasks: Mutex::new(tasks),
            read_only: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
        }))
    }

    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    /// Generate a random entity id.
    pub fn id(&self) -> String {
        Uuid::new_v4().to_string()
    }

    /// Direct store access for advanced callers and tests.
    pub fn store(&self) -> &Arc<TripleStore> {
        &self.store
    }

    /// Submit a transaction: applied optimistically, enqueued for sync,
    /// returned immediately as `Pending`. A later server rejection rolls
    /// the transaction back asynchronously.
    pub async fn transact(&self, operations: Vec<Operation>) -> Result<TransactionResult> {
        self.ensure_usable()?;
        validate_operations(&operations)?;

        let tx = Transaction::new_local(operations);
        if let Err(e) = self.store.apply(&tx).await {
            if let DbError::Storage(_) = &e {
                warn!(error = %e, "storage failure, entering read-only mode");
                self.read_only.store(true, Ordering::SeqCst);
            }
            return Err(e);
        }

        if let Some(sync) = &self.sync {
            sync.send_transaction(tx.clone()).await?;
        }

        Ok(TransactionResult {
            tx_id: tx.id,
            status: TxStatus::Pending,
        })
    }

    /// Submit a fluently built chunk.
    pub async fn transact_chunk(&self, chunk: TxChunk) -> Result<TransactionResult> {
        self.transact(chunk.into_operations()).await
    }

    /// Begin a fluent operation chunk.
    pub fn tx(&self) -> TxChunk {
        TxChunk::new()
    }

    /// Subscribe to a reactive query.
    pub fn subscribe_query(&self, query: &Value) -> Result<QueryHandle> {
        self.ensure_not_disposed()?;
        self.queries.subscribe(query)
    }

    /// One-shot query without subscribing.
    pub async fn query_once(&self, query: &Value) -> Result<Value> {
        self.ensure_not_disposed()?;
        self.queries.query_once(query).await
    }

    /// Latest recorded status of a transaction.
    pub async fn transaction_status(&self, tx_id: &str) -> Result<Option<TxStatus>> {
        self.store.txlog().status(tx_id).await
    }

    /// `true` while the sync session is ready. Always `false` for clients
    /// initialized with `sync_enabled: false`.
    pub fn connection_status(&self) -> watch::Receiver<bool> {
        match &self.sync {
            Some(sync) => sync.connection_status(),
            None => self.offline_status.subscribe(),
        }
    }

    /// Cancel all tasks and close the store. Further calls fail with
    /// `Disposed`; pending transactions stay `committed` in the log and
    /// are re-sent on the next start.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(app_id = %self.app_id, "disposing client");
        let tasks = {
            let Ok(mut guard) = self.tasks.lock() else {
                return;
            };
            std::mem::take(&mut *guard)
        };
        for task in tasks {
            task.abort();
        }
    }

    fn ensure_not_disposed(&self) -> Result<()> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(DbError::Disposed);
        }
        Ok(())
    }

    fn ensure_usable(&self) -> Result<()> {
        self.ensure_not_disposed()?;
        if self.read_only.load(Ordering::SeqCst) {
            return Err(DbError::ReadOnly);
        }
        Ok(())
    }
}

/// Synchronous validation: malformed operations are rejected before any
/// store mutation.
fn validate_operations(operations: &[Operation]) -> Result<()> {
    if operations.is_empty() {
        return Err(DbError::Validation("transaction has no operations".to_string()));
    }
    for op in operations {
        for id in op.referenced_ids() {
            if !is_valid_entity_id(id) {
                return Err(DbError::Validation(format!("invalid entity id: {id:?}")));
            }
        }
        if let Operation::Merge { partial, .. } = op {
            if !partial.is_object() {
                return Err(DbError::Validation(
                    "merge payload must be an object".to_string(),
                ));
            }
        }
        if let Operation::Add { attr, .. } | Operation::Update { attr, .. } = op {
            if attr.is_empty() {
                return Err(DbError::Validation("empty attribute name".to_string()));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn offline_config() -> ClientConfig {
        ClientConfig {
            sync_enabled: false,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn chunk_builder_composes_operations() {
        let mut chunk = TxChunk::new();
        let e1 = Uuid::new_v4().to_string();
        let e2 = Uuid::new_v4().to_string();
        chunk
            .entity("todos", &e1)
            .update(json!({"text": "hello"}))
            .merge(json!({"meta": {"a": 1}}));
        chunk.entity("todos", &e2).delete();

        let ops = chunk.into_operations();
        // ensure-type + update + merge for e1, delete for e2
        assert_eq!(ops.len(), 4);
        assert!(matches!(
            &ops[0],
            Operation::Update { attr, .. } if attr == TYPE_ATTR
        ));
        assert!(matches!(&ops[3], Operation::Delete { entity_id } if *entity_id == e2));
    }

    #[tokio::test]
    async fn transact_applies_optimistically() {
        let client = Client::init("test-app", offline_config()).await.unwrap();
        let e = client.id();

        let result = client
            .transact(vec![
                Operation::Add {
                    entity_type: "todos".to_string(),
                    entity_id: e.clone(),
                    attr: TYPE_ATTR.to_string(),
                    value: json!("todos"),
                },
                Operation::Add {
                    entity_type: "todos".to_string(),
                    entity_id: e.clone(),
                    attr: "text".to_string(),
                    value: json!("hello"),
                },
            ])
            .await
            .unwrap();
        assert_eq!(result.status, TxStatus::Pending);

        let data = client.query_once(&json!({"todos": {}})).await.unwrap();
        let rows = data["todos"].as_array().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["text"], json!("hello"));

        // applied locally means committed in the log
        assert_eq!(
            client.transaction_status(&result.tx_id).await.unwrap(),
            Some(TxStatus::Committed)
        );
        client.dispose().await;
    }

    #[tokio::test]
    async fn validation_rejects_without_mutation() {
        let client = Client::init("test-app", offline_config()).await.unwrap();
        let result = client
            .transact(vec![Operation::Update {
                entity_id: "not-a-uuid".to_string(),
                attr: "text".to_string(),
                value: json!("x"),
            }])
            .await;
        assert!(matches!(result, Err(DbError::Validation(_))));

        let empty = client.transact(vec![]).await;
        assert!(matches!(empty, Err(DbError::Validation(_))));
        client.dispose().await;
    }

    #[tokio::test]
    async fn dispose_blocks_further_calls() {
        let client = Client::init("test-app", offline_config()).await.unwrap();
        client.dispose().await;
        assert!(matches!(
            client.query_once(&json!({"todos": {}})).await,
            Err(DbError::Disposed)
        ));
        assert!(matches!(client.transact(vec![]).await, Err(DbError::Disposed)));
    }

    #[tokio::test]
    async fn offline_client_reports_disconnected() {
        let client = Client::init("test-app", offline_config()).await.unwrap();
        assert!(!*client.connection_status().borrow());
        client.dispose().await;
    }
}
