//! Reactive query engine.
//!
//! Cached queries are keyed by their canonical serialization; every
//! subscriber of one key shares one computation and one watch channel. The
//! engine listens to the store's change stream, coalesces changes over a
//! debounce window, and re-materializes the affected queries.

use dashmap::DashMap;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::domain::TripleChange;
use crate::error::{DbError, Result};
use crate::store::TripleStore;

use super::ast::{self, QueryNode};
use super::materialize;

/// Observed value of a reactive query.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryResult {
    Loading,
    Success(Value),
    Error(String),
}

impl QueryResult {
    pub fn is_loading(&self) -> bool {
        matches!(self, QueryResult::Loading)
    }
}

/// Receives canonical query trees on first subscription so the server can
/// begin pushing matching deltas. Implemented by the sync engine; owned as
/// a trait object so neither side references the other directly.
pub trait QuerySink: Send + Sync {
    fn register_query(&self, key: &str, query: &Value);
}

/// Reactive handle for one subscribed query. Cloneable; every clone
/// observes the same sequence of values.
#[derive(Debug, Clone)]
pub struct QueryHandle {
    key: String,
    rx: watch::Receiver<QueryResult>,
}

impl QueryHandle {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Latest observed value.
    pub fn current(&self) -> QueryResult {
        self.rx.borrow().clone()
    }

    /// Wait for the next published value.
    pub async fn next(&mut self) -> Result<QueryResult> {
        self.rx.changed().await.map_err(|_| DbError::Cancelled)?;
        Ok(self.current())
    }

    /// Wait until the handle leaves `Loading`.
    pub async fn ready(&mut self) -> Result<QueryResult> {
        loop {
            let current = self.current();
            if !current.is_loading() {
                return Ok(current);
            }
            self.rx.changed().await.map_err(|_| DbError::Cancelled)?;
        }
    }
}

struct CachedQuery {
    query: Value,
    nodes: Vec<QueryNode>,
    types: HashSet<String>,
    any_type: bool,
    tx: watch::Sender<QueryResult>,
    last_computed_ms: AtomicI64,
    approx_bytes: AtomicUsize,
}

/// The engine owning the cached-result table.
pub struct QueryEngine {
    store: Arc<TripleStore>,
    cache: DashMap<String, Arc<CachedQuery>>,
    sink: RwLock<Option<Arc<dyn QuerySink>>>,
    debounce: Duration,
    max_cached: usize,
    max_bytes: u64,
}

impl QueryEngine {
    pub fn new(
        store: Arc<TripleStore>,
        debounce_ms: u64,
        max_cached: usize,
        max_bytes: u64,
    ) -> Self {
        Self {
            store,
            cache: DashMap::new(),
            sink: RwLock::new(None),
            debounce: Duration::from_millis(debounce_ms),
            max_cached,
            max_bytes,
        }
    }

    /// Wire the sync engine in; called once at client init.
    pub fn set_sink(&self, sink: Arc<dyn QuerySink>) {
        if let Ok(mut slot) = self.sink.write() {
            *slot = Some(sink);
        }
    }

    /// Subscribe to a query. Handles for the same canonical key share one
    /// cached result; the first subscription triggers materialization and
    /// hands the query to the sync engine.
    pub fn subscribe(self: &Arc<Self>, query: &Value) -> Result<QueryHandle> {
        let key = ast::canonical_key(query);

        if let Some(entry) = self.cache.get(&key) {
            return Ok(QueryHandle {
                key,
                rx: entry.tx.subscribe(),
            });
        }

        let nodes = ast::parse_query(query)?;
        let (types, any_type) = ast::mentioned_types(&nodes);
        let (tx, rx) = watch::channel(QueryResult::Loading);
        let cached = Arc::new(CachedQuery {
            query: query.clone(),
            nodes,
            types,
            any_type,
            tx,
            last_computed_ms: AtomicI64::new(0),
            approx_bytes: AtomicUsize::new(0),
        });

        self.evict_unwatched();

        let cached = match self.cache.entry(key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(existing) => {
                // lost a race with a concurrent subscriber; share theirs
                return Ok(QueryHandle {
                    key,
                    rx: existing.get().tx.subscribe(),
                });
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&cached));
                cached
            }
        };

        if let Ok(sink) = self.sink.read() {
            if let Some(sink) = sink.as_ref() {
                sink.register_query(&key, query);
            }
        }

        let engine = Arc::clone(self);
        let task_key = key.clone();
        tokio::spawn(async move {
            engine.recompute(&task_key, &cached).await;
        });

        Ok(QueryHandle { key, rx })
    }

    /// One-shot materialization without subscribing or caching.
    pub async fn query_once(&self, query: &Value) -> Result<Value> {
        let nodes = ast::parse_query(query)?;
        materialize::materialize(&self.store, &nodes).await
    }

    /// Every cached query `(canonical_key, tree)`, for re-submission on
    /// sync reconnect.
    pub fn cached_queries(&self) -> Vec<(String, Value)> {
        self.cache
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().query.clone()))
            .collect()
    }

    /// Start the invalidation loop. The task ends when the store's change
    /// stream closes or the returned handle is aborted.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let mut rx = engine.store.changes();
            loop {
                let mut types: HashSet<String> = HashSet::new();
                let mut all = false;

                match rx.recv().await {
                    Ok(change) => engine.classify(change, &mut types, &mut all).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "change stream lagged, invalidating all queries");
                        all = true;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }

                // coalesce the burst before recomputing
                tokio::time::sleep(engine.debounce).await;
                let mut closed = false;
                loop {
                    match rx.try_recv() {
                        Ok(change) => engine.classify(change, &mut types, &mut all).await,
                        Err(broadcast::error::TryRecvError::Empty) => break,
                        Err(broadcast::error::TryRecvError::Lagged(_)) => all = true,
                        Err(broadcast::error::TryRecvError::Closed) => {
                            closed = true;
                            break;
                        }
                    }
                }

                engine.invalidate(&types, all).await;
                if closed {
                    break;
                }
            }
            debug!("query invalidation loop stopped");
        })
    }

    /// Map a change to the entity type it affects. Unknown types force a
    /// full invalidation; the rule may over-invalidate, never under.
    async fn classify(&self, change: TripleChange, types: &mut HashSet<String>, all: &mut bool) {
        if let Some(type_name) = change.triple.type_name() {
            types.insert(type_name.to_string());
            return;
        }
        match self.store.entity_type_of(&change.triple.entity_id).await {
            Ok(Some(type_name)) => {
                types.insert(type_name);
            }
            Ok(None) => *all = true,
            Err(e) => {
                warn!(error = %e, "failed to resolve entity type for invalidation");
                *all = true;
            }
        }
    }

    async fn invalidate(&self, types: &HashSet<String>, all: bool) {
        if types.is_empty() && !all {
            return;
        }

        let affected: Vec<(String, Arc<CachedQuery>)> = self
            .cache
            .iter()
            .filter(|entry| {
                let cached = entry.value();
                all || cached.any_type || cached.types.iter().any(|t| types.contains(t))
            })
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();

        debug!(affected = affected.len(), all, "re-materializing queries");
        for (key, cached) in affected {
            self.recompute(&key, &cached).await;
        }
    }

    async fn recompute(&self, key: &str, cached: &CachedQuery) {
        let value = match materialize::materialize(&self.store, &cached.nodes).await {
            Ok(data) => {
                let size = serde_json::to_string(&data).map(|s| s.len()).unwrap_or(0);
                cached.approx_bytes.store(size, Ordering::Relaxed);
                QueryResult::Success(data)
            }
            Err(e) => {
                warn!(query = %key, error = %e, "query materialization failed");
                QueryResult::Error(e.to_string())
            }
        };
        cached
            .last_computed_ms
            .store(chrono::Utc::now().timestamp_millis(), Ordering::Relaxed);
        cached.tx.send_replace(value);
    }

    fn cached_bytes(&self) -> u64 {
        self.cache
            .iter()
            .map(|entry| entry.value().approx_bytes.load(Ordering::Relaxed) as u64)
            .sum()
    }

    /// Drop cached queries nobody watches once the table is over its entry
    /// or byte budget.
    fn evict_unwatched(&self) {
        if self.cache.len() < self.max_cached && self.cached_bytes() <= self.max_bytes {
            return;
        }
        let stale: Vec<String> = self
            .cache
            .iter()
            .filter(|entry| entry.value().tx.receiver_count() == 0)
            .map(|entry| entry.key().clone())
            .collect();
        for key in stale {
            debug!(query = %key, "evicting unwatched query");
            self.cache.remove(&key);
        }
    }
}
