//! Session engine: owns the transport, the outbound queue, the echo set
//! and the attribute cache, and reconciles the local store with the server.
//!
//! One task runs [`SyncEngine::run`]: an outer reconnect loop with capped
//! exponential backoff, and an inner per-connection loop that drives
//! inbound decoding, outbound encoding and keepalive pings.

use dashmap::DashMap;
use serde_json::Value;
use std::collections::{HashSet, VecDeque};
use std::hash::Hash;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::ClientConfig;
use crate::domain::Transaction;
use crate::error::{DbError, Result};
use crate::query::QuerySink;
use crate::store::TripleStore;

use super::attrs::AttributeCache;
use super::decode;
use super::encode;
use super::protocol::{self, ServerMessage};
use super::transport::{Connector, TransportSink, TransportStream};

/// Session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    InitSent,
    Ready,
    AuthFailed,
}

/// Sync engine configuration, extracted from the client config at init.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub app_id: String,
    pub session_url: String,
    pub refresh_token: Option<String>,
    pub reconnect_delay: Duration,
    pub max_reconnect_delay: Duration,
    pub ping_interval: Duration,
    pub echo_cache_size: usize,
    pub outbound_queue_size: usize,
    pub decode_error_threshold: u32,
}

impl SyncConfig {
    pub fn from_client(config: &ClientConfig, app_id: &str) -> Self {
        Self {
            app_id: app_id.to_string(),
            session_url: config.session_url(app_id),
            refresh_token: config.refresh_token.clone(),
            reconnect_delay: Duration::from_millis(config.reconnect_delay_ms),
            max_reconnect_delay: Duration::from_millis(config.max_reconnect_delay_ms),
            ping_interval: Duration::from_secs(config.ping_interval_secs),
            echo_cache_size: config.echo_cache_size,
            outbound_queue_size: config.outbound_queue_size,
            decode_error_threshold: config.decode_error_threshold,
        }
    }
}

/// Insertion-ordered set with a size bound; the oldest entries fall out
/// first. Backs both echo suppression and datalog payload dedup.
#[derive(Debug)]
struct BoundedSet<T: Eq + Hash + Clone> {
    cap: usize,
    inner: Mutex<(VecDeque<T>, HashSet<T>)>,
}

impl<T: Eq + Hash + Clone> BoundedSet<T> {
    fn new(cap: usize) -> Self {
        Self {
            cap,
            inner: Mutex::new((VecDeque::new(), HashSet::new())),
        }
    }

    /// Returns false when the value was already present.
    fn insert(&self, value: T) -> bool {
        let Ok(mut guard) = self.inner.lock() else {
            return true;
        };
        let (order, set) = &mut *guard;
        if !set.insert(value.clone()) {
            return false;
        }
        order.push_back(value);
        while order.len() > self.cap {
            if let Some(evicted) = order.pop_front() {
                set.remove(&evicted);
            }
        }
        true
    }

    fn contains(&self, value: &T) -> bool {
        self.inner
            .lock()
            .map(|guard| guard.1.contains(value))
            .unwrap_or(false)
    }
}

struct Inboxes {
    outbound_rx: mpsc::Receiver<Transaction>,
    query_rx: mpsc::UnboundedReceiver<Value>,
}

enum Flow {
    Continue,
    Close,
}

/// The sync engine. Shared behind `Arc`; [`SyncEngine::run`] is spawned
/// once and owns the transport for the client's lifetime.
pub struct SyncEngine {
    store: Arc<TripleStore>,
    attrs: AttributeCache,
    config: SyncConfig,
    connector: Box<dyn Connector>,
    outbound_tx: mpsc::Sender<Transaction>,
    query_tx: mpsc::UnboundedSender<Value>,
    inboxes: tokio::sync::Mutex<Option<Inboxes>>,
    /// Client event ids of locally sent transactions, for echo suppression.
    sent_events: BoundedSet<String>,
    /// Hashes of decoded datalog payloads, for duplicate suppression.
    seen_payloads: BoundedSet<u64>,
    /// Canonical key -> query tree of every subscribed query.
    queries: DashMap<String, Value>,
    state: RwLock<SessionState>,
    status_tx: watch::Sender<bool>,
    decode_errors: AtomicU32,
}

impl SyncEngine {
    pub fn new(
        store: Arc<TripleStore>,
        connector: Box<dyn Connector>,
        config: SyncConfig,
        attr_hints: std::collections::HashMap<String, std::collections::HashMap<String, String>>,
    ) -> Arc<Self> {
        let (outbound_tx, outbound_rx) = mpsc::channel(config.outbound_queue_size);
        let (query_tx, query_rx) = mpsc::unbounded_channel();
        let (status_tx, _) = watch::channel(false);

        Arc::new(Self {
            store,
            attrs: AttributeCache::new(attr_hints),
            sent_events: BoundedSet::new(config.echo_cache_size),
            seen_payloads: BoundedSet::new(1024),
            config,
            connector,
            outbound_tx,
            query_tx,
            inboxes: tokio::sync::Mutex::new(Some(Inboxes {
                outbound_rx,
                query_rx,
            })),
            queries: DashMap::new(),
            state: RwLock::new(SessionState::Disconnected),
            status_tx,
            decode_errors: AtomicU32::new(0),
        })
    }

    /// Current session state.
    pub fn state(&self) -> SessionState {
        self.state
            .read()
            .map(|s| *s)
            .unwrap_or(SessionState::Disconnected)
    }

    /// `true` while the session is Ready.
    pub fn connection_status(&self) -> watch::Receiver<bool> {
        self.status_tx.subscribe()
    }

    /// Attribute cache accessor (reads on encode, writes on receive loop).
    pub fn attrs(&self) -> &AttributeCache {
        &self.attrs
    }

    /// Enqueue a local transaction for submission. Awaits when the bounded
    /// outbound queue is full.
    pub async fn send_transaction(&self, tx: Transaction) -> Result<()> {
        self.outbound_tx
            .send(tx)
            .await
            .map_err(|_| DbError::Cancelled)
    }

    fn set_state(&self, state: SessionState) {
        if let Ok(mut slot) = self.state.write() {
            *slot = state;
        }
        let _ = self.status_tx.send(state == SessionState::Ready);
    }

    /// Reconnect loop. Runs until the owning task is aborted at dispose.
    pub async fn run(self: Arc<Self>) {
        let Some(mut inboxes) = self.inboxes.lock().await.take() else {
            warn!("sync engine run() called twice");
            return;
        };

        let mut attempt: u32 = 0;
        loop {
            self.set_state(SessionState::Connecting);
            match self.connector.connect(&self.config.session_url).await {
                Ok((sink, stream)) => {
                    attempt = 0;
                    self.decode_errors.store(0, Ordering::Relaxed);
                    match self.session(sink, stream, &mut inboxes).await {
                        Ok(()) => info!("session closed"),
                        Err(e) if e.is_retryable() => warn!(error = %e, "session dropped"),
                        Err(e) => error!(error = %e, "session failed"),
                    }
                }
                Err(e) => warn!(error = %e, "connect failed"),
            }

            self.set_state(SessionState::Disconnected);
            attempt = attempt.saturating_add(1);
            let delay = self.backoff_delay(attempt);
            debug!(attempt, ?delay, "reconnecting");
            tokio::time::sleep(delay).await;
        }
    }

    /// Exponential backoff from the configured delay, capped, with jitter.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        use rand::Rng;

        let base = self.config.reconnect_delay.as_millis() as u64;
        let max = self.config.max_reconnect_delay.as_millis() as u64;
        let exp = base.saturating_mul(1u64 << attempt.saturating_sub(1).min(10));
        let capped = exp.min(max).max(1);
        let jitter = rand::thread_rng().gen_range(0..=capped / 4);
        Duration::from_millis(capped.saturating_add(jitter).min(max))
    }

    async fn session(
        &self,
        mut sink: Box<dyn TransportSink>,
        mut stream: Box<dyn TransportStream>,
        inboxes: &mut Inboxes,
    ) -> Result<()> {
        let init = protocol::init_message(
            &self.config.app_id,
            self.config.refresh_token.as_deref(),
            &Uuid::new_v4().to_string(),
        );
        sink.send(init.to_string()).await?;
        self.set_state(SessionState::InitSent);

        let mut ping = tokio::time::interval(self.config.ping_interval);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ping.tick().await; // the first tick fires immediately

        // transactions already sent on this connection; guards against the
        // store-pending drain and the live queue overlapping
        let mut session_sent: HashSet<String> = HashSet::new();

        loop {
            tokio::select! {
                inbound = stream.recv() => {
                    match inbound {
                        None => return Ok(()),
                        Some(Err(e)) => return Err(e),
                        Some(Ok(text)) => {
                            match self.handle_message(&text, &mut sink, inboxes, &mut session_sent).await? {
                                Flow::Continue => {}
                                Flow::Close => {
                                    sink.close().await;
                                    return Ok(());
                                }
                            }
                        }
                    }
                }
                Some(tx) = inboxes.outbound_rx.recv(), if self.state() == SessionState::Ready => {
                    self.send_local_transaction(&mut sink, &tx, &mut session_sent).await?;
                }
                Some(query) = inboxes.query_rx.recv(), if self.state() == SessionState::Ready => {
                    self.send_add_query(&mut sink, &query).await?;
                }
                _ = ping.tick() => {
                    sink.ping().await?;
                }
            }
        }
    }

    async fn handle_message(
        &self,
        text: &str,
        sink: &mut Box<dyn TransportSink>,
        inboxes: &mut Inboxes,
        session_sent: &mut HashSet<String>,
    ) -> Result<Flow> {
        let message = match ServerMessage::parse(text) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "undecodable message skipped");
                self.note_decode_errors(1)?;
                return Ok(Flow::Continue);
            }
        };

        match message {
            ServerMessage::InitOk { session_id, attrs } => {
                info!(session_id = %session_id, attrs = attrs.len(), "session ready");
                self.attrs.register_all(&attrs);
                self.set_state(SessionState::Ready);
                self.drain_on_ready(sink, inboxes, session_sent).await?;
            }
            ServerMessage::InitError { message } => {
                self.set_state(SessionState::AuthFailed);
                return Err(DbError::Auth(message));
            }
            ServerMessage::TransactOk { client_event_id } => {
                debug!(tx_id = %client_event_id, "transaction acknowledged");
                self.store.mark_synced(&client_event_id).await?;
            }
            ServerMessage::Transact {
                client_event_id,
                tx_steps,
            } => {
                if let Some(event_id) = &client_event_id {
                    if self.sent_events.contains(event_id) {
                        debug!(event_id = %event_id, "dropped echo of local transaction");
                        return Ok(Flow::Continue);
                    }
                }
                let decoded = decode::decode_tx_steps(&tx_steps, &self.attrs);
                self.note_decode_errors(decoded.skipped)?;
                if decoded.operations.is_empty() {
                    return Ok(Flow::Continue);
                }
                let tx_id =
                    client_event_id.unwrap_or_else(|| Uuid::new_v4().to_string());
                let tx = Transaction::new_remote(tx_id, decoded.operations);
                if let Err(e) = self.store.apply(&tx).await {
                    error!(error = %e, tx_id = %tx.id, "failed to apply remote delta");
                }
            }
            ServerMessage::QueryPayload { op, query, body } => {
                debug!(op = %op, "decoding query payload");
                self.apply_datalog_payload(query.as_ref(), &body).await?;
            }
            ServerMessage::InvalidateQuery { query, body } => {
                if !decode::extract_join_rows(&body).is_empty() {
                    self.apply_datalog_payload(query.as_ref(), &body).await?;
                } else {
                    for root in self.invalidation_roots(query.as_ref()) {
                        self.store.notify_refresh(&root);
                    }
                }
            }
            ServerMessage::ServerError {
                client_event_id,
                message,
            } => {
                match client_event_id {
                    Some(tx_id) => {
                        warn!(tx_id = %tx_id, message = %message, "transaction rejected, rolling back");
                        self.store.rollback(&tx_id).await?;
                    }
                    None => {
                        // transport-level error: drop the connection
                        warn!(message = %message, "server error, closing session");
                        return Err(DbError::Transport(message));
                    }
                }
            }
            ServerMessage::Unknown { op } => {
                warn!(op = %op, "unknown message op skipped");
                self.note_decode_errors(1)?;
            }
        }
        Ok(Flow::Continue)
    }

    /// Ready-transition drain: re-submit every cached query subscription,
    /// then every pending local transaction, each exactly once.
    async fn drain_on_ready(
        &self,
        sink: &mut Box<dyn TransportSink>,
        inboxes: &mut Inboxes,
        session_sent: &mut HashSet<String>,
    ) -> Result<()> {
        let queries: Vec<Value> = self
            .queries
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for query in &queries {
            self.send_add_query(sink, query).await?;
        }
        // registrations queued while offline are already in the map above
        while inboxes.query_rx.try_recv().is_ok() {}

        let pending = self.store.pending_transactions().await?;
        debug!(
            queries = queries.len(),
            pending = pending.len(),
            "draining after init-ok"
        );
        for tx in &pending {
            self.send_local_transaction(sink, tx, session_sent).await?;
        }
        // the live queue may hold transactions that were also read from the
        // pending log; session_sent dedups them
        while let Ok(tx) = inboxes.outbound_rx.try_recv() {
            self.send_local_transaction(sink, &tx, session_sent).await?;
        }
        Ok(())
    }

    async fn send_local_transaction(
        &self,
        sink: &mut Box<dyn TransportSink>,
        tx: &Transaction,
        session_sent: &mut HashSet<String>,
    ) -> Result<()> {
        if tx.status.is_terminal() {
            return Ok(());
        }
        if !session_sent.insert(tx.id.clone()) {
            debug!(tx_id = %tx.id, "already sent this session");
            return Ok(());
        }

        let steps = encode::encode_transaction(tx, &self.attrs);
        let message = protocol::transact_message(steps, &tx.id, tx.timestamp_ms);
        self.sent_events.insert(tx.id.clone());
        sink.send(message.to_string()).await
    }

    async fn send_add_query(&self, sink: &mut Box<dyn TransportSink>, query: &Value) -> Result<()> {
        let message = protocol::add_query_message(query, &Uuid::new_v4().to_string());
        sink.send(message.to_string()).await
    }

    /// Decode every join-rows payload in `body` and apply the reconstructed
    /// entities as synced transactions. Identical payloads are dropped.
    async fn apply_datalog_payload(&self, query: Option<&Value>, body: &Value) -> Result<()> {
        let root = query
            .and_then(single_root)
            .or_else(|| self.sole_registered_root());

        for rows in decode::extract_join_rows(body) {
            let result = decode::decode_join_rows(rows, root.as_deref(), &self.attrs);
            if result.entities.is_empty() {
                continue;
            }
            if !self.seen_payloads.insert(result.hash) {
                debug!(hash = result.hash, "duplicate datalog payload dropped");
                continue;
            }
            let ops = decode::entities_to_operations(&result.entities);
            let tx = Transaction::new_remote(Uuid::new_v4().to_string(), ops);
            if let Err(e) = self.store.apply(&tx).await {
                error!(error = %e, "failed to apply datalog payload");
            }
        }
        Ok(())
    }

    /// Root types to refresh for a data-less invalidation.
    fn invalidation_roots(&self, query: Option<&Value>) -> Vec<String> {
        if let Some(root) = query.and_then(single_root) {
            return vec![root];
        }
        let mut roots: Vec<String> = self
            .queries
            .iter()
            .filter_map(|entry| single_root(entry.value()))
            .collect();
        roots.sort();
        roots.dedup();
        roots
    }

    /// The root type shared by every registered query, if unambiguous.
    fn sole_registered_root(&self) -> Option<String> {
        let mut roots = self
            .queries
            .iter()
            .filter_map(|entry| single_root(entry.value()));
        let first = roots.next()?;
        if roots.all(|r| r == first) {
            Some(first)
        } else {
            None
        }
    }

    fn note_decode_errors(&self, count: usize) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        let total = self
            .decode_errors
            .fetch_add(count as u32, Ordering::Relaxed)
            + count as u32;
        if total > self.config.decode_error_threshold {
            return Err(DbError::Decode(format!(
                "{total} decode failures this session, tearing down"
            )));
        }
        Ok(())
    }
}

impl QuerySink for SyncEngine {
    fn register_query(&self, key: &str, query: &Value) {
        if self
            .queries
            .insert(key.to_string(), query.clone())
            .is_none()
        {
            // wake the session loop; if it is offline the registration is
            // re-sent from the map on the next init-ok
            let _ = self.query_tx.send(query.clone());
        }
    }
}

/// The single root entity type of a query tree, if it has exactly one.
fn single_root(query: &Value) -> Option<String> {
    let roots = query.as_object()?;
    if roots.len() == 1 {
        roots.keys().next().cloned()
    } else {
        None
    }
}
