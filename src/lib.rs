pub mod client;
pub mod config;
pub mod domain;
pub mod error;
pub mod logging;
pub mod query;
pub mod store;
pub mod sync;

pub use client::{Client, EntityTx, TransactionResult, TxChunk};
pub use config::ClientConfig;
pub use domain::{
    ChangeKind, Operation, Transaction, Triple, TripleChange, TxOrigin, TxStatus, TYPE_ATTR,
};
pub use error::{DbError, Result};
pub use query::{QueryEngine, QueryHandle, QueryResult};
pub use store::{AggregateOp, AggregateSpec, Direction, EntityQuery, TripleStore};
pub use sync::{
    AttributeCache, Connector, SessionState, SyncConfig, SyncEngine, TransportSink,
    TransportStream, WsConnector,
};
