pub mod ast;
pub mod engine;
pub mod materialize;

pub use ast::{canonical_key, parse_query, QueryNode, Relation};
pub use engine::{QueryEngine, QueryHandle, QueryResult, QuerySink};
