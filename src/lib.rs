//! LegDB: an embedded graph database layered over a transactional,
//! memory-mapped key-value store.
//!
//! The crate manages two kinds of documents, nodes and edges, supports
//! user-declared secondary indexes, and exposes a fluent traversal
//! pipeline (source -> filter -> edge-traversal) that compiles into a
//! plan over the underlying indexed store.

pub mod db;
pub mod error;
pub mod value;

///
/// Prelude
///
/// Prelude contains only domain vocabulary: entities, the value type,
/// and the façade. No errors or storage internals are re-exported here.
///

pub mod prelude {
    pub use crate::db::{Config, Database, DbOpenMode, Edge, Node, PipelineItem, Persisted, Predicate, Table};
    pub use crate::value::Value;
}
