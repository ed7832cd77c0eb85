//! Module: db
//! Responsibility: the graph data model, index catalog, planner, step
//! engine, and the database façade that ties them to a concrete storage
//! backend.
//! Does not own: attribute-value serialization framing beyond the
//! document boundary (callers hand LegDB already-constructed `Value`s).
//! Boundary: `db::store` is the only module allowed to talk to `heed`
//! directly; everything above it operates on `Document`/`Oid`/`Table`.

mod catalog;
mod config;
mod document;
mod entity;
mod key_template;
mod planner;
mod predicate;
mod session;
mod store;
mod step;

mod database;

pub use catalog::{IndexCatalog, IndexSpec};
pub use config::{Config, DbOpenMode};
pub use document::{AttrName, Document};
pub use entity::{Edge, Node, Oid, Table};
pub use key_template::KeyTemplate;
pub use planner::Planner;
pub use predicate::Predicate;
pub use step::{CompressionType, PipelineItem, StepBuilder, Union};

pub use database::{Database, Persisted};
