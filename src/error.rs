//! Module: error
//! Responsibility: the crate's single public error type and its internal
//! classification taxonomy.
//! Does not own: recovery policy. Callers decide whether to retry, abort
//! the enclosing write transaction, or surface the error further.
//! Boundary: every fallible public operation in `db` returns `LegdbError`.

use std::fmt;
use thiserror::Error as ThisError;

///
/// LegdbError
///
/// The public error type for every fallible LegDB operation. Read-path
/// errors terminate the iterator that produced them and surface to the
/// consumer; write-path errors abort the enclosing write transaction.
///
/// `DanglingEdge` is deliberately absent from this enum: it is non-fatal,
/// recorded as a warning-level observation at the point of lazy hydration,
/// with the edge still returned to the caller.
///

#[derive(Debug, ThisError)]
pub enum LegdbError {
    /// Operation requires a database back-reference (e.g. `load`, `save`
    /// on a detached entity).
    #[error("entity is not bound to a database: {0}")]
    NotBound(String),

    /// `source` missing or not first; incompatible range endpoint types;
    /// unsupported step adjacency.
    #[error("invalid pipeline: {0}")]
    InvalidPipeline(String),

    /// A unique index was violated on write.
    #[error("duplicate key in index {index} on table {table}")]
    DuplicateKey { table: &'static str, index: String },

    /// A caller explicitly requested a named index that is not
    /// registered.
    #[error("no such index {index:?} on table {table}")]
    MissingIndex { table: &'static str, index: String },

    /// Range endpoints of different entity types.
    #[error("range endpoints are of different entity types: {lower} vs {upper}")]
    TypeMismatch { lower: &'static str, upper: &'static str },

    /// Passthrough of an underlying storage/transaction/IO failure.
    #[error("storage error: {0}")]
    StorageError(#[from] StoreError),
}

impl LegdbError {
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::NotBound(_) => ErrorClass::InvariantViolation,
            Self::InvalidPipeline(_) => ErrorClass::Unsupported,
            Self::DuplicateKey { .. } => ErrorClass::Conflict,
            Self::MissingIndex { .. } => ErrorClass::NotFound,
            Self::TypeMismatch { .. } => ErrorClass::Unsupported,
            Self::StorageError(_) => ErrorClass::Internal,
        }
    }

    #[must_use]
    pub fn origin(&self) -> ErrorOrigin {
        match self {
            Self::NotBound(_) => ErrorOrigin::Entity,
            Self::InvalidPipeline(_) => ErrorOrigin::Pipeline,
            Self::DuplicateKey { .. } | Self::MissingIndex { .. } => ErrorOrigin::Index,
            Self::TypeMismatch { .. } => ErrorOrigin::Query,
            Self::StorageError(_) => ErrorOrigin::Store,
        }
    }
}

///
/// ErrorClass
/// Internal error taxonomy for runtime classification. Not a stable API;
/// may change without notice.
///

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorClass {
    NotFound,
    Internal,
    Conflict,
    Unsupported,
    InvariantViolation,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::NotFound => "not_found",
            Self::Internal => "internal",
            Self::Conflict => "conflict",
            Self::Unsupported => "unsupported",
            Self::InvariantViolation => "invariant_violation",
        };
        write!(f, "{label}")
    }
}

///
/// ErrorOrigin
/// Internal origin taxonomy for runtime classification. Not a stable API;
/// may change without notice.
///

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorOrigin {
    Entity,
    Store,
    Index,
    Query,
    Pipeline,
}

impl fmt::Display for ErrorOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Entity => "entity",
            Self::Store => "store",
            Self::Index => "index",
            Self::Query => "query",
            Self::Pipeline => "pipeline",
        };
        write!(f, "{label}")
    }
}

///
/// StoreError
///
/// Passthrough taxonomy for failures originating in the storage layer
/// (`db::store`). Kept separate from `LegdbError` so the storage trait does
/// not need to know about pipeline/query-level concerns.
///

#[derive(Debug, ThisError)]
pub enum StoreError {
    #[error("underlying store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("underlying store error: {0}")]
    Backend(String),

    #[error("store is corrupt: {message}")]
    Corrupt { message: String },

    #[error("data key not found: {key}")]
    NotFound { key: String },
}
