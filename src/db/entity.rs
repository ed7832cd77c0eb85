//! Module: entity
//! Responsibility: `Node` and `Edge`, the two document-backed entity
//! kinds, their oid type, and explicit (non-magic) lazy endpoint
//! hydration for edges.
//! Does not own: index selection or storage I/O; hydration delegates to
//! `Database::get_raw`, which itself goes through the planner/store.
//! Boundary: entities hold a non-owning (`Weak`) back-reference to their
//! database; the step pipeline clears it before handing an entity to a
//! consumer.

use crate::db::database::DbHandle;
use crate::db::document::Document;
use crate::error::LegdbError;
use crate::value::Value;
use std::cell::OnceCell;
use std::fmt;

///
/// Table
///
/// The two built-in tables LegDB persists documents in. LegDB has no
/// user-extensible entity kinds; every document is a node or an edge.
///

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Table {
    Node,
    Edge,
}

impl Table {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Node => "node",
            Self::Edge => "edge",
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Attribute names reserved on edge documents.
pub const START_ID_ATTR: &str = "start_id";
pub const END_ID_ATTR: &str = "end_id";

///
/// Oid
///
/// Opaque primary key assigned by the storage layer on insert, immutable
/// once assigned, ordered lexicographically by byte content.
///

#[derive(Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash, derive_more::Deref)]
pub struct Oid(Vec<u8>);

impl Oid {
    #[must_use]
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Allocate the next oid for an append-only auto-increment sequence,
    /// stored big-endian so lexicographic byte order matches numeric order.
    #[must_use]
    pub fn from_sequence(n: u64) -> Self {
        Self(n.to_be_bytes().to_vec())
    }
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

fn extract_oid(doc: &mut Document, attr: &str) -> Result<Oid, LegdbError> {
    match doc.remove(attr) {
        Some(Value::Bytes(b)) => Ok(Oid::from_bytes(b)),
        Some(other) => Err(LegdbError::InvalidPipeline(format!(
            "attribute {attr} must be an oid (bytes), found {other}"
        ))),
        None => Err(LegdbError::InvalidPipeline(format!(
            "edge document missing required attribute {attr}"
        ))),
    }
}

///
/// Node
///
/// Has an `oid` (assigned by storage on insert) and a free-form document
/// of attributes. Created unbound; gains a database back-reference once
/// retrieved from, or saved into, a `Database`.
///

#[derive(Clone, Debug)]
pub struct Node {
    oid: Option<Oid>,
    attrs: Document,
    db: Option<DbHandle>,
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.oid == other.oid && self.attrs == other.attrs
    }
}

impl Node {
    #[must_use]
    pub fn new(attrs: Document) -> Self {
        Self {
            oid: None,
            attrs,
            db: None,
        }
    }

    #[must_use]
    pub fn oid(&self) -> Option<&Oid> {
        self.oid.as_ref()
    }

    pub(crate) fn set_oid(&mut self, oid: Oid) {
        self.oid = Some(oid);
    }

    #[must_use]
    pub fn attrs(&self) -> &Document {
        &self.attrs
    }

    pub fn attrs_mut(&mut self) -> &mut Document {
        &mut self.attrs
    }

    #[must_use]
    pub fn is_bound(&self) -> bool {
        self.db.as_ref().is_some_and(|w| w.strong_count() > 0)
    }

    pub(crate) fn bind(&mut self, db: DbHandle) {
        self.db = Some(db);
    }

    /// Clear the database back-reference. Called by the step pipeline on
    /// emission and before crossing a thread boundary.
    pub fn disconnect(&mut self) {
        self.db = None;
    }

    /// The document form of this node, excluding `oid`.
    #[must_use]
    pub fn to_document(&self) -> Document {
        self.attrs.clone()
    }

    #[must_use]
    pub fn from_document(oid: Oid, attrs: Document) -> Self {
        Self {
            oid: Some(oid),
            attrs,
            db: None,
        }
    }
}

///
/// Edge
///
/// Has an `oid`, required `start_id`/`end_id`, and free-form attributes. May
/// carry hydrated `start`/`end` nodes at runtime; these are never persisted.
/// Endpoint hydration is an explicit, cached, per-instance call rather than
/// automatic attribute-access magic.
///

pub struct Edge {
    oid: Option<Oid>,
    start_id: Oid,
    end_id: Oid,
    attrs: Document,
    start: OnceCell<Option<Node>>,
    end: OnceCell<Option<Node>>,
    db: Option<DbHandle>,
}

impl fmt::Debug for Edge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Edge")
            .field("oid", &self.oid)
            .field("start_id", &self.start_id)
            .field("end_id", &self.end_id)
            .field("attrs", &self.attrs)
            .finish()
    }
}

impl Clone for Edge {
    fn clone(&self) -> Self {
        Self {
            oid: self.oid.clone(),
            start_id: self.start_id.clone(),
            end_id: self.end_id.clone(),
            attrs: self.attrs.clone(),
            start: self.start.clone(),
            end: self.end.clone(),
            db: self.db.clone(),
        }
    }
}

impl PartialEq for Edge {
    fn eq(&self, other: &Self) -> bool {
        self.oid == other.oid
            && self.start_id == other.start_id
            && self.end_id == other.end_id
            && self.attrs == other.attrs
    }
}

impl Edge {
    #[must_use]
    pub fn new(start_id: Oid, end_id: Oid, attrs: Document) -> Self {
        Self {
            oid: None,
            start_id,
            end_id,
            attrs,
            start: OnceCell::new(),
            end: OnceCell::new(),
            db: None,
        }
    }

    #[must_use]
    pub fn oid(&self) -> Option<&Oid> {
        self.oid.as_ref()
    }

    pub(crate) fn set_oid(&mut self, oid: Oid) {
        self.oid = Some(oid);
    }

    #[must_use]
    pub fn start_id(&self) -> &Oid {
        &self.start_id
    }

    #[must_use]
    pub fn end_id(&self) -> &Oid {
        &self.end_id
    }

    #[must_use]
    pub fn attrs(&self) -> &Document {
        &self.attrs
    }

    pub fn attrs_mut(&mut self) -> &mut Document {
        &mut self.attrs
    }

    pub(crate) fn bind(&mut self, db: DbHandle) {
        self.db = Some(db);
    }

    pub fn disconnect(&mut self) {
        self.db = None;
        // Hydrated endpoints are runtime-only state; dropping the
        // back-reference does not invalidate an already-hydrated cache,
        // but a *fresh* hydrate after disconnect must fail with
        // `NotBound` rather than resolve silently against nothing.
    }

    /// The document form of this edge: free-form attributes plus
    /// `start_id`/`end_id`, excluding `oid` and any hydrated endpoint nodes.
    #[must_use]
    pub fn to_document(&self) -> Document {
        let mut doc = self.attrs.clone();
        doc.insert(START_ID_ATTR, Value::Bytes(self.start_id.as_bytes().to_vec()));
        doc.insert(END_ID_ATTR, Value::Bytes(self.end_id.as_bytes().to_vec()));
        doc
    }

    #[must_use]
    pub fn from_document(oid: Oid, mut doc: Document) -> Result<Self, LegdbError> {
        let start_id = extract_oid(&mut doc, START_ID_ATTR)?;
        let end_id = extract_oid(&mut doc, END_ID_ATTR)?;
        Ok(Self {
            oid: Some(oid),
            start_id,
            end_id,
            attrs: doc,
            start: OnceCell::new(),
            end: OnceCell::new(),
            db: None,
        })
    }

    fn db_handle(&self) -> Result<std::sync::Arc<crate::db::database::DbInner>, LegdbError> {
        self.db
            .as_ref()
            .and_then(std::sync::Weak::upgrade)
            .ok_or_else(|| LegdbError::NotBound("edge has no live database back-reference".to_string()))
    }

    /// The hydrated start node, loading it on first access. A missing
    /// endpoint is a non-fatal `DanglingEdge` observation: a warning is
    /// recorded and `Ok(None)` is returned rather than an error.
    pub fn start(&self) -> Result<Option<&Node>, LegdbError> {
        if self.start.get().is_none() {
            let db = self.db_handle()?;
            let node = db.get_raw_node(&self.start_id)?;
            if node.is_none() {
                tracing::warn!(endpoint = %self.start_id, edge = ?self.oid, "dangling edge: start endpoint does not resolve");
            }
            let _ = self.start.set(node);
        }
        Ok(self.start.get().and_then(Option::as_ref))
    }

    /// The hydrated end node; see [`Edge::start`].
    pub fn end(&self) -> Result<Option<&Node>, LegdbError> {
        if self.end.get().is_none() {
            let db = self.db_handle()?;
            let node = db.get_raw_node(&self.end_id)?;
            if node.is_none() {
                tracing::warn!(endpoint = %self.end_id, edge = ?self.oid, "dangling edge: end endpoint does not resolve");
            }
            let _ = self.end.set(node);
        }
        Ok(self.end.get().and_then(Option::as_ref))
    }

    /// Eagerly hydrate both endpoints. Equivalent to calling
    /// [`Edge::start`] and [`Edge::end`] but surfaces the first error.
    pub fn hydrate(&self) -> Result<(), LegdbError> {
        self.start()?;
        self.end()?;
        Ok(())
    }
}
