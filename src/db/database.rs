//! Module: database
//! Responsibility: the public façade: `Database::open`, index
//! registration, save/get/range/seek/find, compression, vacuum, and the
//! entry point into the step pipeline.
//! Does not own: index selection (`db::planner`), storage I/O
//! (`db::store`), or the step-pipeline compiler/executor (`db::step`);
//! this module only wires them together behind one entry point and owns
//! the auto-tx decision: an explicit transaction is used verbatim;
//! otherwise a short-lived one is opened per call.

use crate::db::catalog::{IndexCatalog, IndexSpec};
use crate::db::document::{AttrName, Document};
use crate::db::entity::{Edge, Node, Oid, Table};
use crate::db::planner::Planner;
use crate::db::session::AutoTxn;
use crate::db::step::{CompressionType, StepBuilder};
use crate::db::store::{HeedStore, RoTxn};
use crate::db::{Config, DbOpenMode};
use crate::error::{LegdbError, StoreError};
use crate::value::Value;
use std::sync::{Arc, RwLock, Weak};

/// A non-owning reference an entity carries back to its database, used only
/// for lazy edge-endpoint hydration. Cleared before an entity crosses a
/// thread boundary or is handed out of the step pipeline.
pub type DbHandle = Weak<DbInner>;

fn commit(res: Result<(), heed::Error>) -> Result<(), LegdbError> {
    res.map_err(|e| LegdbError::StorageError(StoreError::Backend(e.to_string())))
}

///
/// Persisted
///
/// The two entity kinds' shared save/load shape: which table they live in,
/// how to move to and from a `Document`, and how an entity learns its
/// assigned oid and its owning database.
///

pub trait Persisted: Sized {
    fn table() -> Table;
    fn oid(&self) -> Option<&Oid>;
    fn to_document(&self) -> Document;
    fn from_row(oid: Oid, doc: Document) -> Result<Self, LegdbError>;
    fn set_oid(&mut self, oid: Oid);
    fn bind(&mut self, db: DbHandle);
}

impl Persisted for Node {
    fn table() -> Table {
        Table::Node
    }

    fn oid(&self) -> Option<&Oid> {
        self.oid()
    }

    fn to_document(&self) -> Document {
        Node::to_document(self)
    }

    fn from_row(oid: Oid, doc: Document) -> Result<Self, LegdbError> {
        Ok(Node::from_document(oid, doc))
    }

    fn set_oid(&mut self, oid: Oid) {
        Node::set_oid(self, oid);
    }

    fn bind(&mut self, db: DbHandle) {
        Node::bind(self, db);
    }
}

impl Persisted for Edge {
    fn table() -> Table {
        Table::Edge
    }

    fn oid(&self) -> Option<&Oid> {
        self.oid()
    }

    fn to_document(&self) -> Document {
        Edge::to_document(self)
    }

    fn from_row(oid: Oid, doc: Document) -> Result<Self, LegdbError> {
        Edge::from_document(oid, doc)
    }

    fn set_oid(&mut self, oid: Oid) {
        Edge::set_oid(self, oid);
    }

    fn bind(&mut self, db: DbHandle) {
        Edge::bind(self, db);
    }
}

///
/// DbInner
///
/// The shared state behind every `Database` handle and every entity's `Weak`
/// back-reference. Kept internal lock-based (`RwLock` for the catalog, a
/// `Mutex`-backed cache inside `Planner`/`HeedStore`) so it can be wrapped
/// in `Arc` and shared across `rayon` worker threads under the optional
/// `parallel` feature.
///

pub struct DbInner {
    store: HeedStore,
    catalog: RwLock<IndexCatalog>,
    planner: Planner,
    config: Config,
}

impl DbInner {
    /// Lazily load a node by oid for edge-endpoint hydration
    /// (`Edge::start`/`Edge::end`). A missing node is not an error here;
    /// the caller surfaces it as a non-fatal dangling-edge observation.
    pub(crate) fn get_raw_node(&self, oid: &Oid) -> Result<Option<Node>, LegdbError> {
        let txn = self.store.read_txn()?;
        match self.store.get(&txn, Table::Node, oid)? {
            Some(doc) => Ok(Some(Node::from_document(oid.clone(), doc))),
            None => Ok(None),
        }
    }

    pub(crate) fn store(&self) -> &HeedStore {
        &self.store
    }

    pub(crate) fn catalog_snapshot(&self) -> IndexCatalog {
        self.catalog.read().expect("catalog lock poisoned").clone()
    }

    pub(crate) fn planner(&self) -> &Planner {
        &self.planner
    }

    pub(crate) fn config(&self) -> &Config {
        &self.config
    }
}

///
/// Database
///
/// The crate's entry point. Cheap to clone, internally an `Arc<DbInner>`,
/// so callers may hold several handles to the same store across threads.
///

#[derive(Clone)]
pub struct Database {
    inner: Arc<DbInner>,
}

impl Database {
    /// Open (or create, per `config.open_mode`) a store at `config.path`,
    /// registering the three built-in edge indexes (`by_start_id_end_id`,
    /// `by_start_id`, `by_end_id`) so `edge_in`/`edge_out`/`edge_all` always
    /// have a usable index regardless of what the caller registers.
    pub fn open(config: Config) -> Result<Self, LegdbError> {
        let create = matches!(config.open_mode, DbOpenMode::Create);
        let store = HeedStore::open(&config.path, config.max_readers, config.map_size, config.subdir, create)?;
        let catalog = RwLock::new(IndexCatalog::new());
        let planner = Planner::new();
        let inner = Arc::new(DbInner { store, catalog, planner, config });

        {
            let mut wtxn = inner.store.write_txn()?;
            let builtins = inner.catalog_snapshot();
            for spec in builtins.list(Table::Edge) {
                inner.store.rebuild_index(&mut wtxn, Table::Edge, spec)?;
            }
            commit(wtxn.commit())?;
        }

        Ok(Self { inner })
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        self.inner.config()
    }

    pub fn sync(&self, force: bool) -> Result<(), LegdbError> {
        self.inner.store.sync(force)
    }

    /// Register a secondary index, idempotently for an identical shape.
    /// `template` is the `"{attr}"` / `"{a}|{b}"` key-template grammar
    /// naming the on-disk component order; pass `None` to derive it from
    /// `attrs`' own order. `force` rebuilds the on-disk index from the
    /// current table contents even if it already existed with this shape;
    /// useful after bulk loads performed before the index was declared.
    /// Invalidates the planner's cache unconditionally on success.
    pub fn ensure_index(
        &self,
        table: Table,
        name: &str,
        attrs: Vec<AttrName>,
        template: Option<&str>,
        duplicates: bool,
        force: bool,
    ) -> Result<(), LegdbError> {
        let mut wtxn = self.inner.store.write_txn()?;
        {
            let mut catalog = self.inner.catalog.write().expect("catalog lock poisoned");
            let existed = catalog.get(table, name).is_some();
            let spec = catalog.ensure_index(table, name.to_string(), attrs, template, duplicates)?.clone();
            if !existed || force {
                self.inner.store.rebuild_index(&mut wtxn, table, &spec)?;
            }
        }
        commit(wtxn.commit())?;
        self.inner.planner.invalidate();
        Ok(())
    }

    /// Save an entity. Assigns and records a fresh oid if `entity` has none
    /// yet; otherwise overwrites the existing row in place with no existence
    /// check.
    pub fn save<T: Persisted>(&self, entity: &mut T) -> Result<(), LegdbError> {
        let mut wtxn = self.inner.store.write_txn()?;
        self.save_in(&mut wtxn, entity)?;
        commit(wtxn.commit())
    }

    /// Same as [`Self::save`] but using a transaction the caller already
    /// holds open, per the explicit-transaction contract.
    pub fn save_in<T: Persisted>(&self, wtxn: &mut heed::RwTxn<'_>, entity: &mut T) -> Result<(), LegdbError> {
        let table = T::table();
        let indexes = self.inner.catalog_snapshot().list(table).to_vec();
        let doc = entity.to_document();
        match entity.oid().cloned() {
            Some(oid) => self.inner.store.save(wtxn, table, &indexes, &oid, &doc)?,
            None => {
                let oid = self.inner.store.append(wtxn, table, &indexes, &doc)?;
                entity.set_oid(oid);
            }
        }
        entity.bind(Arc::downgrade(&self.inner));
        Ok(())
    }

    /// Point lookup by oid.
    pub fn get<T: Persisted>(&self, oid: &Oid) -> Result<Option<T>, LegdbError> {
        let txn = self.inner.store.read_txn()?;
        match self.inner.store.get(&txn, T::table(), oid)? {
            Some(doc) => {
                let mut entity = T::from_row(oid.clone(), doc)?;
                entity.bind(Arc::downgrade(&self.inner));
                Ok(Some(entity))
            }
            None => Ok(None),
        }
    }

    /// Equality seek: plans the predicate exactly as the filter step of the
    /// traversal pipeline does, either against a caller-named index or the
    /// planner's own choice.
    pub fn seek<T: Persisted>(&self, predicate: &crate::db::Predicate, index: Option<&str>) -> Result<Vec<T>, LegdbError> {
        let table = T::table();
        let txn = self.inner.store.read_txn()?;
        let catalog = self.inner.catalog_snapshot();
        let rows = match index {
            Some(name) => {
                let spec = catalog
                    .get(table, name)
                    .ok_or_else(|| LegdbError::MissingIndex { table: table.name(), index: name.to_string() })?;
                seek_named(&self.inner.store, &txn, predicate, table, spec)?
            }
            None => crate::db::step::evaluate_predicate_raw(&self.inner.store, &txn, &catalog, &self.inner.planner, table, predicate)?,
        };
        hydrate_rows(&self.inner, rows)
    }

    /// The first match of [`Self::seek`], if any.
    pub fn seek_one<T: Persisted>(&self, predicate: &crate::db::Predicate, index: Option<&str>) -> Result<Option<T>, LegdbError> {
        Ok(self.seek::<T>(predicate, index)?.into_iter().next())
    }

    /// Seek edges whose endpoints are given either as concrete oids (via
    /// `start`/`end` attributes already present in `extra`) or as patterns
    /// over node attributes. When `start_predicate` and/or `end_predicate`
    /// is given, it is first resolved against the node table, possibly to
    /// several nodes, and the Cartesian product of matches is used to
    /// expand into one concrete edge seek per combination, deduplicated by
    /// oid.
    pub fn seek_edges_by_endpoints(
        &self,
        start_predicate: Option<&crate::db::Predicate>,
        end_predicate: Option<&crate::db::Predicate>,
        extra: &crate::db::Predicate,
    ) -> Result<Vec<Edge>, LegdbError> {
        let start_oids = self.resolve_endpoints(start_predicate)?;
        let end_oids = self.resolve_endpoints(end_predicate)?;

        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        for start in &start_oids {
            for end in &end_oids {
                let mut pred = extra.clone();
                if let Some(oid) = start {
                    pred.insert(crate::db::entity::START_ID_ATTR, Value::Bytes(oid.as_bytes().to_vec()));
                }
                if let Some(oid) = end {
                    pred.insert(crate::db::entity::END_ID_ATTR, Value::Bytes(oid.as_bytes().to_vec()));
                }
                for edge in self.seek::<Edge>(&pred, None)? {
                    if let Some(oid) = edge.oid() {
                        if seen.insert(oid.clone()) {
                            out.push(edge);
                        }
                    }
                }
            }
        }
        Ok(out)
    }

    fn resolve_endpoints(&self, predicate: Option<&crate::db::Predicate>) -> Result<Vec<Option<Oid>>, LegdbError> {
        match predicate {
            None => Ok(vec![None]),
            Some(p) => Ok(self.seek::<Node>(p, None)?.into_iter().map(|n| n.oid().cloned()).collect()),
        }
    }

    /// Full-table scan, optionally filtered in-process by an arbitrary
    /// closure rather than only equality conditions.
    pub fn find<T: Persisted>(&self, filter: Option<&dyn Fn(&Document) -> bool>) -> Result<Vec<T>, LegdbError> {
        let txn = self.inner.store.read_txn()?;
        let rows = self.inner.store.scan_table(&txn, T::table())?;
        let mut out = Vec::new();
        for row in rows {
            if filter.map_or(true, |f| f(&row.doc)) {
                let mut entity = T::from_row(row.oid, row.doc)?;
                entity.bind(Arc::downgrade(&self.inner));
                out.push(entity);
            }
        }
        Ok(out)
    }

    /// Ordered range scan bound to a single entity type, so `lower` and
    /// `upper` can never name different tables.
    pub fn range<T: Persisted>(
        &self,
        lower: Option<&Document>,
        upper: Option<&Document>,
        inclusive: bool,
        index: Option<&str>,
    ) -> Result<Vec<T>, LegdbError> {
        let table = T::table();
        let rows = self.range_dyn(lower.map(|d| (table, d)), upper.map(|d| (table, d)), inclusive, index)?;
        hydrate_rows(&self.inner, rows)
    }

    /// Same as [`Self::range`] but returning bare oids.
    pub fn range_oids<T: Persisted>(&self, lower: Option<&Document>, upper: Option<&Document>, inclusive: bool, index: Option<&str>) -> Result<Vec<Oid>, LegdbError> {
        let table = T::table();
        let rows = self.range_dyn(lower.map(|d| (table, d)), upper.map(|d| (table, d)), inclusive, index)?;
        Ok(rows.into_iter().map(|(oid, _)| oid).collect())
    }

    /// The dynamically-typed range operation: `lower`/`upper` each carry
    /// their own entity type tag, so a mismatch (e.g. a `Node` lower bound
    /// against an `Edge` upper bound) is a runtime
    /// [`LegdbError::TypeMismatch`] rather than a type error. If `index` is
    /// not given, every registered index whose attributes are covered by the
    /// bound document(s) is consulted and their oid results intersected;
    /// if none cover the bound, this degrades to a full scan filtered by
    /// equality on the attributes `lower` supplies (an explicit deviation
    /// recorded in `DESIGN.md`).
    pub fn range_dyn(&self, lower: Option<(Table, &Document)>, upper: Option<(Table, &Document)>, inclusive: bool, index: Option<&str>) -> Result<Vec<(Oid, Document)>, LegdbError> {
        let table = match (lower, upper) {
            (Some((lt, _)), Some((ut, _))) if lt != ut => {
                return Err(LegdbError::TypeMismatch { lower: lt.name(), upper: ut.name() });
            }
            (Some((lt, _)), _) => lt,
            (None, Some((ut, _))) => ut,
            (None, None) => {
                return Err(LegdbError::InvalidPipeline("range requires at least one bound to determine the table".to_string()));
            }
        };

        let txn = self.inner.store.read_txn()?;
        let catalog = self.inner.catalog_snapshot();

        let candidates: Vec<IndexSpec> = match index {
            Some(name) => {
                let spec = catalog.get(table, name).ok_or_else(|| LegdbError::MissingIndex { table: table.name(), index: name.to_string() })?;
                vec![spec.clone()]
            }
            None => {
                let probe = lower.map(|(_, d)| d).or_else(|| upper.map(|(_, d)| d));
                match probe {
                    Some(doc) => {
                        let attrs: Vec<AttrName> = doc.attr_names().cloned().collect();
                        catalog.list(table).iter().filter(|s| s.covers(&attrs)).cloned().collect()
                    }
                    None => Vec::new(),
                }
            }
        };

        if candidates.is_empty() {
            let rows = self.inner.store.scan_table(&txn, table)?;
            let probe = lower.map(|(_, d)| d);
            let out = match probe {
                Some(doc) => rows.into_iter().filter(|r| attrs_match(&r.doc, doc)).map(|r| (r.oid, r.doc)).collect(),
                None => rows.into_iter().map(|r| (r.oid, r.doc)).collect(),
            };
            return Ok(out);
        }

        let mut acc: Option<std::collections::HashSet<Oid>> = None;
        for spec in &candidates {
            let lower_key = lower.map(|(_, d)| render_prefix_for(spec, d));
            let upper_key = upper.map(|(_, d)| render_prefix_for(spec, d));
            let entries = self.inner.store.range_index(&txn, table, &spec.name, lower_key.as_deref(), upper_key.as_deref(), inclusive)?;
            let oids: std::collections::HashSet<Oid> = entries.into_iter().map(|(_, oid)| oid).collect();
            acc = Some(match acc {
                Some(mut running) => {
                    running.retain(|o| oids.contains(o));
                    running
                }
                None => oids,
            });
        }

        let mut out = Vec::new();
        for oid in acc.unwrap_or_default() {
            if let Some(doc) = self.inner.store.get(&txn, table, &oid)? {
                out.push((oid, doc));
            }
        }
        Ok(out)
    }

    /// Train (if `samples` is non-empty) a zstd dictionary and mark `T`'s
    /// table as compressed going forward. Existing rows are left as-is; they
    /// decode correctly regardless of compression state since each row's
    /// encoding is self-describing only through the table-wide compression
    /// marker read at decode time, so compressing mid-lifetime requires a
    /// `vacuum` to re-encode old rows; noted as a sequencing requirement,
    /// not automated here.
    pub fn compress<T: Persisted>(&self, samples: &[Vec<u8>], compression_type: CompressionType, level: i32, dict_size: usize) -> Result<(), LegdbError> {
        if matches!(compression_type, CompressionType::None) {
            return Ok(());
        }
        let table = T::table();
        let mut wtxn = self.inner.store.write_txn()?;
        let dict = if samples.is_empty() { None } else { Some(self.inner.store.zstd_train(&mut wtxn, table, samples, dict_size)?) };
        self.inner.store.set_compressed(&mut wtxn, table, level, dict)?;
        commit(wtxn.commit())
    }

    /// Rewrite both tables in place: dump every row and secondary index
    /// entry, clear the on-disk databases, and reinsert, reclaiming space
    /// LMDB otherwise leaves behind after heavy churn. Implemented as a
    /// clear-and-rewrite within the existing environment rather than a dump-
    /// to-new-environment-and-swap, since `heed`'s safe API does not expose
    /// an atomic environment swap as a single primitive, a deliberate
    /// simplification recorded in `DESIGN.md`.
    pub fn vacuum(&self) -> Result<(), LegdbError> {
        let mut wtxn = self.inner.store.write_txn()?;
        let catalog = self.inner.catalog_snapshot();
        for table in [Table::Node, Table::Edge] {
            let rows = self.inner.store.scan_table(&wtxn, table)?;
            let max_oid = rows.iter().map(|r| r.oid.clone()).max();
            let indexes = catalog.list(table).to_vec();

            self.inner.store.clear_table(&mut wtxn, table)?;
            for spec in &indexes {
                self.inner.store.clear_index(&mut wtxn, table, spec)?;
            }
            for row in &rows {
                self.inner.store.restore_row(&mut wtxn, table, &indexes, &row.oid, &row.doc)?;
            }
            if let Some(high) = max_oid {
                self.inner.store.reset_sequence_after(&mut wtxn, table, &high)?;
            }
        }
        commit(wtxn.commit())?;
        self.inner.planner.invalidate();
        Ok(())
    }

    /// Start a traversal pipeline. Opens its own read transaction up front,
    /// held alive for the lifetime of the returned builder/iterator; use
    /// [`Self::traverse_in`] to supply an explicit one instead.
    pub fn traverse(&self) -> Result<StepBuilder<'_>, LegdbError> {
        let txn = self.inner.store.read_txn()?;
        Ok(self.build_step_builder(AutoTxn::owned(txn)))
    }

    /// Same as [`Self::traverse`], but threads an explicit transaction
    /// through verbatim instead of opening an implicit one.
    pub fn traverse_in<'a>(&'a self, txn: &'a RoTxn<'a>) -> StepBuilder<'a> {
        self.build_step_builder(AutoTxn::borrowed(txn))
    }

    fn build_step_builder(&self, txn: AutoTxn<'_>) -> StepBuilder<'_> {
        StepBuilder::new(
            self.inner.store(),
            txn,
            self.inner.catalog_snapshot(),
            self.inner.planner(),
            Arc::downgrade(&self.inner),
            self.inner.config().page_size,
            self.inner.config().n_jobs,
        )
    }
}

fn seek_named(store: &HeedStore, txn: &RoTxn<'_>, predicate: &crate::db::Predicate, table: Table, spec: &IndexSpec) -> Result<Vec<(Oid, Document)>, LegdbError> {
    let components = predicate
        .components_for(&spec.attrs)
        .ok_or_else(|| LegdbError::InvalidPipeline(format!("predicate does not cover every attribute of index {:?}", spec.name)))?;
    let key = spec.template.render(&components);
    let oids = store.seek_exact(txn, table, &spec.name, &key)?;
    let residual = predicate.residual(&spec.attrs);
    let mut out = Vec::new();
    for oid in oids {
        if let Some(doc) = store.get(txn, table, &oid)? {
            if residual.matches(&doc) {
                out.push((oid, doc));
            }
        }
    }
    Ok(out)
}

fn hydrate_rows<T: Persisted>(inner: &Arc<DbInner>, rows: Vec<(Oid, Document)>) -> Result<Vec<T>, LegdbError> {
    let mut out = Vec::with_capacity(rows.len());
    for (oid, doc) in rows {
        let mut entity = T::from_row(oid, doc)?;
        entity.bind(Arc::downgrade(inner));
        out.push(entity);
    }
    Ok(out)
}

fn attrs_match(doc: &Document, probe: &Document) -> bool {
    probe.iter().all(|(k, v)| doc.get_path(k) == Some(v))
}

fn render_prefix_for(spec: &IndexSpec, doc: &Document) -> Vec<u8> {
    let components: Vec<&Value> = spec.attrs.iter().filter_map(|a| doc.get_path(a)).collect();
    spec.template.render_prefix(&components)
}
