//! Module: step
//! Responsibility: the fluent traversal pipeline: `source -> has ->
//! edge_in/edge_out/edge_all`, compiled via a bounded windowed-sweep
//! rewrite into storage-backed executors, then driven by cooperative,
//! pull-based, paginated iteration.
//! Does not own: which index an executor's predicate should use (see
//! `db::planner`) or how a predicate's attributes render to a seek key
//! (see `db::catalog`, `db::key_template`); only how a *sequence* of
//! predicates is generated, scheduled, and deduplicated across stages.
//! Boundary: this is the only module that understands step adjacency
//! and backpressure; `Database::traverse`/`traverse_in` are its only
//! entry points.

use crate::db::catalog::IndexCatalog;
use crate::db::database::DbHandle;
use crate::db::document::Document;
use crate::db::entity::{Edge, Node, Oid, Table, END_ID_ATTR, START_ID_ATTR};
use crate::db::planner::Planner;
use crate::db::predicate::Predicate;
use crate::db::session::AutoTxn;
use crate::db::store::{HeedStore, RoTxn};
use crate::error::LegdbError;
use crate::value::Value;
use std::collections::{HashSet, VecDeque};

pub use crate::db::store::CompressionType;

///
/// PipelineItem
///
/// A traversal result: either a node or an edge, still carrying its database
/// back-reference until the moment it is handed to the consumer.
///

#[derive(Debug)]
pub enum PipelineItem {
    Node(Node),
    Edge(Edge),
}

impl PipelineItem {
    #[must_use]
    pub fn as_node(&self) -> Option<&Node> {
        match self {
            Self::Node(n) => Some(n),
            Self::Edge(_) => None,
        }
    }

    #[must_use]
    pub fn as_edge(&self) -> Option<&Edge> {
        match self {
            Self::Edge(e) => Some(e),
            Self::Node(_) => None,
        }
    }

    #[must_use]
    pub fn into_node(self) -> Option<Node> {
        match self {
            Self::Node(n) => Some(n),
            Self::Edge(_) => None,
        }
    }

    #[must_use]
    pub fn into_edge(self) -> Option<Edge> {
        match self {
            Self::Edge(e) => Some(e),
            Self::Node(_) => None,
        }
    }

    #[must_use]
    pub fn oid(&self) -> &Oid {
        match self {
            Self::Node(n) => n.oid().expect("pipeline nodes are always loaded from storage, hence always have an oid"),
            Self::Edge(e) => e.oid().expect("pipeline edges are always loaded from storage, hence always have an oid"),
        }
    }

    fn disconnect(&mut self) {
        match self {
            Self::Node(n) => n.disconnect(),
            Self::Edge(e) => e.disconnect(),
        }
    }
}

/// A single declared step, before compilation.
#[derive(Clone, Debug)]
enum Step {
    Source(Table),
    Has(Predicate),
    EdgeIn(Predicate),
    EdgeOut(Predicate),
    EdgeAll(Predicate),
}

/// A compiled, storage-backed unit of work. Every `ExecSpec::Filter` is the
/// table-scoped equality filter; source-with-no-conditions and source-fused-
/// with-one-or-more-`has` both end up as one of these.
#[derive(Clone, Debug)]
enum ExecSpec {
    Filter { table: Table, attrs: Predicate },
    EdgeIn(Predicate),
    EdgeOut(Predicate),
    EdgeAll(Predicate),
}

#[derive(Clone, Debug)]
enum Unit {
    Step(Step),
    Exec(ExecSpec),
}

/// Rewrite one window (length 1 or 2) of the in-progress compilation.
/// Returns whether the scan pointer should advance past this window (`true`)
/// or stay put so the result can be re-examined against its new neighbor
/// (`false`; only the source/has fusion rule does this, so a freshly
/// merged `Filter` can absorb a further `Has` immediately to its right).
fn rewrite(window: &[Unit]) -> (bool, Vec<Unit>) {
    match window {
        [Unit::Step(Step::Source(table))] => (true, vec![Unit::Exec(ExecSpec::Filter { table: *table, attrs: Predicate::new() })]),
        [Unit::Step(Step::EdgeIn(attrs))] => (true, vec![Unit::Exec(ExecSpec::EdgeIn(attrs.clone()))]),
        [Unit::Step(Step::EdgeOut(attrs))] => (true, vec![Unit::Exec(ExecSpec::EdgeOut(attrs.clone()))]),
        [Unit::Step(Step::EdgeAll(attrs))] => (true, vec![Unit::Exec(ExecSpec::EdgeAll(attrs.clone()))]),
        [Unit::Exec(ExecSpec::Filter { table, attrs }), Unit::Step(Step::Has(has))] => {
            let mut merged = attrs.clone();
            merged.merge(has);
            (false, vec![Unit::Exec(ExecSpec::Filter { table: *table, attrs: merged })])
        }
        other => (true, other.to_vec()),
    }
}

/// Compile a declared step sequence into executors via the bounded windowed
/// sweep: window size 1 resolves every bare step to its executor, then
/// window size 2 fuses any `(Filter, Has)` adjacency produced by the first
/// pass.
fn compile_all(steps: Vec<Step>) -> Result<Vec<ExecSpec>, LegdbError> {
    if !matches!(steps.first(), Some(Step::Source(_))) {
        return Err(LegdbError::InvalidPipeline("a pipeline must start with a 'source' step".to_string()));
    }
    let mut units: Vec<Unit> = steps.into_iter().map(Unit::Step).collect();
    for window_size in [1usize, 2usize] {
        let mut i = 0;
        while i < units.len() {
            let j = (i + window_size).min(units.len());
            let window = units[i..j].to_vec();
            let (advance, replacement) = rewrite(&window);
            units.splice(i..j, replacement);
            if advance {
                i += 1;
            }
        }
    }
    units
        .into_iter()
        .map(|u| match u {
            Unit::Exec(spec) => Ok(spec),
            Unit::Step(_) => Err(LegdbError::InvalidPipeline("pipeline has a step that never resolved to an executor".to_string())),
        })
        .collect()
}

/// Plan and evaluate one predicate against `table`: seek the planner's
/// chosen index (residual-filtering the result against the document) or fall
/// back to a full scan filtered by the whole predicate. Shared by every
/// pipeline executor and, through [`evaluate_predicate_raw`], by
/// `Database::seek`/`Database::find`'s planner-driven path.
pub(crate) fn evaluate_predicate_raw(
    store: &HeedStore,
    txn: &RoTxn<'_>,
    catalog: &IndexCatalog,
    planner: &Planner,
    table: Table,
    predicate: &Predicate,
) -> Result<Vec<(Oid, Document)>, LegdbError> {
    let choice = planner.plan(store, txn, catalog, table, predicate)?;
    match &choice.index_name {
        Some(name) => {
            let spec = catalog
                .get(table, name)
                .ok_or_else(|| LegdbError::MissingIndex { table: table.name(), index: name.clone() })?;
            let components = predicate
                .components_for(&spec.attrs)
                .expect("the planner only ever names an index whose attrs are covered by the predicate");
            let key = spec.template.render(&components);
            let oids = store.seek_exact(txn, table, name, &key)?;
            let residual = predicate.residual(&spec.attrs);
            let mut out = Vec::with_capacity(oids.len());
            for oid in oids {
                if let Some(doc) = store.get(txn, table, &oid)? {
                    if residual.matches(&doc) {
                        out.push((oid, doc));
                    }
                }
            }
            Ok(out)
        }
        None => {
            let rows = store.scan_table(txn, table)?;
            Ok(rows.into_iter().filter(|r| predicate.matches(&r.doc)).map(|r| (r.oid, r.doc)).collect())
        }
    }
}

fn hydrate_item(table: Table, oid: Oid, doc: Document, db_handle: &DbHandle) -> Result<PipelineItem, LegdbError> {
    match table {
        Table::Node => {
            let mut node = Node::from_document(oid, doc);
            node.bind(db_handle.clone());
            Ok(PipelineItem::Node(node))
        }
        Table::Edge => {
            let mut edge = Edge::from_document(oid, doc)?;
            edge.bind(db_handle.clone());
            Ok(PipelineItem::Edge(edge))
        }
    }
}

/// Shared runtime state behind every executor: a queue of predicates still
/// to evaluate (seeded by upstream `input`), a buffer of already-evaluated-
/// but-not-yet-emitted items, and the set of oids this executor has ever
/// emitted. Dedup is mandatory and persists for the executor's entire
/// lifetime.
#[derive(Default)]
struct ExecCore {
    queue: VecDeque<Predicate>,
    emitted: HashSet<Oid>,
    buffer: VecDeque<PipelineItem>,
}

impl ExecCore {
    fn absorb(&mut self, rows: Vec<(Oid, Document)>, table: Table, db_handle: &DbHandle) -> Result<(), LegdbError> {
        for (oid, doc) in rows {
            if !self.emitted.insert(oid.clone()) {
                continue;
            }
            self.buffer.push_back(hydrate_item(table, oid, doc, db_handle)?);
        }
        Ok(())
    }

    /// Drain every queued predicate and evaluate them, one seek per
    /// predicate, either serially on the calling thread or, when `n_jobs >
    /// 1` and the `parallel` feature is enabled, fanned out across a
    /// `rayon` scope, each worker opening its own short-lived read
    /// transaction.
    #[allow(clippy::too_many_arguments)]
    fn next_page(
        &mut self,
        store: &HeedStore,
        txn: &RoTxn<'_>,
        catalog: &IndexCatalog,
        planner: &Planner,
        db_handle: &DbHandle,
        table: Table,
        page_size: usize,
        n_jobs: usize,
    ) -> Result<Vec<PipelineItem>, LegdbError> {
        let mut out = Vec::new();
        loop {
            while let Some(item) = self.buffer.pop_front() {
                out.push(item);
                if out.len() == page_size {
                    return Ok(out);
                }
            }
            if self.queue.is_empty() {
                return Ok(out);
            }

            #[cfg(feature = "parallel")]
            if n_jobs > 1 && self.queue.len() > 1 {
                let batch: Vec<Predicate> = self.queue.drain(..).collect();
                let rows = evaluate_batch_parallel(store, catalog, planner, table, &batch)?;
                self.absorb(rows, table, db_handle)?;
                continue;
            }
            #[cfg(not(feature = "parallel"))]
            let _ = n_jobs;

            let pred = self.queue.pop_front().expect("checked non-empty above");
            let rows = evaluate_predicate_raw(store, txn, catalog, planner, table, &pred)?;
            self.absorb(rows, table, db_handle)?;
        }
    }
}

/// Evaluate several predicates concurrently, one `rayon` worker per
/// predicate, each opening its own read transaction against the shared
/// `heed::Env`. Errors from any worker surface on the first one observed
/// after the scope joins.
#[cfg(feature = "parallel")]
fn evaluate_batch_parallel(store: &HeedStore, catalog: &IndexCatalog, planner: &Planner, table: Table, preds: &[Predicate]) -> Result<Vec<(Oid, Document)>, LegdbError> {
    use std::sync::Mutex;
    let results: Mutex<Vec<Result<Vec<(Oid, Document)>, LegdbError>>> = Mutex::new(Vec::with_capacity(preds.len()));
    rayon::scope(|scope| {
        for pred in preds {
            let results = &results;
            scope.spawn(move |_| {
                let outcome = store.read_txn().and_then(|txn| evaluate_predicate_raw(store, &txn, catalog, planner, table, pred));
                results.lock().expect("parallel fan-out result lock poisoned").push(outcome);
            });
        }
    });
    let mut out = Vec::new();
    for result in results.into_inner().expect("parallel fan-out result lock poisoned") {
        out.extend(result?);
    }
    Ok(out)
}

enum EdgeKind {
    In,
    Out,
    All,
}

struct FilterExec {
    table: Table,
    core: ExecCore,
}

struct EdgeExec {
    kind: EdgeKind,
    base_attrs: Predicate,
    core: ExecCore,
}

/// One compiled pipeline stage at runtime. The root stage (always a
/// `Filter`, since a pipeline must start with a source) seeds its own queue
/// at construction; every other stage's queue is fed exclusively by
/// [`ExecRuntime::input`] from its upstream neighbor.
enum ExecRuntime {
    Filter(FilterExec),
    Edge(EdgeExec),
}

impl ExecRuntime {
    fn build(spec: ExecSpec, is_root: bool) -> Self {
        match spec {
            ExecSpec::Filter { table, attrs } => {
                let mut core = ExecCore::default();
                if is_root {
                    core.queue.push_back(attrs);
                }
                Self::Filter(FilterExec { table, core })
            }
            ExecSpec::EdgeIn(attrs) => Self::Edge(EdgeExec { kind: EdgeKind::In, base_attrs: attrs, core: ExecCore::default() }),
            ExecSpec::EdgeOut(attrs) => Self::Edge(EdgeExec { kind: EdgeKind::Out, base_attrs: attrs, core: ExecCore::default() }),
            ExecSpec::EdgeAll(attrs) => Self::Edge(EdgeExec { kind: EdgeKind::All, base_attrs: attrs, core: ExecCore::default() }),
        }
    }

    fn table(&self) -> Table {
        match self {
            Self::Filter(f) => f.table,
            Self::Edge(_) => Table::Edge,
        }
    }

    /// Feed one upstream item, turning it into one (EdgeIn/EdgeOut) or two
    /// (EdgeAll) concrete predicates queued for this stage's own next
    /// evaluation. The root `Filter` stage never receives input; it has no
    /// upstream.
    fn input(&mut self, item: &PipelineItem) {
        let Self::Edge(e) = self else { return };
        let oid = item.oid().clone();
        match e.kind {
            EdgeKind::In => {
                let mut p = e.base_attrs.clone();
                p.insert(END_ID_ATTR, Value::Bytes(oid.as_bytes().to_vec()));
                e.core.queue.push_back(p);
            }
            EdgeKind::Out => {
                let mut p = e.base_attrs.clone();
                p.insert(START_ID_ATTR, Value::Bytes(oid.as_bytes().to_vec()));
                e.core.queue.push_back(p);
            }
            EdgeKind::All => {
                let mut as_start = e.base_attrs.clone();
                as_start.insert(START_ID_ATTR, Value::Bytes(oid.as_bytes().to_vec()));
                e.core.queue.push_back(as_start);
                let mut as_end = e.base_attrs.clone();
                as_end.insert(END_ID_ATTR, Value::Bytes(oid.as_bytes().to_vec()));
                e.core.queue.push_back(as_end);
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn next_page(
        &mut self,
        store: &HeedStore,
        txn: &RoTxn<'_>,
        catalog: &IndexCatalog,
        planner: &Planner,
        db_handle: &DbHandle,
        page_size: usize,
        n_jobs: usize,
    ) -> Result<Vec<PipelineItem>, LegdbError> {
        let table = self.table();
        match self {
            Self::Filter(f) => f.core.next_page(store, txn, catalog, planner, db_handle, table, page_size, n_jobs),
            Self::Edge(e) => e.core.next_page(store, txn, catalog, planner, db_handle, table, page_size, n_jobs),
        }
    }
}

///
/// Pipeline
///
/// The compiled, running form of a [`StepBuilder`]. Implements the
/// cooperative pull-based algorithm: each stage is pulled for a page; an
/// empty page backs the cursor off to feed the previous stage again, never
/// re-querying a stage that still has buffered or queued work. Only the last
/// stage's output reaches the caller.
///

struct Pipeline<'a> {
    execs: Vec<ExecRuntime>,
    stage: usize,
    feed_pending: Option<Vec<PipelineItem>>,
    pending_output: VecDeque<PipelineItem>,
    exhausted: bool,
    store: &'a HeedStore,
    txn: AutoTxn<'a>,
    catalog: IndexCatalog,
    planner: &'a Planner,
    db_handle: DbHandle,
    page_size: usize,
    n_jobs: usize,
}

impl Pipeline<'_> {
    fn advance(&mut self) -> Result<(), LegdbError> {
        let last = self.execs.len().saturating_sub(1);
        loop {
            if self.stage > 0 {
                if let Some(batch) = self.feed_pending.take() {
                    for item in &batch {
                        self.execs[self.stage].input(item);
                    }
                }
            }
            let txn = self.txn.txn();
            let page = self.execs[self.stage].next_page(self.store, txn, &self.catalog, self.planner, &self.db_handle, self.page_size, self.n_jobs)?;
            if page.is_empty() {
                if self.stage == 0 {
                    self.exhausted = true;
                    return Ok(());
                }
                self.stage -= 1;
                continue;
            }
            if self.stage < last {
                self.feed_pending = Some(page);
                self.stage += 1;
                continue;
            }
            self.pending_output.extend(page);
            return Ok(());
        }
    }
}

impl Iterator for Pipeline<'_> {
    type Item = Result<PipelineItem, LegdbError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(mut item) = self.pending_output.pop_front() {
                item.disconnect();
                return Some(Ok(item));
            }
            if self.exhausted {
                return None;
            }
            if let Err(e) = self.advance() {
                self.exhausted = true;
                return Some(Err(e));
            }
        }
    }
}

///
/// StepBuilder
///
/// The fluent builder for a traversal pipeline:
/// `source(table).has(predicate).edge_out(predicate)...`. Compiles lazily
/// on first iteration, exactly once, rather than compiling eagerly at
/// each builder call.
///

pub struct StepBuilder<'a> {
    steps: Vec<Step>,
    store: &'a HeedStore,
    txn: Option<AutoTxn<'a>>,
    catalog: IndexCatalog,
    planner: &'a Planner,
    db_handle: DbHandle,
    page_size: usize,
    n_jobs: usize,
    pipeline: Option<Pipeline<'a>>,
}

impl<'a> StepBuilder<'a> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(store: &'a HeedStore, txn: AutoTxn<'a>, catalog: IndexCatalog, planner: &'a Planner, db_handle: DbHandle, page_size: usize, n_jobs: usize) -> Self {
        Self { steps: Vec::new(), store, txn: Some(txn), catalog, planner, db_handle, page_size, n_jobs, pipeline: None }
    }

    /// Must be the first step in the pipeline.
    pub fn source(mut self, table: Table) -> Result<Self, LegdbError> {
        if !self.steps.is_empty() {
            return Err(LegdbError::InvalidPipeline("step 'source' must be the first step in a pipeline".to_string()));
        }
        self.steps.push(Step::Source(table));
        Ok(self)
    }

    /// An equality filter over the current stage's entities. Fuses with an
    /// immediately preceding bare `source` at compile time rather than
    /// running as its own executor.
    #[must_use]
    pub fn has(mut self, attrs: Predicate) -> Self {
        self.steps.push(Step::Has(attrs));
        self
    }

    /// Follow incoming edges into the current node stage: for each upstream
    /// node, seeks edges whose `end_id` is that node.
    #[must_use]
    pub fn edge_in(mut self, attrs: Predicate) -> Self {
        self.steps.push(Step::EdgeIn(attrs));
        self
    }

    /// Follow outgoing edges from the current node stage: for each upstream
    /// node, seeks edges whose `start_id` is that node.
    #[must_use]
    pub fn edge_out(mut self, attrs: Predicate) -> Self {
        self.steps.push(Step::EdgeOut(attrs));
        self
    }

    /// Follow edges in either direction: for each upstream node, seeks edges
    /// where it is either endpoint, deduplicated by oid (so a self-loop is
    /// emitted once).
    #[must_use]
    pub fn edge_all(mut self, attrs: Predicate) -> Self {
        self.steps.push(Step::EdgeAll(attrs));
        self
    }

    /// Concatenate several independently-built pipelines into one
    /// deduplicated stream. Exposed as an associated function rather than a
    /// chainable instance method since its result is a different iterator
    /// type, not a further `StepBuilder`.
    #[must_use]
    pub fn union(children: Vec<StepBuilder<'a>>) -> Union<'a> {
        Union::new(children)
    }

    fn ensure_compiled(&mut self) -> Result<&mut Pipeline<'a>, LegdbError> {
        if self.pipeline.is_none() {
            let steps = std::mem::take(&mut self.steps);
            let specs = compile_all(steps)?;
            let execs: Vec<ExecRuntime> = specs.into_iter().enumerate().map(|(i, spec)| ExecRuntime::build(spec, i == 0)).collect();
            let txn = self.txn.take().expect("a StepBuilder compiles exactly once");
            self.pipeline = Some(Pipeline {
                execs,
                stage: 0,
                feed_pending: None,
                pending_output: VecDeque::new(),
                exhausted: false,
                store: self.store,
                txn,
                catalog: self.catalog.clone(),
                planner: self.planner,
                db_handle: self.db_handle.clone(),
                page_size: self.page_size,
                n_jobs: self.n_jobs,
            });
        }
        Ok(self.pipeline.as_mut().expect("just compiled, if it wasn't already"))
    }
}

impl<'a> Iterator for StepBuilder<'a> {
    type Item = Result<PipelineItem, LegdbError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.ensure_compiled() {
            Ok(pipeline) => pipeline.next(),
            Err(e) => Some(Err(e)),
        }
    }
}

///
/// Union
///
/// Concatenates the outputs of several independently-compiled pipelines,
/// deduplicated by oid across all of them combined.
///

pub struct Union<'a> {
    children: Vec<StepBuilder<'a>>,
    emitted: HashSet<Oid>,
    idx: usize,
}

impl<'a> Union<'a> {
    #[must_use]
    pub fn new(children: Vec<StepBuilder<'a>>) -> Self {
        Self { children, emitted: HashSet::new(), idx: 0 }
    }
}

impl Iterator for Union<'_> {
    type Item = Result<PipelineItem, LegdbError>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.idx < self.children.len() {
            match self.children[self.idx].next() {
                Some(Ok(item)) => {
                    if self.emitted.insert(item.oid().clone()) {
                        return Some(Ok(item));
                    }
                }
                Some(Err(e)) => return Some(Err(e)),
                None => self.idx += 1,
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node_step(table: Table) -> Vec<Step> {
        vec![Step::Source(table)]
    }

    #[test]
    fn compile_bare_source_is_an_empty_filter() {
        let specs = compile_all(node_step(Table::Node)).unwrap();
        assert_eq!(specs.len(), 1);
        match &specs[0] {
            ExecSpec::Filter { table, attrs } => {
                assert_eq!(*table, Table::Node);
                assert!(attrs.is_empty());
            }
            _ => panic!("expected a Filter spec"),
        }
    }

    #[test]
    fn compile_fuses_source_and_has() {
        let mut steps = node_step(Table::Node);
        steps.push(Step::Has(Predicate::new().with("c", "a")));
        let specs = compile_all(steps).unwrap();
        assert_eq!(specs.len(), 1);
        match &specs[0] {
            ExecSpec::Filter { attrs, .. } => assert_eq!(attrs.get("c"), Some(&Value::Text("a".to_string()))),
            _ => panic!("expected a fused Filter spec"),
        }
    }

    #[test]
    fn compile_does_not_fuse_across_an_edge_step() {
        let mut steps = node_step(Table::Node);
        steps.push(Step::EdgeOut(Predicate::new()));
        steps.push(Step::Has(Predicate::new().with("w", 1i64)));
        let err = compile_all(steps);
        // A `has` immediately after an edge step never fuses (only
        // Filter-then-Has fuses), so it is left unresolved.
        assert!(err.is_err());
    }

    #[test]
    fn compile_rejects_pipeline_without_source_first() {
        let steps = vec![Step::Has(Predicate::new())];
        assert!(compile_all(steps).is_err());
    }

    #[test]
    fn edge_all_queues_both_directions() {
        let mut rt = ExecRuntime::build(ExecSpec::EdgeAll(Predicate::new()), false);
        let node = Node::from_document(Oid::from_sequence(5), Document::new());
        rt.input(&PipelineItem::Node(node));
        if let ExecRuntime::Edge(e) = &rt {
            assert_eq!(e.core.queue.len(), 2);
        } else {
            panic!("expected an edge executor");
        }
    }
}
