//! Module: planner
//! Responsibility: pick the cheapest index whose attribute set is
//! covered by a predicate's attribute set, and compute the residual
//! attributes a post-filter must still check.
//! Does not own: the index registry itself (see `db::catalog`) or the
//! storage-level count/seek calls the choice is based on (see
//! `db::store`).
//! Boundary: callers ask `Planner::plan`; nothing above this module
//! renders an index key or counts entries directly.

use crate::db::catalog::IndexCatalog;
use crate::db::document::AttrName;
use crate::db::entity::Table;
use crate::db::predicate::Predicate;
use crate::db::store::{HeedStore, RoTxn};
use crate::error::LegdbError;
use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

/// The planner's cache key: a predicate's attribute-name *shape*, never its
/// bound values.
type ShapeKey = (Table, BTreeSet<AttrName>);

///
/// PlanChoice
///
/// The planner's verdict for one predicate shape: which index to seek
/// (`None` means full-table scan), and which attributes remain for the post-
/// filter to check.
///

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PlanChoice {
    pub index_name: Option<String>,
    pub residual_attrs: Vec<AttrName>,
}

///
/// Planner
///
/// Caches `(table, attr-name-shape) -> PlanChoice` across read transactions.
/// Invalidated wholesale on `ensure_index` rather than tracked per-entry,
/// since a catalog change can affect any predicate shape's cheapest-index
/// answer.
///

#[derive(Default)]
pub struct Planner {
    cache: Mutex<HashMap<ShapeKey, PlanChoice>>,
}

impl Planner {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every cached plan. Called by the façade on every successful
    /// `ensure_index` call; a rejected `ensure_index` (e.g. a shape conflict)
    /// never reaches here, so the cache stays untouched by failed calls.
    pub fn invalidate(&self) {
        self.cache.lock().expect("planner cache lock poisoned").clear();
    }

    /// Choose the cheapest index for `predicate` against `table`, or `None`
    /// if no registered index's attributes are a subset of the predicate's;
    /// ties broken by registration order).
    pub fn plan(
        &self,
        store: &HeedStore,
        txn: &RoTxn<'_>,
        catalog: &IndexCatalog,
        table: Table,
        predicate: &Predicate,
    ) -> Result<PlanChoice, LegdbError> {
        let shape = predicate.attr_name_set();
        let cache_key = (table, shape);
        if let Some(hit) = self.cache.lock().expect("planner cache lock poisoned").get(&cache_key) {
            return Ok(hit.clone());
        }

        let attr_names = predicate.attr_names();
        let mut best: Option<(usize, usize, &crate::db::catalog::IndexSpec)> = None; // (count, registration_order, spec)
        for spec in catalog.list(table) {
            if !spec.covers(&attr_names) {
                continue;
            }
            let components = predicate
                .components_for(&spec.attrs)
                .expect("covers() guarantees every attr is present in the predicate");
            let key = spec.template.render(&components);
            let count = store.count_exact(txn, table, &spec.name, &key)?;
            let better = match &best {
                None => true,
                Some((best_count, best_order, _)) => {
                    count < *best_count || (count == *best_count && spec.registration_order < *best_order)
                }
            };
            if better {
                best = Some((count, spec.registration_order, spec));
            }
        }

        let choice = match best {
            Some((_, _, spec)) => PlanChoice {
                index_name: Some(spec.name.clone()),
                residual_attrs: predicate.residual(&spec.attrs).attr_names(),
            },
            None => PlanChoice { index_name: None, residual_attrs: attr_names },
        };

        self.cache
            .lock()
            .expect("planner cache lock poisoned")
            .insert(cache_key, choice.clone());
        Ok(choice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_predicate_has_no_candidate_and_empty_residual() {
        let planner = Planner::new();
        let catalog = IndexCatalog::new();
        let predicate = Predicate::new();
        let shape: ShapeKey = (Table::Node, predicate.attr_name_set());
        // No store/txn needed: the candidate loop never runs because no
        // index can ever be covered by an empty attribute set only if
        // an index itself has zero attrs, which `IndexCatalog` forbids
        // by construction (`KeyTemplate::for_arity` asserts arity > 0).
        assert!(catalog.list(Table::Node).is_empty());
        assert_eq!(shape.1.len(), 0);
        planner.invalidate();
    }
}
