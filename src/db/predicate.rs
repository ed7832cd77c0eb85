//! Module: predicate
//! Responsibility: an attribute-equality condition set, as handed to
//! `Database::find`/`StepBuilder::has`.
//! Does not own: which index (if any) satisfies a predicate (see
//! `db::planner`) or range-bound comparisons (see `db::database::range`,
//! which compares `Value`s directly rather than through a `Predicate`).

use crate::db::document::{AttrName, Document};
use crate::value::Value;
use std::collections::BTreeMap;

///
/// Predicate
///
/// An unordered set of `attribute = value` equalities, possibly over nested
/// paths (`outer[inner]`). The planner selects the best available index
/// whose attributes are a subset of the predicate's *top-level* attribute
/// names; whatever the chosen index does not cover is re-checked against the
/// full document as a residual filter.
///

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Predicate {
    conditions: BTreeMap<AttrName, Value>,
}

impl Predicate {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, attr: impl Into<AttrName>, value: impl Into<Value>) -> Self {
        self.conditions.insert(attr.into(), value.into());
        self
    }

    pub fn insert(&mut self, attr: impl Into<AttrName>, value: impl Into<Value>) {
        self.conditions.insert(attr.into(), value.into());
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    #[must_use]
    pub fn get(&self, attr: &str) -> Option<&Value> {
        self.conditions.get(attr)
    }

    /// Top-level attribute names this predicate constrains, in ascending
    /// order. The planner's cache key is this set, not the bound values.
    #[must_use]
    pub fn attr_names(&self) -> Vec<AttrName> {
        self.conditions.keys().cloned().collect()
    }

    #[must_use]
    pub fn attr_name_set(&self) -> std::collections::BTreeSet<AttrName> {
        self.conditions.keys().cloned().collect()
    }

    /// The subset of conditions not covered by `covered` attribute
    /// names: the residual post-filter for a chosen index.
    #[must_use]
    pub fn residual(&self, covered: &[AttrName]) -> Self {
        let conditions = self
            .conditions
            .iter()
            .filter(|(k, _)| !covered.contains(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Self { conditions }
    }

    /// Merge another predicate's conditions into this one; on a shared
    /// attribute name the other predicate's value wins.
    pub fn merge(&mut self, other: &Self) {
        for (k, v) in &other.conditions {
            self.conditions.insert(k.clone(), v.clone());
        }
    }

    /// Component values for a list of attribute names, in that order; used
    /// to render an index seek key for the attributes an index covers.
    #[must_use]
    pub fn components_for<'a>(&'a self, attrs: &[AttrName]) -> Option<Vec<&'a Value>> {
        attrs.iter().map(|a| self.conditions.get(a)).collect()
    }

    /// True if every condition in this predicate matches `doc`, resolving
    /// nested paths via [`Document::get_path`].
    #[must_use]
    pub fn matches(&self, doc: &Document) -> bool {
        self.conditions.iter().all(|(attr, expected)| doc.get_path(attr) == Some(expected))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_checks_every_condition() {
        let mut doc = Document::new();
        doc.insert("c", "a");
        doc.insert("ord_c_mod_2", 1i64);

        let p = Predicate::new().with("c", "a").with("ord_c_mod_2", 1i64);
        assert!(p.matches(&doc));

        let p2 = Predicate::new().with("c", "b");
        assert!(!p2.matches(&doc));
    }

    #[test]
    fn residual_excludes_covered_attrs() {
        let p = Predicate::new().with("c", "a").with("w", 3i64);
        let residual = p.residual(&["c".to_string()]);
        assert_eq!(residual.attr_names(), vec!["w".to_string()]);
    }

    #[test]
    fn attr_name_set_is_shape_only() {
        let p1 = Predicate::new().with("c", "a");
        let p2 = Predicate::new().with("c", "b");
        assert_eq!(p1.attr_name_set(), p2.attr_name_set());
    }
}

#[cfg(test)]
mod property_tests {
    use super::*;
    use proptest::prelude::*;

    const ATTRS: [&str; 3] = ["a", "b", "c"];

    fn arb_value() -> impl Strategy<Value = Value> {
        prop_oneof![any::<i64>().prop_map(Value::Int), "[a-z]{0,4}".prop_map(Value::Text),]
    }

    fn arb_predicate() -> impl Strategy<Value = Predicate> {
        prop::collection::vec(arb_value(), ATTRS.len()).prop_map(|values| {
            let mut p = Predicate::new();
            for (attr, value) in ATTRS.iter().zip(values) {
                p.insert(*attr, value);
            }
            p
        })
    }

    fn arb_attr() -> impl Strategy<Value = &'static str> {
        prop_oneof![Just(ATTRS[0]), Just(ATTRS[1]), Just(ATTRS[2])]
    }

    fn arb_covered() -> impl Strategy<Value = Vec<AttrName>> {
        prop::collection::vec(arb_attr(), 0..=ATTRS.len()).prop_map(|attrs| attrs.into_iter().map(str::to_string).collect())
    }

    fn arb_doc() -> impl Strategy<Value = Document> {
        prop::collection::vec(prop_oneof![Just(None), arb_value().prop_map(Some)], ATTRS.len())
            .prop_map(|values| {
                let mut doc = Document::new();
                for (attr, value) in ATTRS.iter().zip(values) {
                    if let Some(value) = value {
                        doc.insert(*attr, value);
                    }
                }
                doc
            })
    }

    proptest! {
        // Splitting a predicate into an index-covered part and a residual
        // part must never change what it matches: an index seek on the
        // covered attributes, re-checked by the residual post-filter, is
        // only sound if the two halves recombine into the original.
        #[test]
        fn residual_split_is_sound(predicate in arb_predicate(), covered in arb_covered(), doc in arb_doc()) {
            let residual = predicate.residual(&covered);
            let covered_matches = predicate
                .attr_names()
                .iter()
                .filter(|a| covered.contains(*a))
                .all(|a| doc.get_path(a) == predicate.get(a));
            prop_assert_eq!(predicate.matches(&doc), covered_matches && residual.matches(&doc));
        }

        #[test]
        fn merge_is_idempotent_on_self(predicate in arb_predicate()) {
            let mut merged = predicate.clone();
            merged.merge(&predicate);
            prop_assert_eq!(merged, predicate);
        }
    }
}
