//! Module: document
//! Responsibility: convert an in-memory entity to/from its on-disk form
//! (an ordered `attribute name -> value` mapping) and apply the
//! empty-key escape the storage layer requires.
//! Does not own: the `oid` itself (carried alongside a `Document`, never
//! inside it) or edge endpoint hydration (see `db::entity`).

use crate::value::Value;
use std::collections::BTreeMap;

/// An attribute name. A plain `String` alias rather than a newtype: the
/// planner, catalog, and predicate layers all pass these around by
/// reference and comparing/hashing a newtype buys nothing here.
pub type AttrName = String;

/// LMDB (and `heed` atop it) disallows empty keys; any attribute value equal
/// to the empty string is stored under this sentinel instead and mapped back
/// on read.
pub const EMPTY_STRING_SENTINEL: &str = "-";

///
/// Document
///
/// The on-disk form of a node or edge: an ordered `attribute name -> value`
/// mapping. Never carries an `oid`; that travels alongside a `Document`,
/// assigned by the storage layer on insert.
///

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Document {
    attrs: BTreeMap<AttrName, Value>,
}

impl Document {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn from_attrs(attrs: BTreeMap<AttrName, Value>) -> Self {
        Self { attrs }
    }

    pub fn insert(&mut self, name: impl Into<AttrName>, value: impl Into<Value>) -> &mut Self {
        self.attrs.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.attrs.get(name)
    }

    /// Resolve a possibly-nested attribute path (`outer` or `outer[inner]`)
    /// against this document.
    #[must_use]
    pub fn get_path(&self, path: &str) -> Option<&Value> {
        match parse_nested_path(path) {
            Some((outer, inner)) => self.attrs.get(outer)?.get_nested(inner),
            None => self.attrs.get(path),
        }
    }

    #[must_use]
    pub fn attr_names(&self) -> impl Iterator<Item = &AttrName> {
        self.attrs.keys()
    }

    #[must_use]
    pub fn contains_all(&self, names: impl IntoIterator<Item = impl AsRef<str>>) -> bool {
        names.into_iter().all(|n| self.attrs.contains_key(n.as_ref()))
    }

    #[must_use]
    pub fn iter(&self) -> impl Iterator<Item = (&AttrName, &Value)> {
        self.attrs.iter()
    }

    #[must_use]
    pub fn into_attrs(self) -> BTreeMap<AttrName, Value> {
        self.attrs
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.attrs.remove(name)
    }

    /// Apply the empty-string-to-sentinel escape before handing this
    /// document to the storage layer.
    #[must_use]
    pub fn to_stored(&self) -> Self {
        let attrs = self
            .attrs
            .iter()
            .map(|(k, v)| {
                let v = if v.is_empty_string() {
                    Value::Text(EMPTY_STRING_SENTINEL.to_string())
                } else {
                    v.clone()
                };
                (k.clone(), v)
            })
            .collect();
        Self { attrs }
    }

    /// Reverse the empty-string-to-sentinel escape after reading a
    /// document back from the storage layer.
    #[must_use]
    pub fn from_stored(stored: Self) -> Self {
        let attrs = stored
            .attrs
            .into_iter()
            .map(|(k, v)| {
                let v = match &v {
                    Value::Text(s) if s == EMPTY_STRING_SENTINEL => Value::Text(String::new()),
                    _ => v,
                };
                (k, v)
            })
            .collect();
        Self { attrs }
    }
}

/// Split `outer[inner]` into `("outer", "inner")`; returns `None` for a
/// plain (non-nested) attribute name.
fn parse_nested_path(path: &str) -> Option<(&str, &str)> {
    let open = path.find('[')?;
    let close = path.rfind(']')?;
    if close <= open {
        return None;
    }
    Some((&path[..open], &path[open + 1..close]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_string_round_trips_through_sentinel() {
        let mut doc = Document::new();
        doc.insert("name", "");
        doc.insert("other", "value");

        let stored = doc.to_stored();
        assert_eq!(stored.get("name"), Some(&Value::Text("-".to_string())));

        let restored = Document::from_stored(stored);
        assert_eq!(restored.get("name"), Some(&Value::Text(String::new())));
        assert_eq!(restored.get("other"), Some(&Value::Text("value".to_string())));
    }

    #[test]
    fn nested_path_lookup() {
        let mut inner = BTreeMap::new();
        inner.insert("b".to_string(), Value::Int(3));
        let mut doc = Document::new();
        doc.insert("a", Value::Map(inner));

        assert_eq!(doc.get_path("a[b]"), Some(&Value::Int(3)));
        assert_eq!(doc.get_path("a[missing]"), None);
        assert_eq!(doc.get_path("missing[b]"), None);
    }

    #[test]
    fn contains_all() {
        let mut doc = Document::new();
        doc.insert("a", 1i64);
        doc.insert("b", 2i64);
        assert!(doc.contains_all(["a", "b"]));
        assert!(!doc.contains_all(["a", "c"]));
    }
}
