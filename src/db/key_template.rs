//! Module: key_template
//! Responsibility: parse an index's declared key-template grammar
//! (`"{attr}"` / `"{a}|{b}"`) into an attribute order, and render that
//! order's attribute values into the byte string stored as its `heed` key.
//! Does not own: which attributes an index covers for selection purposes
//! (see `db::catalog`) or which index a predicate selects (see
//! `db::planner`).

use crate::db::document::AttrName;
use crate::error::LegdbError;
use crate::value::Value;

/// Byte used to separate components of a composite index key. Chosen
/// outside the printable-ASCII range values are expected to render to,
/// so it cannot collide with a component's own encoded bytes in
/// practice; a mismatch here would only corrupt ordering within a
/// single multi-attribute index, not across indexes.
const COMPONENT_SEPARATOR: u8 = 0x1f;

///
/// KeyTemplate
///
/// Renders one or more attribute values, in the order an index was declared,
/// into a single sortable byte string. Single-attribute templates encode the
/// value directly so that range seeks over a one-attribute index retain the
/// value's own ordering; multi-attribute templates concatenate each
/// component's encoding with a separator, so ordering is lexicographic over
/// the component sequence.
///

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct KeyTemplate {
    arity: usize,
}

impl KeyTemplate {
    #[must_use]
    pub fn for_arity(arity: usize) -> Self {
        assert!(arity > 0, "an index must cover at least one attribute");
        Self { arity }
    }

    #[must_use]
    pub const fn arity(&self) -> usize {
        self.arity
    }

    /// Parse the `"{attr}"` / `"{a}|{b}"` key-template grammar an index is
    /// declared with, returning the template plus the attribute order it
    /// names. A leading `!` is accepted but advisory only: it historically
    /// marked a duplicate-tolerant index, but `ensure_index` takes its own
    /// explicit `duplicates` flag, and the built-in `by_start_id` index is
    /// declared with `duplicates: true` despite carrying no `!`.
    pub fn parse(template: &str) -> Result<(Self, Vec<AttrName>), LegdbError> {
        let body = template.strip_prefix('!').unwrap_or(template);
        if body.is_empty() {
            return Err(LegdbError::InvalidPipeline(format!("empty index key template {template:?}")));
        }
        let mut attrs = Vec::new();
        for segment in body.split('|') {
            let name = segment
                .strip_prefix('{')
                .and_then(|s| s.strip_suffix('}'))
                .filter(|s| !s.is_empty())
                .ok_or_else(|| {
                    LegdbError::InvalidPipeline(format!("malformed key template segment {segment:?} in {template:?}"))
                })?;
            attrs.push(name.to_string());
        }
        Ok((Self::for_arity(attrs.len()), attrs))
    }

    /// Render the canonical grammar string for a declared attribute order,
    /// the default template used when `ensure_index` is not given one
    /// explicitly.
    #[must_use]
    pub fn to_grammar(attrs: &[AttrName]) -> String {
        attrs.iter().map(|a| format!("{{{a}}}")).collect::<Vec<_>>().join("|")
    }

    /// Render a single component's value to its sortable byte encoding.
    /// Type-tagged so that cross-type values never collide and sort by
    /// the same rank order `Value::cmp` uses.
    #[must_use]
    pub fn encode_component(value: &Value) -> Vec<u8> {
        match value {
            Value::Null => vec![0],
            Value::Bool(b) => vec![1, u8::from(*b)],
            Value::Int(i) => {
                let mut out = Vec::with_capacity(9);
                out.push(2);
                // Flip the sign bit so two's-complement order matches
                // numeric order under byte-wise comparison.
                out.extend_from_slice(&(*i as u64 ^ (1 << 63)).to_be_bytes());
                out
            }
            Value::Float(f) => {
                let mut out = Vec::with_capacity(9);
                out.push(3);
                let bits = f.to_bits();
                let encoded = if bits & (1 << 63) != 0 { !bits } else { bits | (1 << 63) };
                out.extend_from_slice(&encoded.to_be_bytes());
                out
            }
            Value::Text(s) => {
                let mut out = Vec::with_capacity(s.len() + 1);
                out.push(4);
                out.extend_from_slice(s.as_bytes());
                out
            }
            Value::Bytes(b) => {
                let mut out = Vec::with_capacity(b.len() + 1);
                out.push(5);
                out.extend_from_slice(b);
                out
            }
            Value::Map(_) => {
                // Nested values never participate in index key templates;
                // the planner never selects an index over a `Map`-valued
                // attribute.
                vec![6]
            }
        }
    }

    /// Render the full key for a sequence of component values, in
    /// declared-attribute order.
    #[must_use]
    pub fn render(&self, components: &[&Value]) -> Vec<u8> {
        debug_assert_eq!(components.len(), self.arity);
        if components.len() == 1 {
            return Self::encode_component(components[0]);
        }
        let mut out = Vec::new();
        for (i, v) in components.iter().enumerate() {
            if i > 0 {
                out.push(COMPONENT_SEPARATOR);
            }
            out.extend_from_slice(&Self::encode_component(v));
        }
        out
    }

    /// Render a key covering only a prefix of this template's components;
    /// used when a predicate binds fewer attributes than the index declares,
    /// which is still useful as a seek lower bound.
    #[must_use]
    pub fn render_prefix(&self, components: &[&Value]) -> Vec<u8> {
        assert!(components.len() <= self.arity);
        if components.len() == self.arity {
            return self.render(components);
        }
        let mut out = Vec::new();
        for (i, v) in components.iter().enumerate() {
            if i > 0 {
                out.push(COMPONENT_SEPARATOR);
            }
            out.extend_from_slice(&Self::encode_component(v));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_attribute_preserves_int_order() {
        let t = KeyTemplate::for_arity(1);
        let a = t.render(&[&Value::Int(-5)]);
        let b = t.render(&[&Value::Int(3)]);
        assert!(a < b);
    }

    #[test]
    fn float_encoding_preserves_order_across_sign() {
        let t = KeyTemplate::for_arity(1);
        let neg = t.render(&[&Value::Float(-2.5)]);
        let zero = t.render(&[&Value::Float(0.0)]);
        let pos = t.render(&[&Value::Float(2.5)]);
        assert!(neg < zero);
        assert!(zero < pos);
    }

    #[test]
    fn parses_single_attribute_grammar() {
        let (t, attrs) = KeyTemplate::parse("{start_id}").unwrap();
        assert_eq!(t.arity(), 1);
        assert_eq!(attrs, vec!["start_id".to_string()]);
    }

    #[test]
    fn parses_composite_grammar_with_duplicate_marker() {
        let (t, attrs) = KeyTemplate::parse("!{start_id}|{end_id}").unwrap();
        assert_eq!(t.arity(), 2);
        assert_eq!(attrs, vec!["start_id".to_string(), "end_id".to_string()]);
    }

    #[test]
    fn parses_attribute_order_from_grammar_not_alphabetically() {
        let (_, attrs) = KeyTemplate::parse("{b}|{a}").unwrap();
        assert_eq!(attrs, vec!["b".to_string(), "a".to_string()]);
    }

    #[test]
    fn rejects_malformed_grammar() {
        assert!(KeyTemplate::parse("start_id").is_err());
        assert!(KeyTemplate::parse("{}").is_err());
        assert!(KeyTemplate::parse("").is_err());
    }

    #[test]
    fn to_grammar_is_the_inverse_of_parse() {
        let attrs = vec!["start_id".to_string(), "end_id".to_string()];
        let grammar = KeyTemplate::to_grammar(&attrs);
        let (_, parsed) = KeyTemplate::parse(&grammar).unwrap();
        assert_eq!(parsed, attrs);
    }

    #[test]
    fn composite_key_is_prefix_seekable() {
        let t = KeyTemplate::for_arity(2);
        let full = t.render(&[&Value::Text("a".into()), &Value::Int(1)]);
        let prefix = t.render_prefix(&[&Value::Text("a".into())]);
        assert!(full.starts_with(&prefix));
    }
}

#[cfg(test)]
mod property_tests {
    use super::*;
    use proptest::prelude::*;

    fn arb_value() -> impl Strategy<Value = Value> {
        prop_oneof![
            any::<i64>().prop_map(Value::Int),
            any::<f64>().prop_map(Value::Float),
            "[a-zA-Z0-9]{0,12}".prop_map(Value::Text),
        ]
    }

    proptest! {
        // The range-seek machinery relies on a single-component key's
        // byte order matching `Value::cmp` exactly; this is what lets a
        // seek over an index substitute for a seek over the attribute
        // itself under the index-narrows-then-residual-confirms design.
        #[test]
        fn single_component_byte_order_matches_value_order(a in arb_value(), b in arb_value()) {
            let t = KeyTemplate::for_arity(1);
            let encoded_a = t.render(&[&a]);
            let encoded_b = t.render(&[&b]);
            prop_assert_eq!(a.cmp(&b), encoded_a.cmp(&encoded_b));
        }

        #[test]
        fn encoding_is_deterministic(v in arb_value()) {
            let t = KeyTemplate::for_arity(1);
            prop_assert_eq!(t.render(&[&v]), t.render(&[&v]));
        }
    }
}
