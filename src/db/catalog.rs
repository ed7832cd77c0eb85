//! Module: catalog
//! Responsibility: track which secondary indexes exist on each table,
//! in registration order, and their shape (attrs, key template,
//! duplicate tolerance).
//! Does not own: index selection for a given predicate (see
//! `db::planner`) or the on-disk index databases themselves (see
//! `db::store`).
//! Boundary: `Database::ensure_index` is the only writer; the planner
//! and store only read through `IndexCatalog`.

use crate::db::document::AttrName;
use crate::db::entity::Table;
use crate::db::key_template::KeyTemplate;
use crate::error::LegdbError;
use std::collections::BTreeSet;

///
/// IndexSpec
///
/// The declared shape of one secondary index: which attributes compose it,
/// in what order, whether it tolerates duplicate keys, and its registration
/// order relative to the table's other indexes (used by the planner to break
/// cost ties; ties are resolved in favor of the earliest-registered index).
///

#[derive(Clone, Debug)]
pub struct IndexSpec {
    pub name: String,
    pub table: Table,
    pub attrs: Vec<AttrName>,
    pub template: KeyTemplate,
    pub template_grammar: String,
    pub duplicates: bool,
    pub registration_order: usize,
}

impl IndexSpec {
    #[must_use]
    pub fn covers(&self, attrs: &[AttrName]) -> bool {
        self.attrs.iter().all(|a| attrs.contains(a))
    }
}

const BUILTIN_BY_START_END: &str = "by_start_id_end_id";
const BUILTIN_BY_START: &str = "by_start_id";
const BUILTIN_BY_END: &str = "by_end_id";

///
/// IndexCatalog
///
/// Per-table list of registered indexes, in the order `ensure_index`
/// declared them. Three edge indexes are always present
/// (`by_start_id_end_id`, `by_start_id`, `by_end_id`) so that
/// `edge_out`/`edge_in`/`edge_all` steps always have a usable index
/// regardless of what the caller has registered.
///

#[derive(Clone, Debug, Default)]
pub struct IndexCatalog {
    node: Vec<IndexSpec>,
    edge: Vec<IndexSpec>,
}

impl IndexCatalog {
    #[must_use]
    pub fn new() -> Self {
        let mut edge = Vec::new();
        push_builtin(&mut edge, BUILTIN_BY_START_END, "!{start_id}|{end_id}", true);
        push_builtin(&mut edge, BUILTIN_BY_START, "{start_id}", true);
        push_builtin(&mut edge, BUILTIN_BY_END, "{end_id}", true);
        Self { node: Vec::new(), edge }
    }

    fn list_mut(&mut self, table: Table) -> &mut Vec<IndexSpec> {
        match table {
            Table::Node => &mut self.node,
            Table::Edge => &mut self.edge,
        }
    }

    #[must_use]
    pub fn list(&self, table: Table) -> &[IndexSpec] {
        match table {
            Table::Node => &self.node,
            Table::Edge => &self.edge,
        }
    }

    #[must_use]
    pub fn get(&self, table: Table, name: &str) -> Option<&IndexSpec> {
        self.list(table).iter().find(|s| s.name == name)
    }

    /// Register an index, idempotently. A second call with the same name and
    /// the same shape is a no-op; a second call with the same name and a
    /// different shape is rejected, since a redefinition would invalidate
    /// the previously built on-disk index without the caller's explicit
    /// intent.
    ///
    /// `template`, when given, is the `"{attr}"` / `"{a}|{b}"` key-template
    /// grammar and must name exactly the attributes in `attrs` (order may
    /// differ from `attrs`; the template's order is what governs the
    /// on-disk key shape, letting two same-arity indexes order their
    /// components differently). When omitted, the template is derived from
    /// `attrs` in the order given.
    pub fn ensure_index(
        &mut self,
        table: Table,
        name: impl Into<String>,
        attrs: Vec<AttrName>,
        template: Option<&str>,
        duplicates: bool,
    ) -> Result<&IndexSpec, LegdbError> {
        let name = name.into();
        let (template, template_grammar, attrs) = match template {
            Some(grammar) => {
                let (template, ordered) = KeyTemplate::parse(grammar)?;
                let declared: BTreeSet<&AttrName> = attrs.iter().collect();
                let named: BTreeSet<&AttrName> = ordered.iter().collect();
                if declared != named {
                    return Err(LegdbError::InvalidPipeline(format!(
                        "index {name:?} template {grammar:?} names {ordered:?}, which does not match the declared attrs {attrs:?}"
                    )));
                }
                (template, grammar.to_string(), ordered)
            }
            None => {
                let grammar = KeyTemplate::to_grammar(&attrs);
                let template = KeyTemplate::for_arity(attrs.len());
                (template, grammar, attrs)
            }
        };
        let order = self.list(table).len();
        let list = self.list_mut(table);
        if let Some(pos) = list.iter().position(|s| s.name == name) {
            let existing = &list[pos];
            if existing.attrs == attrs && existing.duplicates == duplicates {
                return Ok(&list[pos]);
            }
            return Err(LegdbError::InvalidPipeline(format!(
                "index {name:?} on table {table} already registered with a different shape"
            )));
        }
        list.push(IndexSpec {
            name,
            table,
            attrs,
            template,
            template_grammar,
            duplicates,
            registration_order: order,
        });
        Ok(list.last().expect("just pushed"))
    }
}

fn push_builtin(list: &mut Vec<IndexSpec>, name: &str, template_grammar: &str, duplicates: bool) {
    let order = list.len();
    let (template, attrs) = KeyTemplate::parse(template_grammar).expect("built-in index template is well-formed");
    list.push(IndexSpec {
        name: name.to_string(),
        table: Table::Edge,
        attrs,
        template,
        template_grammar: template_grammar.to_string(),
        duplicates,
        registration_order: order,
    });
}
