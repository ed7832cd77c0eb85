//! End-to-end scenarios from the reference test fixture: nodes keyed by
//! `c in {a..z}` with `ord_c_mod_k = ord(c) mod k`, edges for every ordered
//! pair with `w = ord(end.c) - ord(start.c)`.
//!
//! Each query in this file corresponds to a row of the fixture table.

use legdb::db::{Config, DbOpenMode, Document, Oid, Persisted, Predicate, Table};
use legdb::error::LegdbError;
use legdb::prelude::*;
use std::collections::BTreeSet;
use tempfile::tempdir;

fn node_doc(c: char) -> Document {
    let mut doc = Document::new();
    doc.insert("c", c.to_string());
    doc.insert("ord_c_mod_2", (c as i64) % 2);
    doc.insert("ord_c_mod_3", (c as i64) % 3);
    doc.insert("ord_c_mod_4", (c as i64) % 4);
    doc
}

/// Build the `a..z` node/edge fixture plus its three node indexes and one
/// edge index.
fn build_fixture(db: &Database) -> Vec<(char, Oid)> {
    db.ensure_index(Table::Node, "by_c", vec!["c".into()], None, false, false).unwrap();
    db.ensure_index(Table::Node, "by_ord_c_mod_2", vec!["ord_c_mod_2".into()], None, true, false).unwrap();
    db.ensure_index(Table::Node, "by_ord_c_mod_3", vec!["ord_c_mod_3".into()], None, true, false).unwrap();
    db.ensure_index(Table::Edge, "by_w", vec!["w".into()], None, true, false).unwrap();

    let mut oids = Vec::new();
    for c in 'a'..='z' {
        let mut node = Node::new(node_doc(c));
        db.save(&mut node).unwrap();
        oids.push((c, node.oid().unwrap().clone()));
    }

    for (start_c, start_oid) in &oids {
        for (end_c, end_oid) in &oids {
            let w = (*end_c as i64) - (*start_c as i64);
            let mut attrs = Document::new();
            attrs.insert("w", w as f64);
            let mut edge = Edge::new(start_oid.clone(), end_oid.clone(), attrs);
            db.save(&mut edge).unwrap();
        }
    }
    oids
}

fn open_fixture_db(path: &std::path::Path) -> Database {
    let config = Config::new(path).with_open_mode(DbOpenMode::Create);
    let db = Database::open(config).unwrap();
    build_fixture(&db);
    db
}

fn node_c_values(db: &Database, pipeline: impl Iterator<Item = Result<PipelineItem, LegdbError>>) -> BTreeSet<String> {
    pipeline
        .map(|item| {
            let item = item.unwrap();
            let node = item.as_node().expect("expected a node in this pipeline");
            match node.attrs().get("c").unwrap() {
                legdb::value::Value::Text(s) => s.clone(),
                other => panic!("unexpected c value: {other:?}"),
            }
        })
        .collect()
}

fn set_of(chars: &[char]) -> BTreeSet<String> {
    chars.iter().map(|c| c.to_string()).collect()
}

#[test]
fn source_node_yields_all_26_letters() {
    let dir = tempdir().unwrap();
    let db = open_fixture_db(&dir.path().join("db"));
    let pipeline = db.traverse().unwrap().source(Table::Node).unwrap();
    let got = node_c_values(&db, pipeline);
    let expected: BTreeSet<String> = ('a'..='z').map(|c| c.to_string()).collect();
    assert_eq!(got, expected);
}

#[test]
fn has_c_equals_a_uses_by_c_and_returns_one_node() {
    let dir = tempdir().unwrap();
    let db = open_fixture_db(&dir.path().join("db"));
    let pipeline = db
        .traverse()
        .unwrap()
        .source(Table::Node)
        .unwrap()
        .has(Predicate::new().with("c", "a"));
    let got = node_c_values(&db, pipeline);
    assert_eq!(got, set_of(&['a']));
}

#[test]
fn has_ord_c_mod_2_zero_returns_even_ascii_letters() {
    let dir = tempdir().unwrap();
    let db = open_fixture_db(&dir.path().join("db"));
    let pipeline = db
        .traverse()
        .unwrap()
        .source(Table::Node)
        .unwrap()
        .has(Predicate::new().with("ord_c_mod_2", 0i64));
    let got = node_c_values(&db, pipeline);
    let expected: Vec<char> = ('a'..='z').filter(|c| (*c as i64) % 2 == 0).collect();
    assert_eq!(got, set_of(&expected));
}

#[test]
fn has_ord_c_mod_2_then_has_c_picks_by_c_with_residual() {
    let dir = tempdir().unwrap();
    let db = open_fixture_db(&dir.path().join("db"));
    let pipeline = db
        .traverse()
        .unwrap()
        .source(Table::Node)
        .unwrap()
        .has(Predicate::new().with("ord_c_mod_2", 0i64))
        .has(Predicate::new().with("c", "d"));
    let got = node_c_values(&db, pipeline);
    assert_eq!(got, set_of(&['d']));
}

#[test]
fn has_mod_2_and_mod_3_zero_returns_f_l_r_x() {
    let dir = tempdir().unwrap();
    let db = open_fixture_db(&dir.path().join("db"));
    let pipeline = db
        .traverse()
        .unwrap()
        .source(Table::Node)
        .unwrap()
        .has(Predicate::new().with("ord_c_mod_2", 0i64))
        .has(Predicate::new().with("ord_c_mod_3", 0i64));
    let got = node_c_values(&db, pipeline);
    assert_eq!(got, set_of(&['f', 'l', 'r', 'x']));
}

#[test]
fn has_ord_c_mod_4_zero_has_no_index_falls_back_to_full_scan() {
    let dir = tempdir().unwrap();
    let db = open_fixture_db(&dir.path().join("db"));
    let pipeline = db
        .traverse()
        .unwrap()
        .source(Table::Node)
        .unwrap()
        .has(Predicate::new().with("ord_c_mod_4", 0i64));
    let got = node_c_values(&db, pipeline);
    assert_eq!(got, set_of(&['d', 'h', 'l', 'p', 't', 'x']));
}

/// For every emitted edge, resolve its start node's `c` by a direct lookup
/// (not the edge's own lazy `start`/`end`, since the pipeline clears an
/// emitted entity's database back-reference).
fn start_c_values(db: &Database, edges: &[Edge]) -> BTreeSet<String> {
    edges
        .iter()
        .map(|e| {
            let node: Node = db.get(e.start_id()).unwrap().expect("start node must exist in this fixture");
            match node.attrs().get("c").unwrap() {
                legdb::value::Value::Text(s) => s.clone(),
                other => panic!("unexpected c value: {other:?}"),
            }
        })
        .collect()
}

fn end_c_values(db: &Database, edges: &[Edge]) -> BTreeSet<String> {
    edges
        .iter()
        .map(|e| {
            let node: Node = db.get(e.end_id()).unwrap().expect("end node must exist in this fixture");
            match node.attrs().get("c").unwrap() {
                legdb::value::Value::Text(s) => s.clone(),
                other => panic!("unexpected c value: {other:?}"),
            }
        })
        .collect()
}

#[test]
fn edge_in_w_minus_one_from_f_l_r_x_resolves_to_g_m_s_y() {
    let dir = tempdir().unwrap();
    let db = open_fixture_db(&dir.path().join("db"));
    let pipeline = db
        .traverse()
        .unwrap()
        .source(Table::Node)
        .unwrap()
        .has(Predicate::new().with("ord_c_mod_2", 0i64))
        .has(Predicate::new().with("ord_c_mod_3", 0i64))
        .edge_in(Predicate::new().with("w", -1.0f64));
    let edges: Vec<Edge> = pipeline.map(|item| item.unwrap().into_edge().expect("edge_in yields edges")).collect();
    let got = start_c_values(&db, &edges);
    assert_eq!(got, set_of(&['g', 'm', 's', 'y']));
}

#[test]
fn edge_out_w_plus_one_from_f_l_r_x_resolves_to_g_m_s_y() {
    let dir = tempdir().unwrap();
    let db = open_fixture_db(&dir.path().join("db"));
    let pipeline = db
        .traverse()
        .unwrap()
        .source(Table::Node)
        .unwrap()
        .has(Predicate::new().with("ord_c_mod_2", 0i64))
        .has(Predicate::new().with("ord_c_mod_3", 0i64))
        .edge_out(Predicate::new().with("w", 1.0f64));
    let edges: Vec<Edge> = pipeline.map(|item| item.unwrap().into_edge().expect("edge_out yields edges")).collect();
    let got = end_c_values(&db, &edges);
    assert_eq!(got, set_of(&['g', 'm', 's', 'y']));
}

#[test]
fn edge_all_w_one_from_f_l_r_x_returns_eight_edges_to_their_neighbors() {
    let dir = tempdir().unwrap();
    let db = open_fixture_db(&dir.path().join("db"));
    let pipeline = db
        .traverse()
        .unwrap()
        .source(Table::Node)
        .unwrap()
        .has(Predicate::new().with("ord_c_mod_2", 0i64))
        .has(Predicate::new().with("ord_c_mod_3", 0i64))
        .edge_all(Predicate::new().with("w", 1.0f64));
    let edges: Vec<Edge> = pipeline.map(|item| item.unwrap().into_edge().expect("edge_all yields edges")).collect();
    assert_eq!(edges.len(), 8);

    for edge in &edges {
        let start: Node = db.get(edge.start_id()).unwrap().unwrap();
        let end: Node = db.get(edge.end_id()).unwrap().unwrap();
        let start_c = match start.attrs().get("c").unwrap() {
            legdb::value::Value::Text(s) => s.chars().next().unwrap(),
            _ => unreachable!(),
        };
        let end_c = match end.attrs().get("c").unwrap() {
            legdb::value::Value::Text(s) => s.chars().next().unwrap(),
            _ => unreachable!(),
        };
        assert_eq!((end_c as i64) - (start_c as i64), 1);
        assert!(['f', 'l', 'r', 'x'].contains(&start_c) || ['f', 'l', 'r', 'x'].contains(&end_c));
    }
}

// ---------------------------------------------------------------------
// Edge-case tests
// ---------------------------------------------------------------------

#[test]
fn empty_string_attribute_survives_round_trip() {
    let dir = tempdir().unwrap();
    let config = Config::new(dir.path().join("db")).with_open_mode(DbOpenMode::Create);
    let db = Database::open(config).unwrap();

    let mut doc = Document::new();
    doc.insert("name", "");
    doc.insert("other", "value");
    let mut node = Node::new(doc);
    db.save(&mut node).unwrap();

    let loaded: Node = db.get(node.oid().unwrap()).unwrap().unwrap();
    assert_eq!(loaded.attrs().get("name"), Some(&legdb::value::Value::Text(String::new())));
    assert_eq!(loaded.attrs().get("other"), Some(&legdb::value::Value::Text("value".to_string())));
}

#[test]
fn dangling_edge_endpoint_resolves_to_none_without_erroring() {
    let dir = tempdir().unwrap();
    let config = Config::new(dir.path().join("db")).with_open_mode(DbOpenMode::Create);
    let db = Database::open(config).unwrap();

    let mut start = Node::new(node_doc('a'));
    db.save(&mut start).unwrap();
    let missing_end = Oid::from_sequence(9_999);

    let mut attrs = Document::new();
    attrs.insert("w", 0.0f64);
    let mut edge = Edge::new(start.oid().unwrap().clone(), missing_end.clone(), attrs);
    db.save(&mut edge).unwrap();

    let loaded: Edge = db.get(edge.oid().unwrap()).unwrap().unwrap();
    assert!(loaded.start().unwrap().is_some());
    assert!(loaded.end().unwrap().is_none());
}

#[test]
fn range_with_mismatched_entity_types_raises_type_mismatch() {
    let dir = tempdir().unwrap();
    let config = Config::new(dir.path().join("db")).with_open_mode(DbOpenMode::Create);
    let db = Database::open(config).unwrap();

    let node_doc = Document::new();
    let edge_doc = Document::new();
    let err = db.range_dyn(Some((Table::Node, &node_doc)), Some((Table::Edge, &edge_doc)), true, None).unwrap_err();
    assert!(matches!(err, LegdbError::TypeMismatch { .. }));
}

#[test]
fn unknown_named_index_raises_missing_index() {
    let dir = tempdir().unwrap();
    let db = open_fixture_db(&dir.path().join("db"));
    let err = db.seek::<Node>(&Predicate::new().with("c", "a"), Some("no_such_index")).unwrap_err();
    assert!(matches!(err, LegdbError::MissingIndex { .. }));
}

#[test]
fn pipeline_output_is_identical_across_page_sizes() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("db");
    {
        let db = open_fixture_db(&path);
        drop(db);
    }

    let mut runs = Vec::new();
    for page_size in [1usize, 2, 10, 4096, 10_000] {
        let config = Config::new(path.clone()).with_open_mode(DbOpenMode::ReadWrite).with_page_size(page_size);
        let db = Database::open(config).unwrap();
        let pipeline = db
            .traverse()
            .unwrap()
            .source(Table::Node)
            .unwrap()
            .has(Predicate::new().with("ord_c_mod_2", 0i64));
        runs.push(node_c_values(&db, pipeline));
    }
    for w in runs.windows(2) {
        assert_eq!(w[0], w[1]);
    }
}

#[test]
fn edge_all_does_not_double_emit_a_self_loop() {
    let dir = tempdir().unwrap();
    let config = Config::new(dir.path().join("db")).with_open_mode(DbOpenMode::Create);
    let db = Database::open(config).unwrap();

    let mut node = Node::new(node_doc('a'));
    db.save(&mut node).unwrap();
    let oid = node.oid().unwrap().clone();

    let mut attrs = Document::new();
    attrs.insert("w", 0.0f64);
    let mut loop_edge = Edge::new(oid.clone(), oid.clone(), attrs);
    db.save(&mut loop_edge).unwrap();

    let pipeline = db
        .traverse()
        .unwrap()
        .source(Table::Node)
        .unwrap()
        .has(Predicate::new().with("c", "a"))
        .edge_all(Predicate::new());
    let edges: Vec<_> = pipeline.map(|item| item.unwrap()).collect();
    assert_eq!(edges.len(), 1);
}

#[test]
fn round_trip_get_after_save_matches_modulo_oid() {
    let dir = tempdir().unwrap();
    let config = Config::new(dir.path().join("db")).with_open_mode(DbOpenMode::Create);
    let db = Database::open(config).unwrap();

    let mut node = Node::new(node_doc('q'));
    db.save(&mut node).unwrap();
    let loaded: Node = db.get(node.oid().unwrap()).unwrap().unwrap();
    assert_eq!(loaded.attrs(), node.attrs());
}

#[test]
fn ensure_index_honors_an_explicit_composite_template_order() {
    let dir = tempdir().unwrap();
    let config = Config::new(dir.path().join("db")).with_open_mode(DbOpenMode::Create);
    let db = Database::open(config).unwrap();

    db.ensure_index(
        Table::Node,
        "by_mod3_then_mod2",
        vec!["ord_c_mod_2".into(), "ord_c_mod_3".into()],
        Some("{ord_c_mod_3}|{ord_c_mod_2}"),
        true,
        false,
    )
    .unwrap();
    for c in 'a'..='z' {
        let mut node = Node::new(node_doc(c));
        db.save(&mut node).unwrap();
    }

    let results: Vec<Node> = db
        .seek(
            &Predicate::new().with("ord_c_mod_3", 0i64).with("ord_c_mod_2", 0i64),
            Some("by_mod3_then_mod2"),
        )
        .unwrap();
    let got: BTreeSet<String> = results
        .iter()
        .map(|n| match n.attrs().get("c").unwrap() {
            legdb::value::Value::Text(s) => s.clone(),
            other => panic!("unexpected c value: {other:?}"),
        })
        .collect();
    assert_eq!(got, set_of(&['f', 'l', 'r', 'x']));
}

#[test]
fn ensure_index_rejects_a_template_naming_different_attrs() {
    let dir = tempdir().unwrap();
    let config = Config::new(dir.path().join("db")).with_open_mode(DbOpenMode::Create);
    let db = Database::open(config).unwrap();

    let err = db.ensure_index(Table::Node, "by_c_mismatched", vec!["c".into()], Some("{not_c}"), false, false);
    assert!(err.is_err());
}

#[test]
fn index_completeness_seek_finds_every_document_containing_its_attrs() {
    let dir = tempdir().unwrap();
    let db = open_fixture_db(&dir.path().join("db"));
    for c in 'a'..='z' {
        let results: Vec<Node> = db.seek(&Predicate::new().with("c", c.to_string()), Some("by_c")).unwrap();
        assert_eq!(results.len(), 1);
    }
}
