//! Module: store
//! Responsibility: the only module allowed to talk to `heed` directly.
//! Owns environment/table lifecycle, oid assignment, index maintenance on
//! write, exact-key and range lookups, dictionary compression, and the
//! dump/reload cycle `vacuum` needs.
//! Does not own: which index a predicate should use (see `db::planner`)
//! or how a document maps to/from an entity (see `db::document`,
//! `db::entity`).
//! Boundary: callers only ever see `Oid`/`Document`; `heed::RoTxn` /
//! `heed::RwTxn` are re-exported so the façade can thread a single
//! transaction through a multi-step operation, but their contents never
//! leak above `db::store` and `db::session`.

use crate::db::catalog::IndexSpec;
use crate::db::document::Document;
use crate::db::entity::{Oid, Table};
use crate::db::key_template::KeyTemplate;
use crate::error::{LegdbError, StoreError};
use heed::types::Bytes;
use heed::{Database, DatabaseFlags, Env, EnvFlags, EnvOpenOptions};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub use heed::{RoTxn, RwTxn};

/// Reserved headroom for named databases: `node`, `edge`, `meta`, plus
/// however many secondary indexes callers register across both tables.
/// LMDB fixes this count at environment-open time, so it cannot grow
/// after the fact; 512 leaves generous room for any realistic schema.
const MAX_NAMED_DBS: u32 = 512;

const META_DB_NAME: &str = "meta";
const NODE_DB_NAME: &str = "node";
const EDGE_DB_NAME: &str = "edge";

fn store_err(err: heed::Error) -> LegdbError {
    LegdbError::StorageError(StoreError::Backend(err.to_string()))
}

/// One row as read back from a primary table: its `oid` and decoded
/// document.
#[derive(Clone, Debug)]
pub struct Row {
    pub oid: Oid,
    pub doc: Document,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CompressionType {
    None,
    Zstd,
}

#[derive(Clone, Debug)]
struct CompressionState {
    kind: CompressionType,
    level: i32,
    dict: Option<Vec<u8>>,
}

impl Default for CompressionState {
    fn default() -> Self {
        Self { kind: CompressionType::None, level: 0, dict: None }
    }
}

///
/// HeedStore
///
/// Concrete storage backend over `heed` (LMDB bindings): one B-tree table
/// per `Table` variant for primary documents, one `meta` table for oid
/// sequence counters and per-table compression state, and one lazily-created
/// B-tree per registered secondary index (`DUP_SORT` when the index
/// tolerates duplicate keys).
///

pub struct HeedStore {
    env: Env,
    node_db: Database<Bytes, Bytes>,
    edge_db: Database<Bytes, Bytes>,
    meta_db: Database<Bytes, Bytes>,
    index_dbs: Mutex<HashMap<(Table, String), Database<Bytes, Bytes>>>,
    compression: Mutex<HashMap<Table, CompressionState>>,
    path: PathBuf,
}

impl HeedStore {
    pub fn open(
        path: &Path,
        max_readers: u32,
        map_size: usize,
        subdir: bool,
        create: bool,
    ) -> Result<Self, LegdbError> {
        if create {
            // With `subdir`, `path` is the environment directory itself
            // (heed's default expectation) and must exist before open.
            // Without it (`NO_SUB_DIR`), `path` names the data file
            // directly, so only its parent directory needs to exist.
            // Creating `path` itself as a directory would leave heed
            // trying to memory-map a directory as the data file.
            if subdir {
                std::fs::create_dir_all(path).map_err(|e| LegdbError::StorageError(StoreError::Io(e)))?;
            } else if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent).map_err(|e| LegdbError::StorageError(StoreError::Io(e)))?;
            }
        } else if !path.exists() {
            return Err(LegdbError::StorageError(StoreError::NotFound { key: path.display().to_string() }));
        }

        let mut options = EnvOpenOptions::new();
        options.map_size(map_size).max_dbs(MAX_NAMED_DBS).max_readers(max_readers);
        if !subdir {
            options.flags(EnvFlags::NO_SUB_DIR);
        }
        // SAFETY: the caller owns `path` exclusively for the lifetime of
        // this `HeedStore`; no other process is expected to write to the
        // same memory-mapped file concurrently; there is only ever one
        // writer.
        let env = unsafe { options.open(path) }.map_err(store_err)?;

        let mut wtxn = env.write_txn().map_err(store_err)?;
        let node_db = env
            .database_options()
            .types::<Bytes, Bytes>()
            .name(NODE_DB_NAME)
            .create(&mut wtxn)
            .map_err(store_err)?;
        let edge_db = env
            .database_options()
            .types::<Bytes, Bytes>()
            .name(EDGE_DB_NAME)
            .create(&mut wtxn)
            .map_err(store_err)?;
        let meta_db = env
            .database_options()
            .types::<Bytes, Bytes>()
            .name(META_DB_NAME)
            .create(&mut wtxn)
            .map_err(store_err)?;
        wtxn.commit().map_err(store_err)?;

        let store = Self {
            env,
            node_db,
            edge_db,
            meta_db,
            index_dbs: Mutex::new(HashMap::new()),
            compression: Mutex::new(HashMap::new()),
            path: path.to_path_buf(),
        };
        store.load_compression_state()?;
        Ok(store)
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read_txn(&self) -> Result<RoTxn<'_>, LegdbError> {
        self.env.read_txn().map_err(store_err)
    }

    pub fn write_txn(&self) -> Result<RwTxn<'_>, LegdbError> {
        self.env.write_txn().map_err(store_err)
    }

    pub fn sync(&self, force: bool) -> Result<(), LegdbError> {
        self.env.force_sync().map_err(store_err)?;
        let _ = force;
        Ok(())
    }

    /// The backing environment handle. `heed::Env` is a cheap `Arc`-style
    /// clone/share internally, so parallel fan-out workers can each open
    /// their own short-lived read transaction against it without going
    /// through this store's cache locks.
    #[must_use]
    pub fn env(&self) -> &Env {
        &self.env
    }

    fn primary_db(&self, table: Table) -> Database<Bytes, Bytes> {
        match table {
            Table::Node => self.node_db,
            Table::Edge => self.edge_db,
        }
    }

    fn meta_key(table: Table, suffix: &str) -> Vec<u8> {
        format!("{}:{suffix}", table.name()).into_bytes()
    }

    /// Allocate the next oid for an append-only sequence on `table`, big-
    /// endian so lexicographic key order matches assignment order.
    fn next_oid(&self, wtxn: &mut RwTxn<'_>, table: Table) -> Result<Oid, LegdbError> {
        let key = Self::meta_key(table, "seq");
        let current = self
            .meta_db
            .get(wtxn, &key)
            .map_err(store_err)?
            .map_or(0u64, |bytes| u64::from_be_bytes(bytes.try_into().unwrap_or([0; 8])));
        let next = current + 1;
        self.meta_db.put(wtxn, &key, &next.to_be_bytes()).map_err(store_err)?;
        Ok(Oid::from_sequence(current))
    }

    fn encode_document(&self, table: Table, doc: &Document) -> Result<Vec<u8>, LegdbError> {
        let stored = doc.to_stored();
        let plain = serde_cbor::to_vec(&stored.into_attrs())
            .map_err(|e| LegdbError::StorageError(StoreError::Backend(e.to_string())))?;
        match self.compression.lock().expect("compression cache lock poisoned").get(&table).cloned().unwrap_or_default() {
            CompressionState { kind: CompressionType::None, .. } => Ok(plain),
            CompressionState { kind: CompressionType::Zstd, level, dict } => {
                let encoded = match dict {
                    Some(dict) => zstd::bulk::Compressor::with_dictionary(level, &dict)
                        .and_then(|mut c| c.compress(&plain))
                        .map_err(|e| LegdbError::StorageError(StoreError::Backend(e.to_string())))?,
                    None => zstd::encode_all(plain.as_slice(), level)
                        .map_err(|e| LegdbError::StorageError(StoreError::Backend(e.to_string())))?,
                };
                Ok(encoded)
            }
        }
    }

    fn decode_document(&self, table: Table, bytes: &[u8]) -> Result<Document, LegdbError> {
        let plain = match self.compression.lock().expect("compression cache lock poisoned").get(&table).cloned().unwrap_or_default() {
            CompressionState { kind: CompressionType::None, .. } => bytes.to_vec(),
            CompressionState { kind: CompressionType::Zstd, dict: Some(dict), .. } => {
                zstd::bulk::Decompressor::with_dictionary(&dict)
                    .and_then(|mut d| d.decompress(bytes, bytes.len() * 16 + 4096))
                    .map_err(|e| LegdbError::StorageError(StoreError::Backend(e.to_string())))?
            }
            CompressionState { kind: CompressionType::Zstd, dict: None, .. } => zstd::decode_all(bytes)
                .map_err(|e| LegdbError::StorageError(StoreError::Backend(e.to_string())))?,
        };
        let attrs = serde_cbor::from_slice(&plain)
            .map_err(|e| LegdbError::StorageError(StoreError::Backend(e.to_string())))?;
        Ok(Document::from_stored(Document::from_attrs(attrs)))
    }

    /// Point lookup by oid.
    pub fn get(&self, txn: &RoTxn<'_>, table: Table, oid: &Oid) -> Result<Option<Document>, LegdbError> {
        match self.primary_db(table).get(txn, oid.as_bytes()).map_err(store_err)? {
            Some(bytes) => Ok(Some(self.decode_document(table, bytes)?)),
            None => Ok(None),
        }
    }

    /// Append a new document, assigning it the next oid in sequence.
    pub fn append(
        &self,
        wtxn: &mut RwTxn<'_>,
        table: Table,
        indexes: &[IndexSpec],
        doc: &Document,
    ) -> Result<Oid, LegdbError> {
        let oid = self.next_oid(wtxn, table)?;
        self.write_row(wtxn, table, indexes, &oid, doc, None)?;
        Ok(oid)
    }

    /// Overwrite the document at an existing oid, adjusting index entries
    /// derived from the previous revision.
    pub fn save(
        &self,
        wtxn: &mut RwTxn<'_>,
        table: Table,
        indexes: &[IndexSpec],
        oid: &Oid,
        doc: &Document,
    ) -> Result<(), LegdbError> {
        let previous = self.get(wtxn, table, oid)?;
        self.write_row(wtxn, table, indexes, oid, doc, previous.as_ref())
    }

    fn write_row(
        &self,
        wtxn: &mut RwTxn<'_>,
        table: Table,
        indexes: &[IndexSpec],
        oid: &Oid,
        doc: &Document,
        previous: Option<&Document>,
    ) -> Result<(), LegdbError> {
        for index in indexes {
            if let Some(prev) = previous {
                if prev.contains_all(index.attrs.iter()) {
                    let key = self.render_index_key(index, prev)?;
                    let db = self.index_db(wtxn, table, index)?;
                    self.remove_index_entry(wtxn, db, &key, oid, index.duplicates)?;
                }
            }
        }

        let encoded = self.encode_document(table, doc)?;
        self.primary_db(table).put(wtxn, oid.as_bytes(), &encoded).map_err(store_err)?;

        for index in indexes {
            if doc.contains_all(index.attrs.iter()) {
                let key = self.render_index_key(index, doc)?;
                let db = self.index_db(wtxn, table, index)?;
                self.insert_index_entry(wtxn, db, &key, oid, index.duplicates, &index.name, table)?;
            }
        }
        Ok(())
    }

    fn render_index_key(&self, index: &IndexSpec, doc: &Document) -> Result<Vec<u8>, LegdbError> {
        let components: Vec<&crate::value::Value> = index
            .attrs
            .iter()
            .map(|a| doc.get_path(a).expect("caller checked contains_all"))
            .collect();
        Ok(index.template.render(&components))
    }

    fn index_db(&self, wtxn: &mut RwTxn<'_>, table: Table, index: &IndexSpec) -> Result<Database<Bytes, Bytes>, LegdbError> {
        let cache_key = (table, index.name.clone());
        if let Some(db) = self.index_dbs.lock().expect("index db cache lock poisoned").get(&cache_key) {
            return Ok(*db);
        }
        let full_name = format!("{}__{}", table.name(), index.name);
        let mut opts = self.env.database_options();
        opts.types::<Bytes, Bytes>().name(&full_name);
        if index.duplicates {
            opts.flags(DatabaseFlags::DUP_SORT);
        }
        let db = opts.create(wtxn).map_err(store_err)?;
        self.index_dbs.lock().expect("index db cache lock poisoned").insert(cache_key, db);
        Ok(db)
    }

    /// Same as [`Self::index_db`] but for a read-only transaction; the
    /// database must already have been created (returns `None`
    /// otherwise, which the planner treats as "no candidates").
    fn index_db_ro(&self, txn: &RoTxn<'_>, table: Table, name: &str) -> Result<Option<Database<Bytes, Bytes>>, LegdbError> {
        let cache_key = (table, name.to_string());
        if let Some(db) = self.index_dbs.lock().expect("index db cache lock poisoned").get(&cache_key) {
            return Ok(Some(*db));
        }
        let full_name = format!("{}__{name}", table.name());
        let db = self
            .env
            .open_database::<Bytes, Bytes>(txn, Some(&full_name))
            .map_err(store_err)?;
        if let Some(db) = db {
            self.index_dbs.lock().expect("index db cache lock poisoned").insert(cache_key, db);
        }
        Ok(db)
    }

    fn insert_index_entry(
        &self,
        wtxn: &mut RwTxn<'_>,
        db: Database<Bytes, Bytes>,
        key: &[u8],
        oid: &Oid,
        duplicates: bool,
        index_name: &str,
        table: Table,
    ) -> Result<(), LegdbError> {
        if !duplicates {
            if let Some(existing) = db.get(wtxn, key).map_err(store_err)? {
                if existing != oid.as_bytes() {
                    return Err(LegdbError::DuplicateKey { table: table.name(), index: index_name.to_string() });
                }
                return Ok(());
            }
        }
        db.put(wtxn, key, oid.as_bytes()).map_err(store_err)
    }

    fn remove_index_entry(
        &self,
        wtxn: &mut RwTxn<'_>,
        db: Database<Bytes, Bytes>,
        key: &[u8],
        oid: &Oid,
        duplicates: bool,
    ) -> Result<(), LegdbError> {
        if duplicates {
            db.delete_one_duplicate(wtxn, key, oid.as_bytes()).map_err(store_err)?;
        } else {
            db.delete(wtxn, key).map_err(store_err)?;
        }
        Ok(())
    }

    /// Exact-key lookup against a secondary index: every oid stored under
    /// `key`. The index is read-only here; if it has never been written to,
    /// there are no candidates.
    pub fn seek_exact(&self, txn: &RoTxn<'_>, table: Table, index_name: &str, key: &[u8]) -> Result<Vec<Oid>, LegdbError> {
        let Some(db) = self.index_db_ro(txn, table, index_name)? else {
            return Ok(Vec::new());
        };
        let mut out = Vec::new();
        if let Some(iter) = db.get_duplicates(txn, key).map_err(store_err)? {
            for entry in iter {
                let (_, oid_bytes) = entry.map_err(store_err)?;
                out.push(Oid::from_bytes(oid_bytes.to_vec()));
            }
        } else if let Some(oid_bytes) = db.get(txn, key).map_err(store_err)? {
            out.push(Oid::from_bytes(oid_bytes.to_vec()));
        }
        Ok(out)
    }

    /// The number of entries stored under `key` in `index_name`: the
    /// planner's cardinality estimate.
    pub fn count_exact(&self, txn: &RoTxn<'_>, table: Table, index_name: &str, key: &[u8]) -> Result<usize, LegdbError> {
        Ok(self.seek_exact(txn, table, index_name, key)?.len())
    }

    /// Ordered range scan over a secondary index, returning `(key, oid)`
    /// pairs. Collected eagerly: the auto-tx read transaction this runs
    /// under is short-lived by construction, so a scan that outlives it
    /// would be unsound to keep lazy without a self-referential cursor.
    pub fn range_index(
        &self,
        txn: &RoTxn<'_>,
        table: Table,
        index_name: &str,
        lower: Option<&[u8]>,
        upper: Option<&[u8]>,
        inclusive: bool,
    ) -> Result<Vec<(Vec<u8>, Oid)>, LegdbError> {
        let Some(db) = self.index_db_ro(txn, table, index_name)? else {
            return Ok(Vec::new());
        };
        use std::ops::Bound;
        let lo = match lower {
            Some(b) => Bound::Included(b),
            None => Bound::Unbounded,
        };
        let hi = match upper {
            Some(b) if inclusive => Bound::Included(b),
            Some(b) => Bound::Excluded(b),
            None => Bound::Unbounded,
        };
        let mut out = Vec::new();
        for entry in db.range(txn, &(lo, hi)).map_err(store_err)? {
            let (k, v) = entry.map_err(store_err)?;
            out.push((k.to_vec(), Oid::from_bytes(v.to_vec())));
        }
        Ok(out)
    }

    /// Every row in `table`, oldest-assigned first.
    pub fn scan_table(&self, txn: &RoTxn<'_>, table: Table) -> Result<Vec<Row>, LegdbError> {
        let mut out = Vec::new();
        for entry in self.primary_db(table).iter(txn).map_err(store_err)? {
            let (key, val) = entry.map_err(store_err)?;
            let oid = Oid::from_bytes(key.to_vec());
            let doc = self.decode_document(table, val)?;
            out.push(Row { oid, doc });
        }
        Ok(out)
    }

    /// (Re)build a single index's on-disk entries from every row currently
    /// in `table`; used by `ensure_index(force = true)` and by first
    /// registration.
    pub fn rebuild_index(&self, wtxn: &mut RwTxn<'_>, table: Table, index: &IndexSpec) -> Result<(), LegdbError> {
        let db = self.index_db(wtxn, table, index)?;
        db.clear(wtxn).map_err(store_err)?;
        let mut rows = Vec::new();
        for entry in self.primary_db(table).iter(wtxn).map_err(store_err)? {
            let (key, val) = entry.map_err(store_err)?;
            rows.push((Oid::from_bytes(key.to_vec()), self.decode_document(table, val)?));
        }
        for (oid, doc) in rows {
            if doc.contains_all(index.attrs.iter()) {
                let key = self.render_index_key(index, &doc)?;
                self.insert_index_entry(wtxn, db, &key, &oid, index.duplicates, &index.name, table)?;
            }
        }
        Ok(())
    }

    fn load_compression_state(&self) -> Result<(), LegdbError> {
        let txn = self.read_txn()?;
        let mut state = self.compression.lock().expect("compression cache lock poisoned");
        for table in [Table::Node, Table::Edge] {
            let key = Self::meta_key(table, "compression");
            if let Some(bytes) = self.meta_db.get(&txn, &key).map_err(store_err)? {
                if bytes.len() >= 2 {
                    let kind = if bytes[0] == 1 { CompressionType::Zstd } else { CompressionType::None };
                    let level = i32::from(bytes[1] as i8);
                    let dict_key = Self::meta_key(table, "dict");
                    let dict = self.meta_db.get(&txn, &dict_key).map_err(store_err)?.map(<[u8]>::to_vec);
                    state.insert(table, CompressionState { kind, level, dict });
                }
            }
        }
        Ok(())
    }

    /// Train a zstd dictionary from `samples` and persist it to `meta`.
    pub fn zstd_train(&self, wtxn: &mut RwTxn<'_>, table: Table, samples: &[Vec<u8>], dict_size: usize) -> Result<Vec<u8>, LegdbError> {
        let dict = zstd::dict::from_samples(samples, dict_size)
            .map_err(|e| LegdbError::StorageError(StoreError::Backend(e.to_string())))?;
        self.meta_db
            .put(wtxn, &Self::meta_key(table, "dict"), &dict)
            .map_err(store_err)?;
        Ok(dict)
    }

    /// Mark `table` as zstd-compressed from here on.
    pub fn set_compressed(&self, wtxn: &mut RwTxn<'_>, table: Table, level: i32, dict: Option<Vec<u8>>) -> Result<(), LegdbError> {
        let level_byte = i8::try_from(level).unwrap_or(i8::MAX) as u8;
        self.meta_db
            .put(wtxn, &Self::meta_key(table, "compression"), &[1u8, level_byte])
            .map_err(store_err)?;
        self.compression.lock().expect("compression cache lock poisoned").insert(table, CompressionState { kind: CompressionType::Zstd, level, dict });
        Ok(())
    }

    /// Write a row at a caller-chosen oid with no previous-revision index
    /// cleanup; used only by `vacuum`'s dump/reload cycle, where the table
    /// has just been cleared and every index entry is therefore new.
    pub fn restore_row(&self, wtxn: &mut RwTxn<'_>, table: Table, indexes: &[IndexSpec], oid: &Oid, doc: &Document) -> Result<(), LegdbError> {
        self.write_row(wtxn, table, indexes, oid, doc, None)
    }

    /// Drop every row from `table`'s primary database, part of `vacuum`'s
    /// rewrite-in-place.
    pub fn clear_table(&self, wtxn: &mut RwTxn<'_>, table: Table) -> Result<(), LegdbError> {
        self.primary_db(table).clear(wtxn).map_err(store_err)
    }

    /// Drop every entry from one secondary index's on-disk database,
    /// without forgetting it was ever created (its catalog registration
    /// is untouched; only the `vacuum` reload repopulates it).
    pub fn clear_index(&self, wtxn: &mut RwTxn<'_>, table: Table, index: &IndexSpec) -> Result<(), LegdbError> {
        let db = self.index_db(wtxn, table, index)?;
        db.clear(wtxn).map_err(store_err)
    }

    /// Restore the oid sequence counter to one past `high`, so that
    /// appends after a `vacuum` continue the original sequence instead
    /// of colliding with oids just reloaded.
    pub fn reset_sequence_after(&self, wtxn: &mut RwTxn<'_>, table: Table, high: &Oid) -> Result<(), LegdbError> {
        let current = u64::from_be_bytes(high.as_bytes().try_into().unwrap_or([0; 8]));
        let key = Self::meta_key(table, "seq");
        self.meta_db.put(wtxn, &key, &(current + 1).to_be_bytes()).map_err(store_err)
    }
}
