//! The top-level embedded store: a named collection of tables sharing one
//! RowId space and one memory budget (spec §3 "Database"; §4.7; §5).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::record::IndexKind;
use crate::table::Table;
use crate::value::{Row, RowId, Value};

/// Default ceiling on total resident page/data-block bytes across every
/// table before [`Database::check_memory`] starts evicting (spec §4.7).
pub const DEFAULT_MEMORY_LIMIT: usize = 1024 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DatabaseMeta {
    next_row_id: RowId,
    /// Persisted so a reopened database keeps the limit set via
    /// [`Database::set_memory_limit`] rather than silently reverting to
    /// [`DEFAULT_MEMORY_LIMIT`] (spec §6: "The memory limit is an
    /// in-process setting persisted in `<db>/meta.nvar>`").
    memory_limit: usize,
    tables: Vec<String>,
}

fn table_dir(root: &Path, name: &str) -> PathBuf {
    root.join(format!("{name}.table"))
}

/// An embedded, on-disk document store (spec §3, §4.5–§4.7).
///
/// `Table`s are guarded by [`parking_lot::RwLock`] per the declared
/// concurrency model (spec §5), but every operation here takes a write
/// guard: `Page`/`Index` mutate lazily-loaded state and bump access ticks
/// even on a logical read, so there is no useful read/write split to
/// express at this layer without threading interior mutability much
/// deeper. This is a deliberate, documented simplification (see
/// `DESIGN.md`), not an oversight.
pub struct Database {
    root: PathBuf,
    tables: HashMap<String, RwLock<Table>>,
    next_row_id: AtomicU64,
    clock: AtomicU64,
    memory_limit: usize,
}

impl Database {
    fn meta_path(root: &Path) -> PathBuf {
        root.join("meta.yaml")
    }

    pub fn create(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        storage::ensure_layout(&root)?;
        let db = Database {
            root,
            tables: HashMap::new(),
            next_row_id: AtomicU64::new(1),
            clock: AtomicU64::new(0),
            memory_limit: DEFAULT_MEMORY_LIMIT,
        };
        db.save_meta()?;
        Ok(db)
    }

    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let bytes = std::fs::read(Self::meta_path(&root)).map_err(|e| Error::Io(storage::StorageError::io(Self::meta_path(&root), e)))?;
        let meta: DatabaseMeta = serde_yaml::from_slice(&bytes).map_err(|e| Error::corruption(format!("invalid database meta: {e}")))?;
        let mut tables = HashMap::new();
        for name in &meta.tables {
            let table = Table::open(table_dir(&root, name))?;
            tables.insert(name.clone(), RwLock::new(table));
        }
        Ok(Database {
            root,
            tables,
            next_row_id: AtomicU64::new(meta.next_row_id),
            clock: AtomicU64::new(0),
            memory_limit: meta.memory_limit,
        })
    }

    fn save_meta(&self) -> Result<()> {
        let meta = DatabaseMeta {
            next_row_id: self.next_row_id.load(Ordering::SeqCst),
            memory_limit: self.memory_limit,
            tables: {
                let mut names: Vec<String> = self.tables.keys().cloned().collect();
                names.sort();
                names
            },
        };
        let bytes = serde_yaml::to_string(&meta).expect("database meta always serializes");
        storage::save_file(&self.root, "meta.yaml", bytes.as_bytes(), false).map_err(Error::from)
    }

    /// Sets the cache memory budget and persists it immediately (spec §6,
    /// §10.4: the memory limit is the one mutable setting this engine
    /// has, and it is durable as soon as it's set rather than waiting for
    /// the next explicit [`Database::save`]).
    pub fn set_memory_limit(&mut self, bytes: usize) -> Result<()> {
        self.memory_limit = bytes;
        self.save_meta()
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::SeqCst)
    }

    fn alloc_row_id(&self) -> RowId {
        self.next_row_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn create_table(&mut self, name: &str) -> Result<()> {
        if self.tables.contains_key(name) {
            return Err(Error::AlreadyExists(format!("table {name}")));
        }
        let table = Table::create(table_dir(&self.root, name))?;
        self.tables.insert(name.to_string(), RwLock::new(table));
        self.save_meta()?;
        Ok(())
    }

    pub fn has_table(&self, name: &str) -> bool {
        self.tables.contains_key(name)
    }

    fn table(&self, name: &str) -> Result<&RwLock<Table>> {
        self.tables.get(name).ok_or_else(|| Error::NotFound(format!("table {name}")))
    }

    pub fn add_index(&self, table: &str, field: &str, kind: IndexKind, unique: bool, auto_erase: bool) -> Result<()> {
        self.table(table)?.write().add_index(field, kind, unique, auto_erase)
    }

    /// Inserts `row` into `table`, allocating a fresh RowId (spec §4.5,
    /// "insert"). The memory budget is checked after the write, not
    /// before, matching the eviction trigger described in §4.7 ("after any
    /// mutation that could have grown resident memory").
    pub fn insert(&self, table: &str, row: Row) -> Result<RowId> {
        let row_id = self.alloc_row_id();
        let clock = self.tick();
        self.table(table)?.write().insert(row, row_id, clock)?;
        self.check_memory()?;
        Ok(row_id)
    }

    pub fn get(&self, table: &str, row_id: RowId) -> Result<Option<Row>> {
        let clock = self.tick();
        self.table(table)?.write().get(row_id, clock)
    }

    pub fn erase(&self, table: &str, row_id: RowId) -> Result<()> {
        let clock = self.tick();
        self.table(table)?.write().erase(row_id, clock)
    }

    /// Updates the row at `row_id`, allocating its replacement RowId from
    /// the same global counter every `insert` uses (spec §4.5, "update").
    pub fn update(&self, table: &str, row_id: RowId, row: Row) -> Result<RowId> {
        let clock = self.tick();
        let new_id = self
            .table(table)?
            .write()
            .update(row_id, row, clock, &mut || self.alloc_row_id())?;
        self.check_memory()?;
        Ok(new_id)
    }

    /// Callback-driven walk over a declared index, starting at `start`
    /// (spec §4.5, "query"). `f` is invoked with each visited live row
    /// in key order and returns the direction the cursor should move
    /// next: positive to advance, negative to retreat, zero to stop.
    pub fn query(&self, table: &str, index_name: &str, start: &Value, f: &mut dyn FnMut(RowId, &Row) -> i32) -> Result<()> {
        let clock = self.tick();
        self.table(table)?.write().query(index_name, start, clock, f)
    }

    pub fn index_query(&self, table: &str, index_name: &str, start: &Value, end: &Value) -> Result<Vec<RowId>> {
        let clock = self.tick();
        self.table(table)?.write().index_query(index_name, start, end, clock)
    }

    pub fn get_first(&self, table: &str, index_name: &str, value: &Value) -> Result<Option<Row>> {
        let clock = self.tick();
        self.table(table)?.write().get_first(index_name, value, clock)
    }

    pub fn join(&self, table: &str, index_name: &str, left_set: &[RowId]) -> Result<Vec<RowId>> {
        let clock = self.tick();
        self.table(table)?.write().join(index_name, left_set, clock)
    }

    pub fn traverse_start(&self, table: &str) -> Result<Option<RowId>> {
        let clock = self.tick();
        self.table(table)?.write().traverse_start(clock)
    }

    pub fn traverse_end(&self, table: &str) -> Result<Option<RowId>> {
        let clock = self.tick();
        self.table(table)?.write().traverse_end(clock)
    }

    /// Sums resident memory across every table, evicting least-recently
    /// used pages/data blocks one at a time, across table boundaries,
    /// until back under the configured limit (spec §4.7).
    ///
    /// Each eviction acquires and releases one table's write lock in
    /// turn, so the calling thread never holds a table lock while
    /// (re-)evaluating a different table's eviction candidates (spec §5).
    pub fn check_memory(&self) -> Result<()> {
        loop {
            let total: usize = self.tables.values().map(|t| t.read().memory_usage()).sum();
            if total <= self.memory_limit {
                return Ok(());
            }
            let mut evicted_any = false;
            for table in self.tables.values() {
                if table.write().evict_one()? {
                    evicted_any = true;
                    break;
                }
            }
            if !evicted_any {
                // Every table is already fully evicted; nothing left to
                // shrink even though we're still over budget.
                return Ok(());
            }
        }
    }

    /// Rebuilds every table from only its live rows (spec §4.6,
    /// "Compaction"). Takes every table's write lock; lock order follows
    /// the table name's iteration order, which is stable across a single
    /// process but not guaranteed across runs (spec §5 only requires
    /// "order-independent", i.e. no other operation partially locks more
    /// than one table at a time).
    pub fn compact(&self) -> Result<()> {
        let clock = self.tick();
        for table in self.tables.values() {
            table.write().compact(clock)?;
        }
        Ok(())
    }

    /// Saves every table, then this database's own meta file last (spec
    /// §6, "Save protocol"). Tables are saved one at a time under their
    /// own write lock, never holding two at once.
    pub fn save(&self) -> Result<()> {
        for table in self.tables.values() {
            table.write().save(false)?;
        }
        self.save_meta()
    }

    pub fn rollback(&self) -> Result<()> {
        for table in self.tables.values() {
            table.write().rollback(&self.root)?;
        }
        let bytes = std::fs::read(Self::meta_path(&self.root)).map_err(|e| Error::Io(storage::StorageError::io(Self::meta_path(&self.root), e)))?;
        let meta: DatabaseMeta = serde_yaml::from_slice(&bytes).map_err(|e| Error::corruption(format!("invalid database meta: {e}")))?;
        self.next_row_id.store(meta.next_row_id, Ordering::SeqCst);
        Ok(())
    }

    pub fn clean(&self) -> Result<()> {
        for table in self.tables.values() {
            table.read().clean()?;
        }
        storage::clean_dir(&self.root).map_err(Error::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(fields: &[(&str, Value)]) -> Row {
        fields.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn create_insert_get_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = Database::create(dir.path()).unwrap();
        db.create_table("users").unwrap();
        let id = db.insert("users", row(&[("name", Value::String("ada".into()))])).unwrap();
        let fetched = db.get("users", id).unwrap().unwrap();
        assert_eq!(fetched.get("name"), Some(&Value::String("ada".into())));
    }

    #[test]
    fn row_ids_are_unique_across_tables() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = Database::create(dir.path()).unwrap();
        db.create_table("a").unwrap();
        db.create_table("b").unwrap();
        let id1 = db.insert("a", row(&[("x", Value::Int32(1))])).unwrap();
        let id2 = db.insert("b", row(&[("x", Value::Int32(2))])).unwrap();
        assert_ne!(id1, id2);
    }

    #[test]
    fn index_query_rejects_inverted_range() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = Database::create(dir.path()).unwrap();
        db.create_table("t").unwrap();
        db.add_index("t", "age", IndexKind::Int32, false, false).unwrap();
        let err = db
            .index_query("t", "age", &Value::Int32(10), &Value::Int32(0))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn save_then_reopen_preserves_rows_and_counter() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = Database::create(dir.path()).unwrap();
        db.create_table("users").unwrap();
        let id = db.insert("users", row(&[("x", Value::Int32(1))])).unwrap();
        db.save().unwrap();

        let mut reopened = Database::open(dir.path()).unwrap();
        assert!(reopened.get("users", id).unwrap().is_some());
        let next_id = reopened.insert("users", row(&[("x", Value::Int32(2))])).unwrap();
        assert!(next_id > id);
    }

    #[test]
    fn memory_limit_of_zero_triggers_eviction_without_losing_data() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = Database::create(dir.path()).unwrap();
        db.create_table("t").unwrap();
        db.set_memory_limit(0).unwrap();
        let id = db.insert("t", row(&[("x", Value::Int32(1))])).unwrap();
        assert!(db.get("t", id).unwrap().is_some());
    }
}
