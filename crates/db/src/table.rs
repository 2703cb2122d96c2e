//! A table: row directory, data store and declared secondary indexes,
//! all under one `<table>.table/` directory (spec §3 "Table"; §4.5; §4.6).

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use index::{Index, Record};

use crate::data::{DataStore, MIN_COMPRESS_SIZE};
use crate::error::{Error, Result};
use crate::record::{
    DataRecord, DataRecordState, DoubleRecord, FloatRecord, HashRecord, Int32Record, Int64Record,
    IndexKind, Owned, RowRecord, UInt32Record, UInt64Record,
};
use crate::value::{self, Row, RowId, Value};

fn type_mismatch(index_name: &str, expected: &str, got: &Value) -> Error {
    Error::InvalidArgument(format!(
        "index {index_name} expects a {expected} value, got a {} value",
        got.type_name()
    ))
}

fn int32_key(index_name: &str, v: &Value) -> Result<i32> {
    match v {
        Value::Int32(x) => Ok(*x),
        other => Err(type_mismatch(index_name, "int32", other)),
    }
}

fn uint32_key(index_name: &str, v: &Value) -> Result<u32> {
    match v {
        Value::UInt32(x) => Ok(*x),
        other => Err(type_mismatch(index_name, "uint32", other)),
    }
}

fn int64_key(index_name: &str, v: &Value) -> Result<i64> {
    match v {
        Value::Int64(x) => Ok(*x),
        other => Err(type_mismatch(index_name, "int64", other)),
    }
}

fn uint64_key(index_name: &str, v: &Value) -> Result<u64> {
    match v {
        Value::UInt64(x) => Ok(*x),
        other => Err(type_mismatch(index_name, "uint64", other)),
    }
}

fn float_key(index_name: &str, v: &Value) -> Result<f32> {
    match v {
        Value::Float(x) => Ok(*x),
        other => Err(type_mismatch(index_name, "float", other)),
    }
}

fn double_key(index_name: &str, v: &Value) -> Result<f64> {
    match v {
        Value::Double(x) => Ok(*x),
        other => Err(type_mismatch(index_name, "double", other)),
    }
}

fn row_key(index_name: &str, v: &Value) -> Result<RowId> {
    match v {
        Value::RowId(x) => Ok(*x),
        other => Err(type_mismatch(index_name, "row_id", other)),
    }
}

fn min_tick_of<R: Record>(idx: &Index<R>) -> Option<u64>
where
    R::Key: Serialize + for<'de> Deserialize<'de>,
{
    let mut ticks = Vec::new();
    idx.collect_ticks(&mut ticks);
    ticks.into_iter().map(|(t, _)| t).min()
}

fn evict_lru_of<R: Record>(idx: &mut Index<R>) -> storage::Result<()>
where
    R::Key: Serialize + for<'de> Deserialize<'de>,
{
    let mut ticks = Vec::new();
    idx.collect_ticks(&mut ticks);
    if let Some((_, key)) = ticks.into_iter().min_by_key(|(t, _)| *t) {
        idx.evict_page(key)?;
    }
    Ok(())
}

/// Drops every record whose owner is in `erased_rows`, keeping everything
/// else unchanged (spec §4.6: "Non-Row-typed index: walk and push,
/// dropping any record whose RowId is in `erased_rows`.").
fn compact_flat<R: Record + Owned>(
    idx: &mut Index<R>,
    erased_rows: &HashSet<RowId>,
    clock: u64,
) -> storage::Result<()>
where
    R::Key: Serialize + for<'de> Deserialize<'de>,
{
    let mut live = Vec::new();
    idx.traverse(clock, &mut |r: R| {
        if !erased_rows.contains(&r.owner()) {
            live.push(r);
        }
    })?;
    idx.reset();
    for r in live {
        idx.push_record(r, clock)?;
    }
    idx.save(true)?;
    idx.save_meta()?;
    Ok(())
}

/// Compaction for a Row-typed (join/foreign-key) index (spec §4.6): the
/// record's key is itself the referenced RowId, so a record whose key was
/// erased no longer points anywhere and is always dropped. A record whose
/// *owner* was erased or remapped is dropped when the index was declared
/// `auto_erase`, otherwise its owner field is forwarded through
/// `update_map` (or zeroed as a tombstone if the owner was erased outright).
/// The key never changes, so sort order is preserved either way.
fn compact_row(
    idx: &mut Index<RowRecord>,
    erased_rows: &HashSet<RowId>,
    update_map: &HashMap<RowId, RowId>,
    clock: u64,
) -> storage::Result<()> {
    let auto_erase = idx.auto_erase();
    let mut live = Vec::new();
    idx.traverse(clock, &mut |r: RowRecord| {
        if erased_rows.contains(&r.value) {
            return;
        }
        if erased_rows.contains(&r.owner) {
            if auto_erase {
                return;
            }
            let new_owner = update_map.get(&r.owner).copied().unwrap_or(0);
            live.push(RowRecord { value: r.value, owner: new_owner });
            return;
        }
        live.push(r);
    })?;
    idx.reset();
    for r in live {
        idx.push_record(r, clock)?;
    }
    idx.save(true)?;
    idx.save_meta()?;
    Ok(())
}

/// Type-erases the eight `index::Index<R>` instantiations a declared
/// secondary index may be (spec §9: "Index-type dispatch ... re-express as
/// a tagged variant").
pub enum SecondaryIndex {
    Int32(Index<Int32Record>),
    UInt32(Index<UInt32Record>),
    Int64(Index<Int64Record>),
    UInt64(Index<UInt64Record>),
    Float(Index<FloatRecord>),
    Double(Index<DoubleRecord>),
    Row(Index<RowRecord>),
    Hash(Index<HashRecord>),
}

impl SecondaryIndex {
    pub fn kind(&self) -> IndexKind {
        match self {
            SecondaryIndex::Int32(_) => IndexKind::Int32,
            SecondaryIndex::UInt32(_) => IndexKind::UInt32,
            SecondaryIndex::Int64(_) => IndexKind::Int64,
            SecondaryIndex::UInt64(_) => IndexKind::UInt64,
            SecondaryIndex::Float(_) => IndexKind::Float,
            SecondaryIndex::Double(_) => IndexKind::Double,
            SecondaryIndex::Row(_) => IndexKind::Row,
            SecondaryIndex::Hash(_) => IndexKind::Hash,
        }
    }

    pub fn unique(&self) -> bool {
        match self {
            SecondaryIndex::Int32(i) => i.unique(),
            SecondaryIndex::UInt32(i) => i.unique(),
            SecondaryIndex::Int64(i) => i.unique(),
            SecondaryIndex::UInt64(i) => i.unique(),
            SecondaryIndex::Float(i) => i.unique(),
            SecondaryIndex::Double(i) => i.unique(),
            SecondaryIndex::Row(i) => i.unique(),
            SecondaryIndex::Hash(i) => i.unique(),
        }
    }

    pub fn auto_erase(&self) -> bool {
        match self {
            SecondaryIndex::Int32(i) => i.auto_erase(),
            SecondaryIndex::UInt32(i) => i.auto_erase(),
            SecondaryIndex::Int64(i) => i.auto_erase(),
            SecondaryIndex::UInt64(i) => i.auto_erase(),
            SecondaryIndex::Float(i) => i.auto_erase(),
            SecondaryIndex::Double(i) => i.auto_erase(),
            SecondaryIndex::Row(i) => i.auto_erase(),
            SecondaryIndex::Hash(i) => i.auto_erase(),
        }
    }

    pub fn create(dir: PathBuf, kind: IndexKind, unique: bool, auto_erase: bool) -> storage::Result<Self> {
        Ok(match kind {
            IndexKind::Int32 => SecondaryIndex::Int32(Index::create(dir, unique, auto_erase)?),
            IndexKind::UInt32 => SecondaryIndex::UInt32(Index::create(dir, unique, auto_erase)?),
            IndexKind::Int64 => SecondaryIndex::Int64(Index::create(dir, unique, auto_erase)?),
            IndexKind::UInt64 => SecondaryIndex::UInt64(Index::create(dir, unique, auto_erase)?),
            IndexKind::Float => SecondaryIndex::Float(Index::create(dir, unique, auto_erase)?),
            IndexKind::Double => SecondaryIndex::Double(Index::create(dir, unique, auto_erase)?),
            IndexKind::Row => SecondaryIndex::Row(Index::create(dir, unique, auto_erase)?),
            IndexKind::Hash => SecondaryIndex::Hash(Index::create(dir, unique, auto_erase)?),
        })
    }

    pub fn open(dir: PathBuf, kind: IndexKind) -> storage::Result<Self> {
        Ok(match kind {
            IndexKind::Int32 => SecondaryIndex::Int32(Index::open(dir)?),
            IndexKind::UInt32 => SecondaryIndex::UInt32(Index::open(dir)?),
            IndexKind::Int64 => SecondaryIndex::Int64(Index::open(dir)?),
            IndexKind::UInt64 => SecondaryIndex::UInt64(Index::open(dir)?),
            IndexKind::Float => SecondaryIndex::Float(Index::open(dir)?),
            IndexKind::Double => SecondaryIndex::Double(Index::open(dir)?),
            IndexKind::Row => SecondaryIndex::Row(Index::open(dir)?),
            IndexKind::Hash => SecondaryIndex::Hash(Index::open(dir)?),
        })
    }

    /// Whether `value` is already present as a key (spec §4.5 step 3's
    /// pre-flight uniqueness check, S2).
    pub fn contains(&mut self, name: &str, value: &Value, clock: u64) -> Result<bool> {
        Ok(match self {
            SecondaryIndex::Int32(i) => i.get_record(int32_key(name, value)?, clock)?.is_some(),
            SecondaryIndex::UInt32(i) => i.get_record(uint32_key(name, value)?, clock)?.is_some(),
            SecondaryIndex::Int64(i) => i.get_record(int64_key(name, value)?, clock)?.is_some(),
            SecondaryIndex::UInt64(i) => i.get_record(uint64_key(name, value)?, clock)?.is_some(),
            SecondaryIndex::Float(i) => i
                .get_record(index::TotalF32(float_key(name, value)?), clock)?
                .is_some(),
            SecondaryIndex::Double(i) => i
                .get_record(index::TotalF64(double_key(name, value)?), clock)?
                .is_some(),
            SecondaryIndex::Row(i) => i.get_record(row_key(name, value)?, clock)?.is_some(),
            SecondaryIndex::Hash(i) => i.get_record(value::hash(value), clock)?.is_some(),
        })
    }

    pub fn insert(&mut self, name: &str, value: &Value, owner: RowId, clock: u64) -> Result<bool> {
        Ok(match self {
            SecondaryIndex::Int32(i) => i.insert_record(Int32Record { value: int32_key(name, value)?, owner }, clock)?,
            SecondaryIndex::UInt32(i) => i.insert_record(UInt32Record { value: uint32_key(name, value)?, owner }, clock)?,
            SecondaryIndex::Int64(i) => i.insert_record(Int64Record { value: int64_key(name, value)?, owner }, clock)?,
            SecondaryIndex::UInt64(i) => i.insert_record(UInt64Record { value: uint64_key(name, value)?, owner }, clock)?,
            SecondaryIndex::Float(i) => i.insert_record(FloatRecord { value: float_key(name, value)?, owner }, clock)?,
            SecondaryIndex::Double(i) => i.insert_record(DoubleRecord { value: double_key(name, value)?, owner }, clock)?,
            SecondaryIndex::Row(i) => i.insert_record(RowRecord { value: row_key(name, value)?, owner }, clock)?,
            SecondaryIndex::Hash(i) => i.insert_record(HashRecord { value: value::hash(value), owner }, clock)?,
        })
    }

    /// Ascending range scan collecting owner row ids with `start <= key <=
    /// end` (spec §4.5, "index_query"). Rejects an inverted range
    /// (`start > end`) per spec §7.
    pub fn query_range(&mut self, name: &str, start: &Value, end: &Value, clock: u64) -> Result<Vec<RowId>> {
        let inverted = || Error::InvalidArgument("range query start must not exceed end".into());
        let mut out = Vec::new();
        match self {
            SecondaryIndex::Int32(i) => {
                let s = int32_key(name, start)?;
                let e = int32_key(name, end)?;
                if s > e {
                    return Err(inverted());
                }
                i.query(s, clock, &mut |r: Int32Record| {
                    if r.value > e {
                        0
                    } else {
                        out.push(r.owner);
                        1
                    }
                })?;
            }
            SecondaryIndex::UInt32(i) => {
                let s = uint32_key(name, start)?;
                let e = uint32_key(name, end)?;
                if s > e {
                    return Err(inverted());
                }
                i.query(s, clock, &mut |r: UInt32Record| {
                    if r.value > e {
                        0
                    } else {
                        out.push(r.owner);
                        1
                    }
                })?;
            }
            SecondaryIndex::Int64(i) => {
                let s = int64_key(name, start)?;
                let e = int64_key(name, end)?;
                if s > e {
                    return Err(inverted());
                }
                i.query(s, clock, &mut |r: Int64Record| {
                    if r.value > e {
                        0
                    } else {
                        out.push(r.owner);
                        1
                    }
                })?;
            }
            SecondaryIndex::UInt64(i) => {
                let s = uint64_key(name, start)?;
                let e = uint64_key(name, end)?;
                if s > e {
                    return Err(inverted());
                }
                i.query(s, clock, &mut |r: UInt64Record| {
                    if r.value > e {
                        0
                    } else {
                        out.push(r.owner);
                        1
                    }
                })?;
            }
            SecondaryIndex::Float(i) => {
                let s = float_key(name, start)?;
                let e = float_key(name, end)?;
                if s > e {
                    return Err(inverted());
                }
                i.query(index::TotalF32(s), clock, &mut |r: FloatRecord| {
                    if r.value > e {
                        0
                    } else {
                        out.push(r.owner);
                        1
                    }
                })?;
            }
            SecondaryIndex::Double(i) => {
                let s = double_key(name, start)?;
                let e = double_key(name, end)?;
                if s > e {
                    return Err(inverted());
                }
                i.query(index::TotalF64(s), clock, &mut |r: DoubleRecord| {
                    if r.value > e {
                        0
                    } else {
                        out.push(r.owner);
                        1
                    }
                })?;
            }
            SecondaryIndex::Row(i) => {
                let s = row_key(name, start)?;
                let e = row_key(name, end)?;
                if s > e {
                    return Err(inverted());
                }
                i.query(s, clock, &mut |r: RowRecord| {
                    if r.value > e {
                        0
                    } else {
                        out.push(r.owner);
                        1
                    }
                })?;
            }
            SecondaryIndex::Hash(i) => {
                let s = value::hash(start);
                let e = value::hash(end);
                if s > e {
                    return Err(inverted());
                }
                i.query(s, clock, &mut |r: HashRecord| {
                    if r.value > e {
                        0
                    } else {
                        out.push(r.owner);
                        1
                    }
                })?;
            }
        }
        Ok(out)
    }

    /// Bidirectional, callback-driven walk starting at `start` (spec §4.5,
    /// "query", distinct from the range-accumulating "index_query"). `f`
    /// receives each visited owner row id and returns the same
    /// positive/negative/zero direction signal as the underlying
    /// `index::Index::query` cursor.
    pub fn query_owners(&mut self, name: &str, start: &Value, clock: u64, f: &mut dyn FnMut(RowId) -> i32) -> Result<()> {
        match self {
            SecondaryIndex::Int32(i) => {
                let s = int32_key(name, start)?;
                i.query(s, clock, &mut |r: Int32Record| f(r.owner))?;
            }
            SecondaryIndex::UInt32(i) => {
                let s = uint32_key(name, start)?;
                i.query(s, clock, &mut |r: UInt32Record| f(r.owner))?;
            }
            SecondaryIndex::Int64(i) => {
                let s = int64_key(name, start)?;
                i.query(s, clock, &mut |r: Int64Record| f(r.owner))?;
            }
            SecondaryIndex::UInt64(i) => {
                let s = uint64_key(name, start)?;
                i.query(s, clock, &mut |r: UInt64Record| f(r.owner))?;
            }
            SecondaryIndex::Float(i) => {
                let s = float_key(name, start)?;
                i.query(index::TotalF32(s), clock, &mut |r: FloatRecord| f(r.owner))?;
            }
            SecondaryIndex::Double(i) => {
                let s = double_key(name, start)?;
                i.query(index::TotalF64(s), clock, &mut |r: DoubleRecord| f(r.owner))?;
            }
            SecondaryIndex::Row(i) => {
                let s = row_key(name, start)?;
                i.query(s, clock, &mut |r: RowRecord| f(r.owner))?;
            }
            SecondaryIndex::Hash(i) => {
                let s = value::hash(start);
                i.query(s, clock, &mut |r: HashRecord| f(r.owner))?;
            }
        }
        Ok(())
    }

    /// First record whose key equals `value`, if any (spec §4.5,
    /// "get_first"). Not well-defined for a non-unique index beyond "some
    /// matching entry"; callers that need every match use `find_all`.
    pub fn find_first(&mut self, name: &str, value: &Value, clock: u64) -> Result<Option<RowId>> {
        let mut found = None;
        match self {
            SecondaryIndex::Int32(i) => {
                let k = int32_key(name, value)?;
                i.query(k, clock, &mut |r: Int32Record| {
                    if r.value == k {
                        found = Some(r.owner);
                    }
                    0
                })?;
            }
            SecondaryIndex::UInt32(i) => {
                let k = uint32_key(name, value)?;
                i.query(k, clock, &mut |r: UInt32Record| {
                    if r.value == k {
                        found = Some(r.owner);
                    }
                    0
                })?;
            }
            SecondaryIndex::Int64(i) => {
                let k = int64_key(name, value)?;
                i.query(k, clock, &mut |r: Int64Record| {
                    if r.value == k {
                        found = Some(r.owner);
                    }
                    0
                })?;
            }
            SecondaryIndex::UInt64(i) => {
                let k = uint64_key(name, value)?;
                i.query(k, clock, &mut |r: UInt64Record| {
                    if r.value == k {
                        found = Some(r.owner);
                    }
                    0
                })?;
            }
            SecondaryIndex::Float(i) => {
                let k = float_key(name, value)?;
                i.query(index::TotalF32(k), clock, &mut |r: FloatRecord| {
                    if r.value == k {
                        found = Some(r.owner);
                    }
                    0
                })?;
            }
            SecondaryIndex::Double(i) => {
                let k = double_key(name, value)?;
                i.query(index::TotalF64(k), clock, &mut |r: DoubleRecord| {
                    if r.value == k {
                        found = Some(r.owner);
                    }
                    0
                })?;
            }
            SecondaryIndex::Row(i) => {
                let k = row_key(name, value)?;
                i.query(k, clock, &mut |r: RowRecord| {
                    if r.value == k {
                        found = Some(r.owner);
                    }
                    0
                })?;
            }
            SecondaryIndex::Hash(i) => {
                let k = value::hash(value);
                i.query(k, clock, &mut |r: HashRecord| {
                    if r.value == k {
                        found = Some(r.owner);
                    }
                    0
                })?;
            }
        }
        Ok(found)
    }

    /// Every owner row id referencing `target` through a Row-typed index
    /// (spec §4.5, "join"). Records sharing a key are contiguous, and the
    /// walk's starting position lands on the *last* such record, so a pure
    /// backward walk visits every duplicate exactly once.
    pub fn find_all_row(&mut self, target: RowId, clock: u64) -> Result<Vec<RowId>> {
        match self {
            SecondaryIndex::Row(i) => {
                let mut out = Vec::new();
                i.query(target, clock, &mut |r: RowRecord| {
                    if r.value == target {
                        out.push(r.owner);
                        -1
                    } else {
                        0
                    }
                })?;
                Ok(out)
            }
            _ => Err(Error::InvalidArgument("join requires a Row-kind index".into())),
        }
    }

    pub fn memory_usage(&self) -> usize {
        match self {
            SecondaryIndex::Int32(i) => i.memory_usage(),
            SecondaryIndex::UInt32(i) => i.memory_usage(),
            SecondaryIndex::Int64(i) => i.memory_usage(),
            SecondaryIndex::UInt64(i) => i.memory_usage(),
            SecondaryIndex::Float(i) => i.memory_usage(),
            SecondaryIndex::Double(i) => i.memory_usage(),
            SecondaryIndex::Row(i) => i.memory_usage(),
            SecondaryIndex::Hash(i) => i.memory_usage(),
        }
    }

    fn min_tick(&self) -> Option<u64> {
        match self {
            SecondaryIndex::Int32(i) => min_tick_of(i),
            SecondaryIndex::UInt32(i) => min_tick_of(i),
            SecondaryIndex::Int64(i) => min_tick_of(i),
            SecondaryIndex::UInt64(i) => min_tick_of(i),
            SecondaryIndex::Float(i) => min_tick_of(i),
            SecondaryIndex::Double(i) => min_tick_of(i),
            SecondaryIndex::Row(i) => min_tick_of(i),
            SecondaryIndex::Hash(i) => min_tick_of(i),
        }
    }

    fn evict_lru(&mut self) -> storage::Result<()> {
        match self {
            SecondaryIndex::Int32(i) => evict_lru_of(i),
            SecondaryIndex::UInt32(i) => evict_lru_of(i),
            SecondaryIndex::Int64(i) => evict_lru_of(i),
            SecondaryIndex::UInt64(i) => evict_lru_of(i),
            SecondaryIndex::Float(i) => evict_lru_of(i),
            SecondaryIndex::Double(i) => evict_lru_of(i),
            SecondaryIndex::Row(i) => evict_lru_of(i),
            SecondaryIndex::Hash(i) => evict_lru_of(i),
        }
    }

    fn save(&mut self, manual: bool) -> storage::Result<()> {
        match self {
            SecondaryIndex::Int32(i) => i.save(manual),
            SecondaryIndex::UInt32(i) => i.save(manual),
            SecondaryIndex::Int64(i) => i.save(manual),
            SecondaryIndex::UInt64(i) => i.save(manual),
            SecondaryIndex::Float(i) => i.save(manual),
            SecondaryIndex::Double(i) => i.save(manual),
            SecondaryIndex::Row(i) => i.save(manual),
            SecondaryIndex::Hash(i) => i.save(manual),
        }
    }

    fn save_meta(&self) -> storage::Result<()> {
        match self {
            SecondaryIndex::Int32(i) => i.save_meta(),
            SecondaryIndex::UInt32(i) => i.save_meta(),
            SecondaryIndex::Int64(i) => i.save_meta(),
            SecondaryIndex::UInt64(i) => i.save_meta(),
            SecondaryIndex::Float(i) => i.save_meta(),
            SecondaryIndex::Double(i) => i.save_meta(),
            SecondaryIndex::Row(i) => i.save_meta(),
            SecondaryIndex::Hash(i) => i.save_meta(),
        }
    }

    fn rollback(&mut self, db_root: &Path) -> storage::Result<()> {
        match self {
            SecondaryIndex::Int32(i) => i.rollback(db_root),
            SecondaryIndex::UInt32(i) => i.rollback(db_root),
            SecondaryIndex::Int64(i) => i.rollback(db_root),
            SecondaryIndex::UInt64(i) => i.rollback(db_root),
            SecondaryIndex::Float(i) => i.rollback(db_root),
            SecondaryIndex::Double(i) => i.rollback(db_root),
            SecondaryIndex::Row(i) => i.rollback(db_root),
            SecondaryIndex::Hash(i) => i.rollback(db_root),
        }
    }

    fn clean(&self) -> storage::Result<()> {
        match self {
            SecondaryIndex::Int32(i) => i.clean(),
            SecondaryIndex::UInt32(i) => i.clean(),
            SecondaryIndex::Int64(i) => i.clean(),
            SecondaryIndex::UInt64(i) => i.clean(),
            SecondaryIndex::Float(i) => i.clean(),
            SecondaryIndex::Double(i) => i.clean(),
            SecondaryIndex::Row(i) => i.clean(),
            SecondaryIndex::Hash(i) => i.clean(),
        }
    }

    fn compact(
        &mut self,
        erased_rows: &HashSet<RowId>,
        update_map: &HashMap<RowId, RowId>,
        clock: u64,
    ) -> storage::Result<()> {
        match self {
            SecondaryIndex::Int32(i) => compact_flat(i, erased_rows, clock),
            SecondaryIndex::UInt32(i) => compact_flat(i, erased_rows, clock),
            SecondaryIndex::Int64(i) => compact_flat(i, erased_rows, clock),
            SecondaryIndex::UInt64(i) => compact_flat(i, erased_rows, clock),
            SecondaryIndex::Float(i) => compact_flat(i, erased_rows, clock),
            SecondaryIndex::Double(i) => compact_flat(i, erased_rows, clock),
            SecondaryIndex::Hash(i) => compact_flat(i, erased_rows, clock),
            SecondaryIndex::Row(i) => compact_row(i, erased_rows, update_map, clock),
        }
    }
}

/// A declared secondary index's shape, persisted so a reopened table can
/// recreate its `SecondaryIndex` dispatch without inspecting the
/// filesystem (spec §6 names only `{nextDataId}`; this is a grounded
/// deviation recorded in `DESIGN.md`).
#[derive(Debug, Clone, Serialize, Deserialize)]
struct DeclaredIndex {
    name: String,
    kind: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TableMeta {
    indexes: Vec<DeclaredIndex>,
}

fn index_dir(table_dir: &Path, name: &str, kind: IndexKind) -> PathBuf {
    table_dir.join(format!("{name}.{}.index", kind.as_str()))
}

/// One table: a row directory keyed by `RowId`, the row bodies themselves
/// in a [`DataStore`], and every declared secondary index (spec §3, §4.5).
pub struct Table {
    dir: PathBuf,
    directory: Index<DataRecord>,
    data: DataStore,
    indexes: HashMap<String, SecondaryIndex>,
}

impl Table {
    fn meta_path(dir: &Path) -> PathBuf {
        dir.join("meta.yaml")
    }

    pub fn create(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        storage::ensure_layout(&dir)?;
        let directory = Index::create(dir.join("__data.index"), true, false)?;
        let data = DataStore::create(dir.join("__data"))?;
        let table = Table {
            dir,
            directory,
            data,
            indexes: HashMap::new(),
        };
        table.save_meta()?;
        Ok(table)
    }

    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        let bytes = std::fs::read(Self::meta_path(&dir)).map_err(|e| Error::Io(storage::StorageError::io(Self::meta_path(&dir), e)))?;
        let meta: TableMeta = serde_yaml::from_slice(&bytes).map_err(|e| Error::corruption(format!("invalid table meta: {e}")))?;
        let directory = Index::open(dir.join("__data.index"))?;
        let data = DataStore::open(dir.join("__data"))?;
        let mut indexes = HashMap::new();
        for declared in &meta.indexes {
            let kind = IndexKind::from_str(&declared.kind)
                .ok_or_else(|| Error::corruption(format!("unknown index kind {} for {}", declared.kind, declared.name)))?;
            let idx = SecondaryIndex::open(index_dir(&dir, &declared.name, kind), kind)?;
            indexes.insert(declared.name.clone(), idx);
        }
        Ok(Table { dir, directory, data, indexes })
    }

    fn save_meta(&self) -> Result<()> {
        let meta = TableMeta {
            indexes: self
                .indexes
                .iter()
                .map(|(name, idx)| DeclaredIndex { name: name.clone(), kind: idx.kind().as_str().to_string() })
                .collect(),
        };
        let bytes = serde_yaml::to_string(&meta).expect("table meta always serializes");
        storage::save_file(&self.dir, "meta.yaml", bytes.as_bytes(), false).map_err(Error::from)
    }

    /// Declares a new secondary index over field `name` (spec §4.5,
    /// "add_index"). Fails if already declared.
    pub fn add_index(&mut self, name: &str, kind: IndexKind, unique: bool, auto_erase: bool) -> Result<()> {
        if self.indexes.contains_key(name) {
            return Err(Error::AlreadyExists(format!("index {name}")));
        }
        let idx = SecondaryIndex::create(index_dir(&self.dir, name, kind), kind, unique, auto_erase)?;
        self.indexes.insert(name.to_string(), idx);
        self.save_meta()?;
        Ok(())
    }

    pub fn has_index(&self, name: &str) -> bool {
        self.indexes.contains_key(name)
    }

    /// Inserts `row` under `row_id` (spec §4.5, "insert"). Two-phase:
    /// every unique index touched by a declared field is checked *before*
    /// any index or the data store is mutated, so a `ConflictUnique`
    /// failure leaves the table exactly as it was (S2).
    pub fn insert(&mut self, mut row: Row, row_id: RowId, clock: u64) -> Result<()> {
        for (name, idx) in &mut self.indexes {
            if !idx.unique() {
                continue;
            }
            if let Some(value) = row.get(name) {
                if idx.contains(name, value, clock)? {
                    return Err(Error::ConflictUnique { index: name.clone() });
                }
            }
        }

        row.insert("id".to_string(), Value::RowId(row_id));
        let (payload, flags) = value::pack(&row, MIN_COMPRESS_SIZE);
        let (block, offset) = self.data.insert(row_id, &payload, flags, clock)?;
        self.directory.insert_record(DataRecord::live(row_id, block, offset), clock)?;

        for (name, idx) in &mut self.indexes {
            if let Some(value) = row.get(name) {
                idx.insert(name, value, row_id, clock)?;
            }
        }
        Ok(())
    }

    /// Reads the row at `row_id`, following exactly one remap hop (spec
    /// §4.5, "get"; §4.3 boundary B5).
    pub fn get(&mut self, row_id: RowId, clock: u64) -> Result<Option<Row>> {
        let record = match self.directory.get_record(row_id, clock)? {
            Some(r) => r,
            None => return Ok(None),
        };
        match record.state {
            DataRecordState::Erased => Ok(None),
            DataRecordState::Remapped(new_id) => {
                let record = self
                    .directory
                    .get_record(new_id, clock)?
                    .ok_or_else(|| Error::corruption(format!("row {row_id} remapped to missing row {new_id}")))?;
                match record.state {
                    DataRecordState::Live { block, offset } => self.read_row(new_id, block, offset, clock).map(Some),
                    _ => Ok(None),
                }
            }
            DataRecordState::Live { block, offset } => self.read_row(row_id, block, offset, clock).map(Some),
        }
    }

    fn read_row(&mut self, row_id: RowId, block: u32, offset: u32, clock: u64) -> Result<Row> {
        let (stored_id, flags, payload) = self.data.get(block, offset, clock)?;
        if stored_id != row_id {
            return Err(Error::corruption(format!(
                "row {row_id} points at block {block} offset {offset}, which holds row {stored_id}"
            )));
        }
        value::unpack(&payload, flags)
    }

    /// Marks `row_id` erased in place (spec §4.3, §4.5 "erase"). Secondary
    /// index cleanup is deferred to compaction.
    pub fn erase(&mut self, row_id: RowId, clock: u64) -> Result<()> {
        let record = self
            .directory
            .get_record(row_id, clock)?
            .ok_or_else(|| Error::NotFound(format!("row {row_id}")))?;
        if !record.exists() {
            return Err(Error::NotFound(format!("row {row_id}")));
        }
        self.directory
            .replace_record(DataRecord { row_id, state: DataRecordState::Erased }, clock)?;
        Ok(())
    }

    /// Replaces the row at `row_id` with `row`, allocating a fresh RowId
    /// via `alloc` and leaving the old entry remapped in place (spec §4.3,
    /// §4.5 "update"). Returns the new RowId.
    pub fn update(&mut self, row_id: RowId, row: Row, clock: u64, alloc: &mut dyn FnMut() -> RowId) -> Result<RowId> {
        let record = self
            .directory
            .get_record(row_id, clock)?
            .ok_or_else(|| Error::NotFound(format!("row {row_id}")))?;
        if !record.exists() {
            return Err(Error::NotFound(format!("row {row_id}")));
        }
        let new_id = alloc();
        self.insert(row, new_id, clock)?;
        self.directory
            .replace_record(DataRecord { row_id, state: DataRecordState::Remapped(new_id) }, clock)?;
        Ok(new_id)
    }

    /// Callback-driven walk over a declared index (spec §4.5, "query"):
    /// for each visited row id, looks the row up and invokes `f(row_id,
    /// &row)`; the returned direction propagates back to the index
    /// cursor exactly as `index_query`'s underlying `query_range` does.
    /// Rows whose directory entry is no longer `Live` (erased, or
    /// remapped and only reachable via their newest id) are skipped
    /// without consulting `f`, and the walk continues in whatever
    /// direction it was already moving (forward on the first record).
    pub fn query(&mut self, index_name: &str, start: &Value, clock: u64, f: &mut dyn FnMut(RowId, &Row) -> i32) -> Result<()> {
        let Table { directory, data, indexes, .. } = self;
        let idx = indexes
            .get_mut(index_name)
            .ok_or_else(|| Error::NotFound(format!("index {index_name}")))?;
        let mut direction = 1i32;
        let mut error = None;
        idx.query_owners(index_name, start, clock, &mut |owner| {
            if error.is_some() {
                return 0;
            }
            let record = match directory.get_record(owner, clock) {
                Ok(r) => r,
                Err(e) => {
                    error = Some(Error::from(e));
                    return 0;
                }
            };
            let block_offset = match record {
                Some(r) => match r.state {
                    DataRecordState::Live { block, offset } => Some((block, offset)),
                    _ => None,
                },
                None => None,
            };
            let Some((block, offset)) = block_offset else {
                return direction;
            };
            let (stored_id, flags, payload) = match data.get(block, offset, clock) {
                Ok(v) => v,
                Err(e) => {
                    error = Some(e);
                    return 0;
                }
            };
            if stored_id != owner {
                error = Some(Error::corruption(format!(
                    "row {owner} points at block {block} offset {offset}, which holds row {stored_id}"
                )));
                return 0;
            }
            let row = match value::unpack(&payload, flags) {
                Ok(row) => row,
                Err(e) => {
                    error = Some(e);
                    return 0;
                }
            };
            direction = f(owner, &row);
            direction
        })?;
        match error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Ascending range scan over a declared index, filtering out rows
    /// whose directory entry is no longer `Live` (spec §4.5 "index_query";
    /// §4.3 boundary B5).
    pub fn index_query(&mut self, index_name: &str, start: &Value, end: &Value, clock: u64) -> Result<Vec<RowId>> {
        let idx = self
            .indexes
            .get_mut(index_name)
            .ok_or_else(|| Error::NotFound(format!("index {index_name}")))?;
        let candidates = idx.query_range(index_name, start, end, clock)?;
        self.filter_live(candidates, clock)
    }

    pub fn get_first(&mut self, index_name: &str, value: &Value, clock: u64) -> Result<Option<Row>> {
        let idx = self
            .indexes
            .get_mut(index_name)
            .ok_or_else(|| Error::NotFound(format!("index {index_name}")))?;
        match idx.find_first(index_name, value, clock)? {
            Some(row_id) => self.get(row_id, clock),
            None => Ok(None),
        }
    }

    /// Resolves every row id in `left_set` through a Row-typed index,
    /// returning the union of rows that reference any of them (spec §4.5,
    /// "join").
    pub fn join(&mut self, index_name: &str, left_set: &[RowId], clock: u64) -> Result<Vec<RowId>> {
        let idx = self
            .indexes
            .get_mut(index_name)
            .ok_or_else(|| Error::NotFound(format!("index {index_name}")))?;
        let mut out = Vec::new();
        for &target in left_set {
            out.extend(idx.find_all_row(target, clock)?);
        }
        self.filter_live(out, clock)
    }

    fn filter_live(&mut self, ids: Vec<RowId>, clock: u64) -> Result<Vec<RowId>> {
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(record) = self.directory.get_record(id, clock)? {
                if record.exists() {
                    out.push(id);
                }
            }
        }
        Ok(out)
    }

    /// Smallest live RowId, if any (spec §4.5, "traverse_start").
    pub fn traverse_start(&mut self, clock: u64) -> Result<Option<RowId>> {
        let mut found = None;
        self.directory.query(RowId::MIN, clock, &mut |r: DataRecord| {
            if r.exists() {
                found = Some(r.row_id);
                0
            } else if found.is_none() {
                1
            } else {
                0
            }
        })?;
        Ok(found)
    }

    /// Largest live RowId, if any (spec §4.5, "traverse_end").
    pub fn traverse_end(&mut self, clock: u64) -> Result<Option<RowId>> {
        let mut found = None;
        self.directory.query(RowId::MAX, clock, &mut |r: DataRecord| {
            if r.exists() {
                found = Some(r.row_id);
                0
            } else if found.is_none() {
                -1
            } else {
                0
            }
        })?;
        Ok(found)
    }

    pub fn memory_usage(&self) -> usize {
        self.directory.memory_usage() + self.data.memory_usage() + self.indexes.values().map(|i| i.memory_usage()).sum::<usize>()
    }

    /// Evicts exactly one least-recently-used page or data block across the
    /// row directory, the data store, and every secondary index (spec
    /// §4.7). Returns `false` once nothing remains to evict.
    pub fn evict_one(&mut self) -> Result<bool> {
        #[derive(Clone)]
        enum Target {
            Directory,
            Data(u32),
            Index(String),
        }

        let mut best: Option<(u64, Target)> = None;
        let mut consider = |tick: u64, target: Target| {
            if best.as_ref().map_or(true, |(t, _)| tick < *t) {
                best = Some((tick, target));
            }
        };

        if let Some(t) = min_tick_of(&self.directory) {
            consider(t, Target::Directory);
        }
        let mut data_ticks = Vec::new();
        self.data.collect_ticks(&mut data_ticks);
        if let Some((t, id)) = data_ticks.into_iter().min_by_key(|(t, _)| *t) {
            consider(t, Target::Data(id));
        }
        for (name, idx) in &self.indexes {
            if let Some(t) = idx.min_tick() {
                consider(t, Target::Index(name.clone()));
            }
        }

        match best {
            None => Ok(false),
            Some((_, Target::Directory)) => {
                evict_lru_of(&mut self.directory)?;
                Ok(true)
            }
            Some((_, Target::Data(id))) => {
                self.data.evict_block(id)?;
                Ok(true)
            }
            Some((_, Target::Index(name))) => {
                self.indexes.get_mut(&name).expect("name came from self.indexes").evict_lru()?;
                Ok(true)
            }
        }
    }

    /// Rebuilds the row directory and every secondary index from only the
    /// live rows (spec §4.6, "Compaction"). Data blocks are left untouched:
    /// step 4's block replacement is "a caller-triggered follow-up write
    /// path, not part of compact" (spec §4.6), and every remaining live
    /// `DataRecord` still points into the blocks as they stand.
    pub fn compact(&mut self, clock: u64) -> Result<()> {
        let mut erased_rows = HashSet::new();
        let mut update_map = HashMap::new();
        let mut live_records = Vec::new();
        self.directory.traverse(clock, &mut |r: DataRecord| match r.state {
            DataRecordState::Live { .. } => live_records.push(r),
            DataRecordState::Erased => {
                erased_rows.insert(r.row_id);
            }
            DataRecordState::Remapped(new_id) => {
                erased_rows.insert(r.row_id);
                update_map.insert(r.row_id, new_id);
            }
        })?;

        self.directory.reset();
        for r in live_records {
            self.directory.push_record(r, clock)?;
        }
        self.directory.save(true)?;
        self.directory.save_meta()?;

        for idx in self.indexes.values_mut() {
            idx.compact(&erased_rows, &update_map, clock)?;
        }

        Ok(())
    }

    /// Saves the row directory, data store, every secondary index, then
    /// this table's own meta file last (spec §6, "Save protocol").
    pub fn save(&mut self, manual: bool) -> Result<()> {
        self.directory.save(manual)?;
        self.directory.save_meta()?;
        self.data.save(manual)?;
        for idx in self.indexes.values_mut() {
            idx.save(manual)?;
            idx.save_meta()?;
        }
        self.save_meta()
    }

    pub fn rollback(&mut self, db_root: &Path) -> Result<()> {
        self.directory.rollback(db_root)?;
        self.data.rollback(db_root)?;
        for idx in self.indexes.values_mut() {
            idx.rollback(db_root)?;
        }
        let bytes = std::fs::read(Self::meta_path(&self.dir)).map_err(|e| Error::Io(storage::StorageError::io(Self::meta_path(&self.dir), e)))?;
        let meta: TableMeta = serde_yaml::from_slice(&bytes).map_err(|e| Error::corruption(format!("invalid table meta: {e}")))?;
        let mut indexes = HashMap::new();
        for declared in &meta.indexes {
            let kind = IndexKind::from_str(&declared.kind)
                .ok_or_else(|| Error::corruption(format!("unknown index kind {} for {}", declared.kind, declared.name)))?;
            if let Some(mut idx) = self.indexes.remove(&declared.name) {
                idx.rollback(db_root)?;
                indexes.insert(declared.name.clone(), idx);
            } else {
                indexes.insert(declared.name.clone(), SecondaryIndex::open(index_dir(&self.dir, &declared.name, kind), kind)?);
            }
        }
        self.indexes = indexes;
        Ok(())
    }

    pub fn clean(&self) -> Result<()> {
        self.directory.clean()?;
        self.data.clean()?;
        for idx in self.indexes.values() {
            idx.clean()?;
        }
        storage::clean_dir(&self.dir).map_err(Error::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(fields: &[(&str, Value)]) -> Row {
        fields.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn insert_and_get_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut table = Table::create(dir.path()).unwrap();
        table
            .insert(row(&[("name", Value::String("ada".into()))]), 1, 0)
            .unwrap();
        let fetched = table.get(1, 1).unwrap().unwrap();
        assert_eq!(fetched.get("name"), Some(&Value::String("ada".into())));
    }

    #[test]
    fn unique_index_rejects_duplicate_without_mutating_table() {
        let dir = tempfile::tempdir().unwrap();
        let mut table = Table::create(dir.path()).unwrap();
        table.add_index("email", IndexKind::Hash, true, false).unwrap();
        table
            .insert(row(&[("email", Value::String("a@example.com".into()))]), 1, 0)
            .unwrap();

        let err = table
            .insert(row(&[("email", Value::String("a@example.com".into()))]), 2, 0)
            .unwrap_err();
        assert!(matches!(err, Error::ConflictUnique { .. }));
        assert!(table.get(2, 0).unwrap().is_none());
    }

    #[test]
    fn erase_then_get_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let mut table = Table::create(dir.path()).unwrap();
        table.insert(row(&[("x", Value::Int32(1))]), 1, 0).unwrap();
        table.erase(1, 0).unwrap();
        assert!(table.get(1, 0).unwrap().is_none());
    }

    #[test]
    fn update_follows_remap_to_new_row() {
        let dir = tempfile::tempdir().unwrap();
        let mut table = Table::create(dir.path()).unwrap();
        table.insert(row(&[("x", Value::Int32(1))]), 1, 0).unwrap();
        let mut next = 2u64;
        let new_id = table
            .update(1, row(&[("x", Value::Int32(2))]), 0, &mut || {
                let id = next;
                next += 1;
                id
            })
            .unwrap();
        assert_eq!(new_id, 2);
        let fetched = table.get(1, 0).unwrap().unwrap();
        assert_eq!(fetched.get("x"), Some(&Value::Int32(2)));
        let fetched_new = table.get(2, 0).unwrap().unwrap();
        assert_eq!(fetched_new.get("x"), Some(&Value::Int32(2)));
    }

    #[test]
    fn index_query_filters_erased_rows() {
        let dir = tempfile::tempdir().unwrap();
        let mut table = Table::create(dir.path()).unwrap();
        table.add_index("age", IndexKind::Int32, false, false).unwrap();
        table.insert(row(&[("age", Value::Int32(10))]), 1, 0).unwrap();
        table.insert(row(&[("age", Value::Int32(20))]), 2, 0).unwrap();
        table.erase(1, 0).unwrap();

        let found = table
            .index_query("age", &Value::Int32(0), &Value::Int32(100), 0)
            .unwrap();
        assert_eq!(found, vec![2]);
    }

    #[test]
    fn query_walks_forward_and_skips_erased_rows() {
        let dir = tempfile::tempdir().unwrap();
        let mut table = Table::create(dir.path()).unwrap();
        table.add_index("age", IndexKind::Int32, false, false).unwrap();
        table.insert(row(&[("age", Value::Int32(10))]), 1, 0).unwrap();
        table.insert(row(&[("age", Value::Int32(20))]), 2, 0).unwrap();
        table.insert(row(&[("age", Value::Int32(30))]), 3, 0).unwrap();
        table.erase(2, 0).unwrap();

        let mut visited = Vec::new();
        table
            .query("age", &Value::Int32(0), 0, &mut |id, r| {
                visited.push((id, r.get("age").cloned()));
                1
            })
            .unwrap();
        assert_eq!(
            visited,
            vec![(1, Some(Value::Int32(10))), (3, Some(Value::Int32(30)))]
        );
    }

    #[test]
    fn query_stops_as_soon_as_callback_returns_zero() {
        let dir = tempfile::tempdir().unwrap();
        let mut table = Table::create(dir.path()).unwrap();
        table.add_index("age", IndexKind::Int32, false, false).unwrap();
        table.insert(row(&[("age", Value::Int32(10))]), 1, 0).unwrap();
        table.insert(row(&[("age", Value::Int32(20))]), 2, 0).unwrap();
        table.insert(row(&[("age", Value::Int32(30))]), 3, 0).unwrap();

        let mut visited = Vec::new();
        table
            .query("age", &Value::Int32(0), 0, &mut |id, _| {
                visited.push(id);
                0
            })
            .unwrap();
        assert_eq!(visited, vec![1]);
    }

    #[test]
    fn join_resolves_row_typed_index() {
        let dir = tempfile::tempdir().unwrap();
        let mut table = Table::create(dir.path()).unwrap();
        table.add_index("author", IndexKind::Row, false, false).unwrap();
        table.insert(row(&[("author", Value::RowId(100))]), 1, 0).unwrap();
        table.insert(row(&[("author", Value::RowId(100))]), 2, 0).unwrap();
        table.insert(row(&[("author", Value::RowId(200))]), 3, 0).unwrap();

        let mut joined = table.join("author", &[100], 0).unwrap();
        joined.sort();
        assert_eq!(joined, vec![1, 2]);
    }

    #[test]
    fn compact_drops_erased_rows_from_directory_and_index() {
        let dir = tempfile::tempdir().unwrap();
        let mut table = Table::create(dir.path()).unwrap();
        table.add_index("age", IndexKind::Int32, false, false).unwrap();
        table.insert(row(&[("age", Value::Int32(10))]), 1, 0).unwrap();
        table.insert(row(&[("age", Value::Int32(20))]), 2, 0).unwrap();
        table.erase(1, 0).unwrap();

        table.compact(0).unwrap();

        assert!(table.get(1, 0).unwrap().is_none());
        let found = table
            .index_query("age", &Value::Int32(0), &Value::Int32(100), 0)
            .unwrap();
        assert_eq!(found, vec![2]);
    }

    #[test]
    fn save_rollback_restores_prior_row() {
        let db_root = tempfile::tempdir().unwrap();
        let table_dir = db_root.path().join("t.table");
        let mut table = Table::create(&table_dir).unwrap();
        table.insert(row(&[("x", Value::Int32(1))]), 1, 0).unwrap();
        table.save(false).unwrap();

        table.insert(row(&[("x", Value::Int32(2))]), 2, 0).unwrap();
        table.save(false).unwrap();

        table.rollback(db_root.path()).unwrap();
        assert!(table.get(1, 0).unwrap().is_some());
        assert!(table.get(2, 0).unwrap().is_none());
    }
}
