//! Append-only data block: raw payload storage for row bodies (spec §3,
//! "Data block"; §4.4).

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{Error, Result};
use crate::value::RowId;

/// A block stops accepting new payloads once it would exceed this size
/// (spec §3, §4.4).
pub const MAX_DATA_SIZE: usize = 16 * 1024 * 1024;

/// Threshold at which a table requests compression for a packed payload
/// (spec §3, §4.4, §4.5).
pub const MIN_COMPRESS_SIZE: usize = 1000;

const HEADER_LEN: usize = 8 + 4 + 4; // row_id:u64, size:u32, flags:u32

fn file_name(id: u32) -> String {
    id.to_string()
}

fn io_err(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> Error {
    let path = path.into();
    move |source| Error::Io(storage::StorageError::io(path, source))
}

/// One append-only block file (spec §4.4). Records are
/// `(RowId:u64, size:u32, flags:u32, payload:size bytes)` concatenated in
/// insertion order; offsets are stable until the block is cleared by
/// compaction.
pub struct DataBlock {
    path: PathBuf,
    id: u32,
    bytes: Option<Vec<u8>>,
    is_new: bool,
    tick: AtomicU64,
}

impl DataBlock {
    pub fn new_empty(dir: &Path, id: u32) -> Self {
        DataBlock {
            path: dir.join(file_name(id)),
            id,
            bytes: Some(Vec::new()),
            is_new: true,
            tick: AtomicU64::new(0),
        }
    }

    pub fn new_unloaded(dir: &Path, id: u32) -> Self {
        DataBlock {
            path: dir.join(file_name(id)),
            id,
            bytes: None,
            is_new: false,
            tick: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn tick(&self) -> u64 {
        self.tick.load(Ordering::Relaxed)
    }

    fn bump_tick(&self, clock: u64) {
        self.tick.store(clock, Ordering::Relaxed);
    }

    fn ensure_loaded(&mut self) -> Result<()> {
        if self.bytes.is_some() {
            return Ok(());
        }
        log::trace!("loading data block {}", self.path.display());
        let bytes = std::fs::read(&self.path).map_err(io_err(self.path.clone()))?;
        self.bytes = Some(bytes);
        Ok(())
    }

    /// Current size in bytes. Callers consult this against
    /// [`MAX_DATA_SIZE`] before deciding whether a payload fits (spec
    /// §4.4, "size policy").
    pub fn size(&self) -> usize {
        self.bytes.as_ref().map_or(0, |b| b.len())
    }

    pub fn would_fit(&self, payload_len: usize) -> bool {
        self.size() + HEADER_LEN + payload_len <= MAX_DATA_SIZE
    }

    /// Appends `(row_id, flags, payload)` and returns the offset of the
    /// record just written (spec §4.4).
    pub fn insert(&mut self, row_id: RowId, payload: &[u8], flags: u32, clock: u64) -> Result<u32> {
        self.ensure_loaded()?;
        self.bump_tick(clock);
        let bytes = self.bytes.as_mut().unwrap();
        let offset = bytes.len() as u32;
        bytes.extend_from_slice(&row_id.to_le_bytes());
        bytes.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        bytes.extend_from_slice(&flags.to_le_bytes());
        bytes.extend_from_slice(payload);
        Ok(offset)
    }

    /// Reads the record at `offset`: its stored `RowId`, flags, and raw
    /// (still packed) payload bytes. The caller unpacks the payload (spec
    /// §4.4: "calls `unpack(bytes, flags)`").
    pub fn get(&mut self, offset: u32, clock: u64) -> Result<(RowId, u32, Vec<u8>)> {
        self.ensure_loaded()?;
        self.bump_tick(clock);
        let bytes = self.bytes.as_ref().unwrap();
        let offset = offset as usize;
        let header = bytes
            .get(offset..offset + HEADER_LEN)
            .ok_or_else(|| Error::corruption(format!("offset {offset} out of range in {}", self.path.display())))?;
        let row_id = u64::from_le_bytes(header[0..8].try_into().unwrap());
        let size = u32::from_le_bytes(header[8..12].try_into().unwrap()) as usize;
        let flags = u32::from_le_bytes(header[12..16].try_into().unwrap());
        let payload_start = offset + HEADER_LEN;
        let payload = bytes
            .get(payload_start..payload_start + size)
            .ok_or_else(|| Error::corruption(format!("truncated payload at offset {offset} in {}", self.path.display())))?
            .to_vec();
        Ok((row_id, flags, payload))
    }

    pub fn memory_usage(&self) -> usize {
        self.bytes.as_ref().map_or(0, |b| b.len())
    }

    /// Persists the block's current byte image (spec §6).
    pub fn save(&mut self, dir: &Path, manual: bool) -> Result<()> {
        let bytes = match &self.bytes {
            Some(b) => b,
            None => return Ok(()),
        };
        let skip_backup = manual || self.is_new;
        storage::save_file(dir, &file_name(self.id), bytes, skip_backup)?;
        self.is_new = false;
        Ok(())
    }

    /// Frees the resident byte buffer; reloaded lazily on next access (spec
    /// §4.7).
    pub fn evict(&mut self, dir: &Path) -> Result<()> {
        self.save(dir, false)?;
        self.bytes = None;
        Ok(())
    }

}

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DataStoreMeta {
    next_id: u32,
    /// `(block id, size in bytes)`, kept so block-selection (spec §4.4)
    /// never needs to load a block just to check whether it fits.
    blocks: Vec<(u32, usize)>,
}

/// Owns every data block for one table, under `<table>.table/__data/`
/// (spec §6). Not an [`index::Index`] instantiation — blocks are a flat
/// map keyed by id, not a paged B-tree.
pub struct DataStore {
    dir: PathBuf,
    next_id: u32,
    blocks: BTreeMap<u32, DataBlock>,
    sizes: BTreeMap<u32, usize>,
    last_used: Option<u32>,
}

impl DataStore {
    fn meta_path(dir: &Path) -> PathBuf {
        dir.join("meta.yaml")
    }

    pub fn create(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        storage::ensure_layout(&dir)?;
        let store = DataStore {
            dir,
            next_id: 0,
            blocks: BTreeMap::new(),
            sizes: BTreeMap::new(),
            last_used: None,
        };
        store.save_meta()?;
        Ok(store)
    }

    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        let bytes = std::fs::read(Self::meta_path(&dir)).map_err(io_err(Self::meta_path(&dir)))?;
        let meta: DataStoreMeta = serde_yaml::from_str(
            std::str::from_utf8(&bytes).map_err(|_| Error::corruption("data store meta is not utf-8"))?,
        )
        .map_err(|e| Error::corruption(format!("invalid data store meta: {e}")))?;
        let mut blocks = BTreeMap::new();
        let mut sizes = BTreeMap::new();
        for (id, size) in meta.blocks {
            blocks.insert(id, DataBlock::new_unloaded(&dir, id));
            sizes.insert(id, size);
        }
        Ok(DataStore {
            dir,
            next_id: meta.next_id,
            blocks,
            sizes,
            last_used: None,
        })
    }

    /// Chooses a block to receive a payload of `payload_len` bytes (spec
    /// §4.4, resolved per §10.6 in favor of the source's exact policy):
    /// try the most recently used block first, then linearly scan keeping
    /// the *last* block found that fits, and only then allocate a new one.
    fn select_block(&mut self, payload_len: usize) -> u32 {
        let needed = HEADER_LEN + payload_len;
        if let Some(id) = self.last_used {
            if self.sizes.get(&id).copied().unwrap_or(0) + needed <= MAX_DATA_SIZE {
                return id;
            }
        }

        let mut candidate = None;
        for (&id, &size) in &self.sizes {
            if size + needed <= MAX_DATA_SIZE {
                candidate = Some(id);
            }
        }
        if let Some(id) = candidate {
            return id;
        }

        let id = self.next_id;
        self.next_id += 1;
        self.blocks.insert(id, DataBlock::new_empty(&self.dir, id));
        self.sizes.insert(id, 0);
        id
    }

    pub fn insert(&mut self, row_id: RowId, payload: &[u8], flags: u32, clock: u64) -> Result<(u32, u32)> {
        let block_id = self.select_block(payload.len());
        let block = self.blocks.get_mut(&block_id).expect("select_block returns a live id");
        let offset = block.insert(row_id, payload, flags, clock)?;
        self.sizes.insert(block_id, block.size());
        self.last_used = Some(block_id);
        Ok((block_id, offset))
    }

    pub fn get(&mut self, block_id: u32, offset: u32, clock: u64) -> Result<(RowId, u32, Vec<u8>)> {
        let block = self
            .blocks
            .get_mut(&block_id)
            .ok_or_else(|| Error::corruption(format!("data block {block_id} referenced but missing")))?;
        block.get(offset, clock)
    }

    pub fn memory_usage(&self) -> usize {
        self.blocks.values().map(|b| b.memory_usage()).sum()
    }

    pub fn collect_ticks(&self, out: &mut Vec<(u64, u32)>) {
        out.extend(self.blocks.iter().map(|(id, b)| (b.tick(), *id)));
    }

    pub fn evict_block(&mut self, id: u32) -> Result<()> {
        if let Some(block) = self.blocks.get_mut(&id) {
            block.evict(&self.dir)?;
        }
        Ok(())
    }

    fn save_meta(&self) -> Result<()> {
        let meta = DataStoreMeta {
            next_id: self.next_id,
            blocks: self.sizes.iter().map(|(&id, &size)| (id, size)).collect(),
        };
        let bytes = serde_yaml::to_string(&meta).expect("data store meta always serializes");
        storage::save_file(&self.dir, "meta.yaml", bytes.as_bytes(), false).map_err(Error::from)
    }

    /// Saves every block, then the meta file last (spec §6, "Save
    /// protocol").
    pub fn save(&mut self, manual: bool) -> Result<()> {
        for block in self.blocks.values_mut() {
            block.save(&self.dir, manual)?;
        }
        self.save_meta()
    }

    pub fn rollback(&mut self, db_root: &Path) -> Result<()> {
        let restored = storage::restore_backups(&self.dir)?;

        let bytes = std::fs::read(Self::meta_path(&self.dir)).map_err(io_err(Self::meta_path(&self.dir)))?;
        let meta: DataStoreMeta = serde_yaml::from_str(
            std::str::from_utf8(&bytes).map_err(|_| Error::corruption("data store meta is not utf-8"))?,
        )
        .map_err(|e| Error::corruption(format!("invalid data store meta: {e}")))?;
        let mut live: HashSet<String> = meta.blocks.iter().map(|(id, _)| id.to_string()).collect();
        live.insert("meta.yaml".to_string());
        storage::prune_extraneous(&self.dir, &live, &restored, db_root)?;

        let mut blocks = BTreeMap::new();
        let mut sizes = BTreeMap::new();
        for (id, size) in meta.blocks {
            blocks.insert(id, DataBlock::new_unloaded(&self.dir, id));
            sizes.insert(id, size);
        }
        self.blocks = blocks;
        self.sizes = sizes;
        self.next_id = meta.next_id;
        self.last_used = None;
        Ok(())
    }

    pub fn clean(&self) -> Result<()> {
        storage::clean_dir(&self.dir).map_err(Error::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_get_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut block = DataBlock::new_empty(dir.path(), 0);
        let off1 = block.insert(1, b"hello", 0, 1).unwrap();
        let off2 = block.insert(2, b"world!", 0, 1).unwrap();
        assert_eq!(block.get(off1, 2).unwrap(), (1, 0, b"hello".to_vec()));
        assert_eq!(block.get(off2, 2).unwrap(), (2, 0, b"world!".to_vec()));
    }

    #[test]
    fn would_fit_respects_max_data_size() {
        let dir = tempfile::tempdir().unwrap();
        let block = DataBlock::new_empty(dir.path(), 0);
        assert!(block.would_fit(MAX_DATA_SIZE - HEADER_LEN));
        assert!(!block.would_fit(MAX_DATA_SIZE));
    }

    #[test]
    fn save_and_reload_preserves_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let mut block = DataBlock::new_empty(dir.path(), 5);
        let off = block.insert(9, b"payload", 0, 1).unwrap();
        block.save(dir.path(), false).unwrap();

        let mut reloaded = DataBlock::new_unloaded(dir.path(), 5);
        assert_eq!(reloaded.get(off, 1).unwrap(), (9, 0, b"payload".to_vec()));
    }

    #[test]
    fn data_store_allocates_new_block_when_current_is_full() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = DataStore::create(dir.path()).unwrap();
        let (first_block, _) = store.insert(1, b"small", 0, 1).unwrap();
        // A payload that can't possibly fit alongside the first one forces
        // a fresh block id.
        let huge = vec![0u8; MAX_DATA_SIZE];
        let (second_block, _) = store.insert(2, &huge, 0, 1).unwrap();
        assert_ne!(first_block, second_block);
    }

    #[test]
    fn data_store_save_rollback_restores_prior_blocks() {
        let db_root = tempfile::tempdir().unwrap();
        let dir = db_root.path().join("t.table").join("__data");
        let mut store = DataStore::create(&dir).unwrap();
        let (block_id, offset) = store.insert(1, b"v1", 0, 1).unwrap();
        store.save(false).unwrap();

        store.insert(2, b"v2", 0, 1).unwrap();
        store.save(false).unwrap();

        store.rollback(db_root.path()).unwrap();
        assert_eq!(store.get(block_id, offset, 1).unwrap(), (1, 0, b"v1".to_vec()));
    }
}
