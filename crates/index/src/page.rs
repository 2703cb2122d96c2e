//! A page: an on-disk, memory-budgeted map of chunks (spec §4.2).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use storage::Result as StorageResult;

use crate::chunk::{Action, Chunk};
use crate::record::Record;

/// Maximum number of chunks a page may hold before it must be split by the
/// owning index (spec §4.2).
pub const MAX_CHUNKS: usize = 1024;

/// One page: a file-backed, lazily-loaded map from each chunk's minimum key
/// to the chunk itself.
pub struct Page<R: Record> {
    path: PathBuf,
    id: u32,
    chunks: Option<BTreeMap<R::Key, Chunk<R>>>,
    /// False once this page has been saved at least once — gates whether
    /// `save` backs up the previous image first (spec §6).
    is_new: bool,
    memory_usage: usize,
    tick: AtomicU64,
}

fn file_name(id: u32) -> String {
    id.to_string()
}

impl<R: Record> Page<R> {
    /// Creates a brand-new, empty page (no chunks yet). Callers install the
    /// very first record via [`Page::insert`] or [`Page::push`], which
    /// allocates chunk 0 on demand (spec §4.2, "handle_first").
    pub fn new_empty(dir: &Path, id: u32) -> Self {
        Page {
            path: dir.join(file_name(id)),
            id,
            chunks: Some(BTreeMap::new()),
            is_new: true,
            memory_usage: 0,
            tick: AtomicU64::new(0),
        }
    }

    /// Creates a handle to a page that already exists on disk, without
    /// loading it yet.
    pub fn new_unloaded(dir: &Path, id: u32) -> Self {
        Page {
            path: dir.join(file_name(id)),
            id,
            chunks: None,
            is_new: false,
            memory_usage: 0,
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

    fn ensure_loaded(&mut self) -> StorageResult<()> {
        if self.chunks.is_some() {
            return Ok(());
        }
        let bytes = std::fs::read(&self.path)
            .map_err(|e| storage::StorageError::io(self.path.clone(), e))?;
        let mut map = BTreeMap::new();
        let num_chunks = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
        let mut offset = 4;
        let mut memory_usage = 0;
        for _ in 0..num_chunks {
            let (chunk, consumed) = Chunk::<R>::decode(&bytes[offset..]);
            offset += consumed;
            memory_usage += chunk.encoded_len();
            if !chunk.is_empty() {
                map.insert(chunk.min(), chunk);
            }
        }
        self.chunks = Some(map);
        self.memory_usage = memory_usage;
        Ok(())
    }

    /// Number of chunks currently resident (0 for an unloaded page).
    pub fn chunk_count(&self) -> usize {
        self.chunks.as_ref().map_or(0, |m| m.len())
    }

    /// Loads the page if necessary, updates the access tick, and runs `f`
    /// over the resident chunk map.
    fn with_chunks<T>(
        &mut self,
        clock: u64,
        f: impl FnOnce(&mut BTreeMap<R::Key, Chunk<R>>) -> T,
    ) -> StorageResult<T> {
        self.ensure_loaded()?;
        self.bump_tick(clock);
        Ok(f(self.chunks.as_mut().unwrap()))
    }

    fn find_chunk_key(chunks: &BTreeMap<R::Key, Chunk<R>>, key: R::Key) -> Option<R::Key> {
        chunks.range(..=key).next_back().map(|(k, _)| *k)
    }

    /// Inserts `record`. `unique` is the owning index's declared
    /// uniqueness; when true a colliding key anywhere in the target chunk
    /// is rejected (spec §4.1, `ConflictUnique`).
    ///
    /// Returns `None` on a rejected duplicate. Otherwise returns the
    /// [`Action`] the owning index must perform (e.g. splitting this page
    /// if it now holds `MAX_CHUNKS` chunks).
    pub fn insert(&mut self, record: R, unique: bool, clock: u64) -> StorageResult<Option<Action>> {
        let result = self.with_chunks(clock, |chunks| {
            if chunks.is_empty() {
                chunks.insert(record.key(), Chunk::from_records(vec![record]));
                return Some(Action::REMAP);
            }

            let mut chunk_key = Self::find_chunk_key(chunks, record.key())
                .unwrap_or_else(|| *chunks.keys().next().unwrap());
            let chunk = chunks.get_mut(&chunk_key).unwrap();
            let action = chunk.insert(record, unique)?;

            let mut action = action;
            if action.contains(Action::REMAP) && chunk_key != chunk.min() {
                let chunk = chunks.remove(&chunk_key).unwrap();
                let new_key = chunk.min();
                chunks.insert(new_key, chunk);
                chunk_key = new_key;
            }

            if action.contains(Action::SPLIT) {
                if chunks.len() >= MAX_CHUNKS {
                    // Bubble the split up to the index: this page itself
                    // must be split.
                    return Some(Action::SPLIT);
                }
                let chunk = chunks.get_mut(&chunk_key).unwrap();
                let upper = chunk.split();
                chunks.insert(upper.min(), upper);
                action = Action::empty();
            }

            Some(action)
        })?;
        if result.is_some() {
            self.memory_usage += R::ENCODED_LEN;
        }
        Ok(result)
    }

    /// Appends `record`, which the caller guarantees sorts after every
    /// record currently in the page.
    pub fn push(&mut self, record: R, unique: bool, clock: u64) -> StorageResult<Option<Action>> {
        let result = self.with_chunks(clock, |chunks| {
            if chunks.is_empty() {
                chunks.insert(record.key(), Chunk::from_records(vec![record]));
                return Some(Action::REMAP);
            }

            let last_key = *chunks.keys().next_back().unwrap();
            let chunk = chunks.get_mut(&last_key).unwrap();
            let action = chunk.push(record, unique)?;

            if action.contains(Action::SPLIT) {
                if chunks.len() >= MAX_CHUNKS {
                    return Some(Action::SPLIT);
                }
                let chunk = chunks.get_mut(&last_key).unwrap();
                let upper = chunk.split();
                chunks.insert(upper.min(), upper);
                return Some(Action::empty());
            }

            Some(action)
        })?;
        if result.is_some() {
            self.memory_usage += R::ENCODED_LEN;
        }
        Ok(result)
    }

    /// Overwrites the record keyed `record.key()` in place (spec §4.3).
    /// Returns `false` if no such record exists. Never changes chunk
    /// membership or ordering, so no [`Action`] is returned.
    pub fn replace(&mut self, record: R, clock: u64) -> StorageResult<bool> {
        self.with_chunks(clock, |chunks| {
            let chunk_key = match Self::find_chunk_key(chunks, record.key()) {
                Some(k) => k,
                None => return false,
            };
            chunks.get_mut(&chunk_key).map_or(false, |c| c.replace(record))
        })
    }

    pub fn get(&mut self, key: R::Key, clock: u64) -> StorageResult<Option<R>> {
        self.with_chunks(clock, |chunks| {
            let chunk_key = Self::find_chunk_key(chunks, key)?;
            chunks.get(&chunk_key).and_then(|c| c.get(key)).copied()
        })
    }

    /// Splits this page: keeps the lower half of the chunks here, returns
    /// the upper half as a brand-new page.
    pub fn split(&mut self, new_id: u32, clock: u64) -> StorageResult<Page<R>> {
        self.ensure_loaded()?;
        self.bump_tick(clock);
        let chunks = self.chunks.as_mut().unwrap();
        let half = chunks.len() / 2;
        let upper_keys: Vec<R::Key> = chunks.keys().rev().take(chunks.len() - half).copied().collect();
        let mut upper = BTreeMap::new();
        for key in upper_keys {
            let chunk = chunks.remove(&key).unwrap();
            upper.insert(key, chunk);
        }
        let upper_memory: usize = upper.values().map(|c| c.encoded_len()).sum();
        self.memory_usage = self.memory_usage.saturating_sub(upper_memory);
        Ok(Page {
            path: self.path.with_file_name(file_name(new_id)),
            id: new_id,
            chunks: Some(upper),
            is_new: true,
            memory_usage: upper_memory,
            tick: AtomicU64::new(clock),
        })
    }

    pub fn min(&self) -> Option<R::Key> {
        self.chunks.as_ref().and_then(|m| m.keys().next().copied())
    }

    /// Visits every record in the page in ascending key order.
    pub fn traverse(&mut self, clock: u64, f: &mut impl FnMut(R)) -> StorageResult<()> {
        self.with_chunks(clock, |chunks| {
            for chunk in chunks.values() {
                for record in chunk.records() {
                    f(*record);
                }
            }
        })
    }

    /// Bidirectional range walk starting at `start` (spec §4.2). Returns
    /// the sign the last callback invocation returned, so an [`crate::Index`]
    /// knows whether to continue into a neighboring page.
    pub fn query(
        &mut self,
        start: R::Key,
        clock: u64,
        f: &mut impl FnMut(R) -> i32,
    ) -> StorageResult<i32> {
        self.with_chunks(clock, |chunks| {
            if chunks.is_empty() {
                return 0;
            }
            let mut cursor_key = match Self::find_chunk_key(chunks, start) {
                Some(k) => k,
                None => *chunks.keys().next().unwrap(),
            };
            loop {
                let sign = chunks.get(&cursor_key).unwrap().query(start, f);
                if sign > 0 {
                    match chunks.range((std::ops::Bound::Excluded(cursor_key), std::ops::Bound::Unbounded)).next() {
                        Some((k, _)) => cursor_key = *k,
                        None => return sign,
                    }
                } else if sign < 0 {
                    match chunks.range(..cursor_key).next_back() {
                        Some((k, _)) => cursor_key = *k,
                        None => return sign,
                    }
                } else {
                    return 0;
                }
            }
        })
    }

    pub fn memory_usage(&self) -> usize {
        self.memory_usage
    }

    /// Serializes the resident chunk map to the page file, backing up the
    /// previous image first unless this page has never been saved.
    pub fn save(&mut self, dir: &Path, manual: bool) -> StorageResult<()> {
        let chunks = match &self.chunks {
            Some(c) => c,
            None => return Ok(()),
        };
        let mut bytes = Vec::with_capacity(4 + self.memory_usage);
        bytes.extend_from_slice(&(chunks.len() as u32).to_le_bytes());
        for chunk in chunks.values() {
            chunk.encode(&mut bytes);
        }
        // A manual save (used right after compaction rebuilds this page
        // from scratch) never has a prior durable image worth keeping, so
        // it always skips the backup step regardless of `is_new`.
        let skip_backup = manual || self.is_new;
        storage::save_file(dir, &file_name(self.id), &bytes, skip_backup)?;
        self.is_new = false;
        Ok(())
    }

    /// Frees the resident chunk map, e.g. under memory pressure. The page
    /// reloads itself lazily the next time it is accessed.
    pub fn evict(&mut self, dir: &Path) -> StorageResult<()> {
        self.save(dir, false)?;
        self.chunks = None;
        self.memory_usage = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::SPLIT_CHUNK_SIZE;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct IntRecord(u64, u64);

    impl Record for IntRecord {
        type Key = u64;
        const ENCODED_LEN: usize = 16;

        fn key(&self) -> u64 {
            self.0
        }

        fn encode(&self, out: &mut [u8]) {
            out[0..8].copy_from_slice(&self.0.to_le_bytes());
            out[8..16].copy_from_slice(&self.1.to_le_bytes());
        }

        fn decode(bytes: &[u8]) -> Self {
            IntRecord(
                u64::from_le_bytes(bytes[0..8].try_into().unwrap()),
                u64::from_le_bytes(bytes[8..16].try_into().unwrap()),
            )
        }
    }

    #[test]
    fn insert_and_get_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut page = Page::new_empty(dir.path(), 0);
        for v in [5u64, 1, 3, 2, 4] {
            page.insert(IntRecord(v, v * 10), true, 1).unwrap().unwrap();
        }
        for v in 1u64..=5 {
            let record = page.get(v, 2).unwrap().unwrap();
            assert_eq!(record, IntRecord(v, v * 10));
        }
        assert_eq!(page.min(), Some(1));
    }

    #[test]
    fn unique_insert_rejects_duplicate() {
        let dir = tempfile::tempdir().unwrap();
        let mut page = Page::new_empty(dir.path(), 0);
        page.insert(IntRecord(1, 1), true, 1).unwrap().unwrap();
        assert!(page.insert(IntRecord(1, 2), true, 1).unwrap().is_none());
    }

    #[test]
    fn non_unique_insert_allows_duplicate_keys() {
        let dir = tempfile::tempdir().unwrap();
        let mut page = Page::new_empty(dir.path(), 0);
        page.insert(IntRecord(1, 1), false, 1).unwrap().unwrap();
        page.insert(IntRecord(1, 2), false, 1).unwrap().unwrap();
        let mut seen = Vec::new();
        page.query(1, 1, &mut |r| {
            seen.push(r.1);
            1
        })
        .unwrap();
        assert_eq!(seen.len(), 2);
    }

    #[test]
    fn insert_splits_chunk_past_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let mut page = Page::new_empty(dir.path(), 0);
        for v in 0..(SPLIT_CHUNK_SIZE as u64 + 5) {
            page.insert(IntRecord(v, v), true, 1).unwrap().unwrap();
        }
        assert!(page.chunk_count() > 1);
        for v in 0..(SPLIT_CHUNK_SIZE as u64 + 5) {
            assert_eq!(page.get(v, 1).unwrap().unwrap().0, v);
        }
    }

    #[test]
    fn save_and_reload_preserves_records() {
        let dir = tempfile::tempdir().unwrap();
        let mut page = Page::new_empty(dir.path(), 7);
        for v in 0u64..20 {
            page.insert(IntRecord(v, v + 1), true, 1).unwrap().unwrap();
        }
        page.save(dir.path(), false).unwrap();

        let mut reloaded = Page::<IntRecord>::new_unloaded(dir.path(), 7);
        for v in 0u64..20 {
            assert_eq!(reloaded.get(v, 1).unwrap().unwrap(), IntRecord(v, v + 1));
        }
    }
}
