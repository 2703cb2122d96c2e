//! An index: an ordered map from page-minimum-key to page (spec §4.2,
//! "Index"). Shared by every secondary index and by the row directory.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::chunk::Action;
use crate::page::Page;
use crate::record::{Bounded, Record};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexMetaFile<K> {
    next_page_id: u32,
    unique: bool,
    auto_erase: bool,
    /// `(page id, page's minimum key)`, in page-map order.
    pages: Vec<(u32, K)>,
}

/// Ties together a page map, a meta file and the on-disk directory that
/// backs an index (spec §4.2).
pub struct Index<R: Record> {
    dir: PathBuf,
    unique: bool,
    auto_erase: bool,
    next_page_id: u32,
    /// Page id keyed by that page's minimum key.
    pages: BTreeMap<R::Key, Page<R>>,
}

impl<R: Record> Index<R>
where
    R::Key: Serialize + for<'de> Deserialize<'de>,
{
    fn meta_path(dir: &Path) -> PathBuf {
        dir.join("meta.yaml")
    }

    /// Creates a brand-new index directory with a single empty page keyed
    /// at `R::Key::MIN` (spec §4.2).
    pub fn create(dir: impl Into<PathBuf>, unique: bool, auto_erase: bool) -> storage::Result<Self> {
        let dir = dir.into();
        storage::ensure_layout(&dir)?;
        let mut pages = BTreeMap::new();
        pages.insert(R::Key::MIN, Page::new_empty(&dir, 0));
        let index = Index {
            dir,
            unique,
            auto_erase,
            next_page_id: 1,
            pages,
        };
        index.save_meta()?;
        Ok(index)
    }

    /// Reopens an index whose directory already exists.
    pub fn open(dir: impl Into<PathBuf>) -> storage::Result<Self> {
        let dir = dir.into();
        let bytes = std::fs::read(Self::meta_path(&dir))
            .map_err(|e| storage::StorageError::io(Self::meta_path(&dir), e))?;
        let meta: IndexMetaFile<R::Key> = serde_yaml::from_slice(&bytes)
            .map_err(|e| storage::StorageError::io(Self::meta_path(&dir), std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;
        let mut pages = BTreeMap::new();
        for (id, min_key) in meta.pages {
            pages.insert(min_key, Page::new_unloaded(&dir, id));
        }
        Ok(Index {
            dir,
            unique: meta.unique,
            auto_erase: meta.auto_erase,
            next_page_id: meta.next_page_id,
            pages,
        })
    }

    pub fn unique(&self) -> bool {
        self.unique
    }

    pub fn auto_erase(&self) -> bool {
        self.auto_erase
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn find_page_key(&self, key: R::Key) -> R::Key {
        *self
            .pages
            .range(..=key)
            .next_back()
            .map(|(k, _)| k)
            .unwrap_or_else(|| self.pages.keys().next().expect("index has no pages"))
    }

    fn first_page_key(&self) -> R::Key {
        *self.pages.keys().next().expect("index has no pages")
    }

    fn last_page_key(&self) -> R::Key {
        *self.pages.keys().next_back().expect("index has no pages")
    }

    /// Inserts `record` in sorted position. Returns `Ok(false)` if a record
    /// with the same key already exists anywhere in the index.
    pub fn insert_record(&mut self, record: R, clock: u64) -> storage::Result<bool> {
        let page_key = self.find_page_key(record.key());
        let page = self.pages.get_mut(&page_key).unwrap();
        let action = match page.insert(record, self.unique, clock)? {
            Some(a) => a,
            None => return Ok(false),
        };
        self.apply_action(page_key, action, clock)?;
        Ok(true)
    }

    /// Appends `record`, which the caller guarantees sorts after every
    /// record already in the index. Returns `Ok(false)` on a duplicate key
    /// (only possible when the index is declared unique).
    pub fn push_record(&mut self, record: R, clock: u64) -> storage::Result<bool> {
        let page_key = self.last_page_key();
        let page = self.pages.get_mut(&page_key).unwrap();
        let action = match page.push(record, self.unique, clock)? {
            Some(a) => a,
            None => return Ok(false),
        };
        self.apply_action(page_key, action, clock)?;
        Ok(true)
    }

    fn apply_action(&mut self, page_key: R::Key, action: Action, clock: u64) -> storage::Result<()> {
        if action.contains(Action::SPLIT) {
            let new_id = self.next_page_id;
            self.next_page_id += 1;
            let page = self.pages.get_mut(&page_key).unwrap();
            let new_page = page.split(new_id, clock)?;
            let new_min = new_page.min().expect("freshly split page is never empty");
            self.pages.insert(new_min, new_page);
        } else if action.contains(Action::REMAP) {
            let page = self.pages.get(&page_key).unwrap();
            if let Some(new_min) = page.min() {
                if new_min != page_key && page_key != self.first_page_key() {
                    let page = self.pages.remove(&page_key).unwrap();
                    self.pages.insert(new_min, page);
                }
            }
        }
        Ok(())
    }

    pub fn get_record(&mut self, key: R::Key, clock: u64) -> storage::Result<Option<R>> {
        let page_key = self.find_page_key(key);
        self.pages.get_mut(&page_key).unwrap().get(key, clock)
    }

    /// Overwrites the record keyed `record.key()` in place, leaving page
    /// and chunk membership untouched (spec §4.3, `DataRecord`
    /// `erase`/`update`). Returns `false` if no record with that key
    /// exists.
    pub fn replace_record(&mut self, record: R, clock: u64) -> storage::Result<bool> {
        let page_key = self.find_page_key(record.key());
        self.pages.get_mut(&page_key).unwrap().replace(record, clock)
    }

    /// Visits every record in ascending key order.
    pub fn traverse(&mut self, clock: u64, f: &mut impl FnMut(R)) -> storage::Result<()> {
        for page in self.pages.values_mut() {
            page.traverse(clock, f)?;
        }
        Ok(())
    }

    /// Bidirectional range walk starting at `start` across the whole index
    /// (spec §4.2, §4.5). `f` returns positive/negative/zero exactly as
    /// [`crate::Chunk::query`].
    pub fn query(&mut self, start: R::Key, clock: u64, f: &mut impl FnMut(R) -> i32) -> storage::Result<i32> {
        if self.pages.is_empty() {
            return Ok(0);
        }
        let mut cursor_key = self.find_page_key(start);
        loop {
            let sign = self.pages.get_mut(&cursor_key).unwrap().query(start, clock, f)?;
            if sign > 0 {
                match self
                    .pages
                    .range((std::ops::Bound::Excluded(cursor_key), std::ops::Bound::Unbounded))
                    .next()
                {
                    Some((k, _)) => cursor_key = *k,
                    None => return Ok(sign),
                }
            } else if sign < 0 {
                match self.pages.range(..cursor_key).next_back() {
                    Some((k, _)) => cursor_key = *k,
                    None => return Ok(sign),
                }
            } else {
                return Ok(0);
            }
        }
    }

    pub fn memory_usage(&self) -> usize {
        self.pages.values().map(|p| p.memory_usage()).sum()
    }

    /// Builds the `(tick, page_key)` list an owning database uses to evict
    /// the least-recently-used page first (spec §4.7).
    pub fn collect_ticks(&self, out: &mut Vec<(u64, R::Key)>) {
        out.extend(self.pages.iter().map(|(k, p)| (p.tick(), *k)));
    }

    pub fn evict_page(&mut self, key: R::Key) -> storage::Result<()> {
        if let Some(page) = self.pages.get_mut(&key) {
            page.evict(&self.dir)?;
        }
        Ok(())
    }

    /// Discards the current page map and reinstalls a single empty page
    /// keyed at `R::Key::MIN`, exactly as [`Index::create`] does for a
    /// brand-new index directory. Compaction uses this to rebuild an
    /// index from scratch in place: the caller then re-populates it with
    /// [`Index::push_record`] in ascending key order and saves with
    /// `manual = true` (spec §4.6).
    pub fn reset(&mut self) {
        let mut pages = BTreeMap::new();
        pages.insert(R::Key::MIN, Page::new_empty(&self.dir, 0));
        self.pages = pages;
        self.next_page_id = 1;
    }

    /// Replaces the entire page map with `pages` — used by compaction,
    /// which rebuilds an index from scratch into a fresh directory (spec
    /// §4.6).
    pub fn replace_pages(&mut self, pages: BTreeMap<R::Key, Page<R>>, next_page_id: u32) {
        self.pages = pages;
        self.next_page_id = next_page_id;
    }

    pub fn save_meta(&self) -> storage::Result<()> {
        let meta = IndexMetaFile {
            next_page_id: self.next_page_id,
            unique: self.unique,
            auto_erase: self.auto_erase,
            pages: self.pages.iter().map(|(k, p)| (p.id(), *k)).collect(),
        };
        let bytes = serde_yaml::to_string(&meta).expect("index meta always serializes");
        storage::save_file(&self.dir, "meta.yaml", bytes.as_bytes(), false)
    }

    /// Saves every page. `manual` selects the no-backup path used right
    /// after compaction rebuilds every page from scratch (spec §4.6/§6).
    pub fn save(&mut self, manual: bool) -> storage::Result<()> {
        for page in self.pages.values_mut() {
            page.save(&self.dir, manual)?;
        }
        Ok(())
    }

    /// Restores every file under `old/` over its current sibling, then
    /// deletes any file the now-restored meta no longer references (spec
    /// §6, "Rollback").
    ///
    /// Restoring *before* reading `meta.yaml` matters: `meta.yaml` itself
    /// has a backup under `old/`, so the live page set must be computed
    /// from the post-restore meta (the state being rolled back to), not
    /// the pre-restore one (the state being rolled back away from).
    pub fn rollback(&mut self, db_root: &Path) -> storage::Result<()> {
        let restored = storage::restore_backups(&self.dir)?;

        let bytes = std::fs::read(Self::meta_path(&self.dir))
            .map_err(|e| storage::StorageError::io(Self::meta_path(&self.dir), e))?;
        let meta: IndexMetaFile<R::Key> = serde_yaml::from_slice(&bytes)
            .map_err(|e| storage::StorageError::io(Self::meta_path(&self.dir), std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;
        let mut live: HashSet<String> = meta.pages.iter().map(|(id, _)| id.to_string()).collect();
        live.insert("meta.yaml".to_string());
        storage::prune_extraneous(&self.dir, &live, &restored, db_root)?;

        let mut pages = BTreeMap::new();
        for (id, min_key) in meta.pages {
            pages.insert(min_key, Page::new_unloaded(&self.dir, id));
        }
        self.pages = pages;
        self.next_page_id = meta.next_page_id;
        self.unique = meta.unique;
        self.auto_erase = meta.auto_erase;
        Ok(())
    }

    /// Deletes every backup file under `old/` (spec §6, "Clean").
    pub fn clean(&self) -> storage::Result<()> {
        storage::clean_dir(&self.dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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
    fn insert_and_get_across_splits() {
        let dir = tempfile::tempdir().unwrap();
        let mut index: Index<IntRecord> = Index::create(dir.path(), true, false).unwrap();
        for v in 0u64..4000 {
            assert!(index.insert_record(IntRecord(v, v), v).unwrap());
        }
        for v in 0u64..4000 {
            assert_eq!(index.get_record(v, v).unwrap().unwrap(), IntRecord(v, v));
        }
    }

    #[test]
    fn unique_insert_rejects_duplicate_value() {
        let dir = tempfile::tempdir().unwrap();
        let mut index: Index<IntRecord> = Index::create(dir.path(), true, false).unwrap();
        assert!(index.insert_record(IntRecord(5, 1), 0).unwrap());
        assert!(!index.insert_record(IntRecord(5, 2), 0).unwrap());
    }

    #[test]
    fn query_walks_in_ascending_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut index: Index<IntRecord> = Index::create(dir.path(), true, false).unwrap();
        for v in [7u64, 3, 5] {
            index.insert_record(IntRecord(v, v), 0).unwrap();
        }
        let mut seen = Vec::new();
        index
            .query(0, 0, &mut |r| {
                seen.push(r.key());
                1
            })
            .unwrap();
        assert_eq!(seen, vec![3, 5, 7]);
    }

    #[test]
    fn replace_record_overwrites_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let mut index: Index<IntRecord> = Index::create(dir.path(), true, false).unwrap();
        index.insert_record(IntRecord(5, 1), 0).unwrap();
        assert!(index.replace_record(IntRecord(5, 2), 0).unwrap());
        assert_eq!(index.get_record(5, 0).unwrap(), Some(IntRecord(5, 2)));
        assert!(!index.replace_record(IntRecord(6, 9), 0).unwrap());
    }

    #[test]
    fn save_rollback_restores_prior_image() {
        let db_root = tempfile::tempdir().unwrap();
        let dir = db_root.path().join("u.index");
        let mut index: Index<IntRecord> = Index::create(&dir, true, false).unwrap();
        index.insert_record(IntRecord(1, 1), 0).unwrap();
        index.save(false).unwrap();
        index.save_meta().unwrap();

        index.insert_record(IntRecord(2, 2), 0).unwrap();
        index.save(false).unwrap();
        index.save_meta().unwrap();

        index.rollback(db_root.path()).unwrap();
        assert_eq!(index.get_record(1, 0).unwrap(), Some(IntRecord(1, 1)));
        assert_eq!(index.get_record(2, 0).unwrap(), None);
    }
}
