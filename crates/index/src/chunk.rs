//! A chunk: a sorted, in-memory array of records (spec §4.1).

use crate::record::Record;

/// Maximum records a chunk may hold before the owning page must split it.
pub const MAX_CHUNK_SIZE: usize = 32_768;

/// A chunk is split as soon as it would otherwise reach this size. Kept
/// below `MAX_CHUNK_SIZE` so a chunk never grows past the hard ceiling even
/// under the split-then-insert-one-more-record race the original recorded
/// (spec §4.1, invariant P1: "|C| ≤ SPLIT_CHUNK_SIZE immediately after any
/// insert or push").
pub const SPLIT_CHUNK_SIZE: usize = MAX_CHUNK_SIZE - 2;

/// What the owning [`crate::Page`] must do after a chunk mutation.
///
/// A small hand-rolled bitset rather than a crate dependency — three flags
/// that are only ever combined with `|` and tested with `contains`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Action(u8);

impl Action {
    /// The chunk's minimum key changed; the page's chunk map must re-key
    /// this chunk's entry.
    pub const REMAP: Action = Action(0b001);
    /// The chunk reached `SPLIT_CHUNK_SIZE` and must be split in two.
    pub const SPLIT: Action = Action(0b010);
    /// The record was appended at the end rather than inserted in the
    /// middle.
    pub const APPEND: Action = Action(0b100);

    pub fn empty() -> Self {
        Action(0)
    }

    pub fn contains(self, other: Action) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for Action {
    type Output = Action;
    fn bitor(self, rhs: Action) -> Action {
        Action(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for Action {
    fn bitor_assign(&mut self, rhs: Action) {
        self.0 |= rhs.0;
    }
}

/// A sorted array of records (spec §4.1).
#[derive(Debug, Clone)]
pub struct Chunk<R: Record> {
    records: Vec<R>,
}

impl<R: Record> Chunk<R> {
    pub fn new() -> Self {
        Chunk { records: Vec::new() }
    }

    pub fn from_records(records: Vec<R>) -> Self {
        debug_assert!(records.windows(2).all(|w| w[0].key() <= w[1].key()));
        Chunk { records }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[R] {
        &self.records
    }

    /// Smallest key in the chunk. Panics on an empty chunk — a chunk is
    /// never empty except transiently during a split, and callers never
    /// call `min` in that window.
    pub fn min(&self) -> R::Key {
        self.records
            .first()
            .expect("min() called on an empty chunk")
            .key()
    }

    /// Index of the first record whose key is strictly greater than `key`
    /// (an upper bound, matching spec §4.1's "binary search" wording).
    fn upper_bound(&self, key: R::Key) -> usize {
        self.records.partition_point(|r| r.key() <= key)
    }

    pub fn get(&self, key: R::Key) -> Option<&R> {
        let idx = self.upper_bound(key);
        if idx > 0 && self.records[idx - 1].key() == key {
            Some(&self.records[idx - 1])
        } else {
            None
        }
    }

    /// Inserts `record` in sorted position.
    ///
    /// `unique` is the owning index's declared uniqueness: when true, a
    /// colliding key is rejected (`None`) rather than inserted; when
    /// false, records with equal keys are allowed and simply land next to
    /// each other (spec §4.1: "If `unique` and the existing record at the
    /// insertion slot already equals the key, insert fails"). Otherwise
    /// returns the [`Action`] the owning page must perform.
    ///
    /// The duplicate check looks at `records[idx - 1]`, the record
    /// immediately before the insertion point produced by an upper-bound
    /// search — the only position a tie can occur, since `idx` is defined
    /// as the first index whose key is *strictly greater* than the new
    /// key. Indexing `records[idx]` instead (as a naive port of the
    /// upstream C implementation would) reads one past the end whenever
    /// the new key is the largest in the chunk.
    pub fn insert(&mut self, record: R, unique: bool) -> Option<Action> {
        let idx = self.upper_bound(record.key());
        if unique && idx > 0 && self.records[idx - 1].key() == record.key() {
            return None;
        }

        let mut action = Action::empty();
        if idx == self.records.len() {
            action |= Action::APPEND;
        }
        if idx == 0 {
            action |= Action::REMAP;
        }
        self.records.insert(idx, record);
        if self.records.len() >= SPLIT_CHUNK_SIZE {
            action |= Action::SPLIT;
        }
        Some(action)
    }

    /// Appends `record`, which the caller guarantees sorts after every
    /// existing record in this chunk.
    ///
    /// Returns `None` if `unique` is set and `record.key()` collides with
    /// the current last record.
    pub fn push(&mut self, record: R, unique: bool) -> Option<Action> {
        if unique {
            if let Some(last) = self.records.last() {
                if last.key() == record.key() {
                    return None;
                }
            }
        }

        let mut action = Action::APPEND;
        if self.records.is_empty() {
            action |= Action::REMAP;
        }
        self.records.push(record);
        if self.records.len() >= SPLIT_CHUNK_SIZE {
            action |= Action::SPLIT;
        }
        Some(action)
    }

    /// Overwrites the record whose key equals `record.key()` in place,
    /// preserving sort order since the key itself is unchanged. Used by
    /// the row directory to mark an entry erased or remapped without
    /// disturbing its position (spec §4.3: `erase`/`update` act "in
    /// place"). Returns `false` if no record with that key exists.
    pub fn replace(&mut self, record: R) -> bool {
        let idx = self.upper_bound(record.key());
        if idx > 0 && self.records[idx - 1].key() == record.key() {
            self.records[idx - 1] = record;
            true
        } else {
            false
        }
    }

    /// Splits this chunk in half, keeping the lower half here and
    /// returning the upper half as a new chunk (spec §4.1).
    pub fn split(&mut self) -> Chunk<R> {
        let mid = self.records.len() / 2;
        let upper = self.records.split_off(mid);
        Chunk { records: upper }
    }

    /// Walks records starting at `start`, calling `f(record)` for each.
    ///
    /// `f` returns a signed direction: positive to continue towards
    /// larger keys, negative to continue towards smaller keys, zero to
    /// stop. The walk returns whatever sign `f` last returned, so the
    /// owning [`crate::Page`] knows whether to keep walking into a
    /// neighboring chunk.
    pub fn query(&self, start: R::Key, f: &mut impl FnMut(R) -> i32) -> i32 {
        if self.records.is_empty() {
            return 0;
        }

        let ub = self.upper_bound(start);
        let mut idx = if ub == 0 { 0 } else { ub - 1 };

        loop {
            let sign = f(self.records[idx]);
            if sign > 0 {
                if idx + 1 >= self.records.len() {
                    return sign;
                }
                idx += 1;
            } else if sign < 0 {
                if idx == 0 {
                    return sign;
                }
                idx -= 1;
            } else {
                return 0;
            }
        }
    }

    pub fn encoded_len(&self) -> usize {
        4 + self.records.len() * R::ENCODED_LEN
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&(self.records.len() as u32).to_le_bytes());
        let mut buf = vec![0u8; R::ENCODED_LEN];
        for record in &self.records {
            record.encode(&mut buf);
            out.extend_from_slice(&buf);
        }
    }

    pub fn decode(bytes: &[u8]) -> (Self, usize) {
        let count = u32::from_le_bytes(bytes[0..4].try_into().unwrap()) as usize;
        let mut offset = 4;
        let mut records = Vec::with_capacity(count);
        for _ in 0..count {
            let record = R::decode(&bytes[offset..offset + R::ENCODED_LEN]);
            records.push(record);
            offset += R::ENCODED_LEN;
        }
        (Chunk { records }, offset)
    }
}

impl<R: Record> Default for Chunk<R> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct IntRecord(u64);

    impl Record for IntRecord {
        type Key = u64;
        const ENCODED_LEN: usize = 8;

        fn key(&self) -> u64 {
            self.0
        }

        fn encode(&self, out: &mut [u8]) {
            out.copy_from_slice(&self.0.to_le_bytes());
        }

        fn decode(bytes: &[u8]) -> Self {
            IntRecord(u64::from_le_bytes(bytes.try_into().unwrap()))
        }
    }

    #[test]
    fn insert_keeps_sorted_order() {
        let mut chunk = Chunk::new();
        for v in [5u64, 1, 3, 2, 4] {
            chunk.insert(IntRecord(v), true).unwrap();
        }
        let keys: Vec<u64> = chunk.records().iter().map(|r| r.key()).collect();
        assert_eq!(keys, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn insert_rejects_duplicate_including_largest_key() {
        let mut chunk = Chunk::new();
        chunk.insert(IntRecord(1), true).unwrap();
        chunk.insert(IntRecord(10), true).unwrap();
        // Duplicate of the current maximum exercises the idx == len() path.
        assert!(chunk.insert(IntRecord(10), true).is_none());
        assert_eq!(chunk.len(), 2);
    }

    #[test]
    fn push_rejects_duplicate_of_last() {
        let mut chunk = Chunk::new();
        chunk.push(IntRecord(1), true).unwrap();
        chunk.push(IntRecord(2), true).unwrap();
        assert!(chunk.push(IntRecord(2), true).is_none());
    }

    #[test]
    fn non_unique_chunk_allows_duplicate_keys() {
        let mut chunk = Chunk::new();
        chunk.insert(IntRecord(1), false).unwrap();
        chunk.insert(IntRecord(1), false).unwrap();
        chunk.push(IntRecord(1), false).unwrap();
        assert_eq!(chunk.len(), 3);
    }

    #[test]
    fn replace_overwrites_payload_without_moving_key() {
        let mut chunk = Chunk::new();
        for v in [1u64, 2, 3] {
            chunk.insert(IntRecord(v), true).unwrap();
        }
        assert!(chunk.replace(IntRecord(2)));
        assert_eq!(chunk.len(), 3);
        assert!(!chunk.replace(IntRecord(99)));
    }

    #[test]
    fn split_moves_upper_half_out() {
        let mut chunk = Chunk::new();
        for v in 0u64..10 {
            chunk.insert(IntRecord(v), true).unwrap();
        }
        let upper = chunk.split();
        assert_eq!(chunk.len(), 5);
        assert_eq!(upper.len(), 5);
        assert_eq!(chunk.min(), 0);
        assert_eq!(upper.min(), 5);
    }

    #[test]
    fn query_walks_forward_and_stops_at_end() {
        let mut chunk = Chunk::new();
        for v in 0u64..5 {
            chunk.insert(IntRecord(v), true).unwrap();
        }
        let mut seen = Vec::new();
        let sign = chunk.query(0, &mut |r| {
            seen.push(r.key());
            if r.key() < 4 {
                1
            } else {
                0
            }
        });
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
        assert_eq!(sign, 0);
    }

    #[test]
    fn encode_decode_round_trips() {
        let mut chunk = Chunk::new();
        for v in [1u64, 2, 3] {
            chunk.insert(IntRecord(v), true).unwrap();
        }
        let mut bytes = Vec::new();
        chunk.encode(&mut bytes);
        let (decoded, consumed) = Chunk::<IntRecord>::decode(&bytes);
        assert_eq!(consumed, bytes.len());
        assert_eq!(decoded.records(), chunk.records());
    }
}
