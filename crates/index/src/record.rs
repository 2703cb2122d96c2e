//! The record/key abstraction every [`crate::Chunk`]/[`crate::Page`]/
//! [`crate::Index`] is generic over.
//!
//! The index crate has no notion of "row id" or "table" — it only knows how
//! to keep fixed-width, `Copy` records sorted by a comparable key, and how
//! to turn them into bytes for a page file. What a record's key or payload
//! *means* is entirely up to the caller (`kenchidb`).

/// A type with a well-defined minimum value, so an index can always
/// allocate a first page keyed at the bottom of the key space (spec §4.2:
/// "The first page is allocated at index creation with the minimum of type
/// `V` as its key").
pub trait Bounded: Ord + Copy {
    const MIN: Self;
}

macro_rules! impl_bounded_int {
    ($($t:ty),*) => {
        $(impl Bounded for $t {
            const MIN: Self = <$t>::MIN;
        })*
    };
}

impl_bounded_int!(i32, u32, i64, u64);

/// `f32`/`f64` aren't `Ord`; indexes over them compare via a total-order
/// wrapper so the page/chunk machinery (which requires `Ord`) still works.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct TotalF64(pub f64);

impl Eq for TotalF64 {}

impl PartialOrd for TotalF64 {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TotalF64 {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.total_cmp(&other.0)
    }
}

impl Bounded for TotalF64 {
    const MIN: Self = TotalF64(f64::NEG_INFINITY);
}

/// Single-precision counterpart of [`TotalF64`], for indexes declared over
/// the narrower `Float` type code (spec §6) rather than `Double`.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct TotalF32(pub f32);

impl Eq for TotalF32 {}

impl PartialOrd for TotalF32 {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TotalF32 {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.total_cmp(&other.0)
    }
}

impl Bounded for TotalF32 {
    const MIN: Self = TotalF32(f32::NEG_INFINITY);
}

/// A fixed-width record stored in a [`crate::Chunk`], sorted by `key()`.
///
/// Records are `Copy` and encode to a fixed number of bytes so a page file
/// can be read back as `numChunks` followed by, for each chunk, a record
/// count and `count * ENCODED_LEN` bytes (spec §6, "Page file format").
pub trait Record: Copy {
    type Key: Bounded;

    const ENCODED_LEN: usize;

    fn key(&self) -> Self::Key;

    fn encode(&self, out: &mut [u8]);

    fn decode(bytes: &[u8]) -> Self;
}
