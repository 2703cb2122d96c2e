//! A paged, chunked sorted-record index template (spec §4.1/§4.2).
//!
//! This crate owns exactly one data structure — an ordered map from
//! page-minimum-key to [`Page`], where each page is itself a bounded map
//! from chunk-minimum-key to [`Chunk`] — and the operations that keep it
//! balanced under insertion (chunk split, page split) and durable (via
//! the `storage` crate's save/rollback protocol). It has no notion of
//! "row", "table" or "database": those concepts, along with what a
//! record's key or payload *means*, belong to the `kenchidb` crate, which
//! instantiates this template once for the row directory (`DataIndex`,
//! keyed by `RowId`) and once per declared secondary index.

mod chunk;
mod index;
mod page;
mod record;

pub use chunk::{Action, Chunk, MAX_CHUNK_SIZE, SPLIT_CHUNK_SIZE};
pub use index::Index;
pub use page::{Page, MAX_CHUNKS};
pub use record::{Bounded, Record, TotalF32, TotalF64};
