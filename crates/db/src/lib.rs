//! KenchiDB: an embedded, on-disk document store (spec §1–§2).
//!
//! A [`Database`] owns a directory tree, a set of named [`Table`]s, and the
//! global `RowId` counter. Each table owns a row directory, an append-only
//! data store, and zero or more declared secondary indexes, all built from
//! the single paged, chunked sorted-record template in the `index` crate.
//! Durability (save/rollback/clean) is layered on top of the `storage`
//! crate's atomic file protocol. There is no wire protocol and no query
//! language: everything here is reached in-process through `Database`'s
//! methods.

mod compress;
mod data;
mod database;
mod error;
mod record;
mod table;
mod value;

pub use data::{MAX_DATA_SIZE, MIN_COMPRESS_SIZE};
pub use database::{Database, DEFAULT_MEMORY_LIMIT};
pub use error::{Error, Result};
pub use record::IndexKind;
pub use value::{hash, pack, unpack, Row, RowId, Value, COMPRESS_FLAG};
