//! The dynamic value type rows are made of, and its pack/unpack binary
//! encoding (spec §10.1). The storage core treats this as an external
//! collaborator; this module gives it a concrete body.

use std::collections::BTreeMap;

use crate::error::{Error, Result};

/// A row identifier, reused as a `Value` variant so a field can hold a
/// reference to another row (the basis of the `Row`-kind secondary index
/// and `Table::join`, spec §4.5).
pub type RowId = u64;

/// A document: an ordered set of named fields (spec §3, "Row").
pub type Row = BTreeMap<String, Value>;

/// The closed set of types a row field, and therefore a declared index, can
/// hold (spec §10.1).
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    UInt64(u64),
    Float(f32),
    Double(f64),
    Bool(bool),
    String(String),
    Bytes(Vec<u8>),
    RowId(RowId),
}

const TAG_INT32: u8 = 1;
const TAG_UINT32: u8 = 2;
const TAG_INT64: u8 = 3;
const TAG_UINT64: u8 = 4;
const TAG_FLOAT: u8 = 5;
const TAG_DOUBLE: u8 = 6;
const TAG_BOOL: u8 = 7;
const TAG_STRING: u8 = 8;
const TAG_BYTES: u8 = 9;
const TAG_ROW_ID: u8 = 10;

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Int32(_) => "int32",
            Value::UInt32(_) => "uint32",
            Value::Int64(_) => "int64",
            Value::UInt64(_) => "uint64",
            Value::Float(_) => "float",
            Value::Double(_) => "double",
            Value::Bool(_) => "bool",
            Value::String(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::RowId(_) => "row_id",
        }
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            Value::Int32(v) => {
                out.push(TAG_INT32);
                out.extend_from_slice(&v.to_le_bytes());
            }
            Value::UInt32(v) => {
                out.push(TAG_UINT32);
                out.extend_from_slice(&v.to_le_bytes());
            }
            Value::Int64(v) => {
                out.push(TAG_INT64);
                out.extend_from_slice(&v.to_le_bytes());
            }
            Value::UInt64(v) => {
                out.push(TAG_UINT64);
                out.extend_from_slice(&v.to_le_bytes());
            }
            Value::Float(v) => {
                out.push(TAG_FLOAT);
                out.extend_from_slice(&v.to_le_bytes());
            }
            Value::Double(v) => {
                out.push(TAG_DOUBLE);
                out.extend_from_slice(&v.to_le_bytes());
            }
            Value::Bool(v) => {
                out.push(TAG_BOOL);
                out.push(if *v { 1 } else { 0 });
            }
            Value::String(v) => {
                out.push(TAG_STRING);
                out.extend_from_slice(&(v.len() as u32).to_le_bytes());
                out.extend_from_slice(v.as_bytes());
            }
            Value::Bytes(v) => {
                out.push(TAG_BYTES);
                out.extend_from_slice(&(v.len() as u32).to_le_bytes());
                out.extend_from_slice(v);
            }
            Value::RowId(v) => {
                out.push(TAG_ROW_ID);
                out.extend_from_slice(&v.to_le_bytes());
            }
        }
    }

    /// Decodes one value starting at `bytes[0]`, returning the value and
    /// the number of bytes consumed.
    fn decode(bytes: &[u8]) -> Result<(Value, usize)> {
        let corrupt = |d: &str| Error::corruption(d);
        let tag = *bytes.first().ok_or_else(|| corrupt("empty value"))?;
        let body = &bytes[1..];
        match tag {
            TAG_INT32 => {
                let v = i32::from_le_bytes(
                    body.get(0..4)
                        .ok_or_else(|| corrupt("truncated int32"))?
                        .try_into()
                        .unwrap(),
                );
                Ok((Value::Int32(v), 5))
            }
            TAG_UINT32 => {
                let v = u32::from_le_bytes(
                    body.get(0..4)
                        .ok_or_else(|| corrupt("truncated uint32"))?
                        .try_into()
                        .unwrap(),
                );
                Ok((Value::UInt32(v), 5))
            }
            TAG_INT64 => {
                let v = i64::from_le_bytes(
                    body.get(0..8)
                        .ok_or_else(|| corrupt("truncated int64"))?
                        .try_into()
                        .unwrap(),
                );
                Ok((Value::Int64(v), 9))
            }
            TAG_UINT64 => {
                let v = u64::from_le_bytes(
                    body.get(0..8)
                        .ok_or_else(|| corrupt("truncated uint64"))?
                        .try_into()
                        .unwrap(),
                );
                Ok((Value::UInt64(v), 9))
            }
            TAG_FLOAT => {
                let v = f32::from_le_bytes(
                    body.get(0..4)
                        .ok_or_else(|| corrupt("truncated float"))?
                        .try_into()
                        .unwrap(),
                );
                Ok((Value::Float(v), 5))
            }
            TAG_DOUBLE => {
                let v = f64::from_le_bytes(
                    body.get(0..8)
                        .ok_or_else(|| corrupt("truncated double"))?
                        .try_into()
                        .unwrap(),
                );
                Ok((Value::Double(v), 9))
            }
            TAG_BOOL => {
                let v = *body.first().ok_or_else(|| corrupt("truncated bool"))?;
                Ok((Value::Bool(v != 0), 2))
            }
            TAG_STRING => {
                let len = u32::from_le_bytes(
                    body.get(0..4)
                        .ok_or_else(|| corrupt("truncated string length"))?
                        .try_into()
                        .unwrap(),
                ) as usize;
                let bytes = body
                    .get(4..4 + len)
                    .ok_or_else(|| corrupt("truncated string data"))?;
                let s = String::from_utf8(bytes.to_vec())
                    .map_err(|_| corrupt("invalid utf-8 in string value"))?;
                Ok((Value::String(s), 5 + len))
            }
            TAG_BYTES => {
                let len = u32::from_le_bytes(
                    body.get(0..4)
                        .ok_or_else(|| corrupt("truncated bytes length"))?
                        .try_into()
                        .unwrap(),
                ) as usize;
                let bytes = body
                    .get(4..4 + len)
                    .ok_or_else(|| corrupt("truncated bytes data"))?;
                Ok((Value::Bytes(bytes.to_vec()), 5 + len))
            }
            TAG_ROW_ID => {
                let v = u64::from_le_bytes(
                    body.get(0..8)
                        .ok_or_else(|| corrupt("truncated row id"))?
                        .try_into()
                        .unwrap(),
                );
                Ok((Value::RowId(v), 9))
            }
            other => Err(corrupt(&format!("unknown value tag {other}"))),
        }
    }
}

/// Encodes a row as `count:u32` followed by, for each field, a `u16`
/// key length, the key's UTF-8 bytes, and the tagged value encoding.
fn encode_row(row: &Row) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&(row.len() as u32).to_le_bytes());
    for (key, value) in row {
        out.extend_from_slice(&(key.len() as u16).to_le_bytes());
        out.extend_from_slice(key.as_bytes());
        value.encode_into(&mut out);
    }
    out
}

fn decode_row(bytes: &[u8]) -> Result<Row> {
    let corrupt = |d: &str| Error::corruption(d);
    let count = u32::from_le_bytes(
        bytes
            .get(0..4)
            .ok_or_else(|| corrupt("truncated row field count"))?
            .try_into()
            .unwrap(),
    ) as usize;
    let mut offset = 4;
    let mut row = Row::new();
    for _ in 0..count {
        let key_len = u16::from_le_bytes(
            bytes
                .get(offset..offset + 2)
                .ok_or_else(|| corrupt("truncated field key length"))?
                .try_into()
                .unwrap(),
        ) as usize;
        offset += 2;
        let key = String::from_utf8(
            bytes
                .get(offset..offset + key_len)
                .ok_or_else(|| corrupt("truncated field key"))?
                .to_vec(),
        )
        .map_err(|_| corrupt("invalid utf-8 in field key"))?;
        offset += key_len;
        let (value, consumed) = Value::decode(&bytes[offset..])?;
        offset += consumed;
        row.insert(key, value);
    }
    Ok(row)
}

/// Set on the data-block record header's `flags` word when the payload was
/// DEFLATE-compressed before being written (spec §4.4, §10.1).
pub const COMPRESS_FLAG: u32 = 0x1;

/// Packs `row` to its on-disk byte representation, compressing it when its
/// encoded size is at or above `compress_hint` (spec §4.4, §4.5: the table
/// calls this with `MIN_COMPRESS_SIZE`).
pub fn pack(row: &Row, compress_hint: usize) -> (Vec<u8>, u32) {
    let encoded = encode_row(row);
    if encoded.len() >= compress_hint {
        (crate::compress::deflate(&encoded), COMPRESS_FLAG)
    } else {
        (encoded, 0)
    }
}

/// Inverse of [`pack`].
pub fn unpack(bytes: &[u8], flags: u32) -> Result<Row> {
    if flags & COMPRESS_FLAG != 0 {
        let raw = crate::compress::inflate(bytes)?;
        decode_row(&raw)
    } else {
        decode_row(bytes)
    }
}

/// FNV-1a, a small stable non-cryptographic hash, applied to a value's
/// canonical byte encoding (spec §10.1: "used by `Hash`-kind indexes").
/// `std::hash::Hasher`'s default `RandomState` seed is unsuitable here —
/// the hash must be identical across process runs since it's a persisted
/// index key.
pub fn hash(value: &Value) -> u64 {
    const FNV_OFFSET_BASIS: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;

    let mut bytes = Vec::new();
    value.encode_into(&mut bytes);

    let mut h = FNV_OFFSET_BASIS;
    for byte in bytes {
        h ^= byte as u64;
        h = h.wrapping_mul(FNV_PRIME);
    }
    h
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_unpack_round_trips_uncompressed() {
        let mut row = Row::new();
        row.insert("id".to_string(), Value::RowId(7));
        row.insert("name".to_string(), Value::String("hi".to_string()));
        let (bytes, flags) = pack(&row, 1000);
        assert_eq!(flags, 0);
        assert_eq!(unpack(&bytes, flags).unwrap(), row);
    }

    #[test]
    fn pack_compresses_large_payloads() {
        let mut row = Row::new();
        row.insert("blob".to_string(), Value::Bytes(vec![7u8; 4096]));
        let (bytes, flags) = pack(&row, 1000);
        assert_eq!(flags, COMPRESS_FLAG);
        assert!(bytes.len() < 4096);
        assert_eq!(unpack(&bytes, flags).unwrap(), row);
    }

    #[test]
    fn hash_is_stable_and_order_sensitive() {
        let a = Value::String("abc".to_string());
        let b = Value::String("abc".to_string());
        assert_eq!(hash(&a), hash(&b));
        let c = Value::String("abd".to_string());
        assert_ne!(hash(&a), hash(&c));
    }
}
