//! DEFLATE compression for payloads at or above `MIN_COMPRESS_SIZE` (spec
//! §4.4, §10.1). A real crate dependency, not a hand-rolled codec.

use std::io::{Read, Write};

use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;

use crate::error::{Error, Result};

pub fn deflate(bytes: &[u8]) -> Vec<u8> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(bytes)
        .expect("compressing an in-memory buffer cannot fail");
    encoder
        .finish()
        .expect("compressing an in-memory buffer cannot fail")
}

pub fn inflate(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = DeflateDecoder::new(bytes);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| Error::corruption(format!("failed to inflate payload: {e}")))?;
    Ok(out)
}
