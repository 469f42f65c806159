//! bzip2 codec

use crate::{Error, Result};
use bzip2::read::BzDecoder;
use bzip2::write::BzEncoder;
use bzip2::Compression;
use std::io::{Read, Write};

pub(super) fn compress(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = BzEncoder::new(Vec::new(), Compression::best());
    encoder.write_all(data)?;
    encoder
        .finish()
        .map_err(|e| Error::compression(format!("bzip2 compression failed: {}", e)))
}

pub(super) fn decompress(data: &[u8], expected_size: usize) -> Result<Vec<u8>> {
    let mut decoder = BzDecoder::new(data);
    let mut output = Vec::with_capacity(expected_size);
    decoder
        .read_to_end(&mut output)
        .map_err(|e| Error::compression(format!("bzip2 decompression failed: {}", e)))?;
    Ok(output)
}
