//! LZMA codec
//!
//! Stored as a standard LZMA stream (properties header followed by the
//! 64-bit uncompressed size), which is what `lzma-rs` reads and writes.

use crate::{Error, Result};

pub(super) fn compress(data: &[u8]) -> Result<Vec<u8>> {
    let mut output = Vec::new();
    lzma_rs::lzma_compress(&mut std::io::Cursor::new(data), &mut output)
        .map_err(|e| Error::compression(format!("lzma compression failed: {}", e)))?;
    Ok(output)
}

pub(super) fn decompress(data: &[u8], expected_size: usize) -> Result<Vec<u8>> {
    let mut output = Vec::with_capacity(expected_size);
    lzma_rs::lzma_decompress(&mut std::io::Cursor::new(data), &mut output)
        .map_err(|e| Error::compression(format!("lzma decompression failed: {:?}", e)))?;
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let data = b"abcdefgh".repeat(512);
        let packed = compress(&data).unwrap();
        assert!(packed.len() < data.len());
        assert_eq!(decompress(&packed, data.len()).unwrap(), data);
    }
}
