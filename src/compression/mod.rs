//! Compression dispatcher and codec chain handling
//!
//! Stored sectors carry a method byte whose bits select the codecs that
//! were applied. Compression applies codecs in a fixed order and
//! decompression undoes them in the reverse order; a codec that fails to
//! shrink the data is dropped from the chain.

mod adpcm;
mod bzip2;
mod huffman;
mod lzma;
mod pkware;
mod sparse;
mod wave;
mod zlib;

pub use pkware::explode;
pub use wave::is_wave_candidate;

use crate::{Error, Result};

/// Compression method flags, combinable into a chain
pub mod methods {
    /// Huffman encoding (used together with ADPCM for WAVE data)
    pub const HUFFMAN: u8 = 0x01;
    /// zlib (deflate)
    pub const ZLIB: u8 = 0x02;
    /// PKWARE Data Compression Library
    pub const PKWARE: u8 = 0x08;
    /// bzip2
    pub const BZIP2: u8 = 0x10;
    /// Sparse (run-length of zero bytes)
    pub const SPARSE: u8 = 0x20;
    /// IMA ADPCM, one channel
    pub const ADPCM_MONO: u8 = 0x40;
    /// IMA ADPCM, two channels
    pub const ADPCM_STEREO: u8 = 0x80;
    /// LZMA; a standalone method value, not a combinable bit
    pub const LZMA: u8 = 0x12;

    /// The lossy methods, only valid for WAVE payloads
    pub const LOSSY: u8 = ADPCM_MONO | ADPCM_STEREO | HUFFMAN;
}

/// Decompression order; compression applies the reverse
const DECOMPRESS_ORDER: &[u8] = &[
    methods::BZIP2,
    methods::PKWARE,
    methods::ZLIB,
    methods::SPARSE,
    methods::HUFFMAN,
    methods::ADPCM_STEREO,
    methods::ADPCM_MONO,
];

fn apply_one_decompress(method: u8, data: &[u8], expected_size: usize) -> Result<Vec<u8>> {
    match method {
        methods::BZIP2 => bzip2::decompress(data, expected_size),
        methods::PKWARE => pkware::explode(data, expected_size),
        methods::ZLIB => zlib::decompress(data, expected_size),
        methods::SPARSE => sparse::decompress(data, expected_size),
        methods::HUFFMAN => huffman::decompress(data, expected_size),
        methods::ADPCM_STEREO => adpcm::decompress(data, expected_size, 2),
        methods::ADPCM_MONO => adpcm::decompress(data, expected_size, 1),
        _ => Err(Error::compression(format!(
            "unknown compression method 0x{:02X}",
            method
        ))),
    }
}

fn apply_one_compress(method: u8, data: &[u8]) -> Result<Vec<u8>> {
    match method {
        methods::BZIP2 => bzip2::compress(data),
        methods::PKWARE => pkware::implode(data),
        methods::ZLIB => zlib::compress(data),
        methods::SPARSE => sparse::compress(data),
        methods::HUFFMAN => huffman::compress(data),
        methods::ADPCM_STEREO => adpcm::compress(data, 2),
        methods::ADPCM_MONO => adpcm::compress(data, 1),
        _ => Err(Error::compression(format!(
            "unknown compression method 0x{:02X}",
            method
        ))),
    }
}

/// Decompress a sector that carries a leading method byte
///
/// `expected_size` is the decompressed sector length from the file entry.
pub fn decompress(data: &[u8], expected_size: usize) -> Result<Vec<u8>> {
    let Some((&method_mask, payload)) = data.split_first() else {
        return Err(Error::compression("empty compressed sector"));
    };

    if method_mask == 0 {
        return Ok(payload.to_vec());
    }

    // LZMA's method value overlaps the ZLIB and BZIP2 bits and is only
    // ever used on its own.
    if method_mask == methods::LZMA {
        return lzma::decompress(payload, expected_size);
    }

    let mut remaining = method_mask;
    let mut buffer = payload.to_vec();
    for &method in DECOMPRESS_ORDER {
        if remaining & method != 0 {
            remaining &= !method;
            // Intermediate stages do not know their exact output size;
            // the final stage must land on expected_size.
            let stage_size = if remaining == 0 {
                expected_size
            } else {
                expected_size.max(buffer.len())
            };
            buffer = apply_one_decompress(method, &buffer, stage_size)?;
        }
    }

    if remaining != 0 {
        return Err(Error::compression(format!(
            "unknown compression method bits 0x{:02X}",
            remaining
        )));
    }

    Ok(buffer)
}

/// Compress a sector with the given method chain
///
/// Returns the stored form including the leading method byte. Codecs that
/// do not shrink the data are dropped from the chain; when nothing helps
/// the input is returned unchanged with no method byte, and the caller
/// detects that by comparing lengths.
pub fn compress(data: &[u8], method_mask: u8) -> Result<Vec<u8>> {
    if method_mask == 0 || data.is_empty() {
        return Ok(data.to_vec());
    }

    if method_mask == methods::LZMA {
        let packed = lzma::compress(data)?;
        if packed.len() + 1 < data.len() {
            let mut out = Vec::with_capacity(packed.len() + 1);
            out.push(methods::LZMA);
            out.extend_from_slice(&packed);
            return Ok(out);
        }
        return Ok(data.to_vec());
    }

    let mut applied: u8 = 0;
    let mut buffer = data.to_vec();
    for &method in DECOMPRESS_ORDER.iter().rev() {
        if method_mask & method != 0 {
            let stage = apply_one_compress(method, &buffer)?;
            // ADPCM is lossy and must stay in the chain even when the
            // encoded form happens to be larger.
            let lossy = method & (methods::ADPCM_MONO | methods::ADPCM_STEREO) != 0;
            if stage.len() < buffer.len() || lossy {
                buffer = stage;
                applied |= method;
            } else {
                log::debug!(
                    "compression method 0x{:02X} did not shrink {} bytes, skipping",
                    method,
                    buffer.len()
                );
            }
        }
    }

    if applied == 0 || buffer.len() + 1 >= data.len() {
        return Ok(data.to_vec());
    }

    let mut out = Vec::with_capacity(buffer.len() + 1);
    out.push(applied);
    out.extend_from_slice(&buffer);
    Ok(out)
}
