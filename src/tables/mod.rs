//! On-disk archive index tables
//!
//! The classic hash/block pair, the hi-block extension, and the
//! bit-packed HET/BET tables. Tables travel encrypted and optionally
//! compressed; writing applies compression first and encryption second,
//! loading undoes them in the reverse order.

pub mod bet;
pub mod block_table;
pub mod hash_table;
pub mod het;

pub use bet::{BetRecord, BetTable};
pub use block_table::{BlockEntry, BlockFlags, BlockTable, HiBlockTable};
pub use hash_table::{HashEntry, HashTable};
pub use het::HetTable;

use crate::compression::{self, methods};
use crate::crypto::{decrypt_bytes, encrypt_bytes};
use crate::stream::Stream;
use crate::{Error, Result};

/// Size of the extended table header in front of HET/BET data
pub const EXT_HEADER_SIZE: usize = 12;

/// Load a table blob that may be encrypted and compressed
///
/// `real_size` is the decompressed size; `on_disk_size` the stored byte
/// count. A stored size smaller than the real size means the payload is
/// compressed with a leading method byte.
pub(crate) fn load_table(
    stream: &mut Stream,
    offset: u64,
    on_disk_size: usize,
    real_size: usize,
    key: u32,
) -> Result<Vec<u8>> {
    let mut raw = vec![0u8; on_disk_size];
    stream.read(offset, &mut raw)?;

    if key != 0 {
        decrypt_bytes(&mut raw, key);
    }

    if on_disk_size < real_size {
        raw = compression::decompress(&raw, real_size)?;
    }

    if raw.len() != real_size {
        return Err(Error::corrupt(format!(
            "table decompressed to {} bytes, expected {}",
            raw.len(),
            real_size
        )));
    }

    Ok(raw)
}

/// Serialize a table blob, optionally compressing, then encrypting
pub(crate) fn store_table(payload: &[u8], key: u32, compress: bool) -> Result<Vec<u8>> {
    let mut out = if compress {
        compression::compress(payload, methods::ZLIB)?
    } else {
        payload.to_vec()
    };

    if key != 0 {
        encrypt_bytes(&mut out, key);
    }

    Ok(out)
}

/// Parse an extended table header, returning the declared data size
pub(crate) fn read_ext_header(raw: &[u8], expected_signature: u32) -> Result<u32> {
    if raw.len() < EXT_HEADER_SIZE {
        return Err(Error::corrupt("extended table header truncated"));
    }
    let signature = u32::from_le_bytes(raw[0..4].try_into().unwrap());
    let version = u32::from_le_bytes(raw[4..8].try_into().unwrap());
    let data_size = u32::from_le_bytes(raw[8..12].try_into().unwrap());

    if signature != expected_signature {
        return Err(Error::corrupt("extended table signature mismatch"));
    }
    if version != 1 {
        return Err(Error::corrupt(format!(
            "unsupported extended table version {}",
            version
        )));
    }
    Ok(data_size)
}

/// Load an extended (HET/BET) table: plaintext 12-byte header, then an
/// encrypted and possibly compressed payload
pub(crate) fn load_ext_table(
    stream: &mut Stream,
    offset: u64,
    on_disk_size: usize,
    expected_signature: u32,
    key: u32,
) -> Result<Vec<u8>> {
    let mut raw = vec![0u8; on_disk_size];
    stream.read(offset, &mut raw)?;

    let data_size = read_ext_header(&raw, expected_signature)? as usize;
    let mut payload = raw.split_off(EXT_HEADER_SIZE);

    if key != 0 {
        decrypt_bytes(&mut payload, key);
    }

    if payload.len() < data_size {
        payload = compression::decompress(&payload, data_size)?;
    }
    payload.truncate(data_size);

    if payload.len() != data_size {
        return Err(Error::corrupt("extended table shorter than declared"));
    }

    Ok(payload)
}

/// Serialize an extended table with its plaintext header
pub(crate) fn store_ext_table(
    payload: &[u8],
    signature: u32,
    key: u32,
    compress: bool,
) -> Result<Vec<u8>> {
    let body = store_table(payload, key, compress)?;

    let mut out = Vec::with_capacity(EXT_HEADER_SIZE + body.len());
    out.extend_from_slice(&signature.to_le_bytes());
    out.extend_from_slice(&1u32.to_le_bytes());
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signatures;
    use crate::stream::StreamFlags;

    fn stream_with(dir: &tempfile::TempDir, bytes: &[u8]) -> Stream {
        let path = dir.path().join("table.bin");
        std::fs::write(&path, bytes).unwrap();
        Stream::open(&path.display().to_string(), StreamFlags::empty()).unwrap()
    }

    #[test]
    fn test_table_round_trip_encrypted() {
        let dir = tempfile::tempdir().unwrap();
        let payload: Vec<u8> = (0..64u8).collect();
        let key = 0xDEADBEEF;

        let stored = store_table(&payload, key, false).unwrap();
        let mut stream = stream_with(&dir, &stored);
        let loaded = load_table(&mut stream, 0, stored.len(), payload.len(), key).unwrap();
        assert_eq!(loaded, payload);
    }

    #[test]
    fn test_table_round_trip_compressed() {
        let dir = tempfile::tempdir().unwrap();
        let payload = vec![7u8; 4096];
        let key = 0xC0FFEE;

        let stored = store_table(&payload, key, true).unwrap();
        assert!(stored.len() < payload.len());

        let mut stream = stream_with(&dir, &stored);
        let loaded = load_table(&mut stream, 0, stored.len(), payload.len(), key).unwrap();
        assert_eq!(loaded, payload);
    }

    #[test]
    fn test_ext_table_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let payload = vec![0x11u8; 2000];
        let key = 0xB00B1E5;

        let stored = store_ext_table(&payload, signatures::HET_TABLE, key, true).unwrap();
        let mut stream = stream_with(&dir, &stored);
        let loaded =
            load_ext_table(&mut stream, 0, stored.len(), signatures::HET_TABLE, key).unwrap();
        assert_eq!(loaded, payload);
    }

    #[test]
    fn test_ext_table_wrong_signature() {
        let dir = tempfile::tempdir().unwrap();
        let stored = store_ext_table(&[1, 2, 3], signatures::HET_TABLE, 0, false).unwrap();
        let mut stream = stream_with(&dir, &stored);
        assert!(load_ext_table(&mut stream, 0, stored.len(), signatures::BET_TABLE, 0).is_err());
    }
}
