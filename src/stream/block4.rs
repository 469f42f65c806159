//! Sharded archive provider (`blk4-` prefix)
//!
//! The logical stream is spread over numbered files `name.0`, `name.1`,
//! and so on. Each shard holds blocks of 16 KiB payload followed by a
//! 32-byte MD5 tail, and at most 8192 such blocks. Reads translate the
//! logical offset to a shard and block and skip the tails. Read-only.

use super::base::BaseProvider;
use super::block::BlockIo;
use crate::{Error, Result};
use std::path::{Path, PathBuf};

const BLOCK4_BLOCK_SIZE: u64 = 0x4000;
const BLOCK4_HASH_SIZE: u64 = 0x20;
const BLOCK4_STORED_SIZE: u64 = BLOCK4_BLOCK_SIZE + BLOCK4_HASH_SIZE;
const BLOCK4_MAX_BLOCKS: u64 = 0x2000;
const BLOCK4_MAX_FILE_SIZE: u64 = BLOCK4_MAX_BLOCKS * BLOCK4_STORED_SIZE;
const BLOCK4_MAX_SHARDS: usize = 30;

/// The set of shard files making up one logical stream
#[derive(Debug)]
pub(crate) struct Block4Set {
    shards: Vec<BaseProvider>,
    stream_size: u64,
}

impl Block4Set {
    /// Open `name.0`, `name.1`, ... until one is missing
    ///
    /// The given path may carry the `.0` suffix already; it is stripped
    /// before probing.
    pub(crate) fn open(path: &Path, use_mmap: bool) -> Result<Self> {
        let name = path.to_string_lossy();
        let base_name = name.strip_suffix(".0").unwrap_or(&name).to_string();

        let mut shards = Vec::new();
        let mut stream_size = 0u64;

        for suffix in 0..BLOCK4_MAX_SHARDS {
            let shard_path = PathBuf::from(format!("{}.{}", base_name, suffix));
            let shard = match open_base(&shard_path, use_mmap) {
                Ok(shard) => shard,
                Err(_) if suffix > 0 => break,
                Err(e) => return Err(e),
            };

            let file_size = shard.size();
            let block_count = file_size / BLOCK4_STORED_SIZE;
            let remainder = file_size % BLOCK4_STORED_SIZE;

            stream_size += block_count * BLOCK4_BLOCK_SIZE;
            shards.push(shard);

            // Anything but a full shard terminates the chain
            if file_size < BLOCK4_MAX_FILE_SIZE {
                if remainder > BLOCK4_HASH_SIZE {
                    stream_size += remainder - BLOCK4_HASH_SIZE;
                }
                break;
            }
        }

        if shards.is_empty() {
            return Err(Error::NotFound(base_name));
        }

        Ok(Self {
            shards,
            stream_size,
        })
    }

    pub(crate) fn stream_size(&self) -> u64 {
        self.stream_size
    }
}

fn open_base(path: &Path, use_mmap: bool) -> Result<BaseProvider> {
    #[cfg(feature = "mmap")]
    if use_mmap {
        return BaseProvider::open_map(path);
    }
    let _ = use_mmap;
    BaseProvider::open_file(path, true)
}

/// Scheduler adapter for the sharded layer
pub(crate) struct Block4Io<'a> {
    pub(crate) set: &'a mut Block4Set,
}

impl BlockIo for Block4Io<'_> {
    fn block_size(&self) -> u64 {
        BLOCK4_BLOCK_SIZE
    }

    fn stream_size(&self) -> u64 {
        self.set.stream_size
    }

    fn is_complete(&self) -> bool {
        true
    }

    fn block_available(&self, _block_offset: u64) -> bool {
        true
    }

    fn has_master(&self) -> bool {
        false
    }

    fn read_run(&mut self, start: u64, end: u64, out: &mut [u8], _available: bool) -> Result<()> {
        let mut position = start;
        let mut at = 0usize;

        while position < end {
            let logical_block = position / BLOCK4_BLOCK_SIZE;
            let shard_index = (logical_block / BLOCK4_MAX_BLOCKS) as usize;
            let block_index = logical_block % BLOCK4_MAX_BLOCKS;

            let shard = self
                .set
                .shards
                .get_mut(shard_index)
                .ok_or(Error::EndOfFile)?;

            let len = ((end - position).min(BLOCK4_BLOCK_SIZE)) as usize;
            let shard_offset = block_index * BLOCK4_STORED_SIZE;
            shard.read_at(shard_offset, &mut out[at..at + len])?;

            position += len as u64;
            at += len;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::block::block_read;

    /// Write shard files holding `data` with dummy MD5 tails
    fn write_shards(dir: &Path, name: &str, data: &[u8], blocks_per_shard: u64) {
        let mut remaining = data;
        let mut shard_index = 0;
        loop {
            let mut shard = Vec::new();
            let mut blocks = 0;
            while !remaining.is_empty() && blocks < blocks_per_shard {
                let take = remaining.len().min(BLOCK4_BLOCK_SIZE as usize);
                shard.extend_from_slice(&remaining[..take]);
                // Every stored block, even a short last one, carries a tail
                shard.extend_from_slice(&[0u8; BLOCK4_HASH_SIZE as usize]);
                remaining = &remaining[take..];
                blocks += 1;
            }
            std::fs::write(dir.join(format!("{}.{}", name, shard_index)), &shard).unwrap();
            shard_index += 1;
            if remaining.is_empty() {
                break;
            }
        }
    }

    #[test]
    fn test_single_shard_size() {
        let dir = tempfile::tempdir().unwrap();
        let data = vec![7u8; (BLOCK4_BLOCK_SIZE + 100) as usize];
        write_shards(dir.path(), "test.mpq", &data, BLOCK4_MAX_BLOCKS);

        let set = Block4Set::open(&dir.path().join("test.mpq.0"), false).unwrap();
        assert_eq!(set.stream_size(), data.len() as u64);
    }

    #[test]
    fn test_read_skips_hash_tails() {
        let dir = tempfile::tempdir().unwrap();
        let data: Vec<u8> = (0..(BLOCK4_BLOCK_SIZE * 2 + 500) as usize)
            .map(|i| (i / 7) as u8)
            .collect();
        write_shards(dir.path(), "test.mpq", &data, BLOCK4_MAX_BLOCKS);

        let mut set = Block4Set::open(&dir.path().join("test.mpq.0"), false).unwrap();
        let mut io = Block4Io { set: &mut set };

        // Read across the first block boundary, where a hash tail sits
        let from = (BLOCK4_BLOCK_SIZE - 16) as usize;
        let mut buf = vec![0u8; 64];
        block_read(&mut io, &mut None, from as u64, &mut buf).unwrap();
        assert_eq!(&buf[..], &data[from..from + 64]);
    }
}
