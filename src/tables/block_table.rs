//! The classic block table and the hi-block extension

use crate::crypto::{hash_string, hash_type};
use crate::stream::Stream;
use crate::{Error, Result};

/// Key for the block table's own encryption
pub fn table_key() -> u32 {
    hash_string("(block table)", hash_type::FILE_KEY)
}

bitflags::bitflags! {
    /// Per-file flag bits stored in the block table
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct BlockFlags: u32 {
        /// Compressed with PKWARE DCL only (no method byte)
        const IMPLODE = 0x0000_0100;
        /// Compressed with one or more codecs behind a method byte
        const COMPRESS = 0x0000_0200;
        /// Encrypted with the file key
        const ENCRYPTED = 0x0001_0000;
        /// File key depends on the file's position and size
        const FIX_KEY = 0x0002_0000;
        /// Additional Anubis block cipher over the sectors
        const ANUBIS = 0x0004_0000;
        /// Additional Serpent block cipher over the sectors
        const SERPENT = 0x0008_0000;
        /// The file is an incremental patch
        const PATCH_FILE = 0x0010_0000;
        /// Stored as one blob without a sector table
        const SINGLE_UNIT = 0x0100_0000;
        /// Deletion marker in a patch archive
        const DELETE_MARKER = 0x0200_0000;
        /// Each sector is followed by an Adler-32 checksum
        const SECTOR_CRC = 0x0400_0000;
        /// The entry holds a live file
        const EXISTS = 0x8000_0000;
    }
}

impl BlockFlags {
    /// Any compression bit set
    pub fn is_compressed(&self) -> bool {
        self.intersects(BlockFlags::IMPLODE | BlockFlags::COMPRESS)
    }
}

/// Block table entry (16 bytes on disk)
#[derive(Debug, Clone, Copy, Default)]
pub struct BlockEntry {
    /// Offset of the file data, relative to the archive start
    pub file_pos: u32,
    /// Stored (compressed) size in bytes
    pub compressed_size: u32,
    /// Uncompressed size in bytes
    pub file_size: u32,
    /// Flag bits
    pub flags: u32,
}

/// The classic block table
#[derive(Debug, Clone)]
pub struct BlockTable {
    entries: Vec<BlockEntry>,
}

impl BlockTable {
    /// An empty table of `size` entries
    pub fn new(size: usize) -> Self {
        Self {
            entries: vec![BlockEntry::default(); size],
        }
    }

    /// Parse a table from its decrypted on-disk bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() % 16 != 0 {
            return Err(Error::corrupt("block table size not a multiple of 16"));
        }
        let entries = data
            .chunks_exact(16)
            .map(|chunk| BlockEntry {
                file_pos: u32::from_le_bytes(chunk[0..4].try_into().unwrap()),
                compressed_size: u32::from_le_bytes(chunk[4..8].try_into().unwrap()),
                file_size: u32::from_le_bytes(chunk[8..12].try_into().unwrap()),
                flags: u32::from_le_bytes(chunk[12..16].try_into().unwrap()),
            })
            .collect();
        Ok(Self { entries })
    }

    /// Read and decrypt a table from the archive, tolerating truncation
    pub fn read(
        stream: &mut Stream,
        offset: u64,
        entry_count: u32,
        on_disk_size: usize,
    ) -> Result<Self> {
        let real_size = entry_count as usize * 16;

        let readable = (stream.size().saturating_sub(offset) as usize).min(on_disk_size);
        if readable < on_disk_size && on_disk_size == real_size {
            let aligned = readable & !15;
            let mut data = super::load_table(stream, offset, aligned, aligned, table_key())?;
            data.resize(real_size, 0);
            return Self::from_bytes(&data);
        }

        let data = super::load_table(stream, offset, on_disk_size, real_size, table_key())?;
        Self::from_bytes(&data)
    }

    /// Serialize to plaintext bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.entries.len() * 16);
        for entry in &self.entries {
            out.extend_from_slice(&entry.file_pos.to_le_bytes());
            out.extend_from_slice(&entry.compressed_size.to_le_bytes());
            out.extend_from_slice(&entry.file_size.to_le_bytes());
            out.extend_from_slice(&entry.flags.to_le_bytes());
        }
        out
    }

    /// All entries
    pub fn entries(&self) -> &[BlockEntry] {
        &self.entries
    }

    /// One entry
    pub fn get(&self, index: usize) -> Option<&BlockEntry> {
        self.entries.get(index)
    }

    /// Number of entries
    pub fn size(&self) -> usize {
        self.entries.len()
    }

    /// Append an entry, returning its index
    pub fn push(&mut self, entry: BlockEntry) -> u32 {
        self.entries.push(entry);
        (self.entries.len() - 1) as u32
    }
}

/// Hi-block table: the high 16 bits of each file position (v2+)
#[derive(Debug, Clone)]
pub struct HiBlockTable {
    entries: Vec<u16>,
}

impl HiBlockTable {
    /// An all-zero table of `size` entries
    pub fn new(size: usize) -> Self {
        Self {
            entries: vec![0; size],
        }
    }

    /// Read the table; it is stored unencrypted and uncompressed
    pub fn read(stream: &mut Stream, offset: u64, entry_count: u32) -> Result<Self> {
        let mut raw = vec![0u8; entry_count as usize * 2];
        stream.read(offset, &mut raw)?;
        let entries = raw
            .chunks_exact(2)
            .map(|chunk| u16::from_le_bytes(chunk.try_into().unwrap()))
            .collect();
        Ok(Self { entries })
    }

    /// Serialize to bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.entries.len() * 2);
        for &entry in &self.entries {
            out.extend_from_slice(&entry.to_le_bytes());
        }
        out
    }

    /// High bits for one entry
    pub fn get(&self, index: usize) -> u16 {
        self.entries.get(index).copied().unwrap_or(0)
    }

    /// Store high bits for one entry
    pub fn set(&mut self, index: usize, value: u16) {
        if index >= self.entries.len() {
            self.entries.resize(index + 1, 0);
        }
        self.entries[index] = value;
    }

    /// True when any entry is non-zero and the table must be written
    pub fn is_needed(&self) -> bool {
        self.entries.iter().any(|&v| v != 0)
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when the table has no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags() {
        let flags = BlockFlags::COMPRESS | BlockFlags::EXISTS;
        assert!(flags.is_compressed());
        assert!(!flags.contains(BlockFlags::ENCRYPTED));

        let flags = BlockFlags::ENCRYPTED | BlockFlags::FIX_KEY | BlockFlags::EXISTS;
        assert!(flags.contains(BlockFlags::FIX_KEY));
        assert!(!flags.is_compressed());
    }

    #[test]
    fn test_serialization_round_trip() {
        let mut table = BlockTable::new(0);
        table.push(BlockEntry {
            file_pos: 0x200,
            compressed_size: 100,
            file_size: 256,
            flags: (BlockFlags::COMPRESS | BlockFlags::EXISTS).bits(),
        });

        let parsed = BlockTable::from_bytes(&table.to_bytes()).unwrap();
        assert_eq!(parsed.size(), 1);
        let entry = parsed.get(0).unwrap();
        assert_eq!(entry.file_pos, 0x200);
        assert_eq!(entry.compressed_size, 100);
        assert_eq!(entry.file_size, 256);
    }

    #[test]
    fn test_hi_block_table() {
        let mut table = HiBlockTable::new(4);
        assert!(!table.is_needed());
        table.set(2, 0x0001);
        assert!(table.is_needed());
        assert_eq!(table.get(2), 1);
        assert_eq!(table.get(10), 0);
    }
}
