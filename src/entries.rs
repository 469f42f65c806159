//! The unified in-memory file directory
//!
//! Whatever combination of tables an archive carries on disk (classic
//! hash/block, hi-block, HET/BET), loading folds them into one array of
//! file entries. All mutation happens on this array; the on-disk tables
//! are regenerated from it at flush time.

use crate::header::Header;
use crate::tables::het::FoldedHash;
use crate::tables::{BetTable, BlockFlags, BlockTable, HashTable, HetTable, HiBlockTable};
use crate::{Error, Result};

/// Windows LANGID of a stored file; 0 is the neutral locale
pub type Locale = u16;

/// One file within one archive
#[derive(Debug, Clone, Default)]
pub struct FileEntry {
    /// Byte offset of the stored data, relative to the archive start
    pub byte_offset: u64,
    /// Uncompressed size
    pub file_size: u32,
    /// Stored size
    pub compressed_size: u32,
    /// Flag bits
    pub flags: BlockFlags,
    /// Locale of this version of the file
    pub locale: Locale,
    /// Platform code; always observed as zero
    pub platform: u16,
    /// Slot in the classic hash table, when one exists
    pub hash_index: Option<u32>,
    /// Folded Jenkins hash, when a HET table exists
    pub name_hash: Option<FoldedHash>,
    /// File name, when known
    pub name: Option<String>,
    /// CRC-32 from the attributes sidecar
    pub crc32: Option<u32>,
    /// MD5 from the attributes sidecar
    pub md5: Option<[u8; 16]>,
    /// File time from the attributes sidecar
    pub file_time: Option<u64>,
}

impl FileEntry {
    /// True when the slot holds a live file
    pub fn exists(&self) -> bool {
        self.flags.contains(BlockFlags::EXISTS)
    }

    /// Reset to a free slot
    pub fn clear(&mut self) {
        *self = FileEntry::default();
    }
}

/// Directory information surfaced to callers
#[derive(Debug, Clone)]
pub struct FileInfo {
    /// File name, or a synthesized placeholder when unknown
    pub name: String,
    /// Index into the file table
    pub index: u32,
    /// Byte offset of the stored data, relative to the archive start
    pub file_pos: u64,
    /// Uncompressed size
    pub file_size: u32,
    /// Stored size
    pub compressed_size: u32,
    /// Flag bits
    pub flags: BlockFlags,
    /// Locale
    pub locale: Locale,
    /// CRC-32 from the attributes sidecar
    pub crc32: Option<u32>,
    /// File time from the attributes sidecar
    pub file_time: Option<u64>,
}

/// The file table
#[derive(Debug, Clone, Default)]
pub struct FileTable {
    entries: Vec<FileEntry>,
}

impl FileTable {
    /// An empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the unified table from whatever the archive stores
    pub fn from_tables(
        header: &Header,
        hash_table: Option<&HashTable>,
        block_table: Option<&BlockTable>,
        hi_block_table: Option<&HiBlockTable>,
        het_table: Option<&HetTable>,
        bet_table: Option<&BetTable>,
    ) -> Result<Self> {
        let mut entries: Vec<FileEntry>;

        if let (Some(het), Some(bet)) = (het_table, bet_table) {
            // HET/BET is authoritative when present
            if het.entry_count != bet.entry_count {
                return Err(Error::corrupt("HET and BET entry counts differ"));
            }
            entries = Vec::with_capacity(bet.entry_count as usize);
            for i in 0..bet.entry_count {
                let record = bet.get(i)?;
                entries.push(FileEntry {
                    byte_offset: record.file_pos,
                    file_size: record.file_size as u32,
                    compressed_size: record.compressed_size as u32,
                    flags: BlockFlags::from_bits_retain(record.flags),
                    name_hash: Some(FoldedHash::from_parts(
                        0,
                        record.name_hash,
                        het.name_hash_bit_size,
                    )),
                    ..FileEntry::default()
                });
            }

            // Recover the hash fragments by walking the HET slots
            for slot in 0..het.total_count as usize {
                let fragment = het.fragment_at(slot);
                if fragment != crate::tables::het::HET_ENTRY_FREE
                    && fragment != crate::tables::het::HET_ENTRY_DELETED
                {
                    let index = het.index_at(slot)? as usize;
                    if let Some(entry) = entries.get_mut(index) {
                        let remainder = entry.name_hash.map(|h| h.remainder()).unwrap_or(0);
                        entry.name_hash = Some(FoldedHash::from_parts(
                            fragment,
                            remainder,
                            het.name_hash_bit_size,
                        ));
                    }
                }
            }
        } else if let Some(block) = block_table {
            entries = block
                .entries()
                .iter()
                .enumerate()
                .map(|(i, raw)| {
                    let high = hi_block_table.map(|t| t.get(i)).unwrap_or(0);
                    FileEntry {
                        byte_offset: ((high as u64) << 32) | raw.file_pos as u64,
                        file_size: raw.file_size,
                        compressed_size: raw.compressed_size,
                        flags: BlockFlags::from_bits_retain(raw.flags),
                        ..FileEntry::default()
                    }
                })
                .collect();
        } else {
            return Err(Error::corrupt("archive carries no usable file tables"));
        }

        // Classic hash table contributes locale, platform, and slot links
        if let Some(hash) = hash_table {
            for (slot, raw) in hash.entries().iter().enumerate() {
                if raw.is_valid() {
                    if let Some(entry) = entries.get_mut(raw.block_index as usize) {
                        entry.locale = raw.locale;
                        entry.platform = raw.platform;
                        entry.hash_index = Some(slot as u32);
                    }
                }
            }
        }

        let _ = header;
        Ok(Self { entries })
    }

    /// All entries
    pub fn entries(&self) -> &[FileEntry] {
        &self.entries
    }

    /// One entry
    pub fn get(&self, index: u32) -> Option<&FileEntry> {
        self.entries.get(index as usize)
    }

    /// One entry, mutably
    pub fn get_mut(&mut self, index: u32) -> Option<&mut FileEntry> {
        self.entries.get_mut(index as usize)
    }

    /// Number of slots (live and free)
    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Number of live files
    pub fn live_count(&self) -> usize {
        self.entries.iter().filter(|e| e.exists()).count()
    }

    /// Indices of all live entries
    pub fn live_indices(&self) -> impl Iterator<Item = u32> + '_ {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.exists())
            .map(|(i, _)| i as u32)
    }

    /// Claim the first free slot, growing the table when none is free
    pub fn allocate(&mut self) -> u32 {
        for (i, entry) in self.entries.iter().enumerate() {
            if !entry.exists() {
                return i as u32;
            }
        }
        self.entries.push(FileEntry::default());
        (self.entries.len() - 1) as u32
    }

    /// First byte offset past all stored file data
    ///
    /// This is where a new file's data goes. `md5_piece_size`, when the
    /// archive keeps raw-chunk MD5s, reserves room for the trailing
    /// digest array of each file.
    pub fn find_free_space(&self, data_start: u64, raw_chunk_size: u32) -> u64 {
        let mut free = data_start;
        for entry in &self.entries {
            if entry.exists() {
                let mut end = entry.byte_offset + entry.compressed_size as u64;
                if raw_chunk_size != 0 {
                    let chunks = (entry.compressed_size as u64).div_ceil(raw_chunk_size as u64);
                    end += chunks * 16;
                }
                free = free.max(end);
            }
        }
        free
    }

    /// Directory listing of every live entry
    pub fn list(&self) -> Vec<FileInfo> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.exists())
            .map(|(i, e)| FileInfo {
                name: e
                    .name
                    .clone()
                    .unwrap_or_else(|| format!("File{:08}.xxx", i)),
                index: i as u32,
                file_pos: e.byte_offset,
                file_size: e.file_size,
                compressed_size: e.compressed_size,
                flags: e.flags,
                locale: e.locale,
                crc32: e.crc32,
                file_time: e.file_time,
            })
            .collect()
    }

    /// True when every live entry has a known name
    pub fn all_names_known(&self) -> bool {
        self.entries
            .iter()
            .filter(|e| e.exists())
            .all(|e| e.name.is_some())
    }
}
