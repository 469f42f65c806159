//! The (attributes) sidecar file
//!
//! Carries per-entry metadata in parallel arrays: CRC-32, file time,
//! MD5, and a patch bit. Real archives disagree about the exact size of
//! the file, so parsing accepts the three layouts seen in the wild: the
//! full size, one trailing entry short (the writer skipped the
//! (attributes) entry itself), and a patch-bit column stored as a u32
//! array instead of a bit array.

use crate::entries::FileTable;
use crate::{Error, Result};

/// Version written by every known implementation
const ATTRIBUTES_VERSION: u32 = 100;
const HEADER_SIZE: usize = 8;

bitflags::bitflags! {
    /// Which metadata columns the file carries
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct AttributeFlags: u32 {
        /// CRC-32 of each file's plain data
        const CRC32 = 0x01;
        /// Windows FILETIME of each file
        const FILETIME = 0x02;
        /// MD5 of each file's plain data
        const MD5 = 0x04;
        /// Incremental-patch marker bit per file
        const PATCH_BIT = 0x08;
    }
}

/// Parsed (attributes) contents
#[derive(Debug, Clone, Default)]
pub struct Attributes {
    /// Columns present
    pub flags: AttributeFlags,
    /// CRC-32 per entry, when present
    pub crc32: Vec<u32>,
    /// File time per entry, when present
    pub file_times: Vec<u64>,
    /// MD5 per entry, when present
    pub md5: Vec<[u8; 16]>,
    /// Patch bit per entry, when present
    pub patch_bits: Vec<bool>,
}

/// How many entries the columns cover for a given total size
///
/// Returns the accepted entry count or an error when no known layout
/// matches.
fn resolve_entry_count(data_len: usize, flags: AttributeFlags, block_count: usize) -> Result<usize> {
    let size_for = |count: usize, patch_as_u32: bool| -> usize {
        let mut size = HEADER_SIZE;
        if flags.contains(AttributeFlags::CRC32) {
            size += count * 4;
        }
        if flags.contains(AttributeFlags::FILETIME) {
            size += count * 8;
        }
        if flags.contains(AttributeFlags::MD5) {
            size += count * 16;
        }
        if flags.contains(AttributeFlags::PATCH_BIT) {
            size += if patch_as_u32 {
                count * 4
            } else {
                (block_count + 6) / 8
            };
        }
        size
    };

    if data_len == size_for(block_count, false) {
        return Ok(block_count);
    }
    // A writer that skipped its own (attributes) entry
    if block_count > 0 && data_len == size_for(block_count - 1, false) {
        log::debug!("(attributes) is one entry short, tolerated");
        return Ok(block_count - 1);
    }
    // interface.MPQ.part-style u32 patch column
    if flags.contains(AttributeFlags::PATCH_BIT) && data_len == size_for(block_count, true) {
        log::debug!("(attributes) stores the patch column as u32 array, tolerated");
        return Ok(block_count);
    }

    Err(Error::corrupt(format!(
        "(attributes) size {} does not match any known layout for {} entries",
        data_len, block_count
    )))
}

impl Attributes {
    /// Parse the (attributes) file contents
    pub fn parse(data: &[u8], block_count: usize) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(Error::corrupt("(attributes) too short for its header"));
        }
        let version = u32::from_le_bytes(data[0..4].try_into().unwrap());
        let flags = AttributeFlags::from_bits_truncate(u32::from_le_bytes(
            data[4..8].try_into().unwrap(),
        ));
        if version != ATTRIBUTES_VERSION {
            return Err(Error::corrupt(format!(
                "unsupported (attributes) version {}",
                version
            )));
        }

        let count = resolve_entry_count(data.len(), flags, block_count)?;
        let mut at = HEADER_SIZE;
        let mut result = Self {
            flags,
            ..Self::default()
        };

        if flags.contains(AttributeFlags::CRC32) {
            result.crc32 = data[at..at + count * 4]
                .chunks_exact(4)
                .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
                .collect();
            at += count * 4;
        }
        if flags.contains(AttributeFlags::FILETIME) {
            result.file_times = data[at..at + count * 8]
                .chunks_exact(8)
                .map(|c| u64::from_le_bytes(c.try_into().unwrap()))
                .collect();
            at += count * 8;
        }
        if flags.contains(AttributeFlags::MD5) {
            result.md5 = data[at..at + count * 16]
                .chunks_exact(16)
                .map(|c| c.try_into().unwrap())
                .collect();
            at += count * 16;
        }
        if flags.contains(AttributeFlags::PATCH_BIT) {
            let bits = &data[at..];
            result.patch_bits = (0..count)
                .map(|i| {
                    bits.get(i / 8)
                        .map(|&b| b & (1 << (i % 8)) != 0)
                        .unwrap_or(false)
                })
                .collect();
        }

        Ok(result)
    }

    /// Serialize (attributes) contents from the file table
    ///
    /// `count` is the number of column rows to emit; rows past the
    /// table's current capacity (entries about to be added) are zeroed.
    pub fn build(table: &FileTable, flags: AttributeFlags, count: usize) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&ATTRIBUTES_VERSION.to_le_bytes());
        out.extend_from_slice(&flags.bits().to_le_bytes());

        if flags.contains(AttributeFlags::CRC32) {
            for i in 0..count {
                let crc = table.get(i as u32).and_then(|e| e.crc32).unwrap_or(0);
                out.extend_from_slice(&crc.to_le_bytes());
            }
        }
        if flags.contains(AttributeFlags::FILETIME) {
            for i in 0..count {
                let time = table.get(i as u32).and_then(|e| e.file_time).unwrap_or(0);
                out.extend_from_slice(&time.to_le_bytes());
            }
        }
        if flags.contains(AttributeFlags::MD5) {
            for i in 0..count {
                let md5 = table.get(i as u32).and_then(|e| e.md5).unwrap_or([0; 16]);
                out.extend_from_slice(&md5);
            }
        }
        if flags.contains(AttributeFlags::PATCH_BIT) {
            // The bit array historically omits the trailing bit that
            // would belong to the (attributes) entry itself.
            let mut bits = vec![0u8; (count + 6) / 8];
            for i in 0..count {
                let is_patch = table
                    .get(i as u32)
                    .map(|e| {
                        e.flags
                            .contains(crate::tables::BlockFlags::PATCH_FILE)
                    })
                    .unwrap_or(false);
                if is_patch {
                    if let Some(byte) = bits.get_mut(i / 8) {
                        *byte |= 1 << (i % 8);
                    }
                }
            }
            out.extend_from_slice(&bits);
        }

        out
    }

    /// Copy the parsed columns into the file table
    pub fn apply(&self, table: &mut FileTable) {
        for index in 0..table.capacity() as u32 {
            if let Some(entry) = table.get_mut(index) {
                let i = index as usize;
                if let Some(&crc) = self.crc32.get(i) {
                    if crc != 0 {
                        entry.crc32 = Some(crc);
                    }
                }
                if let Some(&time) = self.file_times.get(i) {
                    if time != 0 {
                        entry.file_time = Some(time);
                    }
                }
                if let Some(&md5) = self.md5.get(i) {
                    if md5 != [0; 16] {
                        entry.md5 = Some(md5);
                    }
                }
            }
        }
    }
}
