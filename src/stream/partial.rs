//! Partially-downloaded archive overlay (`part-` prefix)
//!
//! The local file starts with a 52-byte header and a 20-byte map entry
//! per block; block payloads live wherever the map says, typically in
//! download order rather than archive order. Blocks whose map entry has
//! both low flag bits set are present; anything else is fetched from the
//! master and appended at the end of the local file.

use super::base::BaseProvider;
use super::block::BlockIo;
use super::Stream;
use crate::{Error, Result};

const PART_HEADER_SIZE: u64 = 52;
const PART_MAP_ENTRY_SIZE: u64 = 20;
const PART_VERSION: u32 = 2;
const BLOCK_PRESENT_FLAGS: u32 = 3;
const DEFAULT_BLOCK_SIZE: u32 = 0x4000;
const DEFAULT_BUILD_NUMBER: u32 = 10958;

/// One block map entry
#[derive(Debug, Clone, Copy, Default)]
struct MapEntry {
    flags: u32,
    offset: u64,
}

/// In-memory form of the partial-file header and block map
#[derive(Debug)]
pub(crate) struct PartialMap {
    game_build: [u8; 32],
    flags: u32,
    logical_size: u64,
    block_size: u32,
    entries: Vec<MapEntry>,
    modified: bool,
}

impl PartialMap {
    /// Parse the header and map from an existing local file
    pub(crate) fn load(base: &mut BaseProvider) -> Result<Self> {
        if base.size() < PART_HEADER_SIZE {
            return Err(Error::bad_format("partial file too small for its header"));
        }

        let mut header = [0u8; PART_HEADER_SIZE as usize];
        base.read_at(0, &mut header)?;

        let version = u32::from_le_bytes(header[0..4].try_into().unwrap());
        let mut game_build = [0u8; 32];
        game_build.copy_from_slice(&header[4..36]);
        let flags = u32::from_le_bytes(header[36..40].try_into().unwrap());
        let size_lo = u32::from_le_bytes(header[40..44].try_into().unwrap());
        let size_hi = u32::from_le_bytes(header[44..48].try_into().unwrap());
        let block_size = u32::from_le_bytes(header[48..52].try_into().unwrap());

        // The build number is decimal ASCII; both checks guard against
        // files that merely resemble a partial header.
        if version != PART_VERSION
            || block_size == 0
            || !block_size.is_power_of_two()
            || !game_build[0].is_ascii_digit()
        {
            return Err(Error::bad_format("not a partial archive file"));
        }

        let logical_size = ((size_hi as u64) << 32) | size_lo as u64;
        let block_count = logical_size.div_ceil(block_size as u64);

        let map_bytes_len = (block_count * PART_MAP_ENTRY_SIZE) as usize;
        let mut map_bytes = vec![0u8; map_bytes_len];
        base.read_at(PART_HEADER_SIZE, &mut map_bytes)?;

        let mut entries = Vec::with_capacity(block_count as usize);
        for chunk in map_bytes.chunks_exact(PART_MAP_ENTRY_SIZE as usize) {
            let flags = u32::from_le_bytes(chunk[0..4].try_into().unwrap());
            let offset_lo = u32::from_le_bytes(chunk[4..8].try_into().unwrap());
            let offset_hi = u32::from_le_bytes(chunk[8..12].try_into().unwrap());
            entries.push(MapEntry {
                flags,
                offset: ((offset_hi as u64) << 32) | offset_lo as u64,
            });
        }

        Ok(Self {
            game_build,
            flags,
            logical_size,
            block_size,
            entries,
            modified: false,
        })
    }

    /// Create an empty mirror map for a master of `logical_size` bytes
    pub(crate) fn create_mirror(base: &mut BaseProvider, logical_size: u64) -> Result<Self> {
        let mut game_build = [0u8; 32];
        let build = DEFAULT_BUILD_NUMBER.to_string();
        game_build[..build.len()].copy_from_slice(build.as_bytes());

        let block_count = logical_size.div_ceil(DEFAULT_BLOCK_SIZE as u64);
        let mut map = Self {
            game_build,
            flags: 0,
            logical_size,
            block_size: DEFAULT_BLOCK_SIZE,
            entries: vec![MapEntry::default(); block_count as usize],
            modified: true,
        };
        map.flush(base)?;
        Ok(map)
    }

    /// Write the header and map back into the local file
    pub(crate) fn flush(&mut self, base: &mut BaseProvider) -> Result<()> {
        if !self.modified {
            return Ok(());
        }

        let mut out = Vec::with_capacity(self.map_size() as usize);
        out.extend_from_slice(&PART_VERSION.to_le_bytes());
        out.extend_from_slice(&self.game_build);
        out.extend_from_slice(&self.flags.to_le_bytes());
        out.extend_from_slice(&(self.logical_size as u32).to_le_bytes());
        out.extend_from_slice(&((self.logical_size >> 32) as u32).to_le_bytes());
        out.extend_from_slice(&self.block_size.to_le_bytes());
        for entry in &self.entries {
            out.extend_from_slice(&entry.flags.to_le_bytes());
            out.extend_from_slice(&(entry.offset as u32).to_le_bytes());
            out.extend_from_slice(&((entry.offset >> 32) as u32).to_le_bytes());
            out.extend_from_slice(&[0u8; 8]);
        }

        base.write_at(0, &out)?;
        base.flush()?;
        self.modified = false;
        Ok(())
    }

    pub(crate) fn logical_size(&self) -> u64 {
        self.logical_size
    }

    pub(crate) fn block_size(&self) -> u32 {
        self.block_size
    }

    /// Total size of the header plus map region
    fn map_size(&self) -> u64 {
        PART_HEADER_SIZE + self.entries.len() as u64 * PART_MAP_ENTRY_SIZE
    }

    fn is_present(&self, block_index: u64) -> bool {
        self.entries
            .get(block_index as usize)
            .map(|e| e.flags & BLOCK_PRESENT_FLAGS == BLOCK_PRESENT_FLAGS)
            .unwrap_or(false)
    }

    fn block_len(&self, block_index: u64) -> u64 {
        let start = block_index * self.block_size as u64;
        (self.logical_size - start).min(self.block_size as u64)
    }
}

/// Scheduler adapter borrowing the map, local base, and optional master
pub(crate) struct PartialIo<'a> {
    pub(crate) map: &'a mut PartialMap,
    pub(crate) base: &'a mut BaseProvider,
    pub(crate) master: Option<&'a mut Stream>,
}

impl BlockIo for PartialIo<'_> {
    fn block_size(&self) -> u64 {
        self.map.block_size as u64
    }

    fn stream_size(&self) -> u64 {
        self.map.logical_size
    }

    fn is_complete(&self) -> bool {
        self.map
            .entries
            .iter()
            .all(|e| e.flags & BLOCK_PRESENT_FLAGS == BLOCK_PRESENT_FLAGS)
    }

    fn block_available(&self, block_offset: u64) -> bool {
        self.map.is_present(block_offset / self.block_size())
    }

    fn has_master(&self) -> bool {
        self.master.is_some()
    }

    fn read_run(&mut self, start: u64, end: u64, out: &mut [u8], available: bool) -> Result<()> {
        let block_size = self.block_size();

        if available {
            // Present blocks can live anywhere in the local file; read
            // them one by one through the map.
            let mut position = start;
            let mut at = 0usize;
            while position < end {
                let block_index = position / block_size;
                let len = ((end - position).min(block_size)) as usize;
                let local_offset = self.map.entries[block_index as usize].offset;
                self.base.read_at(local_offset, &mut out[at..at + len])?;
                position += len as u64;
                at += len;
            }
            return Ok(());
        }

        let master = self.master.as_deref_mut().ok_or(Error::FileIncomplete)?;
        master.read(start, out)?;

        // Persist the fetched blocks at the end of the local file
        let mut append_at = self.base.size().max(self.map.map_size());
        let mut position = start;
        let mut at = 0usize;
        while position < end {
            let block_index = position / block_size;
            let len = self.map.block_len(block_index) as usize;
            self.base.write_at(append_at, &out[at..at + len])?;
            self.map.entries[block_index as usize] = MapEntry {
                flags: BLOCK_PRESENT_FLAGS,
                offset: append_at,
            };
            self.map.modified = true;
            append_at += len as u64;
            position += len as u64;
            at += len;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("local.mpq.part");

        let mut base = BaseProvider::create_file(&path).unwrap();
        let map = PartialMap::create_mirror(&mut base, 100_000).unwrap();
        assert_eq!(map.block_size(), DEFAULT_BLOCK_SIZE);
        assert_eq!(map.entries.len(), 7);
        drop(map);

        let mut base = BaseProvider::open_file(&path, false).unwrap();
        let map = PartialMap::load(&mut base).unwrap();
        assert_eq!(map.logical_size(), 100_000);
        assert_eq!(map.entries.len(), 7);
        assert!(!map.is_present(0));
    }

    #[test]
    fn test_reject_non_partial() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plain.bin");
        std::fs::write(&path, vec![0xAAu8; 256]).unwrap();

        let mut base = BaseProvider::open_file(&path, true).unwrap();
        assert!(PartialMap::load(&mut base).is_err());
    }
}
