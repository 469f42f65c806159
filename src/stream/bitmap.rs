//! Flat-bitmap overlay: a sparse local copy with a `ptv3` footer
//!
//! The local file is the archive itself with holes where blocks have not
//! been downloaded yet, followed by a bit-per-block bitmap and a 24-byte
//! footer. Fetched blocks are written straight into their natural
//! position, so a completed file is byte-identical to the master plus
//! the trailing bitmap.

use super::base::BaseProvider;
use super::block::BlockIo;
use super::Stream;
use crate::{Error, Result};

/// 'ptv3'
const BITMAP_FOOTER_SIGNATURE: u32 = 0x33767470;
const BITMAP_FOOTER_SIZE: u64 = 24;
const BITMAP_VERSION: u32 = 3;
const DEFAULT_BLOCK_SIZE: u32 = 0x4000;
const DEFAULT_BUILD_NUMBER: u32 = 10958;

/// In-memory form of the trailing block bitmap
#[derive(Debug)]
pub(crate) struct BitmapMap {
    build_number: u32,
    data_size: u64,
    block_size: u32,
    bitmap: Vec<u8>,
    modified: bool,
}

impl BitmapMap {
    /// Probe for and parse the footer of an existing local file
    pub(crate) fn load(base: &mut BaseProvider) -> Result<Self> {
        let file_size = base.size();
        if file_size <= BITMAP_FOOTER_SIZE {
            return Err(Error::bad_format("file too small for a bitmap footer"));
        }

        let mut footer = [0u8; BITMAP_FOOTER_SIZE as usize];
        base.read_at(file_size - BITMAP_FOOTER_SIZE, &mut footer)?;

        let signature = u32::from_le_bytes(footer[0..4].try_into().unwrap());
        let version = u32::from_le_bytes(footer[4..8].try_into().unwrap());
        let build_number = u32::from_le_bytes(footer[8..12].try_into().unwrap());
        let map_offset_lo = u32::from_le_bytes(footer[12..16].try_into().unwrap());
        let map_offset_hi = u32::from_le_bytes(footer[16..20].try_into().unwrap());
        let block_size = u32::from_le_bytes(footer[20..24].try_into().unwrap());

        if signature != BITMAP_FOOTER_SIGNATURE || version != BITMAP_VERSION {
            return Err(Error::bad_format("no bitmap footer present"));
        }
        if block_size == 0 || !block_size.is_power_of_two() {
            return Err(Error::bad_format("bitmap footer block size invalid"));
        }

        let data_size = ((map_offset_hi as u64) << 32) | map_offset_lo as u64;
        let bitmap_size = data_size.div_ceil(block_size as u64).div_ceil(8);

        // The bitmap sits between the data region and the footer
        if data_size + bitmap_size + BITMAP_FOOTER_SIZE != file_size {
            return Err(Error::bad_format("bitmap footer does not match file size"));
        }

        let mut bitmap = vec![0u8; bitmap_size as usize];
        base.read_at(data_size, &mut bitmap)?;

        Ok(Self {
            build_number,
            data_size,
            block_size,
            bitmap,
            modified: false,
        })
    }

    /// Create an all-missing mirror sized for a master of `data_size` bytes
    pub(crate) fn create_mirror(base: &mut BaseProvider, data_size: u64) -> Result<Self> {
        let block_size = DEFAULT_BLOCK_SIZE;
        let bitmap_size = data_size.div_ceil(block_size as u64).div_ceil(8);

        base.set_size(data_size + bitmap_size + BITMAP_FOOTER_SIZE)?;

        let mut map = Self {
            build_number: DEFAULT_BUILD_NUMBER,
            data_size,
            block_size,
            bitmap: vec![0u8; bitmap_size as usize],
            modified: true,
        };
        map.flush(base)?;
        Ok(map)
    }

    /// Write the bitmap and footer back into the local file
    pub(crate) fn flush(&mut self, base: &mut BaseProvider) -> Result<()> {
        if !self.modified {
            return Ok(());
        }

        base.write_at(self.data_size, &self.bitmap)?;

        let mut footer = Vec::with_capacity(BITMAP_FOOTER_SIZE as usize);
        footer.extend_from_slice(&BITMAP_FOOTER_SIGNATURE.to_le_bytes());
        footer.extend_from_slice(&BITMAP_VERSION.to_le_bytes());
        footer.extend_from_slice(&self.build_number.to_le_bytes());
        footer.extend_from_slice(&(self.data_size as u32).to_le_bytes());
        footer.extend_from_slice(&((self.data_size >> 32) as u32).to_le_bytes());
        footer.extend_from_slice(&self.block_size.to_le_bytes());
        base.write_at(self.data_size + self.bitmap.len() as u64, &footer)?;

        base.flush()?;
        self.modified = false;
        Ok(())
    }

    pub(crate) fn logical_size(&self) -> u64 {
        self.data_size
    }

    fn is_present(&self, block_index: u64) -> bool {
        let byte = (block_index / 8) as usize;
        let bit = (block_index % 8) as u32;
        self.bitmap
            .get(byte)
            .map(|&b| b & (1 << bit) != 0)
            .unwrap_or(false)
    }

    fn mark_present(&mut self, block_index: u64) {
        let byte = (block_index / 8) as usize;
        let bit = (block_index % 8) as u32;
        self.bitmap[byte] |= 1 << bit;
        self.modified = true;
    }
}

/// Scheduler adapter borrowing the bitmap, local base, and optional master
pub(crate) struct BitmapIo<'a> {
    pub(crate) map: &'a mut BitmapMap,
    pub(crate) base: &'a mut BaseProvider,
    pub(crate) master: Option<&'a mut Stream>,
}

impl BlockIo for BitmapIo<'_> {
    fn block_size(&self) -> u64 {
        self.map.block_size as u64
    }

    fn stream_size(&self) -> u64 {
        self.map.data_size
    }

    fn is_complete(&self) -> bool {
        let block_count = self.map.data_size.div_ceil(self.map.block_size as u64);
        (0..block_count).all(|i| self.map.is_present(i))
    }

    fn block_available(&self, block_offset: u64) -> bool {
        self.map.is_present(block_offset / self.block_size())
    }

    fn has_master(&self) -> bool {
        self.master.is_some()
    }

    fn read_run(&mut self, start: u64, end: u64, out: &mut [u8], available: bool) -> Result<()> {
        if available {
            return self.base.read_at(start, out);
        }

        let master = self.master.as_deref_mut().ok_or(Error::FileIncomplete)?;
        master.read(start, out)?;

        // The data region mirrors the master, so fetched bytes land at
        // their own offset and only the bitmap needs updating.
        self.base.write_at(start, out)?;
        let block_size = self.block_size();
        let mut block = start / block_size;
        while block * block_size < end {
            self.map.mark_present(block);
            block += 1;
        }

        Ok(())
    }
}
