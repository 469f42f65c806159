//! The per-file write engine
//!
//! Writes are three-phase: `create_file` allocates space and reserves
//! the sector table, `write` streams sectors through compression and
//! encryption, and `finish` lands the sector table, checksums, and the
//! directory entry. `add_file_data` wraps the three phases for callers
//! that have the whole payload in memory.

use super::{sector_count_for, PatchInfo, PATCH_INFO_SIZE};
use crate::archive::Archive;
use crate::compression::{self, is_wave_candidate, methods};
use crate::crypto::{adler32, encrypt_bytes, keys};
use crate::entries::Locale;
use crate::tables::BlockFlags;
use crate::{Error, Result};
use md5::{Digest, Md5};

/// Options for adding a file
#[derive(Debug, Clone)]
pub struct AddFileOptions {
    pub(crate) compression: u8,
    pub(crate) encrypt: bool,
    pub(crate) fix_key: bool,
    pub(crate) single_unit: bool,
    pub(crate) sector_crc: bool,
    pub(crate) patch_file: bool,
    pub(crate) locale: Locale,
    pub(crate) file_time: u64,
    pub(crate) replace_existing: bool,
}

impl AddFileOptions {
    /// Default options: zlib compression, neutral locale, no encryption
    pub fn new() -> Self {
        Self {
            compression: methods::ZLIB,
            encrypt: false,
            fix_key: false,
            single_unit: false,
            sector_crc: false,
            patch_file: false,
            locale: 0,
            file_time: 0,
            replace_existing: true,
        }
    }

    /// Compression method mask; 0 stores the file raw
    pub fn compression(mut self, compression: u8) -> Self {
        self.compression = compression;
        self
    }

    /// Encrypt the file with a key derived from its plain name
    pub fn encrypt(mut self, encrypt: bool) -> Self {
        self.encrypt = encrypt;
        self
    }

    /// Make the key depend on the file's position and size
    pub fn fix_key(mut self, fix_key: bool) -> Self {
        self.fix_key = fix_key;
        if fix_key {
            self.encrypt = true;
        }
        self
    }

    /// Store the file as one blob without a sector table
    pub fn single_unit(mut self, single_unit: bool) -> Self {
        self.single_unit = single_unit;
        self
    }

    /// Append an Adler-32 checksum per sector
    pub fn sector_crc(mut self, sector_crc: bool) -> Self {
        self.sector_crc = sector_crc;
        self
    }

    /// Mark the file as an incremental patch and reserve its header
    pub fn patch_file(mut self, patch_file: bool) -> Self {
        self.patch_file = patch_file;
        self
    }

    /// Locale of this version of the file
    pub fn locale(mut self, locale: Locale) -> Self {
        self.locale = locale;
        self
    }

    /// Windows FILETIME recorded in the attributes sidecar
    pub fn file_time(mut self, file_time: u64) -> Self {
        self.file_time = file_time;
        self
    }

    /// Fail instead of replacing an existing file of the same locale
    pub fn replace_existing(mut self, replace: bool) -> Self {
        self.replace_existing = replace;
        self
    }

    fn flags(&self) -> BlockFlags {
        let mut flags = BlockFlags::EXISTS;
        if self.compression != 0 {
            flags |= BlockFlags::COMPRESS;
        }
        if self.encrypt {
            flags |= BlockFlags::ENCRYPTED;
        }
        if self.fix_key {
            flags |= BlockFlags::FIX_KEY;
        }
        if self.single_unit {
            flags |= BlockFlags::SINGLE_UNIT;
        }
        if self.patch_file {
            flags |= BlockFlags::PATCH_FILE;
        }
        // Sector checksums need a sector table, which only compressed
        // multi-sector files have.
        if self.sector_crc && self.compression != 0 && !self.single_unit {
            flags |= BlockFlags::SECTOR_CRC;
        }
        flags
    }
}

impl Default for AddFileOptions {
    fn default() -> Self {
        Self::new()
    }
}

/// An open file being written
#[derive(Debug)]
pub struct FileWriter<'a> {
    archive: &'a mut Archive,
    name: String,
    flags: BlockFlags,
    locale: Locale,
    file_time: u64,
    /// Entry position, including any patch-info header
    byte_offset: u64,
    /// Start of the sector table / data
    data_offset: u64,
    declared_size: u64,
    sector_size: usize,
    sector_count: usize,
    file_key: u32,
    default_compression: u8,
    /// Codec chosen when the current sector started filling
    sector_codec: u8,
    scratch: Vec<u8>,
    sector_offsets: Vec<u32>,
    checksums: Vec<u32>,
    /// Raw sector bytes written so far, relative to the data region
    raw_written: u64,
    plain_written: u64,
    sectors_emitted: usize,
    first_sector: Vec<u8>,
    crc: crc32fast::Hasher,
    md5: Md5,
    finished: bool,
}

impl Archive {
    /// Add a file from a memory buffer
    pub fn add_file_data(
        &mut self,
        name: &str,
        data: &[u8],
        options: AddFileOptions,
    ) -> Result<()> {
        let mut writer = self.create_file(name, data.len() as u64, options)?;
        writer.write(data, None)?;
        writer.finish()
    }

    /// Add a file from disk under `archive_name`
    pub fn add_file<P: AsRef<std::path::Path>>(
        &mut self,
        path: P,
        archive_name: &str,
        options: AddFileOptions,
    ) -> Result<()> {
        let data = std::fs::read(path)?;
        self.add_file_data(archive_name, &data, options)
    }

    /// Open a file for three-phase writing
    ///
    /// `size` must name the final uncompressed size; it dimensions the
    /// sector table and feeds the key derivation for fix-key files.
    pub fn create_file(
        &mut self,
        name: &str,
        size: u64,
        options: AddFileOptions,
    ) -> Result<FileWriter<'_>> {
        self.ensure_writable()?;
        if name.is_empty() {
            return Err(Error::invalid_parameter("file name is empty"));
        }
        if size > u32::MAX as u64 {
            return Err(Error::invalid_parameter("file larger than 4 GiB"));
        }

        if let Some(existing) = self.find_entry(name, options.locale) {
            let same_locale = self
                .file_table
                .get(existing)
                .map(|e| e.locale == options.locale)
                .unwrap_or(false);
            if same_locale {
                if !options.replace_existing {
                    return Err(Error::AlreadyExists(name.to_string()));
                }
                self.delete_entry(existing);
                self.dirty = true;
            }
        }

        // Make sure the hash table has room before any bytes move
        if let Some(hash) = &self.hash_table {
            if hash.find_insert_slot(name, options.locale).is_none() {
                return Err(Error::CannotComplete(
                    "hash table is full; raise the file limit first".to_string(),
                ));
            }
        }

        let flags = options.flags();
        let byte_offset = self
            .file_table
            .find_free_space(self.data_start(), self.header.raw_chunk_size);
        let sector_size = self.sector_size();
        let single_unit = flags.contains(BlockFlags::SINGLE_UNIT);
        let sector_count = if single_unit {
            1
        } else {
            sector_count_for(size, sector_size)
        };

        let mut data_offset = byte_offset;
        if flags.contains(BlockFlags::PATCH_FILE) {
            let info = PatchInfo {
                length: PATCH_INFO_SIZE as u32,
                flags: 0x8000_0000,
                data_size: size as u32,
                md5: [0; 16],
            };
            self.write_raw(byte_offset, &info.to_bytes())?;
            data_offset += PATCH_INFO_SIZE as u64;
        }

        let file_key = if flags.contains(BlockFlags::ENCRYPTED) {
            keys::file_key(name, byte_offset, size as u32, flags.contains(BlockFlags::FIX_KEY))
        } else {
            0
        };

        let mut writer = FileWriter {
            archive: self,
            name: name.to_string(),
            flags,
            locale: options.locale,
            file_time: options.file_time,
            byte_offset,
            data_offset,
            declared_size: size,
            sector_size,
            sector_count,
            file_key,
            default_compression: options.compression,
            sector_codec: options.compression,
            scratch: Vec::with_capacity(sector_size),
            sector_offsets: Vec::new(),
            checksums: Vec::new(),
            raw_written: 0,
            plain_written: 0,
            sectors_emitted: 0,
            first_sector: Vec::new(),
            crc: crc32fast::Hasher::new(),
            md5: Md5::new(),
            finished: false,
        };

        // Reserve the sector table region with zeros
        if writer.has_sector_table() {
            let table_len = writer.sector_table_len();
            let zeros = vec![0u8; table_len];
            let offset = writer.data_offset;
            writer.archive.write_raw(offset, &zeros)?;
            writer.raw_written = table_len as u64;
            writer.sector_offsets.push(table_len as u32);
        }

        Ok(writer)
    }
}

impl FileWriter<'_> {
    fn has_sector_table(&self) -> bool {
        self.flags.is_compressed() && !self.flags.contains(BlockFlags::SINGLE_UNIT)
    }

    fn sector_table_len(&self) -> usize {
        let mut entries = self.sector_count + 1;
        if self.flags.contains(BlockFlags::SECTOR_CRC) {
            entries += 1;
        }
        entries * 4
    }

    /// The capacity of one logical sector; the whole file for
    /// single-unit storage
    fn sector_capacity(&self) -> usize {
        if self.flags.contains(BlockFlags::SINGLE_UNIT) {
            self.declared_size as usize
        } else {
            self.sector_size
        }
    }

    /// Append payload bytes, optionally overriding the codec for
    /// sectors that start within this call
    pub fn write(&mut self, data: &[u8], codec: Option<u8>) -> Result<()> {
        if self.finished {
            return Err(Error::InvalidHandle);
        }
        if self.plain_written + data.len() as u64 > self.declared_size {
            return Err(Error::invalid_parameter(
                "more data than the declared file size",
            ));
        }

        let mut remaining = data;
        while !remaining.is_empty() {
            if self.scratch.is_empty() {
                // A fresh sector adopts the codec in effect now
                self.sector_codec = codec.unwrap_or(self.default_compression);
            }

            let room = self.sector_capacity() - self.scratch.len();
            let take = room.min(remaining.len());
            self.scratch.extend_from_slice(&remaining[..take]);
            remaining = &remaining[take..];

            if self.scratch.len() == self.sector_capacity() && !self.scratch.is_empty() {
                self.emit_sector()?;
            }
        }

        self.plain_written += data.len() as u64;
        self.crc.update(data);
        self.md5.update(data);
        Ok(())
    }

    /// Compress, encrypt, and write out the buffered sector
    fn emit_sector(&mut self) -> Result<()> {
        let plain = std::mem::take(&mut self.scratch);
        let index = self.sectors_emitted;

        if index == 0 {
            // Kept for the WAVE check that gates lossy codecs
            self.first_sector = plain.clone();
        }

        let codec = self.effective_codec(index);
        let mut stored = if codec != 0 && self.flags.is_compressed() {
            compression::compress(&plain, codec)?
        } else {
            plain.clone()
        };
        if stored.len() >= plain.len() {
            stored = plain.clone();
        }

        if self.flags.contains(BlockFlags::SECTOR_CRC) {
            self.checksums.push(adler32(&stored));
        }

        if self.flags.contains(BlockFlags::ENCRYPTED) {
            encrypt_bytes(&mut stored, self.file_key.wrapping_add(index as u32));
        }

        let at = if self.has_sector_table() {
            self.data_offset + self.raw_written
        } else {
            // No table: every sector sits at its natural position
            self.data_offset + (index * self.sector_size) as u64
        };
        self.archive.write_raw(at, &stored)?;

        self.raw_written += stored.len() as u64;
        self.sectors_emitted += 1;
        if self.has_sector_table() {
            self.sector_offsets.push(self.raw_written as u32);
        }
        Ok(())
    }

    /// Resolve the codec for a sector, substituting a lossless one when
    /// the lossy chain is not applicable
    fn effective_codec(&self, sector_index: usize) -> u8 {
        let codec = self.sector_codec;
        if codec & methods::LOSSY == 0 || codec == methods::LZMA {
            return codec;
        }

        let channels = if codec & methods::ADPCM_STEREO != 0 { 2 } else { 1 };
        let wave_ok = if sector_index == 0 {
            false
        } else {
            is_wave_candidate(&self.first_sector, channels)
        };
        let single_unit = self.flags.contains(BlockFlags::SINGLE_UNIT);

        if wave_ok && !single_unit {
            codec
        } else {
            // Lossy compression is only safe on WAVE payload sectors
            log::debug!(
                "substituting lossless compression for sector {} of {}",
                sector_index,
                self.name
            );
            (codec & !methods::LOSSY) | methods::ZLIB
        }
    }

    /// Complete the file: flush the tail sector, write the sector table
    /// and checksums, and publish the directory entry
    pub fn finish(mut self) -> Result<()> {
        if self.finished {
            return Err(Error::InvalidHandle);
        }
        self.finished = true;

        if !self.scratch.is_empty() {
            self.emit_sector()?;
        }

        if self.plain_written != self.declared_size {
            return Err(Error::invalid_parameter(format!(
                "wrote {} of {} declared bytes",
                self.plain_written, self.declared_size
            )));
        }

        if self.has_sector_table() {
            // Degenerate empty files still carry the end marker
            while self.sector_offsets.len() < self.sector_count + 1 {
                let last = *self.sector_offsets.last().unwrap();
                self.sector_offsets.push(last);
            }

            // The checksum sector: compressed when that helps, never
            // encrypted.
            if self.flags.contains(BlockFlags::SECTOR_CRC) {
                let mut plain = Vec::with_capacity(self.checksums.len() * 4);
                for &checksum in &self.checksums {
                    plain.extend_from_slice(&checksum.to_le_bytes());
                }
                let stored = compression::compress(&plain, methods::ZLIB)?;
                let at = self.data_offset + self.raw_written;
                self.archive.write_raw(at, &stored)?;
                self.raw_written += stored.len() as u64;
                self.sector_offsets.push(self.raw_written as u32);
            }

            let mut table = Vec::with_capacity(self.sector_offsets.len() * 4);
            for &offset in &self.sector_offsets {
                table.extend_from_slice(&offset.to_le_bytes());
            }
            if self.flags.contains(BlockFlags::ENCRYPTED) {
                encrypt_bytes(&mut table, self.file_key.wrapping_sub(1));
            }
            let offset = self.data_offset;
            self.archive.write_raw(offset, &table)?;
        }

        let md5: [u8; 16] = self.md5.clone().finalize().into();
        let crc32 = self.crc.clone().finalize();

        if self.flags.contains(BlockFlags::PATCH_FILE) {
            let info = PatchInfo {
                length: PATCH_INFO_SIZE as u32,
                flags: 0x8000_0000,
                data_size: self.declared_size as u32,
                md5,
            };
            let offset = self.byte_offset;
            self.archive.write_raw(offset, &info.to_bytes())?;
        }

        let patch_len = if self.flags.contains(BlockFlags::PATCH_FILE) {
            PATCH_INFO_SIZE as u64
        } else {
            0
        };
        let compressed_size = (patch_len + self.raw_written) as u32;

        // Trailing raw-chunk digests when the archive keeps them
        if self.archive.header.raw_chunk_size != 0 {
            self.write_raw_chunk_md5s(compressed_size)?;
        }

        // Publish the entry
        let index = self.archive.file_table.allocate();
        let hash_slot = match self.archive.hash_table.as_mut() {
            Some(hash) => Some(hash.insert(&self.name, self.locale, index)? as u32),
            None => None,
        };
        let name_hash = match self.archive.het_table.as_ref() {
            Some(het) => Some(het.fold(&self.name)),
            None => None,
        };
        if let Some(folded) = name_hash {
            self.archive.het_insert(folded, index)?;
        }

        let entry = self.archive.file_table.get_mut(index).unwrap();
        entry.byte_offset = self.byte_offset;
        entry.file_size = self.declared_size as u32;
        entry.compressed_size = compressed_size;
        entry.flags = self.flags;
        entry.locale = self.locale;
        entry.platform = 0;
        entry.hash_index = hash_slot;
        entry.name_hash = name_hash;
        entry.name = Some(self.name.clone());
        entry.crc32 = Some(crc32);
        entry.md5 = Some(md5);
        entry.file_time = if self.file_time != 0 {
            Some(self.file_time)
        } else {
            None
        };

        self.archive.dirty = true;
        Ok(())
    }

    /// MD5 digests over the raw stored bytes, one per raw chunk
    fn write_raw_chunk_md5s(&mut self, compressed_size: u32) -> Result<()> {
        let chunk_size = self.archive.header.raw_chunk_size as usize;
        let mut digests = Vec::new();

        let mut remaining = compressed_size as usize;
        let mut at = self.byte_offset;
        while remaining > 0 {
            let take = remaining.min(chunk_size);
            let mut chunk = vec![0u8; take];
            self.archive.read_raw(at, &mut chunk)?;
            let digest: [u8; 16] = Md5::digest(&chunk).into();
            digests.extend_from_slice(&digest);
            at += take as u64;
            remaining -= take;
        }

        self.archive
            .write_raw(self.byte_offset + compressed_size as u64, &digests)
    }
}
