//! MPQ archive handling
//!
//! The archive handle owns one stream, the normalized header, and the
//! unified file table. The classic hash table is maintained
//! incrementally across mutations; the HET/BET pair is rebuilt from the
//! file table whenever the archive is flushed, because its layout
//! depends on the entry count.

use crate::attributes::{AttributeFlags, Attributes};
use crate::entries::{FileEntry, FileInfo, FileTable, Locale};
use crate::file::AddFileOptions;
use crate::header::{self, FormatVersion, Header, UserData};
use crate::special_files::{build_listfile, parse_listfile};
use crate::stream::{Stream, StreamFlags};
use crate::tables::het::DEFAULT_NAME_HASH_BITS;
use crate::tables::{
    block_table, hash_table, BetRecord, BetTable, BlockEntry, BlockFlags, BlockTable, HashTable,
    HetTable, HiBlockTable,
};
use crate::{compression, Error, Result};
use md5::{Digest, Md5};
use std::path::Path;

/// Options for opening MPQ archives
#[derive(Debug, Clone)]
pub struct OpenOptions {
    read_only: bool,
    load_listfile: bool,
    load_attributes: bool,
    use_mmap: bool,
}

impl OpenOptions {
    /// Create new default options
    pub fn new() -> Self {
        Self {
            read_only: false,
            load_listfile: true,
            load_attributes: true,
            use_mmap: false,
        }
    }

    /// Refuse every mutation on the opened archive
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Skip reading the (listfile); entries stay nameless
    pub fn load_listfile(mut self, load: bool) -> Self {
        self.load_listfile = load;
        self
    }

    /// Skip reading the (attributes) sidecar
    pub fn load_attributes(mut self, load: bool) -> Self {
        self.load_attributes = load;
        self
    }

    /// Prefer a memory map for the base provider (forces read-only)
    pub fn use_mmap(mut self, use_mmap: bool) -> Self {
        self.use_mmap = use_mmap;
        self
    }

    /// Open an archive at a filesystem path
    pub fn open<P: AsRef<Path>>(self, path: P) -> Result<Archive> {
        self.open_url(&path.as_ref().display().to_string())
    }

    /// Open an archive from a stream provider URL
    pub fn open_url(self, url: &str) -> Result<Archive> {
        let mut flags = StreamFlags::empty();
        if self.read_only || self.use_mmap {
            flags |= StreamFlags::READ_ONLY;
        }
        if self.use_mmap {
            flags |= StreamFlags::USE_MMAP;
        }
        let stream = Stream::open(url, flags)?;
        Archive::from_stream(stream, self)
    }
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self::new()
    }
}

/// Options for creating new MPQ archives
#[derive(Debug, Clone)]
pub struct CreateOptions {
    version: FormatVersion,
    sector_size_shift: u16,
    hash_table_size: u32,
    listfile: bool,
    attributes: Option<AttributeFlags>,
    signature: bool,
    raw_chunk_size: u32,
}

impl CreateOptions {
    /// Create new default options: v1, 4 KiB sectors, 16-slot hash table
    pub fn new() -> Self {
        Self {
            version: FormatVersion::V1,
            sector_size_shift: 3,
            hash_table_size: 16,
            listfile: true,
            attributes: Some(AttributeFlags::CRC32 | AttributeFlags::FILETIME | AttributeFlags::MD5),
            signature: false,
            raw_chunk_size: 0,
        }
    }

    /// Target MPQ format version
    pub fn version(mut self, version: FormatVersion) -> Self {
        self.version = version;
        self
    }

    /// Sector size shift; sector bytes = 512 << shift
    pub fn sector_size_shift(mut self, shift: u16) -> Self {
        self.sector_size_shift = shift;
        self
    }

    /// Hash table slot count; rounded up to a power of two
    pub fn hash_table_size(mut self, size: u32) -> Self {
        self.hash_table_size = size.next_power_of_two().max(4);
        self
    }

    /// Whether to maintain a (listfile)
    pub fn listfile(mut self, listfile: bool) -> Self {
        self.listfile = listfile;
        self
    }

    /// Which (attributes) columns to maintain, or none
    pub fn attributes(mut self, attributes: Option<AttributeFlags>) -> Self {
        self.attributes = attributes;
        self
    }

    /// Reserve and fill a weak (signature) file at flush time
    pub fn signature(mut self, signature: bool) -> Self {
        self.signature = signature;
        self
    }

    /// Raw-chunk MD5 coverage (v4); 0 disables it
    pub fn raw_chunk_size(mut self, size: u32) -> Self {
        self.raw_chunk_size = size;
        self
    }

    /// Create a new archive file, truncating any existing one
    pub fn create<P: AsRef<Path>>(self, path: P) -> Result<Archive> {
        let stream = Stream::create(path.as_ref())?;
        Archive::create_on_stream(stream, self)
    }
}

impl Default for CreateOptions {
    fn default() -> Self {
        Self::new()
    }
}

/// An MPQ archive
#[derive(Debug)]
pub struct Archive {
    pub(crate) stream: Stream,
    /// Absolute offset of the MPQ header within the stream
    pub(crate) archive_offset: u64,
    pub(crate) header: Header,
    user_data: Option<UserData>,
    pub(crate) file_table: FileTable,
    pub(crate) hash_table: Option<HashTable>,
    pub(crate) het_table: Option<HetTable>,
    pub(crate) attribute_flags: Option<AttributeFlags>,
    has_listfile: bool,
    has_signature: bool,
    pub(crate) dirty: bool,
    read_only: bool,
    /// Patch archive chain; the base owns the links
    pub(crate) patch: Option<Box<Archive>>,
    pub(crate) patch_prefix: String,
}

impl Archive {
    /// Open an existing MPQ archive with default options
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        OpenOptions::new().open(path)
    }

    /// Open an archive from a stream provider URL with default options
    pub fn open_url(url: &str) -> Result<Self> {
        OpenOptions::new().open_url(url)
    }

    /// Create a new archive with default options
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        CreateOptions::new().create(path)
    }

    fn from_stream(mut stream: Stream, options: OpenOptions) -> Result<Self> {
        let file_size = stream.size();
        let (archive_offset, user_data, header) = header::find_header(&mut stream)?;

        let read_only = options.read_only
            || options.use_mmap
            || stream.is_read_only()
            || header.malformed;

        // HET/BET load first; they are authoritative when present
        let mut het_table = None;
        let mut bet_table = None;
        if header.het_table_pos != 0 && header.het_table_size_64 != 0 {
            het_table = Some(HetTable::read(
                &mut stream,
                archive_offset + header.het_table_pos,
                header.het_table_size_64 as usize,
                hash_table::table_key(),
            )?);
        }
        if header.bet_table_pos != 0 && header.bet_table_size_64 != 0 {
            bet_table = Some(BetTable::read(
                &mut stream,
                archive_offset + header.bet_table_pos,
                header.bet_table_size_64 as usize,
                block_table::table_key(),
            )?);
        }

        // Only v4 compresses the classic tables; older versions'
        // computed gap sizes are advisory and truncation is handled by
        // the table readers themselves.
        let hash_real = header.hash_table_size as usize * 16;
        let block_real = header.block_table_size as usize * 16;
        let (hash_on_disk, block_on_disk) = if header.format_version >= FormatVersion::V4 {
            (
                (header.hash_table_size_64 as usize).max(1).min(hash_real.max(1)),
                (header.block_table_size_64 as usize).max(1).min(block_real.max(1)),
            )
        } else {
            (hash_real, block_real)
        };

        let mut hash_table = None;
        let mut block = None;
        let mut hi_block = None;
        if header.hash_table_pos != 0 && header.hash_table_size != 0 {
            hash_table = Some(HashTable::read(
                &mut stream,
                archive_offset + header.hash_table_pos,
                header.hash_table_size,
                hash_on_disk,
            )?);
        }
        if header.block_table_pos != 0 && header.block_table_size != 0 {
            block = Some(BlockTable::read(
                &mut stream,
                archive_offset + header.block_table_pos,
                header.block_table_size,
                block_on_disk,
            )?);
        }
        if header.hi_block_table_pos != 0 {
            hi_block = Some(HiBlockTable::read(
                &mut stream,
                archive_offset + header.hi_block_table_pos,
                header.block_table_size,
            )?);
        }

        let file_table = FileTable::from_tables(
            &header,
            hash_table.as_ref(),
            block.as_ref(),
            hi_block.as_ref(),
            het_table.as_ref(),
            bet_table.as_ref(),
        )?;

        // Entries must stay within the file
        for index in file_table.live_indices().collect::<Vec<_>>() {
            let entry = file_table.get(index).unwrap();
            if archive_offset + entry.byte_offset + entry.compressed_size as u64 > file_size {
                return Err(Error::corrupt(format!(
                    "entry {} extends past end of archive",
                    index
                )));
            }
        }

        let mut archive = Self {
            stream,
            archive_offset,
            header,
            user_data,
            file_table,
            hash_table,
            het_table,
            attribute_flags: None,
            has_listfile: false,
            has_signature: false,
            dirty: false,
            read_only,
            patch: None,
            patch_prefix: String::new(),
        };

        // Internal files resolve names and metadata for everything else
        archive.name_internal_files();
        if options.load_listfile {
            archive.load_listfile()?;
        }
        if options.load_attributes {
            archive.load_attributes()?;
        }
        archive.has_signature = archive.find_entry(crate::SIGNATURE_NAME, 0).is_some();

        Ok(archive)
    }

    fn create_on_stream(stream: Stream, options: CreateOptions) -> Result<Self> {
        let mut header = Header::new(options.version, options.sector_size_shift);
        header.hash_table_size = options.hash_table_size;
        if options.version >= FormatVersion::V4 {
            header.raw_chunk_size = options.raw_chunk_size;
        }

        let het_table = if options.version >= FormatVersion::V3 {
            Some(HetTable::new(0, DEFAULT_NAME_HASH_BITS))
        } else {
            None
        };

        let mut archive = Self {
            stream,
            archive_offset: 0,
            header,
            user_data: None,
            file_table: FileTable::new(),
            hash_table: Some(HashTable::new(options.hash_table_size as usize)?),
            het_table,
            attribute_flags: options.attributes,
            has_listfile: options.listfile,
            has_signature: options.signature,
            dirty: true,
            read_only: false,
            patch: None,
            patch_prefix: String::new(),
        };

        archive.flush()?;
        Ok(archive)
    }

    /// Get the archive header
    pub fn header(&self) -> &Header {
        &self.header
    }

    /// Get the user data preamble if present
    pub fn user_data(&self) -> Option<&UserData> {
        self.user_data.as_ref()
    }

    /// Absolute offset of the MPQ header within the stream
    pub fn archive_offset(&self) -> u64 {
        self.archive_offset
    }

    /// Local path of the archive, when it has one
    pub fn path(&self) -> Option<&Path> {
        self.stream.path()
    }

    /// True when mutations are refused
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Number of live files, internal files included
    pub fn file_count(&self) -> usize {
        self.file_table.live_count()
    }

    /// Directory listing of every live entry
    pub fn list(&self) -> Vec<FileInfo> {
        self.file_table.list()
    }

    /// True when the archive contains `name` under any locale
    pub fn has_file(&self, name: &str) -> bool {
        self.find_entry_any_locale(name).is_some()
    }

    /// Information about one file
    pub fn file_info(&self, name: &str) -> Result<FileInfo> {
        let index = self
            .find_entry_any_locale(name)
            .ok_or_else(|| Error::NotFound(name.to_string()))?;
        let entry = self.file_table.get(index).unwrap();
        Ok(FileInfo {
            name: entry.name.clone().unwrap_or_else(|| name.to_string()),
            index,
            file_pos: entry.byte_offset,
            file_size: entry.file_size,
            compressed_size: entry.compressed_size,
            flags: entry.flags,
            locale: entry.locale,
            crc32: entry.crc32,
            file_time: entry.file_time,
        })
    }

    /// Grow the file table to hold at least `count` files
    ///
    /// Rebuilds the classic hash table, which requires every entry's
    /// name to be known.
    pub fn set_max_file_count(&mut self, count: u32) -> Result<()> {
        self.ensure_writable()?;
        if !self.file_table.all_names_known() {
            return Err(Error::UnknownFileNames);
        }
        let new_size = count.next_power_of_two().max(4);
        if new_size < self.file_table.live_count() as u32 {
            return Err(Error::invalid_parameter(
                "new file count below current file count",
            ));
        }

        let mut new_table = HashTable::new(new_size as usize)?;
        for index in self.file_table.live_indices().collect::<Vec<_>>() {
            let entry = self.file_table.get(index).unwrap();
            let name = entry.name.clone().unwrap();
            let locale = entry.locale;
            let slot = new_table.insert(&name, locale, index)?;
            self.file_table.get_mut(index).unwrap().hash_index = Some(slot as u32);
        }

        self.header.hash_table_size = new_size;
        self.hash_table = Some(new_table);
        self.dirty = true;
        Ok(())
    }

    pub(crate) fn set_signature_flag(&mut self, enabled: bool) {
        self.has_signature = enabled;
    }

    /// Insert into the runtime HET table, rebuilding it larger when the
    /// probe space is exhausted
    ///
    /// Every live entry carries its folded hash whenever a HET table
    /// exists, so a rebuild never needs file names.
    pub(crate) fn het_insert(
        &mut self,
        folded: crate::tables::het::FoldedHash,
        index: u32,
    ) -> Result<()> {
        let Some(het) = self.het_table.as_mut() else {
            return Ok(());
        };
        if het.insert(folded, index).is_ok() {
            return Ok(());
        }

        let bit_size = het.name_hash_bit_size;
        let mut rebuilt = HetTable::new(self.file_table.capacity() as u32 + 8, bit_size);
        for live in self.file_table.live_indices().collect::<Vec<_>>() {
            if live == index {
                continue;
            }
            if let Some(existing) = self.file_table.get(live).and_then(|e| e.name_hash) {
                rebuilt.insert(existing, live)?;
            }
        }
        rebuilt.insert(folded, index)?;
        self.het_table = Some(rebuilt);
        Ok(())
    }

    pub(crate) fn ensure_writable(&self) -> Result<()> {
        if self.read_only {
            return Err(Error::AccessDenied("archive is read-only".to_string()));
        }
        Ok(())
    }

    /// First byte of file data, relative to the archive start
    pub(crate) fn data_start(&self) -> u64 {
        self.header.format_version.header_size() as u64
    }

    /// Sector size in bytes
    pub(crate) fn sector_size(&self) -> usize {
        self.header.sector_size()
    }

    /// Read raw bytes at an archive-relative offset
    pub(crate) fn read_raw(&mut self, mpq_offset: u64, buf: &mut [u8]) -> Result<()> {
        self.stream.read(self.archive_offset + mpq_offset, buf)
    }

    /// Write raw bytes at an archive-relative offset
    pub(crate) fn write_raw(&mut self, mpq_offset: u64, data: &[u8]) -> Result<()> {
        self.stream.write(self.archive_offset + mpq_offset, data)
    }

    // ---- lookup -----------------------------------------------------

    /// Find a file entry by name, preferring `locale`, falling back to
    /// the neutral locale
    pub(crate) fn find_entry(&self, name: &str, locale: Locale) -> Option<u32> {
        // The HET table has no locale dimension; it wins when present
        if let Some(het) = &self.het_table {
            let folded = het.fold(name);
            for candidate in het.candidates(folded) {
                if let Some(entry) = self.file_table.get(candidate) {
                    if entry.exists()
                        && entry
                            .name_hash
                            .map(|h| h.remainder() == folded.remainder())
                            .unwrap_or(false)
                    {
                        return Some(candidate);
                    }
                }
            }
        }

        if let Some(hash) = &self.hash_table {
            if let Some(slot) = hash.find(name, locale) {
                let index = hash.get(slot).unwrap().block_index;
                if self.file_table.get(index).map(|e| e.exists()).unwrap_or(false) {
                    return Some(index);
                }
            }
        }

        None
    }

    /// Find a file entry by name under any locale
    pub(crate) fn find_entry_any_locale(&self, name: &str) -> Option<u32> {
        if let Some(index) = self.find_entry(name, 0) {
            return Some(index);
        }
        if let Some(hash) = &self.hash_table {
            if let Some(slot) = hash.find_any_locale(name) {
                let index = hash.get(slot).unwrap().block_index;
                if self.file_table.get(index).map(|e| e.exists()).unwrap_or(false) {
                    return Some(index);
                }
            }
        }
        None
    }

    /// Assign `name` to every entry it hashes to
    fn assign_name(&mut self, name: &str) {
        if let Some(het) = &self.het_table {
            let folded = het.fold(name);
            for candidate in het.candidates(folded) {
                if let Some(entry) = self.file_table.get_mut(candidate) {
                    if entry.exists()
                        && entry
                            .name_hash
                            .map(|h| h.remainder() == folded.remainder())
                            .unwrap_or(false)
                    {
                        entry.name = Some(name.to_string());
                    }
                }
            }
        }

        if let Some(hash) = self.hash_table.as_ref() {
            // Collect every slot for this name, whatever the locale
            let mut matches = Vec::new();
            let name_a = crate::crypto::hash_string(name, crate::crypto::hash_type::NAME_A);
            let name_b = crate::crypto::hash_string(name, crate::crypto::hash_type::NAME_B);
            for raw in hash.entries() {
                if raw.is_valid() && raw.name_a == name_a && raw.name_b == name_b {
                    matches.push(raw.block_index);
                }
            }
            for index in matches {
                if let Some(entry) = self.file_table.get_mut(index) {
                    if entry.exists() {
                        entry.name = Some(name.to_string());
                    }
                }
            }
        }
    }

    fn name_internal_files(&mut self) {
        for name in [
            crate::LISTFILE_NAME,
            crate::ATTRIBUTES_NAME,
            crate::SIGNATURE_NAME,
        ] {
            self.assign_name(name);
        }
    }

    fn load_listfile(&mut self) -> Result<()> {
        if self.find_entry(crate::LISTFILE_NAME, 0).is_none() {
            return Ok(());
        }
        match self.read_file(crate::LISTFILE_NAME) {
            Ok(data) => {
                for name in parse_listfile(&data)? {
                    self.assign_name(&name);
                }
                self.has_listfile = true;
                Ok(())
            }
            Err(e) => {
                log::warn!("failed to read (listfile): {}", e);
                Ok(())
            }
        }
    }

    fn load_attributes(&mut self) -> Result<()> {
        if self.find_entry(crate::ATTRIBUTES_NAME, 0).is_none() {
            return Ok(());
        }
        match self.read_file(crate::ATTRIBUTES_NAME) {
            Ok(data) => match Attributes::parse(&data, self.file_table.capacity()) {
                Ok(attributes) => {
                    attributes.apply(&mut self.file_table);
                    self.attribute_flags = Some(attributes.flags);
                    Ok(())
                }
                Err(e) => {
                    log::warn!("ignoring malformed (attributes): {}", e);
                    Ok(())
                }
            },
            Err(e) => {
                log::warn!("failed to read (attributes): {}", e);
                Ok(())
            }
        }
    }

    /// Add an external list of file names, resolving nameless entries
    pub fn add_listfile_names(&mut self, data: &[u8]) -> Result<usize> {
        let names = parse_listfile(data)?;
        let count = names.len();
        for name in names {
            self.assign_name(&name);
        }
        Ok(count)
    }

    // ---- mutation ---------------------------------------------------

    /// Rename a file, re-encrypting its data when the key depends on
    /// the name
    pub fn rename_file(&mut self, old_name: &str, new_name: &str) -> Result<()> {
        self.ensure_writable()?;
        if self.find_entry_any_locale(new_name).is_some() {
            return Err(Error::AlreadyExists(new_name.to_string()));
        }
        let index = self
            .find_entry_any_locale(old_name)
            .ok_or_else(|| Error::NotFound(old_name.to_string()))?;
        if crate::is_internal_file_name(old_name) {
            return Err(Error::InternalFile(old_name.to_string()));
        }

        // Encrypted data is keyed off the plain name, so renaming always
        // re-encrypts, even when the two keys would coincide.
        let entry = self.file_table.get(index).unwrap().clone();
        if entry.flags.contains(BlockFlags::ENCRYPTED) {
            self.reencrypt_file(index, old_name, new_name)?;
        }

        let locale = entry.locale;
        if let Some(slot) = entry.hash_index {
            if let Some(hash) = self.hash_table.as_mut() {
                hash.delete(slot as usize);
            }
        }
        let new_slot = match self.hash_table.as_mut() {
            Some(hash) => Some(hash.insert(new_name, locale, index)? as u32),
            None => None,
        };

        if let Some(het) = self.het_table.as_mut() {
            if let Some(folded) = self.file_table.get(index).unwrap().name_hash {
                het.delete(folded, index);
            }
            let folded = het.fold(new_name);
            self.file_table.get_mut(index).unwrap().name_hash = Some(folded);
            self.het_insert(folded, index)?;
        }

        let entry = self.file_table.get_mut(index).unwrap();
        entry.name = Some(new_name.to_string());
        entry.hash_index = new_slot;
        self.dirty = true;
        Ok(())
    }

    /// Remove a file from the archive
    ///
    /// The data bytes stay in place until the archive is compacted.
    pub fn delete_file(&mut self, name: &str) -> Result<()> {
        self.ensure_writable()?;
        if crate::is_internal_file_name(name) {
            return Err(Error::InternalFile(name.to_string()));
        }
        let index = self
            .find_entry_any_locale(name)
            .ok_or_else(|| Error::NotFound(name.to_string()))?;
        self.delete_entry(index);
        self.dirty = true;
        Ok(())
    }

    pub(crate) fn delete_entry(&mut self, index: u32) {
        let entry = self.file_table.get(index).cloned().unwrap_or_default();
        if let Some(slot) = entry.hash_index {
            if let Some(hash) = self.hash_table.as_mut() {
                hash.delete(slot as usize);
            }
        }
        if let (Some(het), Some(folded)) = (self.het_table.as_mut(), entry.name_hash) {
            het.delete(folded, index);
        }
        if let Some(entry) = self.file_table.get_mut(index) {
            entry.clear();
        }
    }

    // ---- flush ------------------------------------------------------

    /// Persist all pending changes to the stream
    pub fn flush(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        self.ensure_writable()?;

        // Stale internal entries go first, then the table is renumbered
        // densely, and the regenerated internal files append to it.
        self.drop_internal_files();
        self.compact_file_table();
        self.write_internal_files()?;

        // Serialize tables after the last file byte
        let mut position = self
            .file_table
            .find_free_space(self.data_start(), self.header.raw_chunk_size);

        let use_het = self.het_table.is_some();
        let (het_payload, bet_payload) = if use_het {
            let (het, bet) = self.build_het_bet()?;
            self.het_table = Some(het);
            (
                Some(self.het_table.as_ref().unwrap().to_payload()),
                Some(bet.to_payload()),
            )
        } else {
            (None, None)
        };

        let mut het_blob = None;
        let mut bet_blob = None;
        if let (Some(het_payload), Some(bet_payload)) = (&het_payload, &bet_payload) {
            het_blob = Some(crate::tables::store_ext_table(
                het_payload,
                crate::signatures::HET_TABLE,
                hash_table::table_key(),
                true,
            )?);
            bet_blob = Some(crate::tables::store_ext_table(
                bet_payload,
                crate::signatures::BET_TABLE,
                block_table::table_key(),
                true,
            )?);
        }

        // Classic tables are always written for compatibility
        let hash = self
            .hash_table
            .get_or_insert(HashTable::new(self.header.hash_table_size.max(4) as usize)?);
        let hash_payload = hash.to_bytes();
        let hash_blob = crate::tables::store_table(&hash_payload, hash_table::table_key(), false)?;

        let (block_payload, hi_payload) = self.build_block_tables();
        let block_blob =
            crate::tables::store_table(&block_payload, block_table::table_key(), false)?;

        // Lay the tables out: HET, BET, hash, block, hi-block
        let md5 = |data: &[u8]| -> [u8; 16] { Md5::digest(data).into() };

        if let Some(blob) = &het_blob {
            self.header.het_table_pos = position;
            self.header.het_table_size_64 = blob.len() as u64;
            self.header.md5_het_table = md5(blob);
            self.write_raw(position, blob)?;
            position += blob.len() as u64;
        } else {
            self.header.het_table_pos = 0;
            self.header.het_table_size_64 = 0;
        }

        if let Some(blob) = &bet_blob {
            self.header.bet_table_pos = position;
            self.header.bet_table_size_64 = blob.len() as u64;
            self.header.md5_bet_table = md5(blob);
            self.write_raw(position, blob)?;
            position += blob.len() as u64;
        } else {
            self.header.bet_table_pos = 0;
            self.header.bet_table_size_64 = 0;
        }

        self.header.hash_table_pos = position;
        self.header.hash_table_size = (hash_payload.len() / 16) as u32;
        self.header.hash_table_size_64 = hash_blob.len() as u64;
        self.header.md5_hash_table = md5(&hash_blob);
        self.write_raw(position, &hash_blob)?;
        position += hash_blob.len() as u64;

        self.header.block_table_pos = position;
        self.header.block_table_size = (block_payload.len() / 16) as u32;
        self.header.block_table_size_64 = block_blob.len() as u64;
        self.header.md5_block_table = md5(&block_blob);
        self.write_raw(position, &block_blob)?;
        position += block_blob.len() as u64;

        if let Some(hi_payload) = &hi_payload {
            self.header.hi_block_table_pos = position;
            self.header.hi_block_table_size_64 = hi_payload.len() as u64;
            self.header.md5_hi_block_table = md5(hi_payload);
            self.write_raw(position, hi_payload)?;
            position += hi_payload.len() as u64;
        } else {
            self.header.hi_block_table_pos = 0;
            self.header.hi_block_table_size_64 = 0;
        }

        // Finalize the header
        self.header.archive_size_64 = position;
        self.header.archive_size = position.min(u32::MAX as u64) as u32;
        let header_bytes = header::write_header(&self.header);
        self.header.md5_mpq_header = header_bytes[header_bytes.len() - 16..]
            .try_into()
            .unwrap_or([0; 16]);
        self.write_raw(0, &header_bytes)?;

        self.stream.set_size(self.archive_offset + position)?;
        self.stream.flush()?;
        self.dirty = false;

        // The weak signature covers the final bytes, so it goes last
        if self.has_signature {
            self.write_weak_signature()?;
        }

        Ok(())
    }

    /// Flush and close the archive
    pub fn close(mut self) -> Result<()> {
        if self.dirty && !self.read_only {
            self.flush()?;
        }
        self.stream.flush()
    }

    /// Drop stale internal entries; they are rebuilt from scratch
    pub(crate) fn drop_internal_files(&mut self) {
        for name in [crate::LISTFILE_NAME, crate::ATTRIBUTES_NAME] {
            let regenerate = match name {
                crate::LISTFILE_NAME => self.has_listfile,
                _ => self.attribute_flags.is_some(),
            };
            if regenerate {
                if let Some(index) = self.find_entry(name, 0) {
                    self.delete_entry(index);
                }
            }
        }
        if self.has_signature {
            if let Some(index) = self.find_entry(crate::SIGNATURE_NAME, 0) {
                self.delete_entry(index);
            }
        }
    }

    fn write_internal_files(&mut self) -> Result<()> {
        if self.has_listfile {
            let mut names: Vec<String> = self
                .file_table
                .entries()
                .iter()
                .filter(|e| e.exists())
                .filter_map(|e| e.name.clone())
                .collect();
            names.sort();
            names.push(crate::LISTFILE_NAME.to_string());
            if self.attribute_flags.is_some() {
                names.push(crate::ATTRIBUTES_NAME.to_string());
            }
            if self.has_signature {
                names.push(crate::SIGNATURE_NAME.to_string());
            }
            let data = build_listfile(&names);
            self.add_file_data(
                crate::LISTFILE_NAME,
                &data,
                AddFileOptions::new().compression(compression::methods::ZLIB),
            )?;
        }

        if let Some(flags) = self.attribute_flags {
            // The column count covers the entries that will exist after
            // the sidecar itself (and the signature) are added.
            let mut planned = self.file_table.capacity();
            if self.find_entry(crate::ATTRIBUTES_NAME, 0).is_none() {
                planned += 1;
            }
            if self.has_signature && self.find_entry(crate::SIGNATURE_NAME, 0).is_none() {
                planned += 1;
            }
            let data = Attributes::build(&self.file_table, flags, planned);
            self.add_file_data(
                crate::ATTRIBUTES_NAME,
                &data,
                AddFileOptions::new().compression(compression::methods::ZLIB),
            )?;
        }

        if self.has_signature && self.find_entry(crate::SIGNATURE_NAME, 0).is_none() {
            // Reserved as zeros; the real signature is patched in after
            // the tables are final.
            self.add_file_data(
                crate::SIGNATURE_NAME,
                &[0u8; crate::crypto::signature::WEAK_SIGNATURE_FILE_SIZE],
                AddFileOptions::new().compression(0),
            )?;
        }

        Ok(())
    }

    /// Renumber the file table densely, fixing up hash table links
    fn compact_file_table(&mut self) {
        let mut mapping: Vec<Option<u32>> = vec![None; self.file_table.capacity()];
        let mut compacted: Vec<FileEntry> = Vec::with_capacity(self.file_table.live_count());

        for (old_index, entry) in self.file_table.entries().iter().enumerate() {
            if entry.exists() {
                mapping[old_index] = Some(compacted.len() as u32);
                compacted.push(entry.clone());
            }
        }

        if let Some(hash) = self.hash_table.as_mut() {
            for slot in 0..hash.size() {
                let raw = *hash.get(slot).unwrap();
                if raw.is_valid() {
                    match mapping.get(raw.block_index as usize).copied().flatten() {
                        Some(new_index) => hash.set_block_index(slot, new_index),
                        None => hash.delete(slot),
                    }
                }
            }
        }

        self.file_table = FileTable::new();
        for entry in compacted {
            let index = self.file_table.allocate();
            *self.file_table.get_mut(index).unwrap() = entry;
        }
    }

    fn build_het_bet(&self) -> Result<(HetTable, BetTable)> {
        let count = self.file_table.capacity() as u32;
        let bit_size = self
            .het_table
            .as_ref()
            .map(|t| t.name_hash_bit_size)
            .unwrap_or(DEFAULT_NAME_HASH_BITS);

        let mut het = HetTable::new(count.max(1), bit_size);
        let mut records = Vec::with_capacity(count as usize);

        for index in 0..count {
            let entry = self.file_table.get(index).unwrap();
            let folded = match (&entry.name, entry.name_hash) {
                (Some(name), _) => het.fold(name),
                (None, Some(folded)) => folded,
                (None, None) => {
                    return Err(Error::UnknownFileNames);
                }
            };
            het.insert(folded, index)?;
            records.push(BetRecord {
                file_pos: entry.byte_offset,
                file_size: entry.file_size as u64,
                compressed_size: entry.compressed_size as u64,
                flags: entry.flags.bits(),
                name_hash: folded.remainder(),
            });
        }

        let bet = BetTable::build(&records, bit_size - 8)?;
        Ok((het, bet))
    }

    fn build_block_tables(&self) -> (Vec<u8>, Option<Vec<u8>>) {
        let mut block = BlockTable::new(0);
        let mut hi = HiBlockTable::new(self.file_table.capacity());

        for index in 0..self.file_table.capacity() as u32 {
            let entry = self.file_table.get(index).unwrap();
            block.push(BlockEntry {
                file_pos: entry.byte_offset as u32,
                compressed_size: entry.compressed_size,
                file_size: entry.file_size,
                flags: entry.flags.bits(),
            });
            hi.set(index as usize, (entry.byte_offset >> 32) as u16);
        }

        let hi_payload = if hi.is_needed() {
            Some(hi.to_bytes())
        } else {
            None
        };
        (block.to_bytes(), hi_payload)
    }

    fn write_weak_signature(&mut self) -> Result<()> {
        use crate::crypto::signature;

        let Some(index) = self.find_entry(crate::SIGNATURE_NAME, 0) else {
            return Ok(());
        };
        let entry = self.file_table.get(index).unwrap().clone();

        // The reserved file is stored raw, so the digest sees zeros in
        // the signature region and the bytes can be patched in place.
        let digest = crate::verify::archive_md5_excluding(
            &mut self.stream,
            self.archive_offset,
            self.header.archive_size_64,
            self.archive_offset + entry.byte_offset,
            entry.compressed_size as u64,
        )?;

        let signature = signature::sign_weak(&digest)?;
        let offset = entry.byte_offset;
        self.write_raw(offset, &signature)?;
        self.stream.flush()
    }

    // ---- rename support ---------------------------------------------


    /// Decrypt every stored piece of a file under its old key and
    /// re-encrypt under the new name's key, without recompressing
    fn reencrypt_file(&mut self, index: u32, old_name: &str, new_name: &str) -> Result<()> {
        use crate::crypto::{decrypt_bytes, encrypt_bytes, keys};

        let entry = self.file_table.get(index).unwrap().clone();
        let fix_key = entry.flags.contains(BlockFlags::FIX_KEY);
        let old_key = keys::file_key(old_name, entry.byte_offset, entry.file_size, fix_key);
        let new_key = keys::file_key(new_name, entry.byte_offset, entry.file_size, fix_key);

        let sector_size = self.sector_size();
        let base = entry.byte_offset;

        if entry.flags.contains(BlockFlags::SINGLE_UNIT) || !entry.flags.is_compressed() {
            // Fixed-size pieces with no offset table
            let piece = if entry.flags.contains(BlockFlags::SINGLE_UNIT) {
                entry.compressed_size as usize
            } else {
                sector_size
            };
            let mut offset = 0usize;
            let mut sector = 0u32;
            while offset < entry.compressed_size as usize {
                let len = piece.min(entry.compressed_size as usize - offset);
                let mut data = vec![0u8; len];
                self.read_raw(base + offset as u64, &mut data)?;
                decrypt_bytes(&mut data, old_key.wrapping_add(sector));
                encrypt_bytes(&mut data, new_key.wrapping_add(sector));
                self.write_raw(base + offset as u64, &data)?;
                offset += len;
                sector += 1;
            }
            return Ok(());
        }

        // Compressed multi-sector: walk the real sector offset table
        let sector_count = (entry.file_size as usize).div_ceil(sector_size);
        let mut table_len = (sector_count + 1) * 4;
        if entry.flags.contains(BlockFlags::SECTOR_CRC) {
            table_len += 4;
        }

        let mut raw_table = vec![0u8; table_len];
        self.read_raw(base, &mut raw_table)?;
        decrypt_bytes(&mut raw_table, old_key.wrapping_sub(1));
        let offsets: Vec<u32> = raw_table
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
            .collect();

        // Data sectors only; the trailing checksum sector travels
        // unencrypted.
        for k in 0..sector_count.min(offsets.len().saturating_sub(1)) {
            let start = offsets[k] as u64;
            let end = offsets[k + 1] as u64;
            if end < start || end > entry.compressed_size as u64 {
                return Err(Error::corrupt("sector offset table out of bounds"));
            }
            let mut data = vec![0u8; (end - start) as usize];
            self.read_raw(base + start, &mut data)?;
            decrypt_bytes(&mut data, old_key.wrapping_add(k as u32));
            encrypt_bytes(&mut data, new_key.wrapping_add(k as u32));
            self.write_raw(base + start, &data)?;
        }

        encrypt_bytes(&mut raw_table, new_key.wrapping_sub(1));
        self.write_raw(base, &raw_table)?;
        Ok(())
    }
}

impl Drop for Archive {
    fn drop(&mut self) {
        if self.dirty && !self.is_read_only() {
            if let Err(e) = self.flush() {
                log::warn!("archive flush on drop failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::methods;

    fn scratch_archive(dir: &tempfile::TempDir, version: FormatVersion) -> Archive {
        CreateOptions::new()
            .version(version)
            .hash_table_size(64)
            .create(dir.path().join("t.mpq"))
            .unwrap()
    }

    #[test]
    fn test_create_reopen_empty() {
        let dir = tempfile::tempdir().unwrap();
        scratch_archive(&dir, FormatVersion::V1).close().unwrap();

        let archive = Archive::open(dir.path().join("t.mpq")).unwrap();
        assert_eq!(archive.header().format_version, FormatVersion::V1);
        // Only the internal files are present
        assert!(archive.file_count() >= 1);
    }

    #[test]
    fn test_het_and_classic_lookups_agree() {
        let dir = tempfile::tempdir().unwrap();
        let mut archive = scratch_archive(&dir, FormatVersion::V4);
        let names = [
            "war3map.j",
            "units\\human\\footman.mdx",
            "sound\\music\\title.wav",
            "(10)DustwallowKeys.w3m",
        ];
        for name in names {
            archive
                .add_file_data(name, name.as_bytes(), AddFileOptions::new())
                .unwrap();
        }
        archive.flush().unwrap();
        let path = archive.path().unwrap().to_path_buf();
        archive.close().unwrap();

        let archive = Archive::open(path).unwrap();
        assert!(archive.het_table.is_some());

        for name in names {
            // HET path: candidate confirmed by the stored hash remainder
            let het = archive.het_table.as_ref().unwrap();
            let folded = het.fold(name);
            let het_index = het
                .candidates(folded)
                .into_iter()
                .find(|&candidate| {
                    archive
                        .file_table
                        .get(candidate)
                        .and_then(|e| e.name_hash)
                        .map(|h| h.remainder() == folded.remainder())
                        .unwrap_or(false)
                })
                .unwrap_or_else(|| panic!("{} not found via HET", name));

            // Classic path: hash table probe
            let hash = archive.hash_table.as_ref().unwrap();
            let slot = hash
                .find(name, 0)
                .unwrap_or_else(|| panic!("{} not found via hash table", name));
            let classic_index = hash.get(slot).unwrap().block_index;

            assert_eq!(het_index, classic_index, "paths disagree for {}", name);
        }
    }

    #[test]
    fn test_lookup_prefers_het_but_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let mut archive = scratch_archive(&dir, FormatVersion::V1);
        archive
            .add_file_data("plain.txt", b"data", AddFileOptions::new())
            .unwrap();

        // v1 archives have no HET table; lookups go through the classic
        // table alone.
        assert!(archive.het_table.is_none());
        assert!(archive.find_entry("plain.txt", 0).is_some());
        assert!(archive.find_entry("absent.txt", 0).is_none());
    }

    #[test]
    fn test_compressed_tables_survive_v4_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut archive = scratch_archive(&dir, FormatVersion::V4);
        archive
            .add_file_data(
                "compressed.bin",
                &vec![7u8; 30_000],
                AddFileOptions::new().compression(methods::ZLIB),
            )
            .unwrap();
        let path = archive.path().unwrap().to_path_buf();
        archive.close().unwrap();

        // The v4 header MD5s and table digests must all check out on load
        let mut archive = Archive::open(path).unwrap();
        assert_eq!(archive.read_file("compressed.bin").unwrap(), vec![7u8; 30_000]);
    }
}
