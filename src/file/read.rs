//! The per-file read engine
//!
//! Opening a file locates its entry, derives (or brute-forces) the
//! encryption key, and decodes the sector offset table. Reads then pull
//! raw sectors through decryption, checksum verification, and the
//! compression dispatcher.

use super::{sector_count_for, PatchInfo, PATCH_INFO_SIZE};
use crate::archive::Archive;
use crate::crypto::{adler32, decrypt_bytes, keys};
use crate::entries::{FileEntry, Locale};
use crate::tables::BlockFlags;
use crate::{compression, Error, Result};

/// Maximum protector-inserted prefix tolerated in a sector table
const MAX_SECTOR_TABLE_SLACK: u32 = 0x400;

/// An open file positioned for reading
#[derive(Debug)]
pub struct FileReader<'a> {
    archive: &'a mut Archive,
    entry: FileEntry,
    /// Effective size of the readable data
    file_size: u32,
    /// Start of the sector table / data, past any patch info
    data_offset: u64,
    file_key: u32,
    sector_offsets: Option<Vec<u32>>,
    sector_checksums: Option<Vec<u32>>,
    patch_info: Option<PatchInfo>,
    position: u64,
    verify_checksums: bool,
}

impl Archive {
    /// Read a whole file by name
    pub fn read_file(&mut self, name: &str) -> Result<Vec<u8>> {
        self.read_file_locale(name, 0)
    }

    /// Read a whole file by name and locale
    pub fn read_file_locale(&mut self, name: &str, locale: Locale) -> Result<Vec<u8>> {
        self.open_file_locale(name, locale)?.read_all()
    }

    /// Open a file for reading
    pub fn open_file(&mut self, name: &str) -> Result<FileReader<'_>> {
        self.open_file_locale(name, 0)
    }

    /// Open a file for reading, preferring `locale`
    pub fn open_file_locale(&mut self, name: &str, locale: Locale) -> Result<FileReader<'_>> {
        let index = self
            .find_entry(name, locale)
            .ok_or_else(|| Error::NotFound(name.to_string()))?;
        FileReader::open(self, index, Some(name))
    }

    /// Open a file by table index, recovering the key when the name is
    /// unknown
    pub fn open_file_by_index(&mut self, index: u32) -> Result<FileReader<'_>> {
        FileReader::open(self, index, None)
    }
}

impl<'a> FileReader<'a> {
    pub(crate) fn open(
        archive: &'a mut Archive,
        index: u32,
        name: Option<&str>,
    ) -> Result<Self> {
        let entry = archive
            .file_table
            .get(index)
            .cloned()
            .ok_or(Error::InvalidHandle)?;
        if !entry.exists() {
            return Err(Error::NotFound(format!("file table entry {}", index)));
        }
        if entry.flags.contains(BlockFlags::DELETE_MARKER) {
            return Err(Error::MarkedForDelete(
                name.unwrap_or("(unnamed)").to_string(),
            ));
        }
        if entry
            .flags
            .intersects(BlockFlags::ANUBIS | BlockFlags::SERPENT)
        {
            // The extended block ciphers have no primitive available in
            // our dependency set.
            return Err(Error::unsupported(
                "Anubis/Serpent encrypted files are not supported",
            ));
        }

        let mut data_offset = entry.byte_offset;
        let mut file_size = entry.file_size;
        let mut patch_info = None;

        if entry.flags.contains(BlockFlags::PATCH_FILE) {
            let mut raw = [0u8; PATCH_INFO_SIZE];
            archive.read_raw(entry.byte_offset, &mut raw)?;
            let info = PatchInfo::parse(&raw)?;
            data_offset += info.length as u64;
            file_size = info.data_size;
            patch_info = Some(info);
        }

        let mut reader = Self {
            archive,
            entry,
            file_size,
            data_offset,
            file_key: 0,
            sector_offsets: None,
            sector_checksums: None,
            patch_info,
            position: 0,
            verify_checksums: true,
        };

        reader.resolve_key(name)?;
        reader.load_sector_offsets()?;
        Ok(reader)
    }

    /// Effective readable size in bytes
    pub fn size(&self) -> u64 {
        self.file_size as u64
    }

    /// The recovered or derived encryption key
    pub fn file_key(&self) -> u32 {
        self.file_key
    }

    /// Disable per-sector checksum verification
    pub fn verify_checksums(&mut self, verify: bool) {
        self.verify_checksums = verify;
    }

    /// Move the read position
    pub fn seek(&mut self, position: u64) {
        self.position = position.min(self.file_size as u64);
    }

    /// Read from the current position, advancing it
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let remaining = (self.file_size as u64).saturating_sub(self.position) as usize;
        let take = remaining.min(buf.len());
        if take == 0 {
            return Ok(0);
        }
        let position = self.position;
        self.read_at(position, &mut buf[..take])?;
        self.position += take as u64;
        Ok(take)
    }

    /// Read the entire file
    pub fn read_all(&mut self) -> Result<Vec<u8>> {
        let mut out = vec![0u8; self.file_size as usize];
        self.read_at(0, &mut out)?;
        Ok(out)
    }

    /// Read `buf.len()` bytes at an absolute file position
    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        if offset + buf.len() as u64 > self.file_size as u64 {
            return Err(Error::EndOfFile);
        }
        if buf.is_empty() {
            return Ok(());
        }

        let sector_size = self.archive.sector_size() as u64;

        if self.entry.flags.contains(BlockFlags::SINGLE_UNIT) {
            let data = self.read_single_unit()?;
            buf.copy_from_slice(&data[offset as usize..offset as usize + buf.len()]);
            return Ok(());
        }

        let first_sector = (offset / sector_size) as usize;
        let last_sector = ((offset + buf.len() as u64 - 1) / sector_size) as usize;

        let mut copied = 0usize;
        for sector in first_sector..=last_sector {
            let data = self.read_sector(sector)?;
            let sector_base = sector as u64 * sector_size;
            let start = offset.max(sector_base) - sector_base;
            let end = (offset + buf.len() as u64 - sector_base).min(data.len() as u64);
            let slice = &data[start as usize..end as usize];
            buf[copied..copied + slice.len()].copy_from_slice(slice);
            copied += slice.len();
        }

        debug_assert_eq!(copied, buf.len());
        Ok(())
    }

    // ---- internals --------------------------------------------------

    fn sector_count(&self) -> usize {
        if self.entry.flags.contains(BlockFlags::SINGLE_UNIT) {
            1
        } else {
            sector_count_for(self.file_size as u64, self.archive.sector_size())
        }
    }

    fn sector_table_len(&self) -> usize {
        let mut entries = self.sector_count() + 1;
        if self.entry.flags.contains(BlockFlags::SECTOR_CRC) {
            entries += 1;
        }
        entries * 4
    }

    fn has_sector_table(&self) -> bool {
        self.entry.flags.is_compressed() && !self.entry.flags.contains(BlockFlags::SINGLE_UNIT)
    }

    /// Derive the key from the name, or recover it from known plaintext
    fn resolve_key(&mut self, name: Option<&str>) -> Result<()> {
        if !self.entry.flags.contains(BlockFlags::ENCRYPTED) {
            return Ok(());
        }

        let fix_key = self.entry.flags.contains(BlockFlags::FIX_KEY);

        if let Some(name) = name.or(self.entry.name.as_deref()) {
            self.file_key =
                keys::file_key(name, self.entry.byte_offset, self.file_size, fix_key);
            return Ok(());
        }

        // No name anywhere: brute-force from the sector table or from
        // well-known content signatures.
        let detected = if self.has_sector_table() {
            let mut raw = [0u8; 8];
            self.archive.read_raw(self.data_offset, &mut raw)?;
            let encrypted = [
                u32::from_le_bytes(raw[0..4].try_into().unwrap()),
                u32::from_le_bytes(raw[4..8].try_into().unwrap()),
            ];
            keys::detect_file_key_by_sector_table(
                &encrypted,
                self.archive.sector_size() as u32,
                self.sector_table_len() as u32,
            )
        } else {
            let mut raw = [0u8; 8];
            self.archive.read_raw(self.data_offset, &mut raw)?;
            let encrypted = [
                u32::from_le_bytes(raw[0..4].try_into().unwrap()),
                u32::from_le_bytes(raw[4..8].try_into().unwrap()),
            ];
            keys::detect_file_key_by_content(
                &encrypted,
                self.archive.sector_size() as u32,
                self.file_size,
            )
        };

        self.file_key =
            detected.ok_or_else(|| Error::UnknownFileKey("(unnamed file)".to_string()))?;
        Ok(())
    }

    /// Load and validate the sector offset table
    fn load_sector_offsets(&mut self) -> Result<()> {
        if !self.has_sector_table() {
            return Ok(());
        }

        let table_len = self.sector_table_len();
        let data_sectors = self.sector_count();
        let offsets = self.read_sector_table(self.data_offset, table_len)?;

        match validate_sector_offsets(
            &offsets,
            table_len as u32,
            self.archive.sector_size(),
            data_sectors,
        ) {
            Ok(()) => {
                self.sector_offsets = Some(offsets);
                Ok(())
            }
            Err(first_error) => {
                // Protected archives write an oversized table; the first
                // entry then names the real table length and the sector
                // offsets that follow stay valid.
                let claimed = offsets[0];
                if claimed > table_len as u32
                    && claimed <= table_len as u32 + MAX_SECTOR_TABLE_SLACK
                    && claimed % 4 == 0
                {
                    let padded = self.read_sector_table(self.data_offset, claimed as usize)?;
                    let head: Vec<u32> = padded[..table_len / 4].to_vec();
                    if validate_sector_offsets(
                        &head,
                        claimed,
                        self.archive.sector_size(),
                        data_sectors,
                    )
                    .is_ok()
                    {
                        log::debug!("sector table accepted after protector workaround");
                        self.sector_offsets = Some(head);
                        return Ok(());
                    }
                }
                Err(first_error)
            }
        }
    }

    fn read_sector_table(&mut self, offset: u64, len: usize) -> Result<Vec<u32>> {
        let mut raw = vec![0u8; len];
        self.archive.read_raw(offset, &mut raw)?;
        if self.entry.flags.contains(BlockFlags::ENCRYPTED) {
            decrypt_bytes(&mut raw, self.file_key.wrapping_sub(1));
        }
        Ok(raw
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
            .collect())
    }

    /// Load the per-sector checksums, lazily
    fn load_sector_checksums(&mut self) -> Result<()> {
        if self.sector_checksums.is_some()
            || !self.entry.flags.contains(BlockFlags::SECTOR_CRC)
            || !self.has_sector_table()
        {
            return Ok(());
        }

        let offsets = self.sector_offsets.as_ref().unwrap();
        let count = self.sector_count();
        let start = offsets[count] as u64;
        let end = offsets[count + 1] as u64;
        let stored = (end - start) as usize;
        let expected = count * 4;

        let mut raw = vec![0u8; stored];
        self.archive.read_raw(self.data_offset + start, &mut raw)?;

        // The checksum sector may be compressed but is never encrypted
        let plain = if stored < expected {
            compression::decompress(&raw, expected)?
        } else {
            raw
        };

        self.sector_checksums = Some(
            plain
                .chunks_exact(4)
                .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
                .collect(),
        );
        Ok(())
    }

    fn read_single_unit(&mut self) -> Result<Vec<u8>> {
        let stored = self.entry.compressed_size as usize
            - self.patch_info.map(|p| p.length as usize).unwrap_or(0);
        let mut raw = vec![0u8; stored];
        self.archive.read_raw(self.data_offset, &mut raw)?;

        if self.entry.flags.contains(BlockFlags::ENCRYPTED) {
            decrypt_bytes(&mut raw, self.file_key);
        }

        if self.entry.flags.is_compressed() && stored < self.file_size as usize {
            raw = self.decompress_sector(raw, self.file_size as usize)?;
        }

        if raw.len() < self.file_size as usize {
            return Err(Error::corrupt("single-unit file shorter than declared"));
        }
        raw.truncate(self.file_size as usize);
        Ok(raw)
    }

    /// Read and decode one sector
    fn read_sector(&mut self, index: usize) -> Result<Vec<u8>> {
        let sector_size = self.archive.sector_size();
        let plain_len =
            (self.file_size as usize - index * sector_size).min(sector_size);

        let (raw_offset, raw_len) = if let Some(offsets) = &self.sector_offsets {
            let start = offsets[index];
            let end = offsets[index + 1];
            if end < start {
                return Err(Error::corrupt("sector offsets out of order"));
            }
            (start as u64, (end - start) as usize)
        } else {
            // No table: sectors are stored at their natural positions
            ((index * sector_size) as u64, plain_len)
        };

        let mut raw = vec![0u8; raw_len];
        self.archive.read_raw(self.data_offset + raw_offset, &mut raw)?;

        if self.entry.flags.contains(BlockFlags::ENCRYPTED) {
            decrypt_bytes(&mut raw, self.file_key.wrapping_add(index as u32));
        }

        if self.entry.flags.contains(BlockFlags::SECTOR_CRC) && self.verify_checksums {
            self.load_sector_checksums()?;
            if let Some(checksums) = &self.sector_checksums {
                let expected = checksums.get(index).copied().unwrap_or(0);
                // A zero stored checksum means "not checked"
                if expected != 0 && adler32(&raw) != expected {
                    return Err(Error::checksum(format!("sector {} damaged", index)));
                }
            }
        }

        if raw.len() < plain_len {
            raw = self.decompress_sector(raw, plain_len)?;
        }
        if raw.len() < plain_len {
            return Err(Error::corrupt(format!(
                "sector {} decompressed short: {} of {} bytes",
                index,
                raw.len(),
                plain_len
            )));
        }
        raw.truncate(plain_len);
        Ok(raw)
    }

    fn decompress_sector(&self, raw: Vec<u8>, plain_len: usize) -> Result<Vec<u8>> {
        if self.entry.flags.contains(BlockFlags::IMPLODE) {
            compression::explode(&raw, plain_len)
        } else {
            compression::decompress(&raw, plain_len)
        }
    }
}

/// Check the sector-offset invariants
///
/// The first entry names the table's own byte length; each data-sector
/// entry is strictly greater than the one before it, and no data sector
/// spans more than one sector size. The trailing checksum entry, whose
/// run may legitimately be empty and whose size tracks the sector
/// count, only has to be non-decreasing.
fn validate_sector_offsets(
    offsets: &[u32],
    table_len: u32,
    sector_size: usize,
    data_sectors: usize,
) -> Result<()> {
    if offsets.is_empty() || offsets[0] != table_len {
        return Err(Error::corrupt(format!(
            "sector table length field {} does not match {}",
            offsets.first().copied().unwrap_or(0),
            table_len
        )));
    }
    for (i, pair) in offsets.windows(2).enumerate() {
        if i < data_sectors {
            if pair[1] <= pair[0] {
                return Err(Error::corrupt("sector offsets do not increase"));
            }
            if (pair[1] - pair[0]) as usize > sector_size {
                return Err(Error::corrupt("sector larger than the sector size"));
            }
        } else if pair[1] < pair[0] {
            return Err(Error::corrupt("sector offsets decrease"));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_sector_offsets() {
        // 3 sectors + end entry, table length 16
        let good = vec![16u32, 116, 216, 316];
        assert!(validate_sector_offsets(&good, 16, 4096, 3).is_ok());

        let wrong_len = vec![20u32, 116, 216, 316];
        assert!(validate_sector_offsets(&wrong_len, 16, 4096, 3).is_err());

        let decreasing = vec![16u32, 216, 116, 316];
        assert!(validate_sector_offsets(&decreasing, 16, 4096, 3).is_err());

        // Equal data-sector offsets mean a mis-keyed or corrupt table
        let stalled = vec![16u32, 116, 116, 316];
        assert!(validate_sector_offsets(&stalled, 16, 4096, 3).is_err());

        let oversized = vec![16u32, 16 + 5000, 16 + 6000, 16 + 7000];
        assert!(validate_sector_offsets(&oversized, 16, 4096, 3).is_err());

        // A full sector is fine; one byte over is not
        let exact = vec![16u32, 16 + 4096, 16 + 8192];
        assert!(validate_sector_offsets(&exact, 16, 4096, 2).is_ok());
        let over = vec![16u32, 16 + 4097, 16 + 8193];
        assert!(validate_sector_offsets(&over, 16, 4096, 2).is_err());

        // The trailing checksum entry may repeat when its run is empty
        let empty_checksums = vec![20u32, 120, 220, 320, 320];
        assert!(validate_sector_offsets(&empty_checksums, 20, 4096, 3).is_ok());
    }
}
