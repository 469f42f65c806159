//! Archive compaction
//!
//! Rewrites the archive into a temporary file with no gaps between
//! files and no dead entries, then atomically replaces the original.
//! Stored bytes are copied as-is; only fix-key encrypted files are
//! re-encrypted, because their keys embed the file position.

use crate::archive::Archive;
use crate::crypto::{decrypt_bytes, encrypt_bytes};
use crate::file::FileReader;
use crate::stream::Stream;
use crate::tables::BlockFlags;
use crate::{Error, Result};
use tempfile::NamedTempFile;

/// Progress callback: `(bytes processed, total bytes)`
pub type CompactProgress<'a> = &'a mut dyn FnMut(u64, u64);

impl Archive {
    /// Rewrite the archive without gaps
    pub fn compact(&mut self) -> Result<()> {
        self.compact_with_progress(None)
    }

    /// Rewrite the archive without gaps, reporting progress
    pub fn compact_with_progress(&mut self, mut progress: Option<CompactProgress<'_>>) -> Result<()> {
        self.ensure_writable()?;
        let path = self
            .path()
            .ok_or_else(|| Error::unsupported("only file-backed archives can be compacted"))?
            .to_path_buf();

        // Start from a consistent on-disk state, then drop the internal
        // files; they are regenerated after the copy, so copying their
        // old bytes would only leave gaps.
        self.flush()?;
        self.drop_internal_files();

        // Every encrypted entry needs a recoverable key before any
        // bytes move; a name gives the key directly, otherwise it is
        // brute-forced from the data.
        let keys = self.recover_all_keys()?;

        let temp = NamedTempFile::new_in(path.parent().unwrap_or_else(|| std::path::Path::new(".")))?;
        let mut target = Stream::create(temp.path())?;

        // The pre-header region (user data) travels verbatim
        if self.archive_offset > 0 {
            let mut preamble = vec![0u8; self.archive_offset as usize];
            self.stream.read(0, &mut preamble)?;
            target.write(0, &preamble)?;
        }

        let total: u64 = self
            .file_table
            .entries()
            .iter()
            .filter(|e| e.exists())
            .map(|e| e.compressed_size as u64)
            .sum();
        let mut processed = 0u64;

        let raw_chunk_size = self.header.raw_chunk_size;
        let mut new_offset = self.data_start();
        let indices: Vec<u32> = self.file_table.live_indices().collect();

        for index in indices {
            let entry = self.file_table.get(index).unwrap().clone();
            let mut raw = vec![0u8; entry.compressed_size as usize];
            self.read_raw(entry.byte_offset, &mut raw)?;

            // Moving a fix-key file changes its key
            if entry.flags.contains(BlockFlags::ENCRYPTED)
                && entry.flags.contains(BlockFlags::FIX_KEY)
                && new_offset != entry.byte_offset
            {
                let old_key = keys[index as usize]
                    .ok_or_else(|| Error::UnknownFileKey(format!("entry {}", index)))?;
                let base = (old_key ^ entry.file_size).wrapping_sub(entry.byte_offset as u32);
                let new_key = base.wrapping_add(new_offset as u32) ^ entry.file_size;
                reencrypt_in_place(
                    &mut raw,
                    &entry.flags,
                    entry.file_size,
                    self.sector_size(),
                    old_key,
                    new_key,
                )?;
            }

            target.write(self.archive_offset + new_offset, &raw)?;

            // Raw-chunk digests are position independent but cheap to
            // recompute, which also covers the re-encrypted case.
            let mut entry_end = new_offset + raw.len() as u64;
            if raw_chunk_size != 0 {
                use md5::{Digest, Md5};
                let mut digests = Vec::new();
                for chunk in raw.chunks(raw_chunk_size as usize) {
                    let digest: [u8; 16] = Md5::digest(chunk).into();
                    digests.extend_from_slice(&digest);
                }
                target.write(self.archive_offset + entry_end, &digests)?;
                entry_end += digests.len() as u64;
            }

            self.file_table.get_mut(index).unwrap().byte_offset = new_offset;
            new_offset = entry_end;

            processed += entry.compressed_size as u64;
            if let Some(callback) = progress.as_mut() {
                callback(processed, total);
            }
        }

        // Swap in the new stream and let flush rebuild the tables there
        self.stream = target;
        self.dirty = true;
        self.flush()?;

        // Atomically replace the original file and reattach to it
        temp.persist(&path).map_err(|e| Error::Io(e.error))?;
        self.stream = Stream::open(&path.display().to_string(), Default::default())?;
        Ok(())
    }

    /// Effective encryption keys for every live entry, by brute force
    /// when the name is unknown
    fn recover_all_keys(&mut self) -> Result<Vec<Option<u32>>> {
        let capacity = self.file_table.capacity();
        let mut keys = vec![None; capacity];

        for index in 0..capacity as u32 {
            let needs_key = self
                .file_table
                .get(index)
                .map(|e| e.exists() && e.flags.contains(BlockFlags::ENCRYPTED))
                .unwrap_or(false);
            if !needs_key {
                continue;
            }

            let reader = FileReader::open(self, index, None)?;
            keys[index as usize] = Some(reader.file_key());
        }

        Ok(keys)
    }
}

/// Re-encrypt one file's stored bytes from `old_key` to `new_key`
fn reencrypt_in_place(
    raw: &mut [u8],
    flags: &BlockFlags,
    file_size: u32,
    sector_size: usize,
    old_key: u32,
    new_key: u32,
) -> Result<()> {
    if flags.contains(BlockFlags::SINGLE_UNIT) {
        decrypt_bytes(raw, old_key);
        encrypt_bytes(raw, new_key);
        return Ok(());
    }

    if !flags.is_compressed() {
        // Fixed-size sectors, no offset table
        let mut sector = 0u32;
        for chunk in raw.chunks_mut(sector_size) {
            decrypt_bytes(chunk, old_key.wrapping_add(sector));
            encrypt_bytes(chunk, new_key.wrapping_add(sector));
            sector += 1;
        }
        return Ok(());
    }

    // Sector table first, then each data sector it points at
    let sector_count = (file_size as usize).div_ceil(sector_size);
    let mut table_entries = sector_count + 1;
    if flags.contains(BlockFlags::SECTOR_CRC) {
        table_entries += 1;
    }
    let table_len = table_entries * 4;
    if raw.len() < table_len {
        return Err(Error::corrupt("stored file shorter than its sector table"));
    }

    decrypt_bytes(&mut raw[..table_len], old_key.wrapping_sub(1));
    let offsets: Vec<u32> = raw[..table_len]
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
        .collect();

    for k in 0..sector_count {
        let start = offsets[k] as usize;
        let end = offsets[k + 1] as usize;
        if start > end || end > raw.len() {
            return Err(Error::corrupt("sector offsets escape the stored file"));
        }
        decrypt_bytes(&mut raw[start..end], old_key.wrapping_add(k as u32));
        encrypt_bytes(&mut raw[start..end], new_key.wrapping_add(k as u32));
    }

    encrypt_bytes(&mut raw[..table_len], new_key.wrapping_sub(1));
    Ok(())
}
