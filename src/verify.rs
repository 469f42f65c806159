//! Archive and file verification
//!
//! Covers the three signature schemes (weak, strong, secure), the
//! per-file checks against the attributes sidecar, and the v4 raw-chunk
//! MD5s.

use crate::archive::Archive;
use crate::crypto::signature::{
    self, RsaPublicKey, STRONG_SIGNATURE_SIZE, WEAK_SIGNATURE_FILE_SIZE,
};
use crate::stream::Stream;
use crate::tables::BlockFlags;
use crate::{Error, Result};
use md5::{Digest, Md5};
use sha1::Sha1;

/// Unit of chunked digesting over the archive
const DIGEST_UNIT_SIZE: usize = 0x10000;

/// Outcome of a signature verification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureStatus {
    /// The archive carries no signature at all
    NoSignature,
    /// Weak signature present and valid
    WeakOk,
    /// Weak signature present but wrong
    WeakError,
    /// Strong signature present and valid
    StrongOk,
    /// Strong signature present but wrong
    StrongError,
    /// Secure signature present and valid
    SecureOk,
    /// Secure signature present but wrong
    SecureError,
}

/// Outcome of verifying a whole archive
#[derive(Debug, Clone)]
pub struct ArchiveVerifyResult {
    /// Signature verdict
    pub signature: SignatureStatus,
    /// Raw-chunk digests all matched, when the archive keeps them
    pub raw_data_ok: Option<bool>,
    /// Names of files that failed their own checks
    pub failed_files: Vec<String>,
}

/// Outcome of verifying one file
#[derive(Debug, Clone, Default)]
pub struct FileVerifyResult {
    /// Sector checksums all matched, when the file carries them
    pub sector_crc_ok: Option<bool>,
    /// CRC-32 matched the attributes sidecar, when recorded
    pub crc32_ok: Option<bool>,
    /// MD5 matched the attributes sidecar, when recorded
    pub md5_ok: Option<bool>,
}

impl FileVerifyResult {
    /// True when nothing checkable failed
    pub fn is_ok(&self) -> bool {
        self.sector_crc_ok != Some(false)
            && self.crc32_ok != Some(false)
            && self.md5_ok != Some(false)
    }
}

/// MD5 over `[begin, begin + size)` with one region replaced by zeros
pub(crate) fn archive_md5_excluding(
    stream: &mut Stream,
    begin: u64,
    size: u64,
    exclude_offset: u64,
    exclude_len: u64,
) -> Result<[u8; 16]> {
    let mut md5 = Md5::new();
    let mut position = begin;
    let end = begin + size;
    let mut buffer = vec![0u8; DIGEST_UNIT_SIZE];

    while position < end {
        let take = ((end - position) as usize).min(DIGEST_UNIT_SIZE);
        let chunk = &mut buffer[..take];
        stream.read(position, chunk)?;

        // Zero the overlap with the excluded region
        let ex_start = exclude_offset.max(position);
        let ex_end = (exclude_offset + exclude_len).min(position + take as u64);
        if ex_start < ex_end {
            let from = (ex_start - position) as usize;
            let to = (ex_end - position) as usize;
            chunk[from..to].fill(0);
        }

        md5.update(&chunk[..]);
        position += take as u64;
    }

    Ok(md5.finalize().into())
}

/// SHA-1 over `[begin, begin + size)` with the three tail variants the
/// strong scheme accepts: nothing, the lowercase plain file name, and
/// the literal `ARCHIVE`
fn archive_sha1_variants(
    stream: &mut Stream,
    begin: u64,
    size: u64,
    plain_name: &str,
) -> Result<[[u8; 20]; 3]> {
    let mut sha1 = Sha1::new();
    let mut position = begin;
    let end = begin + size;
    let mut buffer = vec![0u8; DIGEST_UNIT_SIZE];

    while position < end {
        let take = ((end - position) as usize).min(DIGEST_UNIT_SIZE);
        stream.read(position, &mut buffer[..take])?;
        sha1.update(&buffer[..take]);
        position += take as u64;
    }

    let base = sha1;

    let plain: [u8; 20] = base.clone().finalize().into();

    let mut with_name = base.clone();
    let lowered: Vec<u8> = plain_name.bytes().map(|b| b.to_ascii_lowercase()).collect();
    with_name.update(&lowered);
    let with_name: [u8; 20] = with_name.finalize().into();

    let mut with_archive = base;
    with_archive.update(b"ARCHIVE");
    let with_archive: [u8; 20] = with_archive.finalize().into();

    Ok([plain, with_name, with_archive])
}

impl Archive {
    /// Verify whatever signature the archive carries
    ///
    /// Checks the weak (signature) file first, then the strong `NGIS`
    /// footer. Secure signatures need a caller key; use
    /// [`Archive::verify_secure_signature`].
    pub fn verify_signature(&mut self) -> Result<SignatureStatus> {
        if let Some(index) = self.find_entry(crate::SIGNATURE_NAME, 0) {
            let entry = self.file_table.get(index).unwrap().clone();
            let contents = self.read_file(crate::SIGNATURE_NAME)?;

            if contents.len() > WEAK_SIGNATURE_FILE_SIZE {
                // Larger signature files belong to the secure scheme
                return Ok(SignatureStatus::SecureError);
            }

            let digest = archive_md5_excluding(
                &mut self.stream,
                self.archive_offset,
                self.header.archive_size_64,
                self.archive_offset + entry.byte_offset,
                entry.compressed_size as u64,
            )?;

            return Ok(if signature::verify_weak(&contents, &digest)? {
                SignatureStatus::WeakOk
            } else {
                SignatureStatus::WeakError
            });
        }

        if let Some(strong) = self.read_strong_signature()? {
            let plain_name = self
                .path()
                .and_then(|p| p.file_name())
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let digests = archive_sha1_variants(
                &mut self.stream,
                self.archive_offset,
                self.header.archive_size_64,
                &plain_name,
            )?;

            return Ok(if signature::verify_strong(&strong, &digests)? {
                SignatureStatus::StrongOk
            } else {
                SignatureStatus::StrongError
            });
        }

        Ok(SignatureStatus::NoSignature)
    }

    /// Verify a secure signature with a caller-supplied key
    pub fn verify_secure_signature(&mut self, key: &RsaPublicKey) -> Result<SignatureStatus> {
        let Some(index) = self.find_entry(crate::SIGNATURE_NAME, 0) else {
            return Ok(SignatureStatus::NoSignature);
        };
        let entry = self.file_table.get(index).unwrap().clone();
        let contents = self.read_file(crate::SIGNATURE_NAME)?;

        // Hash with the signature region zeroed, SHA-1 for this scheme
        let mut sha1 = Sha1::new();
        let mut position = self.archive_offset;
        let end = self.archive_offset + self.header.archive_size_64;
        let exclude_start = self.archive_offset + entry.byte_offset;
        let exclude_end = exclude_start + entry.compressed_size as u64;
        let mut buffer = vec![0u8; DIGEST_UNIT_SIZE];
        while position < end {
            let take = ((end - position) as usize).min(DIGEST_UNIT_SIZE);
            let chunk = &mut buffer[..take];
            self.stream.read(position, chunk)?;
            let ex_start = exclude_start.max(position);
            let ex_end = exclude_end.min(position + take as u64);
            if ex_start < ex_end {
                chunk[(ex_start - position) as usize..(ex_end - position) as usize].fill(0);
            }
            sha1.update(&chunk[..]);
            position += take as u64;
        }
        let digest: [u8; 20] = sha1.finalize().into();

        Ok(if signature::verify_secure(&contents, &digest, key)? {
            SignatureStatus::SecureOk
        } else {
            SignatureStatus::SecureError
        })
    }

    /// Mark the archive for weak signing; the signature is computed and
    /// written at the next flush
    pub fn sign_weak(&mut self) -> Result<()> {
        self.ensure_writable()?;
        self.set_signature_flag(true);
        self.dirty = true;
        self.flush()
    }

    /// Read the strong `NGIS` footer when one follows the archive
    fn read_strong_signature(&mut self) -> Result<Option<Vec<u8>>> {
        let footer_at = self.archive_offset + self.header.archive_size_64;
        let stream_size = self.stream.size();
        if footer_at + 4 + STRONG_SIGNATURE_SIZE as u64 > stream_size {
            return Ok(None);
        }

        let mut magic = [0u8; 4];
        self.stream.read(footer_at, &mut magic)?;
        if magic != crate::signatures::STRONG_SIGNATURE {
            return Ok(None);
        }

        // Stored little-endian, which is how the verifier reads it
        let mut raw = vec![0u8; STRONG_SIGNATURE_SIZE];
        self.stream.read(footer_at + 4, &mut raw)?;
        Ok(Some(raw))
    }

    /// Verify the whole archive: every named file plus the signature
    /// and, for v4 archives, the raw-chunk digests
    pub fn verify_archive(&mut self) -> Result<ArchiveVerifyResult> {
        let mut failed_files = Vec::new();
        let mut raw_data_ok = None;

        let named: Vec<String> = self
            .list()
            .into_iter()
            .filter(|info| !info.name.starts_with("File"))
            .map(|info| info.name)
            .collect();

        for name in named {
            if crate::is_internal_file_name(&name) {
                continue;
            }
            match self.verify_file(&name) {
                Ok(result) if result.is_ok() => {}
                _ => failed_files.push(name.clone()),
            }
            if self.header.raw_chunk_size != 0 {
                let chunk_ok = self.verify_file_raw_md5(&name).unwrap_or(false);
                raw_data_ok = Some(raw_data_ok.unwrap_or(true) && chunk_ok);
                if !chunk_ok && !failed_files.contains(&name) {
                    failed_files.push(name);
                }
            }
        }

        Ok(ArchiveVerifyResult {
            signature: self.verify_signature()?,
            raw_data_ok,
            failed_files,
        })
    }

    /// Verify one file against its sector checksums and sidecar values
    pub fn verify_file(&mut self, name: &str) -> Result<FileVerifyResult> {
        let index = self
            .find_entry_any_locale(name)
            .ok_or_else(|| Error::NotFound(name.to_string()))?;
        let entry = self.file_table.get(index).unwrap().clone();

        let mut result = FileVerifyResult::default();

        // Reading with checksum verification on exercises sector CRCs
        let data = match self.read_file(name) {
            Ok(data) => {
                if entry.flags.contains(BlockFlags::SECTOR_CRC) {
                    result.sector_crc_ok = Some(true);
                }
                data
            }
            Err(Error::ChecksumError(_)) => {
                result.sector_crc_ok = Some(false);
                return Ok(result);
            }
            Err(e) => return Err(e),
        };

        if let Some(expected) = entry.crc32 {
            result.crc32_ok = Some(crc32fast::hash(&data) == expected);
        }
        if let Some(expected) = entry.md5 {
            let digest: [u8; 16] = Md5::digest(&data).into();
            result.md5_ok = Some(digest == expected);
        }

        Ok(result)
    }

    /// Verify the raw-chunk MD5 array trailing one file's stored bytes
    ///
    /// Only meaningful for v4 archives with a non-zero raw chunk size.
    pub fn verify_file_raw_md5(&mut self, name: &str) -> Result<bool> {
        let chunk_size = self.header.raw_chunk_size as usize;
        if chunk_size == 0 {
            return Err(Error::unsupported(
                "archive does not keep raw-chunk digests",
            ));
        }
        let index = self
            .find_entry_any_locale(name)
            .ok_or_else(|| Error::NotFound(name.to_string()))?;
        let entry = self.file_table.get(index).unwrap().clone();

        let mut remaining = entry.compressed_size as usize;
        let mut at = entry.byte_offset;
        let mut digest_at = entry.byte_offset + entry.compressed_size as u64;

        while remaining > 0 {
            let take = remaining.min(chunk_size);
            let mut chunk = vec![0u8; take];
            self.read_raw(at, &mut chunk)?;
            let expected: [u8; 16] = {
                let mut stored = [0u8; 16];
                self.read_raw(digest_at, &mut stored)?;
                stored
            };
            let digest: [u8; 16] = Md5::digest(&chunk).into();
            if digest != expected {
                return Ok(false);
            }
            at += take as u64;
            digest_at += 16;
            remaining -= take;
        }

        Ok(true)
    }

}
