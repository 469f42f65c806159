//! MPQ header location, parsing, and normalization
//!
//! On disk there are four header sizes (32, 44, 68, 208 bytes). In
//! memory there is exactly one header shape: the v4 layout with every
//! field present, missing ones computed or zeroed during normalization.

use crate::stream::Stream;
use crate::{signatures, Error, Result};
use md5::{Digest, Md5};

/// MPQ format version constants
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FormatVersion {
    /// Original MPQ format (32-byte header)
    V1 = 0,
    /// The Burning Crusade format (44-byte header)
    V2 = 1,
    /// Cataclysm Beta format (68-byte header)
    V3 = 2,
    /// Cataclysm+ format (208-byte header)
    V4 = 3,
}

impl FormatVersion {
    /// Header size in bytes for this version
    pub fn header_size(self) -> u32 {
        match self {
            FormatVersion::V1 => 32,
            FormatVersion::V2 => 44,
            FormatVersion::V3 => 68,
            FormatVersion::V4 => 208,
        }
    }

    /// Map the on-disk version field
    pub fn from_raw(raw: u16) -> Result<Self> {
        match raw {
            0 => Ok(FormatVersion::V1),
            1 => Ok(FormatVersion::V2),
            2 => Ok(FormatVersion::V3),
            3 => Ok(FormatVersion::V4),
            other => Err(Error::bad_format(format!(
                "unsupported MPQ format version {}",
                other
            ))),
        }
    }
}

/// Size of the fixed user-data preamble
pub const USER_DATA_HEADER_SIZE: u64 = 16;

/// Stride of the header scan
const HEADER_SCAN_STEP: u64 = 0x200;

/// Region of the v4 header covered by its own MD5
const V4_MD5_COVERED: usize = 192;

/// The optional user-data block in front of the real header
#[derive(Debug, Clone)]
pub struct UserData {
    /// Maximum size of the user data area
    pub user_data_size: u32,
    /// Offset of the MPQ header, relative to the user data begin
    pub header_offset: u32,
    /// Size of the user data header
    pub user_data_header_size: u32,
    /// The user payload bytes
    pub data: Vec<u8>,
}

/// An MPQ header normalized to the v4 field set
#[derive(Debug, Clone)]
pub struct Header {
    /// On-disk format version
    pub format_version: FormatVersion,
    /// Header size in bytes, as stored
    pub header_size: u32,
    /// 32-bit archive size (legacy field, valid through v2)
    pub archive_size: u32,
    /// Sector size shift; sector bytes = 512 << shift
    pub sector_size_shift: u16,
    /// Hash table position, 64-bit, relative to archive start
    pub hash_table_pos: u64,
    /// Block table position, 64-bit, relative to archive start
    pub block_table_pos: u64,
    /// Number of hash table entries
    pub hash_table_size: u32,
    /// Number of block table entries
    pub block_table_size: u32,
    /// Hi-block table position, or 0 when absent
    pub hi_block_table_pos: u64,
    /// 64-bit archive size
    pub archive_size_64: u64,
    /// BET table position, or 0 when absent
    pub bet_table_pos: u64,
    /// HET table position, or 0 when absent
    pub het_table_pos: u64,
    /// On-disk byte counts of each table (compressed sizes)
    pub hash_table_size_64: u64,
    /// On-disk bytes of the block table
    pub block_table_size_64: u64,
    /// On-disk bytes of the hi-block table
    pub hi_block_table_size_64: u64,
    /// On-disk bytes of the HET table
    pub het_table_size_64: u64,
    /// On-disk bytes of the BET table
    pub bet_table_size_64: u64,
    /// Size of raw data chunks covered by trailing MD5s (v4), or 0
    pub raw_chunk_size: u32,
    /// MD5 of the encrypted block table (v4)
    pub md5_block_table: [u8; 16],
    /// MD5 of the encrypted hash table (v4)
    pub md5_hash_table: [u8; 16],
    /// MD5 of the hi-block table (v4)
    pub md5_hi_block_table: [u8; 16],
    /// MD5 of the BET table (v4)
    pub md5_bet_table: [u8; 16],
    /// MD5 of the HET table (v4)
    pub md5_het_table: [u8; 16],
    /// MD5 of the header itself (v4)
    pub md5_mpq_header: [u8; 16],
    /// Tolerated malformations were seen; archive must stay read-only
    pub malformed: bool,
}

impl Header {
    /// A fresh header for a new archive
    pub fn new(version: FormatVersion, sector_size_shift: u16) -> Self {
        Self {
            format_version: version,
            header_size: version.header_size(),
            archive_size: 0,
            sector_size_shift,
            hash_table_pos: 0,
            block_table_pos: 0,
            hash_table_size: 0,
            block_table_size: 0,
            hi_block_table_pos: 0,
            archive_size_64: 0,
            bet_table_pos: 0,
            het_table_pos: 0,
            hash_table_size_64: 0,
            block_table_size_64: 0,
            hi_block_table_size_64: 0,
            het_table_size_64: 0,
            bet_table_size_64: 0,
            raw_chunk_size: 0,
            md5_block_table: [0; 16],
            md5_hash_table: [0; 16],
            md5_hi_block_table: [0; 16],
            md5_bet_table: [0; 16],
            md5_het_table: [0; 16],
            md5_mpq_header: [0; 16],
            malformed: false,
        }
    }

    /// Sector size in bytes
    pub fn sector_size(&self) -> usize {
        crate::sector_size_from_shift(self.sector_size_shift)
    }
}

/// Scan a stream for the archive header
///
/// The header may be preceded by a user-data block; both magics are
/// looked for in 512-byte strides. Returns the absolute offset of the
/// archive header, the user data if present, and the normalized header.
pub fn find_header(stream: &mut Stream) -> Result<(u64, Option<UserData>, Header)> {
    let file_size = stream.size();
    let mut probe = [0u8; 16];
    let mut user_data = None;
    let mut user_data_offset = 0u64;
    let mut offset = 0u64;

    while offset + USER_DATA_HEADER_SIZE <= file_size {
        stream.read(offset, &mut probe)?;
        let magic = u32::from_le_bytes(probe[0..4].try_into().unwrap());

        if magic == signatures::MPQ_USERDATA && user_data.is_none() {
            // The user data block points forward at the real header
            let user_data_size = u32::from_le_bytes(probe[4..8].try_into().unwrap());
            let header_offset = u32::from_le_bytes(probe[8..12].try_into().unwrap());
            let user_data_header_size = u32::from_le_bytes(probe[12..16].try_into().unwrap());

            let payload_len = (user_data_header_size as u64)
                .min(file_size.saturating_sub(offset + USER_DATA_HEADER_SIZE));
            let mut data = vec![0u8; payload_len as usize];
            stream.read(offset + USER_DATA_HEADER_SIZE, &mut data)?;

            user_data = Some(UserData {
                user_data_size,
                header_offset,
                user_data_header_size,
                data,
            });
            user_data_offset = offset;

            // Jump to where the user data says the header lives; a zero
            // pointer would loop forever, treat it as absent.
            if header_offset != 0 {
                offset += header_offset as u64;
                continue;
            }
            user_data = None;
        }

        if magic == signatures::MPQ_ARCHIVE {
            let header = read_header(stream, offset, file_size)?;
            return Ok((offset, user_data, header));
        }

        // A user-data block whose forward pointer was wrong falls back
        // to plain scanning from the block itself.
        if user_data.is_some() && offset > user_data_offset {
            user_data = None;
            offset = user_data_offset;
        }
        offset += HEADER_SCAN_STEP;
    }

    Err(Error::bad_format("no MPQ header found"))
}

/// Read and normalize a header known to start at `header_offset`
pub fn read_header(stream: &mut Stream, header_offset: u64, file_size: u64) -> Result<Header> {
    let available = file_size - header_offset;
    if available < FormatVersion::V1.header_size() as u64 {
        return Err(Error::bad_format("file too small for an MPQ header"));
    }

    // Read up to a v4 header worth of bytes; short files get zero fill
    let mut raw = [0u8; 208];
    let take = (available.min(208)) as usize;
    stream.read(header_offset, &mut raw[..take])?;

    let u32_at = |at: usize| u32::from_le_bytes(raw[at..at + 4].try_into().unwrap());
    let u16_at = |at: usize| u16::from_le_bytes(raw[at..at + 2].try_into().unwrap());
    let u64_at = |at: usize| u64::from_le_bytes(raw[at..at + 8].try_into().unwrap());
    let md5_at = |at: usize| -> [u8; 16] { raw[at..at + 16].try_into().unwrap() };

    if u32_at(0) != signatures::MPQ_ARCHIVE {
        return Err(Error::bad_format("missing MPQ signature"));
    }

    let header_size = u32_at(4);
    let format_version = FormatVersion::from_raw(u16_at(0x0C))?;
    let mut header = Header::new(format_version, u16_at(0x0E));
    header.header_size = header_size;
    header.archive_size = u32_at(8);
    header.hash_table_pos = u32_at(0x10) as u64;
    header.block_table_pos = u32_at(0x14) as u64;
    header.hash_table_size = u32_at(0x18);
    header.block_table_size = u32_at(0x1C);

    if format_version >= FormatVersion::V2 && available >= 44 {
        header.hi_block_table_pos = u64_at(0x20);
        header.hash_table_pos |= (u16_at(0x28) as u64) << 32;
        header.block_table_pos |= (u16_at(0x2A) as u64) << 32;
    }

    if format_version >= FormatVersion::V3 && available >= 68 {
        header.archive_size_64 = u64_at(0x2C);
        header.bet_table_pos = u64_at(0x34);
        header.het_table_pos = u64_at(0x3C);
    }

    if format_version >= FormatVersion::V4 && available >= 208 {
        header.hash_table_size_64 = u64_at(0x44);
        header.block_table_size_64 = u64_at(0x4C);
        header.hi_block_table_size_64 = u64_at(0x54);
        header.het_table_size_64 = u64_at(0x5C);
        header.bet_table_size_64 = u64_at(0x64);
        header.raw_chunk_size = u32_at(0x6C);
        header.md5_block_table = md5_at(0x70);
        header.md5_hash_table = md5_at(0x80);
        header.md5_hi_block_table = md5_at(0x90);
        header.md5_bet_table = md5_at(0xA0);
        header.md5_het_table = md5_at(0xB0);
        header.md5_mpq_header = md5_at(0xC0);

        // The header MD5 is the one integrity check that is fatal
        let digest = Md5::digest(&raw[..V4_MD5_COVERED]);
        if digest.as_slice() != header.md5_mpq_header {
            return Err(Error::corrupt("v4 header MD5 mismatch"));
        }
    }

    normalize(&mut header, file_size - header_offset);
    Ok(header)
}

/// Fill in the fields older versions do not store and sanity-check the
/// table layout against the file size
fn normalize(header: &mut Header, available: u64) {
    // Tables sorted by position let the gaps define on-disk sizes for
    // versions that do not store them.
    if header.format_version < FormatVersion::V4 {
        let hash_pos = header.hash_table_pos;
        let block_pos = header.block_table_pos;
        let hi_pos = header.hi_block_table_pos;
        let het_pos = header.het_table_pos;
        let bet_pos = header.bet_table_pos;

        let mut positions = vec![(hash_pos, 0usize), (block_pos, 1usize)];
        if hi_pos != 0 {
            positions.push((hi_pos, 2));
        }
        if het_pos != 0 {
            positions.push((het_pos, 3));
        }
        if bet_pos != 0 {
            positions.push((bet_pos, 4));
        }
        positions.sort_unstable();

        let mut sizes = [0u64; 5];
        for i in 0..positions.len() {
            let (pos, idx) = positions[i];
            let next = positions
                .get(i + 1)
                .map(|&(p, _)| p)
                .unwrap_or_else(|| available.min(archive_end_guess(header, available)));
            sizes[idx] = next.saturating_sub(pos);
        }

        header.hash_table_size_64 = sizes[0].min(header.hash_table_size as u64 * 16);
        header.block_table_size_64 = sizes[1].min(header.block_table_size as u64 * 16);
        if hi_pos != 0 {
            header.hi_block_table_size_64 = sizes[2].min(header.block_table_size as u64 * 2);
        }
        if het_pos != 0 {
            header.het_table_size_64 = sizes[3];
        }
        if bet_pos != 0 {
            header.bet_table_size_64 = sizes[4];
        }
    }

    // 64-bit archive size for versions that only store 32 bits
    if header.archive_size_64 == 0 {
        header.archive_size_64 = archive_end_guess(header, available);
    }

    // Truncated tables are tolerated but force read-only mode
    let hash_end = header.hash_table_pos + header.hash_table_size as u64 * 16;
    let block_end = header.block_table_pos + header.block_table_size as u64 * 16;
    if hash_end > available || block_end > available {
        log::warn!("table extends past end of file; archive marked malformed");
        header.malformed = true;
    }

    // Block table placed before the header is a known protector trick
    if header.block_table_pos < FormatVersion::V1.header_size() as u64
        && header.block_table_size > 0
    {
        log::warn!("block table overlaps header; archive marked malformed");
        header.malformed = true;
    }
}

/// End of the furthest table, clipped to the bytes actually present
fn archive_end_guess(header: &Header, available: u64) -> u64 {
    let mut end = header.archive_size as u64;
    end = end.max(header.hash_table_pos + header.hash_table_size as u64 * 16);
    end = end.max(header.block_table_pos + header.block_table_size as u64 * 16);
    if header.hi_block_table_pos != 0 {
        end = end.max(header.hi_block_table_pos + header.block_table_size as u64 * 2);
    }
    end.min(available)
}

/// Serialize a header for its format version, computing the v4 MD5
pub fn write_header(header: &Header) -> Vec<u8> {
    let mut out = Vec::with_capacity(header.format_version.header_size() as usize);

    out.extend_from_slice(&signatures::MPQ_ARCHIVE.to_le_bytes());
    out.extend_from_slice(&header.format_version.header_size().to_le_bytes());
    out.extend_from_slice(&header.archive_size.to_le_bytes());
    out.extend_from_slice(&(header.format_version as u16).to_le_bytes());
    out.extend_from_slice(&header.sector_size_shift.to_le_bytes());
    out.extend_from_slice(&(header.hash_table_pos as u32).to_le_bytes());
    out.extend_from_slice(&(header.block_table_pos as u32).to_le_bytes());
    out.extend_from_slice(&header.hash_table_size.to_le_bytes());
    out.extend_from_slice(&header.block_table_size.to_le_bytes());

    if header.format_version >= FormatVersion::V2 {
        out.extend_from_slice(&header.hi_block_table_pos.to_le_bytes());
        out.extend_from_slice(&((header.hash_table_pos >> 32) as u16).to_le_bytes());
        out.extend_from_slice(&((header.block_table_pos >> 32) as u16).to_le_bytes());
    }

    if header.format_version >= FormatVersion::V3 {
        out.extend_from_slice(&header.archive_size_64.to_le_bytes());
        out.extend_from_slice(&header.bet_table_pos.to_le_bytes());
        out.extend_from_slice(&header.het_table_pos.to_le_bytes());
    }

    if header.format_version >= FormatVersion::V4 {
        out.extend_from_slice(&header.hash_table_size_64.to_le_bytes());
        out.extend_from_slice(&header.block_table_size_64.to_le_bytes());
        out.extend_from_slice(&header.hi_block_table_size_64.to_le_bytes());
        out.extend_from_slice(&header.het_table_size_64.to_le_bytes());
        out.extend_from_slice(&header.bet_table_size_64.to_le_bytes());
        out.extend_from_slice(&header.raw_chunk_size.to_le_bytes());
        out.extend_from_slice(&header.md5_block_table);
        out.extend_from_slice(&header.md5_hash_table);
        out.extend_from_slice(&header.md5_hi_block_table);
        out.extend_from_slice(&header.md5_bet_table);
        out.extend_from_slice(&header.md5_het_table);

        let digest = Md5::digest(&out[..V4_MD5_COVERED]);
        out.extend_from_slice(&digest);
    }

    debug_assert_eq!(out.len(), header.format_version.header_size() as usize);
    out
}

/// Serialize a user-data preamble
pub fn write_user_data(user_data: &UserData) -> Vec<u8> {
    let mut out = Vec::with_capacity(USER_DATA_HEADER_SIZE as usize + user_data.data.len());
    out.extend_from_slice(&signatures::MPQ_USERDATA.to_le_bytes());
    out.extend_from_slice(&user_data.user_data_size.to_le_bytes());
    out.extend_from_slice(&user_data.header_offset.to_le_bytes());
    out.extend_from_slice(&user_data.user_data_header_size.to_le_bytes());
    out.extend_from_slice(&user_data.data);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::StreamFlags;

    fn stream_from_bytes(dir: &tempfile::TempDir, name: &str, bytes: &[u8]) -> Stream {
        let path = dir.path().join(name);
        std::fs::write(&path, bytes).unwrap();
        Stream::open(&path.display().to_string(), StreamFlags::empty()).unwrap()
    }

    fn minimal_v1_header() -> Header {
        let mut header = Header::new(FormatVersion::V1, 3);
        header.hash_table_pos = 32;
        header.block_table_pos = 32 + 16 * 16;
        header.hash_table_size = 16;
        header.block_table_size = 4;
        header.archive_size = 32 + 16 * 16 + 4 * 16;
        header
    }

    #[test]
    fn test_v1_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let header = minimal_v1_header();
        let mut bytes = write_header(&header);
        assert_eq!(bytes.len(), 32);
        bytes.resize(header.archive_size as usize, 0);

        let mut stream = stream_from_bytes(&dir, "v1.mpq", &bytes);
        let (offset, user_data, parsed) = find_header(&mut stream).unwrap();
        assert_eq!(offset, 0);
        assert!(user_data.is_none());
        assert_eq!(parsed.format_version, FormatVersion::V1);
        assert_eq!(parsed.hash_table_size, 16);
        assert_eq!(parsed.sector_size(), 4096);
        assert!(!parsed.malformed);
    }

    #[test]
    fn test_v4_md5_is_checked() {
        let dir = tempfile::tempdir().unwrap();
        let mut header = Header::new(FormatVersion::V4, 3);
        header.hash_table_pos = 208;
        header.block_table_pos = 208 + 256;
        header.hash_table_size = 16;
        header.block_table_size = 1;
        header.hash_table_size_64 = 256;
        header.block_table_size_64 = 16;
        header.archive_size_64 = 208 + 256 + 16;

        let mut bytes = write_header(&header);
        bytes.resize(header.archive_size_64 as usize, 0);

        // Intact header parses
        let mut stream = stream_from_bytes(&dir, "ok.mpq", &bytes);
        let size = stream.size();
        let parsed = read_header(&mut stream, 0, size).unwrap();
        assert_eq!(parsed.format_version, FormatVersion::V4);

        // One flipped byte in the covered region is fatal
        bytes[0x10] ^= 0xFF;
        let mut stream = stream_from_bytes(&dir, "bad.mpq", &bytes);
        let size = stream.size();
        assert!(matches!(
            read_header(&mut stream, 0, size),
            Err(Error::FileCorrupt(_))
        ));
    }

    #[test]
    fn test_user_data_preamble() {
        let dir = tempfile::tempdir().unwrap();
        let header = minimal_v1_header();

        let user_data = UserData {
            user_data_size: 512,
            header_offset: 512,
            user_data_header_size: 6,
            data: b"hello!".to_vec(),
        };

        let mut bytes = write_user_data(&user_data);
        bytes.resize(512, 0);
        bytes.extend_from_slice(&write_header(&header));
        bytes.resize(512 + header.archive_size as usize, 0);

        let mut stream = stream_from_bytes(&dir, "ud.mpq", &bytes);
        let (offset, user_data, parsed) = find_header(&mut stream).unwrap();
        assert_eq!(offset, 512);
        assert_eq!(user_data.unwrap().data, b"hello!");
        assert_eq!(parsed.format_version, FormatVersion::V1);
    }

    #[test]
    fn test_header_after_junk() {
        let dir = tempfile::tempdir().unwrap();
        let header = minimal_v1_header();

        let mut bytes = vec![0xEEu8; 1024];
        bytes.extend_from_slice(&write_header(&header));
        bytes.resize(1024 + header.archive_size as usize, 0);

        let mut stream = stream_from_bytes(&dir, "junk.mpq", &bytes);
        let (offset, _, _) = find_header(&mut stream).unwrap();
        assert_eq!(offset, 1024);
    }

    #[test]
    fn test_truncated_block_table_marks_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let mut header = minimal_v1_header();
        header.block_table_size = 1000;

        let mut bytes = write_header(&header);
        bytes.resize(600, 0);

        let mut stream = stream_from_bytes(&dir, "trunc.mpq", &bytes);
        let size = stream.size();
        let parsed = read_header(&mut stream, 0, size).unwrap();
        assert!(parsed.malformed);
    }

    #[test]
    fn test_no_header_found() {
        let dir = tempfile::tempdir().unwrap();
        let mut stream = stream_from_bytes(&dir, "noise.bin", &vec![0x11u8; 4096]);
        assert!(find_header(&mut stream).is_err());
    }
}
