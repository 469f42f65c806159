//! Incremental patch chains
//!
//! A base archive can carry a chain of patch archives. Each patched
//! file is stored as a `PTCH` blob holding the MD5 of the version it
//! applies to, the MD5 of the result, and either a verbatim copy or a
//! BSDIFF40 delta whose payload may additionally be RLE packed.

use crate::archive::Archive;
use crate::tables::BlockFlags;
use crate::{Error, Result};
use byteorder::{LittleEndian, ReadBytesExt};
use md5::{Digest, Md5};
use std::io::Cursor;

/// 'PTCH'
const PATCH_SIGNATURE: u32 = 0x48435450;
/// 'MD5_'
const MD5_SIGNATURE: u32 = 0x5F35444D;
/// 'XFRM'
const XFRM_SIGNATURE: u32 = 0x4D524658;
/// 'BSD0'
const PATCH_TYPE_BSD0: u32 = 0x30445342;
/// 'COPY'
const PATCH_TYPE_COPY: u32 = 0x59504F43;

/// "BSDIFF40" as a little-endian u64
const BSDIFF40_SIGNATURE: u64 = 0x3034464649445342;

const PATCH_HEADER_SIZE: usize = 0x48;
const XFRM_HEADER_SIZE: usize = 0x0C;
const BSDIFF_HEADER_SIZE: usize = 32;
const BSDIFF_CTRL_RECORD_SIZE: usize = 12;

/// Parsed `PTCH` blob header
#[derive(Debug, Clone)]
struct PatchHeader {
    size_of_patch_data: u32,
    size_before_patch: u32,
    size_after_patch: u32,
    md5_before_patch: [u8; 16],
    md5_after_patch: [u8; 16],
    xfrm_block_size: u32,
    patch_type: u32,
}

fn parse_patch_header(raw: &[u8]) -> Result<PatchHeader> {
    if raw.len() < PATCH_HEADER_SIZE {
        return Err(Error::corrupt("patch blob too short for its header"));
    }
    let u32_at = |at: usize| u32::from_le_bytes(raw[at..at + 4].try_into().unwrap());

    if u32_at(0) != PATCH_SIGNATURE || u32_at(16) != MD5_SIGNATURE || u32_at(64) != XFRM_SIGNATURE {
        return Err(Error::corrupt("patch blob signature mismatch"));
    }

    Ok(PatchHeader {
        size_of_patch_data: u32_at(4),
        size_before_patch: u32_at(8),
        size_after_patch: u32_at(12),
        md5_before_patch: raw[24..40].try_into().unwrap(),
        md5_after_patch: raw[40..56].try_into().unwrap(),
        xfrm_block_size: u32_at(68),
        patch_type: u32_at(72),
    })
}

/// Undo the RLE packing applied to some BSD0 payloads
///
/// The first four bytes of the packed data are skipped. A control byte
/// with the high bit set copies `(byte & 0x7F) + 1` literal bytes; one
/// with it clear skips `byte + 1` positions, which stay zero.
fn decompress_rle(packed: &[u8], unpacked_size: usize) -> Vec<u8> {
    let mut out = vec![0u8; unpacked_size];
    let mut input = packed.iter().skip(4).copied();
    let mut at = 0usize;

    while at < unpacked_size {
        let Some(control) = input.next() else { break };
        if control & 0x80 != 0 {
            let count = (control & 0x7F) as usize + 1;
            for _ in 0..count {
                if at >= unpacked_size {
                    break;
                }
                let Some(byte) = input.next() else { break };
                out[at] = byte;
                at += 1;
            }
        } else {
            at += control as usize + 1;
        }
    }

    out
}

/// Apply a BSDIFF40 delta to `source`
fn apply_bsd0(patch_data: &[u8], source: &[u8]) -> Result<Vec<u8>> {
    if patch_data.len() < BSDIFF_HEADER_SIZE {
        return Err(Error::corrupt("BSDIFF header truncated"));
    }

    let mut cursor = Cursor::new(patch_data);
    if cursor.read_u64::<LittleEndian>()? != BSDIFF40_SIGNATURE {
        return Err(Error::corrupt("BSDIFF signature mismatch"));
    }
    let ctrl_size = cursor.read_u64::<LittleEndian>()? as usize;
    let data_size = cursor.read_u64::<LittleEndian>()? as usize;
    let new_size = cursor.read_u64::<LittleEndian>()? as usize;

    let ctrl_at = BSDIFF_HEADER_SIZE;
    let data_at = ctrl_at + ctrl_size;
    let extra_at = data_at + data_size;
    if extra_at > patch_data.len() {
        return Err(Error::corrupt("BSDIFF blocks exceed patch size"));
    }

    let ctrl_block = &patch_data[ctrl_at..data_at];
    let mut data_block = &patch_data[data_at..extra_at];
    let mut extra_block = &patch_data[extra_at..];

    let mut output = vec![0u8; new_size];
    let mut new_at = 0usize;
    let mut old_at = 0usize;
    let mut ctrl = ctrl_block;

    while new_at < new_size {
        if ctrl.len() < BSDIFF_CTRL_RECORD_SIZE {
            return Err(Error::corrupt("BSDIFF control block exhausted"));
        }
        let mut record = Cursor::new(ctrl);
        let add_len = record.read_u32::<LittleEndian>()? as usize;
        let move_len = record.read_u32::<LittleEndian>()? as usize;
        let old_move = record.read_u32::<LittleEndian>()?;
        ctrl = &ctrl[BSDIFF_CTRL_RECORD_SIZE..];

        if new_at + add_len > new_size || add_len > data_block.len() {
            return Err(Error::corrupt("BSDIFF diff run out of range"));
        }

        // Diff bytes add to the source, saturating at the source end
        output[new_at..new_at + add_len].copy_from_slice(&data_block[..add_len]);
        data_block = &data_block[add_len..];

        let combine = if old_at + add_len >= source.len() {
            source.len().saturating_sub(old_at)
        } else {
            add_len
        };
        for i in 0..combine {
            output[new_at + i] = output[new_at + i].wrapping_add(source[old_at + i]);
        }
        new_at += add_len;
        old_at += add_len;

        // Extra bytes copy through verbatim
        if new_at + move_len > new_size || move_len > extra_block.len() {
            return Err(Error::corrupt("BSDIFF extra run out of range"));
        }
        output[new_at..new_at + move_len].copy_from_slice(&extra_block[..move_len]);
        extra_block = &extra_block[move_len..];
        new_at += move_len;

        // The source pointer moves by a sign-and-magnitude delta: with
        // the high bit set, the low 31 bits are a backward distance
        if old_move & 0x8000_0000 != 0 {
            let back = old_move.wrapping_sub(0x8000_0000) as usize;
            old_at = old_at.wrapping_sub(back);
        } else {
            old_at += old_move as usize;
        }
    }

    Ok(output)
}

/// Apply one parsed patch blob to the current file version
fn apply_patch(header: &PatchHeader, payload: &[u8], current: &[u8]) -> Result<Vec<u8>> {
    // The payload may be RLE packed; a packed payload is smaller than
    // the declared patch data size.
    let declared = header.size_of_patch_data as usize - PATCH_HEADER_SIZE;
    let stored = header.xfrm_block_size as usize - XFRM_HEADER_SIZE;
    let unpacked;
    let payload = if stored < declared {
        unpacked = decompress_rle(payload, declared);
        &unpacked[..]
    } else {
        payload
    };

    let result = match header.patch_type {
        PATCH_TYPE_COPY => {
            // The new file bytes verbatim
            payload.to_vec()
        }
        PATCH_TYPE_BSD0 => apply_bsd0(payload, current)?,
        other => {
            return Err(Error::unsupported(format!(
                "unknown patch type 0x{:08X}",
                other
            )))
        }
    };

    if result.len() != header.size_after_patch as usize {
        return Err(Error::corrupt(format!(
            "patched size {} does not match declared {}",
            result.len(),
            header.size_after_patch
        )));
    }

    let digest: [u8; 16] = Md5::digest(&result).into();
    if digest != header.md5_after_patch {
        return Err(Error::corrupt("patched data MD5 mismatch"));
    }

    Ok(result)
}

impl Archive {
    /// Attach a patch archive to the end of this archive's chain
    ///
    /// `prefix` is prepended to every name looked up in the patch, the
    /// way localized game data is laid out (`Base\`, `enGB\`, ...).
    pub fn add_patch(&mut self, patch: Archive, prefix: &str) -> Result<()> {
        let mut patch = Box::new(patch);
        patch.patch_prefix = normalize_prefix(prefix);

        let mut tail = &mut self.patch;
        while let Some(next) = tail {
            tail = &mut next.patch;
        }
        *tail = Some(patch);
        Ok(())
    }

    /// Attach a patch archive, deriving the prefix from the patch's
    /// own contents
    pub fn add_patch_auto(&mut self, patch: Archive) -> Result<()> {
        let prefix = derive_patch_prefix(&patch);
        self.add_patch(patch, &prefix)
    }

    /// True when at least one patch archive is attached
    pub fn is_patched(&self) -> bool {
        self.patch.is_some()
    }

    /// Read a file through the patch chain
    ///
    /// The base version comes from this archive (or the first chain
    /// member carrying a full copy); each patch whose before-MD5 matches
    /// the current bytes is applied in order. Patch records that do not
    /// chain are skipped.
    pub fn read_patched_file(&mut self, name: &str) -> Result<Vec<u8>> {
        let mut current: Option<Vec<u8>> = match self.find_entry(name, 0) {
            Some(index) => {
                let entry = self.file_table.get(index).unwrap();
                if entry.flags.contains(BlockFlags::PATCH_FILE) {
                    None
                } else {
                    Some(self.read_file(name)?)
                }
            }
            None => None,
        };

        let mut patch = self.patch.as_deref_mut();
        while let Some(archive) = patch {
            let patched_name = format!("{}{}", archive.patch_prefix, name);
            let lookup = if archive.find_entry(&patched_name, 0).is_some() {
                Some(patched_name.clone())
            } else if archive.find_entry(name, 0).is_some() {
                Some(name.to_string())
            } else {
                None
            };

            if let Some(found) = lookup {
                let index = archive.find_entry(&found, 0).unwrap();
                let entry = archive.file_table.get(index).unwrap().clone();

                if entry.flags.contains(BlockFlags::DELETE_MARKER) {
                    current = None;
                } else if !entry.flags.contains(BlockFlags::PATCH_FILE) {
                    // A full replacement resets the chain
                    current = Some(archive.read_file(&found)?);
                } else {
                    let blob = archive.read_file(&found)?;
                    let header = parse_patch_header(&blob)?;
                    let payload = &blob[PATCH_HEADER_SIZE..];

                    match current.take() {
                        Some(bytes) => {
                            let digest: [u8; 16] = Md5::digest(&bytes).into();
                            if digest == header.md5_before_patch
                                || header.md5_before_patch == [0; 16]
                            {
                                current = Some(apply_patch(&header, payload, &bytes)?);
                            } else {
                                // Out-of-sequence patches are skipped
                                log::debug!("patch for {} does not chain, skipped", found);
                                current = Some(bytes);
                            }
                        }
                        None if header.patch_type == PATCH_TYPE_COPY => {
                            current = Some(apply_patch(&header, payload, &[])?);
                        }
                        None => {
                            return Err(Error::BaseFileMissing(name.to_string()));
                        }
                    }
                }
            }

            patch = archive.patch.as_deref_mut();
        }

        current.ok_or_else(|| Error::NotFound(name.to_string()))
    }
}

fn normalize_prefix(prefix: &str) -> String {
    if prefix.is_empty() || prefix.ends_with('\\') {
        prefix.to_string()
    } else {
        format!("{}\\", prefix)
    }
}

/// Guess the patch prefix from `*-md5.lst` style index files
fn derive_patch_prefix(patch: &Archive) -> String {
    for info in patch.list() {
        if info.name.ends_with("-md5.lst") {
            if let Some(pos) = info.name.rfind('\\') {
                return normalize_prefix(&info.name[..pos]);
            }
        }
    }
    String::new()
}

/// Build a `PTCH` COPY blob; used when authoring patch archives
pub fn build_copy_patch(before: &[u8], after: &[u8]) -> Vec<u8> {
    build_patch_blob(before, after, PATCH_TYPE_COPY, after.to_vec())
}

/// Build a `PTCH` BSD0 blob whose delta is a trivial whole-file diff
pub fn build_bsd0_patch(before: &[u8], after: &[u8]) -> Vec<u8> {
    // One control record adds the full new file over the source
    let mut diff = Vec::with_capacity(after.len());
    for (i, &byte) in after.iter().enumerate() {
        let old = before.get(i).copied().unwrap_or(0);
        // The applier re-adds the source bytes it can reach
        if i < before.len() {
            diff.push(byte.wrapping_sub(old));
        } else {
            diff.push(byte);
        }
    }

    let mut payload = Vec::new();
    payload.extend_from_slice(&BSDIFF40_SIGNATURE.to_le_bytes());
    payload.extend_from_slice(&(BSDIFF_CTRL_RECORD_SIZE as u64).to_le_bytes());
    payload.extend_from_slice(&(diff.len() as u64).to_le_bytes());
    payload.extend_from_slice(&(after.len() as u64).to_le_bytes());
    payload.extend_from_slice(&(after.len() as u32).to_le_bytes());
    payload.extend_from_slice(&0u32.to_le_bytes());
    payload.extend_from_slice(&0u32.to_le_bytes());
    payload.extend_from_slice(&diff);

    build_patch_blob(before, after, PATCH_TYPE_BSD0, payload)
}

fn build_patch_blob(before: &[u8], after: &[u8], patch_type: u32, payload: Vec<u8>) -> Vec<u8> {
    let md5_before: [u8; 16] = Md5::digest(before).into();
    let md5_after: [u8; 16] = Md5::digest(after).into();

    let mut out = Vec::with_capacity(PATCH_HEADER_SIZE + payload.len());
    out.extend_from_slice(&PATCH_SIGNATURE.to_le_bytes());
    out.extend_from_slice(&((PATCH_HEADER_SIZE + payload.len()) as u32).to_le_bytes());
    out.extend_from_slice(&(before.len() as u32).to_le_bytes());
    out.extend_from_slice(&(after.len() as u32).to_le_bytes());
    out.extend_from_slice(&MD5_SIGNATURE.to_le_bytes());
    out.extend_from_slice(&40u32.to_le_bytes());
    out.extend_from_slice(&md5_before);
    out.extend_from_slice(&md5_after);
    out.extend_from_slice(&XFRM_SIGNATURE.to_le_bytes());
    out.extend_from_slice(&((XFRM_HEADER_SIZE + payload.len()) as u32).to_le_bytes());
    out.extend_from_slice(&patch_type.to_le_bytes());
    out.extend_from_slice(&payload);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rle_literals_and_zero_runs() {
        // 4 skipped bytes, then: copy 3 literals, skip 2, copy 1
        let packed = [0u8, 0, 0, 0, 0x82, 10, 20, 30, 0x01, 0x80, 40];
        let out = decompress_rle(&packed, 7);
        assert_eq!(out, [10, 20, 30, 0, 0, 40, 0]);
    }

    #[test]
    fn test_rle_truncated_input_leaves_zeros() {
        let packed = [0u8, 0, 0, 0, 0x83, 1, 2];
        let out = decompress_rle(&packed, 8);
        assert_eq!(&out[..2], &[1, 2]);
        assert!(out[2..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_copy_patch_round_trip() {
        let before = b"the old file contents".to_vec();
        let after = b"completely new data".to_vec();

        let blob = build_copy_patch(&before, &after);
        let header = parse_patch_header(&blob).unwrap();
        assert_eq!(header.patch_type, PATCH_TYPE_COPY);

        let result = apply_patch(&header, &blob[PATCH_HEADER_SIZE..], &before).unwrap();
        assert_eq!(result, after);
    }

    #[test]
    fn test_bsd0_patch_round_trip() {
        let before: Vec<u8> = (0..200u8).collect();
        let mut after = before.clone();
        after[40] = 0xAA;
        after[41] = 0xBB;
        after.extend_from_slice(b"trailing addition");

        let blob = build_bsd0_patch(&before, &after);
        let header = parse_patch_header(&blob).unwrap();
        assert_eq!(header.patch_type, PATCH_TYPE_BSD0);

        let result = apply_patch(&header, &blob[PATCH_HEADER_SIZE..], &before).unwrap();
        assert_eq!(result, after);
    }

    #[test]
    fn test_bsd0_shrinking_patch() {
        let before: Vec<u8> = (0..100u8).collect();
        let after: Vec<u8> = before[..60].to_vec();

        let blob = build_bsd0_patch(&before, &after);
        let header = parse_patch_header(&blob).unwrap();
        let result = apply_patch(&header, &blob[PATCH_HEADER_SIZE..], &before).unwrap();
        assert_eq!(result, after);
    }

    #[test]
    fn test_patch_result_md5_is_checked() {
        let before = b"base".to_vec();
        let after = b"new!".to_vec();
        let mut blob = build_copy_patch(&before, &after);

        // Corrupt a payload byte; the after-MD5 check must fire
        let last = blob.len() - 1;
        blob[last] ^= 0xFF;
        let header = parse_patch_header(&blob).unwrap();
        assert!(matches!(
            apply_patch(&header, &blob[PATCH_HEADER_SIZE..], &before),
            Err(Error::FileCorrupt(_))
        ));
    }

    #[test]
    fn test_bsd0_backward_seek() {
        // Two records; the first rewinds the source pointer by four so
        // the second adds the same source run again.
        let source = b"ABCDEFGH";

        let mut payload = Vec::new();
        payload.extend_from_slice(&BSDIFF40_SIGNATURE.to_le_bytes());
        payload.extend_from_slice(&(2 * BSDIFF_CTRL_RECORD_SIZE as u64).to_le_bytes());
        payload.extend_from_slice(&8u64.to_le_bytes());
        payload.extend_from_slice(&8u64.to_le_bytes());
        // add 4, move 0, seek back 4 (0x80000000 | 4)
        payload.extend_from_slice(&4u32.to_le_bytes());
        payload.extend_from_slice(&0u32.to_le_bytes());
        payload.extend_from_slice(&0x8000_0004u32.to_le_bytes());
        // add 4, move 0, no seek
        payload.extend_from_slice(&4u32.to_le_bytes());
        payload.extend_from_slice(&0u32.to_le_bytes());
        payload.extend_from_slice(&0u32.to_le_bytes());
        // zero diff bytes: the output is the source runs verbatim
        payload.extend_from_slice(&[0u8; 8]);

        let result = apply_bsd0(&payload, source).unwrap();
        assert_eq!(&result, b"ABCDABCD");
    }
}
