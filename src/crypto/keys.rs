//! File encryption key derivation and recovery

use super::{hash_string, hash_type, ENCRYPTION_TABLE};
use crate::plain_name;

/// Derive the encryption key for a file
///
/// The key is the FILE_KEY hash of the plain name. With `fix_key` set the
/// key additionally depends on the file's position and size, so moving or
/// resizing the file invalidates it.
pub fn file_key(filename: &str, mpq_offset: u64, file_size: u32, fix_key: bool) -> u32 {
    let base = hash_string(plain_name(filename), hash_type::FILE_KEY);
    if fix_key {
        base.wrapping_add(mpq_offset as u32) ^ file_size
    } else {
        base
    }
}

/// Recover a file key from its encrypted sector-offset table
///
/// The first DWORD of a decrypted sector-offset table equals the byte
/// length of the table itself, which pins the sum of both key stream
/// seeds; only the low byte of the key remains unknown and is found by
/// trying all 256 values. The second DWORD must not exceed the first by
/// more than one sector, which rules out false positives.
///
/// Returns the key already incremented to the file key proper (the table
/// is encrypted with `key - 1`).
pub fn detect_file_key_by_sector_table(
    encrypted: &[u32],
    sector_size: u32,
    decrypted0: u32,
) -> Option<u32> {
    if encrypted.len() < 2 {
        return None;
    }
    let decrypted1_max = sector_size.wrapping_add(decrypted0);

    // The combined value of key + initial seed, recovered from the known
    // plaintext of the first DWORD.
    let key1_plus_key2 = (encrypted[0] ^ decrypted0).wrapping_sub(0xEEEEEEEE);

    for i in 0..0x100u32 {
        let mut key1 = key1_plus_key2.wrapping_sub(ENCRYPTION_TABLE[0x400 + i as usize]);
        let mut key2 = 0xEEEEEEEEu32;

        key2 = key2.wrapping_add(ENCRYPTION_TABLE[0x400 + (key1 & 0xFF) as usize]);
        let plain0 = encrypted[0] ^ key1.wrapping_add(key2);

        if plain0 == decrypted0 {
            // Candidate found; check it holds for the second DWORD too
            let save_key = key1.wrapping_add(1);

            key1 = (!key1 << 0x15).wrapping_add(0x11111111) | (key1 >> 0x0B);
            key2 = plain0
                .wrapping_add(key2)
                .wrapping_add(key2 << 5)
                .wrapping_add(3);

            key2 = key2.wrapping_add(ENCRYPTION_TABLE[0x400 + (key1 & 0xFF) as usize]);
            let plain1 = encrypted[1] ^ key1.wrapping_add(key2);

            if plain1 <= decrypted1_max {
                return Some(save_key);
            }
        }
    }

    None
}

/// Recover a file key from two known plaintext DWORDs
pub fn detect_file_key_by_known_content(
    encrypted: &[u32],
    decrypted0: u32,
    decrypted1: u32,
) -> Option<u32> {
    if encrypted.len() < 2 {
        return None;
    }
    let key1_plus_key2 = (encrypted[0] ^ decrypted0).wrapping_sub(0xEEEEEEEE);

    for i in 0..0x100u32 {
        let mut key1 = key1_plus_key2.wrapping_sub(ENCRYPTION_TABLE[0x400 + i as usize]);
        let mut key2 = 0xEEEEEEEEu32;

        key2 = key2.wrapping_add(ENCRYPTION_TABLE[0x400 + (key1 & 0xFF) as usize]);
        let plain0 = encrypted[0] ^ key1.wrapping_add(key2);

        if plain0 == decrypted0 {
            let save_key = key1;

            key1 = (!key1 << 0x15).wrapping_add(0x11111111) | (key1 >> 0x0B);
            key2 = plain0
                .wrapping_add(key2)
                .wrapping_add(key2 << 5)
                .wrapping_add(3);

            key2 = key2.wrapping_add(ENCRYPTION_TABLE[0x400 + (key1 & 0xFF) as usize]);
            let plain1 = encrypted[1] ^ key1.wrapping_add(key2);

            if plain1 == decrypted1 {
                return Some(save_key);
            }
        }
    }

    None
}

/// Guess a single-unit file's key from well-known file headers
///
/// Tried in turn: RIFF/WAVE, EXE, and XML headers.
pub fn detect_file_key_by_content(
    encrypted: &[u32],
    sector_size: u32,
    file_size: u32,
) -> Option<u32> {
    // "RIFF" + chunk size
    if sector_size >= 0x0C {
        if let Some(key) =
            detect_file_key_by_known_content(encrypted, 0x46464952, file_size.wrapping_sub(8))
        {
            return Some(key);
        }
    }

    // "MZ" header
    if sector_size > 0x40 {
        if let Some(key) = detect_file_key_by_known_content(encrypted, 0x00905A4D, 0x00000003) {
            return Some(key);
        }
    }

    // "<?xm" "l ve"
    if sector_size > 0x04 {
        if let Some(key) = detect_file_key_by_known_content(encrypted, 0x6D783F3C, 0x6576206C) {
            return Some(key);
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::encrypt_block;

    #[test]
    fn test_file_key_uses_plain_name() {
        let full = file_key("DBFilesClient\\Achievement.dbc", 0, 0, false);
        let plain = file_key("Achievement.dbc", 0, 0, false);
        assert_eq!(full, plain);
    }

    #[test]
    fn test_fix_key_adjustment() {
        let base = file_key("data.bin", 0, 0, false);
        let fixed = file_key("data.bin", 0x1000, 0x2345, true);
        assert_eq!(fixed, base.wrapping_add(0x1000) ^ 0x2345);
    }

    #[test]
    fn test_detect_key_from_sector_table() {
        let sector_size = 4096u32;
        let key = file_key("music\\intro.wav", 0x230, 10000, false);

        // A plausible sector offset table for a 3-sector file
        let table = vec![16u32, 16 + 900, 16 + 2000, 16 + 3100];
        let mut encrypted = table.clone();
        encrypt_block(&mut encrypted, key.wrapping_sub(1));

        let detected =
            detect_file_key_by_sector_table(&encrypted, sector_size, (table.len() * 4) as u32);
        assert_eq!(detected, Some(key));
    }

    #[test]
    fn test_detect_key_known_content() {
        let key = 0x13579BDF;
        let mut encrypted = vec![0x46464952u32, 0x00001234];
        encrypt_block(&mut encrypted, key);

        let detected = detect_file_key_by_known_content(&encrypted, 0x46464952, 0x00001234);
        assert_eq!(detected, Some(key));
    }

    #[test]
    fn test_detect_key_failure() {
        // Garbage that decrypts to nothing sensible under any key
        let encrypted = vec![0xFFFFFFFFu32, 0xFFFFFFFF];
        assert_eq!(
            detect_file_key_by_known_content(&encrypted, 0x12345678, 0x9ABCDEF0),
            None
        );
    }
}
