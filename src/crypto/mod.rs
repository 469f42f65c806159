//! Encryption, decryption, and hashing primitives for MPQ archives

pub mod hash;
pub mod jenkins;
pub mod keys;
pub mod signature;

pub use hash::{hash_string, hash_type};
pub use jenkins::{jenkins_hashlittle2, jenkins_one_at_a_time};
pub use keys::{detect_file_key_by_content, detect_file_key_by_sector_table, file_key};

/// Generate the MPQ encryption table at compile time
const fn generate_encryption_table() -> [u32; 0x500] {
    let mut table = [0u32; 0x500];
    let mut seed: u32 = 0x00100001;

    let mut index1 = 0;
    while index1 < 0x100 {
        let mut index2 = 0;
        while index2 < 5 {
            let table_index = index1 + index2 * 0x100;

            seed = (seed.wrapping_mul(125).wrapping_add(3)) % 0x2AAAAB;
            let temp1 = (seed & 0xFFFF) << 0x10;

            seed = (seed.wrapping_mul(125).wrapping_add(3)) % 0x2AAAAB;
            let temp2 = seed & 0xFFFF;

            table[table_index] = temp1 | temp2;
            index2 += 1;
        }
        index1 += 1;
    }

    table
}

/// The static encryption table used by all MPQ operations
pub const ENCRYPTION_TABLE: [u32; 0x500] = generate_encryption_table();

/// Decrypt a block of little-endian DWORDs in place
pub fn decrypt_block(data: &mut [u32], mut key: u32) {
    if key == 0 {
        return;
    }

    let mut seed: u32 = 0xEEEEEEEE;

    for value in data.iter_mut() {
        seed = seed.wrapping_add(ENCRYPTION_TABLE[0x400 + (key & 0xFF) as usize]);

        let ch = *value ^ key.wrapping_add(seed);
        *value = ch;

        key = (!key << 0x15).wrapping_add(0x11111111) | (key >> 0x0B);
        seed = ch
            .wrapping_add(seed)
            .wrapping_add(seed << 5)
            .wrapping_add(3);
    }
}

/// Encrypt a block of little-endian DWORDs in place
pub fn encrypt_block(data: &mut [u32], mut key: u32) {
    if key == 0 {
        return;
    }

    let mut seed: u32 = 0xEEEEEEEE;

    for value in data.iter_mut() {
        seed = seed.wrapping_add(ENCRYPTION_TABLE[0x400 + (key & 0xFF) as usize]);

        let ch = *value;
        *value = ch ^ key.wrapping_add(seed);

        key = (!key << 0x15).wrapping_add(0x11111111) | (key >> 0x0B);
        seed = ch
            .wrapping_add(seed)
            .wrapping_add(seed << 5)
            .wrapping_add(3);
    }
}

/// Decrypt a byte buffer in place
///
/// The cipher operates on DWORDs; a trailing partial DWORD is processed as
/// if it were zero padded, so encrypt/decrypt round-trip for any length.
pub fn decrypt_bytes(data: &mut [u8], key: u32) {
    transform_bytes(data, key, decrypt_block);
}

/// Encrypt a byte buffer in place
pub fn encrypt_bytes(data: &mut [u8], key: u32) {
    transform_bytes(data, key, encrypt_block);
}

fn transform_bytes(data: &mut [u8], key: u32, f: fn(&mut [u32], u32)) {
    if data.is_empty() || key == 0 {
        return;
    }

    let dword_count = data.len().div_ceil(4);
    let mut buffer: Vec<u32> = Vec::with_capacity(dword_count);
    for chunk in data.chunks(4) {
        let mut dword = [0u8; 4];
        dword[..chunk.len()].copy_from_slice(chunk);
        buffer.push(u32::from_le_bytes(dword));
    }

    f(&mut buffer, key);

    for (chunk, value) in data.chunks_mut(4).zip(&buffer) {
        let bytes = value.to_le_bytes();
        let n = chunk.len();
        chunk.copy_from_slice(&bytes[..n]);
    }
}

/// Adler-32 checksum as defined by RFC 1950
///
/// Used for the per-sector checksums; no crate in our stack exposes it
/// standalone.
pub fn adler32(data: &[u8]) -> u32 {
    const MOD_ADLER: u32 = 65521;
    let mut a: u32 = 1;
    let mut b: u32 = 0;

    // Process in runs short enough that the sums cannot overflow
    for chunk in data.chunks(5552) {
        for &byte in chunk {
            a += byte as u32;
            b += a;
        }
        a %= MOD_ADLER;
        b %= MOD_ADLER;
    }

    (b << 16) | a
}

/// Decrypt a single DWORD value
pub fn decrypt_dword(value: u32, key: u32) -> u32 {
    if key == 0 {
        return value;
    }

    let seed = 0xEEEEEEEEu32.wrapping_add(ENCRYPTION_TABLE[0x400 + (key & 0xFF) as usize]);
    value ^ key.wrapping_add(seed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encryption_table_generation() {
        // Known values from the MPQ specification
        assert_eq!(ENCRYPTION_TABLE[0x000], 0x55C6_36E2);
        assert_eq!(ENCRYPTION_TABLE[0x001], 0x02BE_0170);
        assert_eq!(ENCRYPTION_TABLE[0x002], 0x584B_71D4);
        assert_eq!(ENCRYPTION_TABLE[0x003], 0x2984_F00E);
        assert_eq!(ENCRYPTION_TABLE[0x004], 0xB682_C809);

        assert_eq!(ENCRYPTION_TABLE[0x100], 0x708C_9EEC);
        assert_eq!(ENCRYPTION_TABLE[0x200], 0xEE8D_D024);
        assert_eq!(ENCRYPTION_TABLE[0x300], 0x4C20_2B7A);
        assert_eq!(ENCRYPTION_TABLE[0x400], 0x3A6F_DD6C);

        assert_eq!(ENCRYPTION_TABLE[0x4FE], 0x4C10_790D);
        assert_eq!(ENCRYPTION_TABLE[0x4FF], 0x7303_286C);
    }

    #[test]
    fn test_encrypt_decrypt_round_trip() {
        let original = vec![
            0x12345678u32,
            0x9ABCDEF0,
            0x13579BDF,
            0x2468ACE0,
            0xFEDCBA98,
            0x76543210,
        ];
        let key = 0xC1EB1CEF;

        let mut data = original.clone();
        encrypt_block(&mut data, key);
        assert_ne!(data, original);

        decrypt_block(&mut data, key);
        assert_eq!(data, original);
    }

    #[test]
    fn test_byte_round_trip_odd_length() {
        let original: Vec<u8> = (0..23).collect();
        let key = 0xDEADBEEF;

        let mut data = original.clone();
        encrypt_bytes(&mut data, key);
        assert_ne!(data, original);

        decrypt_bytes(&mut data, key);
        assert_eq!(data, original);
    }

    #[test]
    fn test_decrypt_single_dword() {
        let original = 0x12345678;
        let key = 0xC1EB1CEF;

        let mut data = vec![original];
        encrypt_block(&mut data, key);

        assert_eq!(decrypt_dword(data[0], key), original);
    }

    #[test]
    fn test_adler32_vectors() {
        // RFC 1950 reference values
        assert_eq!(adler32(b""), 1);
        assert_eq!(adler32(b"Wikipedia"), 0x11E60398);
    }

    #[test]
    fn test_zero_key_is_identity() {
        let original = vec![0x12345678u32, 0x9ABCDEF0];
        let mut data = original.clone();

        encrypt_block(&mut data, 0);
        assert_eq!(data, original);

        decrypt_block(&mut data, 0);
        assert_eq!(data, original);
    }
}
