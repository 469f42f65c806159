//! Whole-archive encrypted provider (`mpqe-` prefix)
//!
//! The entire file is encrypted in 64-byte chunks with a Salsa-style
//! round function keyed from one of the known installer authentication
//! codes. The right code is found by brute force: the first chunk of
//! every known key is tried until one decrypts to an MPQ signature.
//! Read-only.

use super::base::BaseProvider;
use super::block::BlockIo;
use crate::{Error, Result};

/// Size of one encrypted chunk
pub(crate) const MPQE_CHUNK_SIZE: usize = 0x40;

const KEY_TEMPLATE: &[u8; 64] = b"expand 32-byte k000000000000000000000000000000000000000000000000";

/// Authentication codes published with the various game installers
const AUTH_CODES: &[&str] = &[
    // Starcraft II (Heart of the Swarm)
    "S48B6CDTN5XEQAKQDJNDLJBJ73FDFM3U",
    // Diablo III installers
    "UCMXF6EJY352EFH4XFRXCFH2XC9MQRZK",
    "MMKVHY48RP7WXP4GHYBQ7SL9J9UNPHBP",
    "8MXLWHQ7VGGLTZ9MQZQSFDCLJYET3CPP",
    "EJ2R5TM6XFE2GUNG5QDGHKQ9UAKPWZSZ",
    "PBGFBE42Z6LNK65UGJQ3WZVMCLP4HQQT",
    "X7SEJJS9TSGCW5P28EBSC47AJPEY8VU2",
    "5KVBQA8VYE6XRY3DLGC5ZDE4XS4P7YA2",
    "478JD2K56EVNVVY4XX8TDWYT5B8KB254",
    "8TS4VNFQRZTN6YWHE9CHVDH9NVWD474A",
    "LJ52Z32DF4LZ4ZJJXVKK3AZQA6GABLJB",
    "K6BDHY2ECUE2545YKNLBJPVYWHE7XYAG",
    "NDVW8GWLAYCRPGRNY8RT7ZZUQU63VLPR",
    "6VWCQTN8V3ZZMRUCZXV8A8CGUX2TAA8H",
    // Starcraft II (Wings of Liberty) installers
    "Y45MD3CAK4KXSSXHYD9VY64Z8EKJ4XFX",
    "G8MN8UDG6NA2ANGY6A3DNY82HRGF29ZH",
    "W9RRHLB2FDU9WW5B3ECEBLRSFWZSF7HW",
    "3DH5RE5NVM5GTFD85LXGWT6FK859ETR5",
    "8WLKUAXE94PFQU4Y249PAZ24N4R4XKTQ",
    "A34DXX3VHGGXSQBRFE5UFFDXMF9G4G54",
    "ZG7J9K938HJEFWPQUA768MA2PFER6EAJ",
    "NE7CUNNNTVAPXV7E3G2BSVBWGVMW8BL2",
    "3V9E2FTMBM9QQWK7U6MAMWAZWQDB838F",
    "2NSFB8MELULJ83U6YHA3UP6K4MQD48L6",
    "QA2TZ9EWZ4CUU8BMB5WXCTY65F9CSW4E",
    "VHB378W64BAT9SH7D68VV9NLQDK9YEGT",
    "U3NFQJV4M6GC7KBN9XQJ3BRDN3PLD9NE",
];

/// Where each key word lands when the state is loaded for shuffling
const SHUFFLE_ORDER: [usize; 16] = [
    0x0E, 0x0C, 0x05, 0x0F, 0x0A, 0x07, 0x0B, 0x09, 0x03, 0x06, 0x08, 0x0D, 0x02, 0x04, 0x01,
    0x00,
];

/// Quarter-round state indices; rotations are 7, 9, 13, 18
const ROUND_GROUPS: [[usize; 4]; 8] = [
    [0x0A, 0x03, 0x02, 0x0E],
    [0x07, 0x06, 0x04, 0x0C],
    [0x0B, 0x08, 0x01, 0x05],
    [0x09, 0x0D, 0x00, 0x0F],
    [0x04, 0x08, 0x09, 0x0E],
    [0x01, 0x0D, 0x0A, 0x0C],
    [0x00, 0x03, 0x07, 0x05],
    [0x02, 0x06, 0x0B, 0x0F],
];

/// Which shuffled and mirror words mask each output word
const XOR_SHUFFLED: [usize; 16] = [
    0x0E, 0x04, 0x08, 0x09, 0x0A, 0x0C, 0x01, 0x0D, 0x03, 0x07, 0x05, 0x00, 0x02, 0x06, 0x0B,
    0x0F,
];
const XOR_MIRROR: [usize; 16] = [
    0x00, 0x0D, 0x0A, 0x07, 0x04, 0x01, 0x0E, 0x0B, 0x08, 0x05, 0x02, 0x0F, 0x0C, 0x09, 0x06,
    0x03,
];

/// Expand an authentication code into the 64-byte chunk key
fn key_from_auth_code(auth_code: &str) -> [u8; 64] {
    let mut key = *KEY_TEMPLATE;
    let code = auth_code.as_bytes();

    let auth_word = |i: usize| -> [u8; 4] { code[i * 4..i * 4 + 4].try_into().unwrap() };

    // Scattered copy of the code into the key body
    for (slot, word) in [
        (0x00, 0x03),
        (0x02, 0x07),
        (0x03, 0x02),
        (0x05, 0x06),
        (0x06, 0x01),
        (0x08, 0x05),
        (0x09, 0x00),
        (0x0B, 0x04),
    ] {
        key[0x10 + slot * 4..0x10 + slot * 4 + 4].copy_from_slice(&auth_word(word));
    }

    key
}

/// Decrypt whole chunks in place; `byte_offset` selects the key stream
fn decrypt_chunks(key: &[u8; 64], byte_offset: u64, data: &mut [u8]) {
    debug_assert_eq!(data.len() % MPQE_CHUNK_SIZE, 0);

    let mut mirror = [0u32; 16];
    for (word, chunk) in mirror.iter_mut().zip(key.chunks_exact(4)) {
        *word = u32::from_le_bytes(chunk.try_into().unwrap());
    }

    let chunk_index = byte_offset / MPQE_CHUNK_SIZE as u64;
    mirror[0x05] = (chunk_index >> 32) as u32;
    mirror[0x08] = chunk_index as u32;

    for block in data.chunks_exact_mut(MPQE_CHUNK_SIZE) {
        let mut shuffled = [0u32; 16];
        for (i, &slot) in SHUFFLE_ORDER.iter().enumerate() {
            shuffled[slot] = mirror[i];
        }

        for _ in 0..10 {
            for [a, b, c, d] in ROUND_GROUPS {
                shuffled[a] ^= (shuffled[d].wrapping_add(shuffled[c])).rotate_left(7);
                shuffled[b] ^= (shuffled[a].wrapping_add(shuffled[d])).rotate_left(9);
                shuffled[c] ^= (shuffled[b].wrapping_add(shuffled[a])).rotate_left(13);
                shuffled[d] ^= (shuffled[c].wrapping_add(shuffled[b])).rotate_left(18);
            }
        }

        for i in 0..16 {
            let mask = shuffled[XOR_SHUFFLED[i]].wrapping_add(mirror[XOR_MIRROR[i]]);
            let at = i * 4;
            let word = u32::from_le_bytes(block[at..at + 4].try_into().unwrap()) ^ mask;
            block[at..at + 4].copy_from_slice(&word.to_le_bytes());
        }

        // Advance the chunk counter embedded in the key
        mirror[0x08] = mirror[0x08].wrapping_add(1);
        if mirror[0x08] == 0 {
            mirror[0x05] = mirror[0x05].wrapping_add(1);
        }
    }
}

/// Cipher state of an opened encrypted stream
#[derive(Debug)]
pub(crate) struct MpqeCipher {
    key: [u8; 64],
    stream_size: u64,
}

impl MpqeCipher {
    /// Brute-force the key list against the first chunk of the file
    pub(crate) fn detect(base: &mut BaseProvider) -> Result<Self> {
        let file_size = base.size();
        if file_size < MPQE_CHUNK_SIZE as u64 {
            return Err(Error::bad_format("encrypted archive shorter than one chunk"));
        }

        let mut first_chunk = [0u8; MPQE_CHUNK_SIZE];
        base.read_at(0, &mut first_chunk)?;

        for auth_code in AUTH_CODES {
            let key = key_from_auth_code(auth_code);
            let mut trial = first_chunk;
            decrypt_chunks(&key, 0, &mut trial);

            // Every known encrypted MPQ has the archive header first
            if &trial[0..3] == b"MPQ" {
                log::debug!("encrypted archive key found by brute force");
                return Ok(Self {
                    key,
                    stream_size: file_size,
                });
            }
        }

        Err(Error::UnknownFileKey("(encrypted archive)".to_string()))
    }

}

/// Scheduler adapter for the encrypted layer
pub(crate) struct MpqeIo<'a> {
    pub(crate) cipher: &'a mut MpqeCipher,
    pub(crate) base: &'a mut BaseProvider,
}

impl BlockIo for MpqeIo<'_> {
    fn block_size(&self) -> u64 {
        MPQE_CHUNK_SIZE as u64
    }

    fn stream_size(&self) -> u64 {
        self.cipher.stream_size
    }

    fn is_complete(&self) -> bool {
        true
    }

    fn block_available(&self, _block_offset: u64) -> bool {
        true
    }

    fn has_master(&self) -> bool {
        false
    }

    fn read_run(&mut self, start: u64, end: u64, out: &mut [u8], _available: bool) -> Result<()> {
        self.base.read_at(start, out)?;

        // Decryption works on whole chunks; a short tail is padded out
        // and the padding discarded.
        let len = out.len();
        if len % MPQE_CHUNK_SIZE == 0 {
            decrypt_chunks(&self.cipher.key, start, out);
        } else {
            let mut padded = vec![0u8; len.div_ceil(MPQE_CHUNK_SIZE) * MPQE_CHUNK_SIZE];
            padded[..len].copy_from_slice(out);
            decrypt_chunks(&self.cipher.key, start, &mut padded);
            out.copy_from_slice(&padded[..len]);
        }
        let _ = end;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_template_layout() {
        let key = key_from_auth_code(AUTH_CODES[0]);
        assert_eq!(&key[0..16], b"expand 32-byte k");
        // Word 9 of the body receives the first auth word
        assert_eq!(&key[0x10 + 9 * 4..0x10 + 9 * 4 + 4], b"S48B");
    }

    #[test]
    fn test_decrypt_is_an_involution() {
        // The cipher is a pure XOR stream, so applying it twice with the
        // same offset restores the input.
        let key = key_from_auth_code(AUTH_CODES[1]);
        let original: Vec<u8> = (0..128).collect();

        let mut data = original.clone();
        decrypt_chunks(&key, 0, &mut data);
        assert_ne!(data, original);
        decrypt_chunks(&key, 0, &mut data);
        assert_eq!(data, original);
    }

    #[test]
    fn test_chunk_offset_changes_key_stream() {
        let key = key_from_auth_code(AUTH_CODES[1]);
        let mut a = vec![0u8; 64];
        let mut b = vec![0u8; 64];
        decrypt_chunks(&key, 0, &mut a);
        decrypt_chunks(&key, 64, &mut b);
        assert_ne!(a, b);
    }

    #[test]
    fn test_second_chunk_matches_streamed_decryption() {
        // Decrypting two chunks at once equals decrypting them separately
        let key = key_from_auth_code(AUTH_CODES[2]);
        let mut joined = vec![0x5Au8; 128];
        decrypt_chunks(&key, 0, &mut joined);

        let mut first = vec![0x5Au8; 64];
        let mut second = vec![0x5Au8; 64];
        decrypt_chunks(&key, 0, &mut first);
        decrypt_chunks(&key, 64, &mut second);

        assert_eq!(&joined[..64], first.as_slice());
        assert_eq!(&joined[64..], second.as_slice());
    }

    #[test]
    fn test_detect_round_trip() {
        // Build an "encrypted" file by running the involution over a
        // plausible archive header, then detect the key back.
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("enc.mpqe");

        let key = key_from_auth_code(AUTH_CODES[0]);
        let mut contents = vec![0u8; 256];
        contents[0..4].copy_from_slice(b"MPQ\x1A");
        contents[4..8].copy_from_slice(&32u32.to_le_bytes());
        decrypt_chunks(&key, 0, &mut contents);
        std::fs::write(&path, &contents).unwrap();

        let mut base = BaseProvider::open_file(&path, true).unwrap();
        let mut cipher = MpqeCipher::detect(&mut base).unwrap();

        let mut io = MpqeIo {
            cipher: &mut cipher,
            base: &mut base,
        };
        let mut plain = vec![0u8; 8];
        io.read_run(0, 8, &mut plain, true).unwrap();
        // read_run pads to a chunk; read the first 8 plain bytes
        assert_eq!(&plain[0..4], b"MPQ\x1A");
    }
}
