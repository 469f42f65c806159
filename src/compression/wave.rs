//! WAVE payload detection for the lossy codec gate

/// Check whether a buffer starts like a 16-bit (or wider) PCM WAVE file
///
/// The lossy ADPCM/Huffman chain is only allowed on payloads that pass
/// this check; anything else gets a lossless codec substituted.
pub fn is_wave_candidate(first_sector: &[u8], channels: usize) -> bool {
    // RIFF....WAVEfmt + 16-byte format chunk
    if first_sector.len() < 0x2C {
        return false;
    }
    if &first_sector[0..4] != b"RIFF" || &first_sector[8..12] != b"WAVE" {
        return false;
    }
    if &first_sector[12..16] != b"fmt " {
        return false;
    }

    let format_tag = u16::from_le_bytes([first_sector[20], first_sector[21]]);
    let channel_count = u16::from_le_bytes([first_sector[22], first_sector[23]]);
    let bits_per_sample = u16::from_le_bytes([first_sector[34], first_sector[35]]);

    // PCM, matching channel count, at least 16 bits per sample
    format_tag == 1 && channel_count as usize == channels && bits_per_sample >= 16
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wave_header(channels: u16, bits: u16) -> Vec<u8> {
        let mut header = Vec::new();
        header.extend_from_slice(b"RIFF");
        header.extend_from_slice(&1000u32.to_le_bytes());
        header.extend_from_slice(b"WAVE");
        header.extend_from_slice(b"fmt ");
        header.extend_from_slice(&16u32.to_le_bytes());
        header.extend_from_slice(&1u16.to_le_bytes()); // PCM
        header.extend_from_slice(&channels.to_le_bytes());
        header.extend_from_slice(&44100u32.to_le_bytes());
        header.extend_from_slice(&176400u32.to_le_bytes());
        header.extend_from_slice(&4u16.to_le_bytes());
        header.extend_from_slice(&bits.to_le_bytes());
        header.extend_from_slice(b"data");
        header.extend_from_slice(&900u32.to_le_bytes());
        header
    }

    #[test]
    fn test_valid_wave() {
        assert!(is_wave_candidate(&wave_header(1, 16), 1));
        assert!(is_wave_candidate(&wave_header(2, 16), 2));
    }

    #[test]
    fn test_channel_mismatch() {
        assert!(!is_wave_candidate(&wave_header(2, 16), 1));
    }

    #[test]
    fn test_eight_bit_rejected() {
        assert!(!is_wave_candidate(&wave_header(1, 8), 1));
    }

    #[test]
    fn test_not_a_wave() {
        assert!(!is_wave_candidate(b"MZ followed by anything else here...........", 1));
        assert!(!is_wave_candidate(&[], 1));
    }
}
