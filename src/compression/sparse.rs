//! Sparse codec: run-length encoding of zero bytes
//!
//! The stored form starts with the uncompressed size as a 32-bit
//! big-endian value, followed by tokens. A token byte with the high bit
//! set introduces a literal run of `(token & 0x7F) + 1` bytes; with the
//! high bit clear it stands for `(token & 0x7F) + 3` zero bytes.

use crate::{Error, Result};

const MAX_LITERAL_RUN: usize = 0x80;
const MAX_ZERO_RUN: usize = 0x7F + 3;

pub(super) fn compress(data: &[u8]) -> Result<Vec<u8>> {
    let mut output = Vec::with_capacity(data.len() / 2 + 8);
    output.extend_from_slice(&(data.len() as u32).to_be_bytes());

    let mut pos = 0;
    while pos < data.len() {
        // Zero runs shorter than 3 bytes cost more to encode than to copy
        let zero_len = data[pos..].iter().take_while(|&&b| b == 0).count();
        if zero_len >= 3 {
            let run = zero_len.min(MAX_ZERO_RUN);
            output.push((run - 3) as u8);
            pos += run;
            continue;
        }

        // Collect a literal run up to the next worthwhile zero run
        let start = pos;
        while pos < data.len() && pos - start < MAX_LITERAL_RUN {
            if data[pos] == 0 {
                let zeros = data[pos..].iter().take_while(|&&b| b == 0).count();
                if zeros >= 3 {
                    break;
                }
            }
            pos += 1;
        }
        output.push(0x80 | (pos - start - 1) as u8);
        output.extend_from_slice(&data[start..pos]);
    }

    Ok(output)
}

pub(super) fn decompress(data: &[u8], expected_size: usize) -> Result<Vec<u8>> {
    if data.len() < 4 {
        return Err(Error::compression("sparse data too short"));
    }
    let stored_size = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;

    let mut output = Vec::with_capacity(stored_size.max(expected_size));
    let mut pos = 4;
    while pos < data.len() && output.len() < stored_size {
        let token = data[pos];
        pos += 1;

        if token & 0x80 != 0 {
            let run = (token & 0x7F) as usize + 1;
            if pos + run > data.len() {
                return Err(Error::compression("sparse literal run past end of input"));
            }
            output.extend_from_slice(&data[pos..pos + run]);
            pos += run;
        } else {
            let run = (token & 0x7F) as usize + 3;
            output.resize(output.len() + run, 0);
        }
    }

    if output.len() != stored_size {
        return Err(Error::compression(format!(
            "sparse stream ended at {} of {} bytes",
            output.len(),
            stored_size
        )));
    }

    Ok(output)
}
