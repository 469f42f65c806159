//! PKWARE Data Compression Library (DCL) codec
//!
//! Decompression uses the `explode` crate. There is no imploder: the
//! compress direction returns the input unchanged, which the dispatcher
//! treats as "did not shrink" so the sector is stored raw. Archives
//! imploded by other tools still read fine.

use crate::{Error, Result};

pub(super) fn implode(data: &[u8]) -> Result<Vec<u8>> {
    log::debug!("PKWARE implode requested; storing {} bytes raw", data.len());
    Ok(data.to_vec())
}

/// Decompress a PKWARE DCL (implode) stream
///
/// Also used directly for files carrying the imploded flag, which have no
/// method byte in front of the sector data.
pub fn explode(data: &[u8], expected_size: usize) -> Result<Vec<u8>> {
    let output = ::explode::explode(data)
        .map_err(|e| Error::compression(format!("PKWARE explode failed: {:?}", e)))?;

    if output.len() < expected_size {
        return Err(Error::compression(format!(
            "PKWARE stream yielded {} of {} bytes",
            output.len(),
            expected_size
        )));
    }

    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_implode_falls_back_to_raw() {
        let data = b"some test data".to_vec();
        assert_eq!(implode(&data).unwrap(), data);
    }

    #[test]
    fn test_explode_rejects_garbage() {
        // 0x02 is not a valid literal-encoding selector
        assert!(explode(&[0x02, 0x04, 0xFF, 0xFF], 16).is_err());
    }
}
