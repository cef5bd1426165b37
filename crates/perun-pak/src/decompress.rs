//! Decompression transforms for archive entries.

use std::io::Read;

use flate2::read::DeflateDecoder;

use crate::{Error, Result};

/// Magic bytes opening a Zstandard frame (0xFD2FB528 little-endian).
pub const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];

/// Check whether a payload starts with a raw Zstandard frame.
pub fn is_zstd_frame(bytes: &[u8]) -> bool {
    bytes.len() >= 4 && bytes[..4] == ZSTD_MAGIC
}

/// Inflate a raw DEFLATE stream with a known output size hint.
pub fn inflate_raw_sized<R: Read>(reader: R, expected_size: usize) -> Result<Vec<u8>> {
    let mut output = Vec::with_capacity(expected_size);
    let mut decoder = DeflateDecoder::new(reader);
    decoder
        .read_to_end(&mut output)
        .map_err(|e| Error::Decompression(e.to_string()))?;
    Ok(output)
}

/// Decompress a Zstandard stream with a known output size hint.
pub fn decompress_zstd_sized<R: Read>(reader: R, expected_size: usize) -> Result<Vec<u8>> {
    let mut output = Vec::with_capacity(expected_size);
    let mut decoder = zstd::Decoder::new(reader).map_err(|e| Error::Decompression(e.to_string()))?;
    decoder
        .read_to_end(&mut output)
        .map_err(|e| Error::Decompression(e.to_string()))?;
    Ok(output)
}

/// Decompress a BZip2 stream with a known output size hint.
pub fn decompress_bzip2_sized<R: Read>(reader: R, expected_size: usize) -> Result<Vec<u8>> {
    let mut output = Vec::with_capacity(expected_size);
    let mut decoder = bzip2::read::BzDecoder::new(reader);
    decoder
        .read_to_end(&mut output)
        .map_err(|e| Error::Decompression(e.to_string()))?;
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deflate_round_trip() {
        use flate2::write::DeflateEncoder;
        use flate2::Compression;
        use std::io::Write;

        let original = b"Hello, World! This is a test of DEFLATE compression.";

        let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(original).unwrap();
        let compressed = encoder.finish().unwrap();

        let decompressed = inflate_raw_sized(&compressed[..], original.len()).unwrap();
        assert_eq!(decompressed, original);
    }

    #[test]
    fn test_zstd_round_trip() {
        let original = b"Hello, World! This is a test of Zstandard compression.";

        let compressed = zstd::encode_all(&original[..], 3).unwrap();
        assert!(is_zstd_frame(&compressed));

        let decompressed = decompress_zstd_sized(&compressed[..], original.len()).unwrap();
        assert_eq!(decompressed, original);
    }

    #[test]
    fn test_bzip2_round_trip() {
        use bzip2::read::BzEncoder;
        use bzip2::Compression;

        let original = b"Hello, World! This is a test of BZip2 compression.";

        let mut compressed = Vec::new();
        BzEncoder::new(&original[..], Compression::default())
            .read_to_end(&mut compressed)
            .unwrap();

        let decompressed = decompress_bzip2_sized(&compressed[..], original.len()).unwrap();
        assert_eq!(decompressed, original);
    }
}
