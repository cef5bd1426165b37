//! CRC-32 hashing utilities.
//!
//! ZIP-family archives record the CRC-32 (ISO-HDLC polynomial) of each
//! entry's uncompressed content.

/// Compute the CRC-32 of a byte slice.
#[inline]
pub fn hash_bytes(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// Streaming CRC-32 hasher, for checksumming data read in chunks.
pub use crc32fast::Hasher;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_hash() {
        assert_eq!(hash_bytes(&[]), 0);
    }

    #[test]
    fn test_known_hash() {
        // Standard CRC-32 check value.
        assert_eq!(hash_bytes(b"123456789"), 0xCBF43926);
    }

    #[test]
    fn test_streaming_matches_oneshot() {
        let data = b"the quick brown fox jumps over the lazy dog";
        let mut hasher = Hasher::new();
        for chunk in data.chunks(7) {
            hasher.update(chunk);
        }
        assert_eq!(hasher.finalize(), hash_bytes(data));
    }
}
