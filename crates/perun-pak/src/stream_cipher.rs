//! Counter-mode stream cipher used for key-table encrypted archives.
//!
//! The engine runs a 128-bit block cipher (Twofish for the original
//! key-table technique, AES for the Hunt variant) in "SIC-reversed"
//! counter mode: the whole 16-byte block is a little-endian counter seeded
//! from the IV, incremented once per keystream block. Encrypt and decrypt
//! are the same keystream XOR.

use byteorder::{ByteOrder, LE};
use cipher::consts::U16;
use cipher::generic_array::GenericArray;
use cipher::{BlockEncrypt, BlockSizeUser, KeyInit};

use crate::{Error, Result};

/// Which 128-bit block cipher drives the keystream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEngine {
    /// AES-128 (Hunt / key-table v2 archives).
    Aes,
    /// Twofish (original key-table archives).
    Twofish,
}

fn apply_keystream<C>(cipher: &C, iv: &[u8; 16], data: &mut [u8])
where
    C: BlockEncrypt + BlockSizeUser<BlockSize = U16>,
{
    let mut counter = u128::from_le_bytes(*iv);
    for chunk in data.chunks_mut(16) {
        let mut block = GenericArray::from(counter.to_le_bytes());
        cipher.encrypt_block(&mut block);
        for (byte, key) in chunk.iter_mut().zip(block.iter()) {
            *byte ^= key;
        }
        counter = counter.wrapping_add(1);
    }
}

/// Apply the SIC-reversed keystream to `data` in place.
///
/// Decryption and encryption are identical; partial trailing blocks use a
/// truncated keystream block.
pub fn apply_sic_reversed(
    engine: StreamEngine,
    key: &[u8; 16],
    iv: &[u8; 16],
    data: &mut [u8],
) -> Result<()> {
    match engine {
        StreamEngine::Aes => {
            let cipher = aes::Aes128::new_from_slice(key)
                .map_err(|e| Error::UnableToDecrypt(format!("bad AES key: {e}")))?;
            apply_keystream(&cipher, iv, data);
        }
        StreamEngine::Twofish => {
            let cipher = twofish::Twofish::new_from_slice(key)
                .map_err(|e| Error::UnableToDecrypt(format!("bad Twofish key: {e}")))?;
            apply_keystream(&cipher, iv, data);
        }
    }
    Ok(())
}

/// Select which of the 16 unwrapped keys protects an entry.
///
/// The index is a function of the entry's recorded CRC.
pub fn entry_key_index(crc: u32) -> usize {
    (!(crc >> 2) & 0xF) as usize
}

/// Derive an entry's 16-byte IV from its central-directory metadata.
pub fn entry_iv(uncompressed_size: u64, compressed_size: u64, crc: u32) -> [u8; 16] {
    let words = [
        (uncompressed_size ^ (compressed_size << 12)) as u32,
        u32::from(compressed_size == 0),
        (u64::from(crc) ^ (compressed_size << 12)) as u32,
        (u64::from(uncompressed_size == 0) ^ compressed_size) as u32,
    ];
    let mut iv = [0u8; 16];
    LE::write_u32_into(&words, &mut iv);
    iv
}

/// Reference checksum keying the legacy stream-cipher technique.
pub fn reference_crc_for_pak() -> u32 {
    0
}

/// Legacy stream-cipher technique.
///
/// The keystream algorithm for this technique has never been observed in
/// the wild; data passes through unchanged. Callers log the condition.
pub fn legacy_stream_cipher(_data: &mut [u8], _reference_crc: u32) {}
