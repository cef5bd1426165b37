//! P4K per-entry decryption using AES-128-CBC.
//!
//! P4K archives mark individual entries as AES-protected via the extra
//! field; the payload is AES-128-CBC with a zero IV and no padding.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecryptMut, KeyIvInit};

use crate::{Error, Result};

type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;

/// The AES-128 key shipped with the engine.
///
/// Hardcoded in the game client; used when the caller supplies no key.
pub const DEFAULT_P4K_KEY: [u8; 16] = [
    0x5E, 0x7A, 0x20, 0x02, 0x30, 0x2E, 0xEB, 0x1A, 0x3B, 0xB6, 0x17, 0xC3, 0x0F, 0xDE, 0x1E, 0x47,
];

/// The initialization vector (all zeros).
const P4K_AES_IV: [u8; 16] = [0u8; 16];

/// Decrypt P4K entry data in place.
///
/// The data length must be a multiple of the AES block size (16 bytes).
/// Returns the number of valid bytes after decryption. Trailing NUL bytes
/// are treated as padding and excluded; there is no explicit length field
/// backing this, so plaintexts that legitimately end in NUL bytes lose
/// those bytes.
pub fn decrypt_in_place(key: &[u8], data: &mut [u8]) -> Result<usize> {
    if data.is_empty() {
        return Ok(0);
    }
    if key.len() != 16 {
        return Err(Error::UnableToDecrypt(format!(
            "AES key must be 16 bytes, got {}",
            key.len()
        )));
    }
    if data.len() % 16 != 0 {
        return Err(Error::InvalidCipherLength {
            multiple: 16,
            len: data.len(),
        });
    }

    let key = GenericArray::from_slice(key);
    let iv = GenericArray::from_slice(&P4K_AES_IV);
    let decryptor = Aes128CbcDec::new(key, iv);

    decryptor
        .decrypt_padded_mut::<aes::cipher::block_padding::NoPadding>(data)
        .map_err(|_| Error::UnableToDecrypt("AES decryption failed".into()))?;

    // Find the last non-null byte (trim zero padding).
    let last_non_null = data.iter().rposition(|&b| b != 0).map(|i| i + 1).unwrap_or(0);

    Ok(last_non_null)
}

/// Decrypt P4K entry data to a new buffer, with trailing NUL bytes removed.
pub fn decrypt(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    if data.is_empty() {
        return Ok(Vec::new());
    }

    let mut buffer = data.to_vec();
    let len = decrypt_in_place(key, &mut buffer)?;
    buffer.truncate(len);
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use aes::cipher::BlockEncryptMut;

    type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;

    fn encrypt_fixture(key: &[u8; 16], plain: &[u8]) -> Vec<u8> {
        let mut padded = plain.to_vec();
        while padded.len() % 16 != 0 {
            padded.push(0);
        }
        let len = padded.len();
        let encryptor =
            Aes128CbcEnc::new(GenericArray::from_slice(key), GenericArray::from_slice(&P4K_AES_IV));
        encryptor
            .encrypt_padded_mut::<aes::cipher::block_padding::NoPadding>(&mut padded, len)
            .unwrap();
        padded.to_vec()
    }

    #[test]
    fn test_decrypt_empty() {
        let result = decrypt(&DEFAULT_P4K_KEY, &[]).unwrap();
        assert!(result.is_empty());
    }

    #[test]
    fn test_decrypt_invalid_length() {
        let mut data = vec![1u8; 15]; // Not a multiple of 16
        assert!(decrypt_in_place(&DEFAULT_P4K_KEY, &mut data).is_err());
    }

    #[test]
    fn test_round_trip_trims_padding() {
        let plain = b"<xml>cutlass black</xml>";
        let wire = encrypt_fixture(&DEFAULT_P4K_KEY, plain);
        assert_eq!(wire.len() % 16, 0);
        assert_eq!(decrypt(&DEFAULT_P4K_KEY, &wire).unwrap(), plain);
    }

    #[test]
    fn test_wrong_key_length_rejected() {
        let mut data = vec![0u8; 16];
        assert!(decrypt_in_place(&[0u8; 8], &mut data).is_err());
    }
}
