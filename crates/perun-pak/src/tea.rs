//! TEA-family block ciphers used by the engine's legacy header encryption.
//!
//! Two distinct variants are in play, with distinct keys and rotations:
//!
//! - TEA-64: the classic 64-bit-block Tiny Encryption Algorithm, applied
//!   block-by-block. Used (with a word-inversion pass and a 3-byte prefix)
//!   to protect the central directory.
//! - XXTEA: the variable-block-length `btea` variant that treats the whole
//!   buffer as a single block, bracketed by a byte-order swap. Used for
//!   per-entry data under the Deflate+TEA method code.
//!
//! All routines operate on checked little-endian 32-bit word views; buffer
//! length preconditions are validated, not assumed.

use byteorder::{ByteOrder, LE};

use crate::{Error, Result};

/// Default XXTEA key for per-entry encryption.
pub const XXTEA_DEFAULT_KEY: [u32; 4] = [0xc968fb67, 0x8f9b4267, 0x85399e84, 0xf9b99dc4];

/// TEA key protecting the central directory.
pub const DIRECTORY_TEA_KEY: [u32; 4] = [0x4dd87487, 0xc15011b0, 0x5edd6b3d, 0x43cf5892];

/// Number of opaque prefix bytes preceding a TEA-encrypted directory.
pub const DIRECTORY_TEA_PREFIX: usize = 3;

const DELTA: u32 = 0x9e3779b9;

fn load_words(data: &[u8]) -> Vec<u32> {
    let mut words = vec![0u32; data.len() / 4];
    LE::read_u32_into(&data[..words.len() * 4], &mut words);
    words
}

fn store_words(words: &[u32], data: &mut [u8]) {
    LE::write_u32_into(words, &mut data[..words.len() * 4]);
}

fn swap_word_order(words: &mut [u32]) {
    for w in words.iter_mut() {
        *w = w.swap_bytes();
    }
}

fn invert_words(words: &mut [u32]) {
    for w in words.iter_mut() {
        *w = !*w;
    }
}

#[inline]
fn mx(y: u32, z: u32, sum: u32, p: u32, e: u32, key: &[u32; 4]) -> u32 {
    ((z >> 5 ^ y << 2).wrapping_add(y >> 3 ^ z << 4))
        ^ ((sum ^ y).wrapping_add(key[((p & 3) ^ e) as usize] ^ z))
}

/// XXTEA whole-buffer encode. No-op for fewer than two words.
fn btea_encode(v: &mut [u32], key: &[u32; 4]) {
    let n = v.len();
    if n < 2 {
        return;
    }
    let mut rounds = 6 + 52 / n as u32;
    let mut sum: u32 = 0;
    let mut z = v[n - 1];
    loop {
        sum = sum.wrapping_add(DELTA);
        let e = (sum >> 2) & 3;
        for p in 0..n - 1 {
            let y = v[p + 1];
            v[p] = v[p].wrapping_add(mx(y, z, sum, p as u32, e, key));
            z = v[p];
        }
        let y = v[0];
        v[n - 1] = v[n - 1].wrapping_add(mx(y, z, sum, (n - 1) as u32, e, key));
        z = v[n - 1];
        rounds -= 1;
        if rounds == 0 {
            break;
        }
    }
}

/// XXTEA whole-buffer decode. No-op for fewer than two words.
fn btea_decode(v: &mut [u32], key: &[u32; 4]) {
    let n = v.len();
    if n < 2 {
        return;
    }
    let rounds = 6 + 52 / n as u32;
    let mut sum = rounds.wrapping_mul(DELTA);
    let mut y = v[0];
    loop {
        let e = (sum >> 2) & 3;
        for p in (1..n).rev() {
            let z = v[p - 1];
            v[p] = v[p].wrapping_sub(mx(y, z, sum, p as u32, e, key));
            y = v[p];
        }
        let z = v[n - 1];
        v[0] = v[0].wrapping_sub(mx(y, z, sum, 0, e, key));
        y = v[0];
        sum = sum.wrapping_sub(DELTA);
        if sum == 0 {
            break;
        }
    }
}

/// Encrypt a buffer in place with XXTEA under the byte-order swap convention.
///
/// The buffer length must be a multiple of 4.
pub fn xxtea_encrypt(data: &mut [u8], key: &[u32; 4]) -> Result<()> {
    if data.len() % 4 != 0 {
        return Err(Error::InvalidCipherLength {
            multiple: 4,
            len: data.len(),
        });
    }
    let mut words = load_words(data);
    swap_word_order(&mut words);
    btea_encode(&mut words, key);
    swap_word_order(&mut words);
    store_words(&words, data);
    Ok(())
}

/// Decrypt a buffer in place with XXTEA under the byte-order swap convention.
///
/// The buffer length must be a multiple of 4.
pub fn xxtea_decrypt(data: &mut [u8], key: &[u32; 4]) -> Result<()> {
    if data.len() % 4 != 0 {
        return Err(Error::InvalidCipherLength {
            multiple: 4,
            len: data.len(),
        });
    }
    let mut words = load_words(data);
    swap_word_order(&mut words);
    btea_decode(&mut words, key);
    swap_word_order(&mut words);
    store_words(&words, data);
    Ok(())
}

fn tea_encode_blocks(words: &mut [u32], key: &[u32; 4]) {
    let [a, b, c, d] = *key;
    for block in words.chunks_exact_mut(2) {
        let mut y = block[0];
        let mut z = block[1];
        let mut sum: u32 = 0;
        for _ in 0..32 {
            sum = sum.wrapping_add(DELTA);
            y = y.wrapping_add(
                (z << 4).wrapping_add(a) ^ z.wrapping_add(sum) ^ (z >> 5).wrapping_add(b),
            );
            z = z.wrapping_add(
                (y << 4).wrapping_add(c) ^ y.wrapping_add(sum) ^ (y >> 5).wrapping_add(d),
            );
        }
        block[0] = y;
        block[1] = z;
    }
}

fn tea_decode_blocks(words: &mut [u32], key: &[u32; 4]) {
    let [a, b, c, d] = *key;
    for block in words.chunks_exact_mut(2) {
        let mut y = block[0];
        let mut z = block[1];
        let mut sum: u32 = 0xC6EF3720;
        for _ in 0..32 {
            z = z.wrapping_sub(
                (y << 4).wrapping_add(c) ^ y.wrapping_add(sum) ^ (y >> 5).wrapping_add(d),
            );
            y = y.wrapping_sub(
                (z << 4).wrapping_add(a) ^ z.wrapping_add(sum) ^ (z >> 5).wrapping_add(b),
            );
            sum = sum.wrapping_sub(DELTA);
        }
        block[0] = y;
        block[1] = z;
    }
}

/// Encrypt a buffer in place with 64-bit-block TEA.
///
/// The buffer length must be a multiple of 8.
pub fn tea_encrypt(data: &mut [u8], key: &[u32; 4]) -> Result<()> {
    if data.len() % 8 != 0 {
        return Err(Error::InvalidCipherLength {
            multiple: 8,
            len: data.len(),
        });
    }
    let mut words = load_words(data);
    tea_encode_blocks(&mut words, key);
    store_words(&words, data);
    Ok(())
}

/// Decrypt a buffer in place with 64-bit-block TEA.
///
/// The buffer length must be a multiple of 8.
pub fn tea_decrypt(data: &mut [u8], key: &[u32; 4]) -> Result<()> {
    if data.len() % 8 != 0 {
        return Err(Error::InvalidCipherLength {
            multiple: 8,
            len: data.len(),
        });
    }
    let mut words = load_words(data);
    tea_decode_blocks(&mut words, key);
    store_words(&words, data);
    Ok(())
}

/// Decrypt a TEA-protected central directory image.
///
/// The wire format carries an opaque 3-byte prefix; the remainder is
/// word-inverted and TEA-encoded over its 8-byte-aligned span. Trailing
/// bytes outside the aligned span pass through untouched, matching the
/// packer's output.
pub fn decrypt_directory(data: &[u8]) -> Vec<u8> {
    let mut body = data.get(DIRECTORY_TEA_PREFIX..).unwrap_or_default().to_vec();
    let word_span = body.len() / 4 * 4;
    let mut words = load_words(&body[..word_span]);
    invert_words(&mut words);
    let tea_words = words.len() / 2 * 2;
    tea_decode_blocks(&mut words[..tea_words], &DIRECTORY_TEA_KEY);
    store_words(&words, &mut body[..word_span]);
    body
}

/// Build the encrypted directory image for `plain` (used by fixtures and
/// round-trip tests; the packer emits three prefix bytes we reproduce as
/// zeroes).
pub fn encrypt_directory(plain: &[u8]) -> Vec<u8> {
    let mut body = plain.to_vec();
    let word_span = body.len() / 4 * 4;
    let mut words = load_words(&body[..word_span]);
    let tea_words = words.len() / 2 * 2;
    tea_encode_blocks(&mut words[..tea_words], &DIRECTORY_TEA_KEY);
    invert_words(&mut words);
    store_words(&words, &mut body[..word_span]);
    let mut out = vec![0u8; DIRECTORY_TEA_PREFIX];
    out.extend_from_slice(&body);
    out
}

/// Decrypt per-entry data stored under the Deflate+TEA method code.
///
/// Entry payloads are not padded to the cipher block, so only the 4-byte
/// aligned span is transformed and any trailing bytes pass through.
pub fn decrypt_entry_tea(data: &mut [u8]) {
    let span = data.len() / 4 * 4;
    // Aligned span cannot fail the length precondition.
    let _ = xxtea_decrypt(&mut data[..span], &XXTEA_DEFAULT_KEY);
}

/// Inverse of [`decrypt_entry_tea`], for fixtures.
pub fn encrypt_entry_tea(data: &mut [u8]) {
    let span = data.len() / 4 * 4;
    let _ = xxtea_encrypt(&mut data[..span], &XXTEA_DEFAULT_KEY);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_xxtea_round_trip() {
        let mut data = *b"0123456789abcdef";
        let original = data;
        xxtea_encrypt(&mut data, &XXTEA_DEFAULT_KEY).unwrap();
        assert_ne!(data, original);
        xxtea_decrypt(&mut data, &XXTEA_DEFAULT_KEY).unwrap();
        assert_eq!(data, original);
    }

    #[test]
    fn test_xxtea_rejects_unaligned() {
        let mut data = [0u8; 7];
        assert!(xxtea_encrypt(&mut data, &XXTEA_DEFAULT_KEY).is_err());
    }

    #[test]
    fn test_tea_round_trip() {
        let mut data = *b"8 byte blocks go";
        let original = data;
        tea_encrypt(&mut data, &DIRECTORY_TEA_KEY).unwrap();
        assert_ne!(data, original);
        tea_decrypt(&mut data, &DIRECTORY_TEA_KEY).unwrap();
        assert_eq!(data, original);
    }

    #[test]
    fn test_tea_rejects_unaligned() {
        let mut data = [0u8; 12];
        assert!(tea_decrypt(&mut data, &DIRECTORY_TEA_KEY).is_err());
    }

    #[test]
    fn test_directory_round_trip() {
        // Length chosen so word-aligned and block-aligned spans differ,
        // exercising the pass-through tail handling.
        let plain: Vec<u8> = (0..53).map(|i| i as u8).collect();
        let wire = encrypt_directory(&plain);
        assert_eq!(wire.len(), plain.len() + DIRECTORY_TEA_PREFIX);
        assert_eq!(decrypt_directory(&wire), plain);
    }

    #[test]
    fn test_entry_tea_round_trip() {
        let mut data: Vec<u8> = (0..37).map(|i| (i * 7) as u8).collect();
        let original = data.clone();
        encrypt_entry_tea(&mut data);
        decrypt_entry_tea(&mut data);
        assert_eq!(data, original);
        // Unaligned tail is never touched.
        assert_eq!(data[36], original[36]);
    }
}
