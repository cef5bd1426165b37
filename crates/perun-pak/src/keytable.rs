//! Recovery of the symmetric key table from its RSA wrapping.
//!
//! Key-table archives carry a 16-byte IV and sixteen 16-byte cipher keys,
//! each wrapped independently as one 128-byte RSA message: the packer
//! OAEP-encoded the value and applied the private-key operation, so
//! recovery is the public-key operation followed by EME-OAEP decoding
//! (RFC 8017, empty label, MGF1 under the same digest). The digest varies
//! by scheme: SHA-1 for TEA-era archives, SHA-256 for the key-table
//! schemes, Blake2b-512 for some title variants.

use blake2::Blake2b512;
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs8::DecodePublicKey;
use rsa::traits::PublicKeyParts;
use rsa::{BigUint, Pkcs1v15Sign, RsaPublicKey};
use sha1::Sha1;
use sha2::digest::Digest;
use sha2::Sha256;

use crate::{Error, Result};

/// RSA message length: the modulus size of the signing/wrapping key pair.
pub const RSA_MESSAGE_LEN: usize = 128;

/// Number of symmetric keys in the wrapped table.
pub const KEY_COUNT: usize = 16;

/// Length of each symmetric key and of the IV.
pub const KEY_LEN: usize = 16;

/// Default SubjectPublicKeyInfo DER blob used when the caller supplies no
/// key material.
pub const DEFAULT_RSA_PUBLIC_KEY: [u8; 162] = [
    0x30, 0x81, 0x9F, 0x30, 0x0D, 0x06, 0x09, 0x2A, 0x86, 0x48, 0x86, 0xF7, 0x0D, 0x01, 0x01, 0x01,
    0x05, 0x00, 0x03, 0x81, 0x8D, 0x00, 0x30, 0x81, 0x89, 0x02, 0x81, 0x81, 0x00, 0xA9, 0xD5, 0x90,
    0xA4, 0xBC, 0x92, 0xDB, 0x8C, 0xF1, 0xFC, 0x5A, 0xD5, 0x8F, 0x46, 0x05, 0x52, 0x16, 0xEE, 0xF3,
    0xC3, 0xBE, 0x86, 0xDE, 0x70, 0x1F, 0x4E, 0x2D, 0x18, 0xD3, 0x01, 0x92, 0x46, 0xBE, 0xFA, 0xAD,
    0x66, 0x04, 0x7B, 0x8C, 0xDD, 0x0D, 0x24, 0x8D, 0xA7, 0x23, 0xCA, 0x52, 0xC8, 0xE5, 0x01, 0xE0,
    0xB7, 0x2B, 0xEB, 0x55, 0xCF, 0x0D, 0xF7, 0x97, 0x77, 0xDC, 0x11, 0xE8, 0x7B, 0x18, 0xCC, 0xDB,
    0x90, 0x07, 0x2D, 0x9D, 0xC4, 0xAD, 0x80, 0x7C, 0x50, 0x23, 0x85, 0x46, 0xF3, 0xE9, 0x2C, 0x54,
    0x81, 0x11, 0x7B, 0x6D, 0xE2, 0x57, 0x87, 0x8E, 0x65, 0xE1, 0xD3, 0x16, 0xC4, 0x54, 0xED, 0x29,
    0xED, 0x51, 0xFD, 0xB1, 0xEF, 0xE4, 0x95, 0x01, 0x24, 0xAE, 0xC0, 0x6A, 0xFA, 0xE0, 0x5B, 0x19,
    0xD2, 0xE6, 0xF0, 0x22, 0x3B, 0xC3, 0xE7, 0xDD, 0x17, 0x1A, 0x8C, 0xF8, 0xE1, 0x02, 0x03, 0x01,
    0x00, 0x01,
];

/// Digest parameterizing OAEP decoding and its MGF1 mask function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OaepDigest {
    Sha1,
    Sha256,
    Blake2b512,
}

impl OaepDigest {
    fn output_len(self) -> usize {
        match self {
            OaepDigest::Sha1 => 20,
            OaepDigest::Sha256 => 32,
            OaepDigest::Blake2b512 => 64,
        }
    }

    fn hash(self, parts: &[&[u8]]) -> Vec<u8> {
        fn digest_parts<D: Digest>(parts: &[&[u8]]) -> Vec<u8> {
            let mut digest = D::new();
            for part in parts {
                digest.update(part);
            }
            digest.finalize().to_vec()
        }
        match self {
            OaepDigest::Sha1 => digest_parts::<Sha1>(parts),
            OaepDigest::Sha256 => digest_parts::<Sha256>(parts),
            OaepDigest::Blake2b512 => digest_parts::<Blake2b512>(parts),
        }
    }

    fn mgf1(self, seed: &[u8], len: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(len + self.output_len());
        let mut counter: u32 = 0;
        while out.len() < len {
            out.extend_from_slice(&self.hash(&[seed, &counter.to_be_bytes()]));
            counter += 1;
        }
        out.truncate(len);
        out
    }
}

/// The unwrapped key material. Owned by the archive once recovered.
#[derive(Clone)]
pub struct KeyTable {
    /// IV for the directory keystream.
    pub iv: [u8; KEY_LEN],
    /// The sixteen symmetric keys; entries select one by CRC.
    pub keys: [[u8; KEY_LEN]; KEY_COUNT],
}

impl std::fmt::Debug for KeyTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Key material stays out of debug output.
        f.debug_struct("KeyTable").finish_non_exhaustive()
    }
}

pub(crate) fn load_public_key(der: Option<&[u8]>) -> Result<RsaPublicKey> {
    let der = der.unwrap_or(&DEFAULT_RSA_PUBLIC_KEY);
    RsaPublicKey::from_public_key_der(der)
        .or_else(|_| RsaPublicKey::from_pkcs1_der(der))
        .map_err(|e| Error::KeyRecoveryFailed(format!("invalid public key: {e}")))
}

/// Undo one block's wrapping: raw public-exponent operation, then OAEP
/// decoding.
fn recover_block(key: &RsaPublicKey, block: &[u8], digest: OaepDigest) -> Result<Vec<u8>> {
    let k = key.size();
    if block.len() != k {
        return Err(Error::KeyRecoveryFailed(format!(
            "wrapped block is {} bytes, key expects {k}",
            block.len()
        )));
    }
    let c = BigUint::from_bytes_be(block);
    if &c >= key.n() {
        return Err(Error::KeyRecoveryFailed(
            "wrapped block out of range for modulus".into(),
        ));
    }
    let m = c.modpow(key.e(), key.n());
    let raw = m.to_bytes_be();
    let mut em = vec![0u8; k];
    em[k - raw.len()..].copy_from_slice(&raw);
    oaep_decode(&em, digest)
}

/// EME-OAEP decoding with an empty label.
fn oaep_decode(em: &[u8], digest: OaepDigest) -> Result<Vec<u8>> {
    let h_len = digest.output_len();
    let k = em.len();
    if k < 2 * h_len + 2 {
        return Err(Error::KeyRecoveryFailed(
            "message too short for OAEP digest".into(),
        ));
    }
    if em[0] != 0 {
        return Err(Error::KeyRecoveryFailed("bad OAEP leading byte".into()));
    }
    let masked_seed = &em[1..1 + h_len];
    let masked_db = &em[1 + h_len..];

    let seed_mask = digest.mgf1(masked_db, h_len);
    let seed: Vec<u8> = masked_seed
        .iter()
        .zip(&seed_mask)
        .map(|(a, b)| a ^ b)
        .collect();

    let db_mask = digest.mgf1(&seed, k - h_len - 1);
    let db: Vec<u8> = masked_db.iter().zip(&db_mask).map(|(a, b)| a ^ b).collect();

    let l_hash = digest.hash(&[]);
    if db[..h_len] != l_hash[..] {
        return Err(Error::KeyRecoveryFailed("OAEP label hash mismatch".into()));
    }

    for (i, &byte) in db[h_len..].iter().enumerate() {
        match byte {
            0x00 => continue,
            0x01 => return Ok(db[h_len + i + 1..].to_vec()),
            _ => break,
        }
    }
    Err(Error::KeyRecoveryFailed("OAEP separator not found".into()))
}

/// Recover the IV and the full key table from their wrapped forms.
///
/// Every block is processed independently; any failing block fails the
/// whole operation and nothing is returned.
pub fn unwrap_key_table(
    public_key_der: Option<&[u8]>,
    wrapped_iv: &[u8],
    wrapped_keys: &[u8],
    digest: OaepDigest,
) -> Result<KeyTable> {
    let key = load_public_key(public_key_der)?;
    let k = key.size();
    if wrapped_iv.len() != k || wrapped_keys.len() != KEY_COUNT * k {
        return Err(Error::KeyRecoveryFailed(format!(
            "wrapped material sized {}/{} does not match a {}-byte modulus",
            wrapped_iv.len(),
            wrapped_keys.len(),
            k
        )));
    }

    let iv_bytes = recover_block(&key, wrapped_iv, digest)?;
    let iv: [u8; KEY_LEN] = iv_bytes
        .as_slice()
        .try_into()
        .map_err(|_| Error::KeyRecoveryFailed(format!("IV is {} bytes, not 16", iv_bytes.len())))?;

    let mut keys = [[0u8; KEY_LEN]; KEY_COUNT];
    for (i, slot) in keys.iter_mut().enumerate() {
        let block = &wrapped_keys[i * k..(i + 1) * k];
        let recovered = recover_block(&key, block, digest)?;
        *slot = recovered.as_slice().try_into().map_err(|_| {
            Error::KeyRecoveryFailed(format!("key {i} is {} bytes, not 16", recovered.len()))
        })?;
    }

    Ok(KeyTable { iv, keys })
}

/// Verify the RSA signature over the raw directory bytes and the archive's
/// base file name.
///
/// The wire format of the hash is not published; a PKCS#1 v1.5 SHA-256
/// verification is attempted best-effort and the caller decides whether a
/// failure is fatal.
pub(crate) fn verify_cdr_signature(
    public_key_der: Option<&[u8]>,
    cdr: &[u8],
    archive_name: &[u8],
    signature: &[u8],
) -> bool {
    let Ok(key) = load_public_key(public_key_der) else {
        return false;
    };
    let mut digest = Sha256::new();
    digest.update(cdr);
    digest.update(archive_name);
    let hashed = digest.finalize();
    key.verify(Pkcs1v15Sign::new::<Sha256>(), &hashed, signature)
        .is_ok()
}
