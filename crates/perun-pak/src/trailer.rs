//! The custom trailer embedded in the archive comment field.
//!
//! Engine archives that are encrypted and/or signed append a strict
//! sequence of fixed-size records to the ZIP comment: an extended header
//! declaring the techniques, then (in order) an optional signature header,
//! an optional TEA header, and an optional encryption header carrying the
//! RSA-wrapped IV and key table. The comment length must equal the sum of
//! the sizes implied by the declared techniques exactly.

use perun_common::BinaryReader;

use crate::keytable::{KEY_COUNT, RSA_MESSAGE_LEN};
use crate::{Error, Result};

/// How the central directory and per-entry data are encrypted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionScheme {
    /// Not encrypted.
    None,
    /// Legacy engine stream cipher keyed by a reference checksum.
    /// Functionally unobserved; treated as a plaintext passthrough.
    StreamCipher,
    /// TEA over the directory, XXTEA per entry.
    Tea,
    /// Twofish keystream keyed from an RSA-wrapped 16-key table.
    StreamCipherKeyTable,
    /// "Hunt" variant of the key table: AES keystream, two extra header
    /// words on the wire.
    StreamCipherKeyTable2,
}

impl EncryptionScheme {
    pub(crate) fn from_wire(value: u16) -> Option<Self> {
        match value {
            0 => Some(Self::None),
            1 => Some(Self::StreamCipher),
            2 => Some(Self::Tea),
            3 => Some(Self::StreamCipherKeyTable),
            4 => Some(Self::StreamCipherKeyTable2),
            _ => None,
        }
    }

    /// Whether the scheme ships an RSA-wrapped key table in the trailer.
    pub fn has_key_table(self) -> bool {
        matches!(
            self,
            Self::Tea | Self::StreamCipherKeyTable | Self::StreamCipherKeyTable2
        )
    }
}

/// How the central directory is signed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureScheme {
    /// Not signed.
    None,
    /// RSA signature over the raw directory bytes plus the archive name.
    CdrSigned,
    /// Reserved second variant; same wire shape as [`Self::CdrSigned`].
    CdrSigned2,
}

impl SignatureScheme {
    pub(crate) fn from_wire(value: u16) -> Option<Self> {
        match value {
            0 => Some(Self::None),
            1 => Some(Self::CdrSigned),
            2 => Some(Self::CdrSigned2),
            _ => None,
        }
    }
}

/// Size of the extended header, the smallest possible trailer.
pub(crate) const EXTENDED_HEADER_SIZE: u64 = 8;

const SIGNATURE_HEADER_SIZE: u32 = 4 + RSA_MESSAGE_LEN as u32;
const TEA_HEADER_SIZE: u32 = 4 + TEA_HEADER_OPAQUE;
const TEA_HEADER_OPAQUE: u32 = 172;
const ENCRYPTION_HEADER_SIZE: u32 = 4 + (RSA_MESSAGE_LEN + KEY_COUNT * RSA_MESSAGE_LEN) as u32;
const ENCRYPTION_HEADER_SIZE2: u32 = 8;

/// The 128-byte RSA signature over the directory.
pub struct SignatureHeader {
    pub cdr_signed: [u8; RSA_MESSAGE_LEN],
}

/// Opaque TEA-era header. Carried but not interpreted.
pub struct TeaHeader {
    pub opaque: [u8; TEA_HEADER_OPAQUE as usize],
}

/// The wrapped key material.
pub struct EncryptionHeader {
    /// Two shadow words present only in the key-table v2 variant.
    pub shadow: Option<(u32, u32)>,
    /// RSA-wrapped 16-byte IV (one 128-byte block).
    pub wrapped_iv: Vec<u8>,
    /// RSA-wrapped key table (sixteen 128-byte blocks).
    pub wrapped_keys: Vec<u8>,
}

/// A fully parsed comment trailer.
pub struct Trailer {
    pub encryption: EncryptionScheme,
    pub signing: SignatureScheme,
    pub signature: Option<SignatureHeader>,
    pub tea: Option<TeaHeader>,
    pub keys: Option<EncryptionHeader>,
}

impl Trailer {
    /// Parse the whole comment field as a trailer.
    ///
    /// Validates the declared sizes and the exact total-length arithmetic.
    pub(crate) fn parse(comment: &[u8]) -> Result<Trailer> {
        let mut r = BinaryReader::new(comment);

        let header_size = r.read_u32()?;
        let encryption_raw = r.read_u16()?;
        let signing_raw = r.read_u16()?;
        if header_size as u64 != EXTENDED_HEADER_SIZE {
            return Err(Error::MalformedTrailer(format!(
                "bad extended header size {header_size}"
            )));
        }

        let encryption = EncryptionScheme::from_wire(encryption_raw).ok_or_else(|| {
            Error::MalformedTrailer(format!(
                "unexpected encryption technique {encryption_raw} in header"
            ))
        })?;
        // The legacy stream cipher was never dispatched through the trailer.
        if encryption == EncryptionScheme::StreamCipher {
            return Err(Error::MalformedTrailer(
                "unexpected encryption technique in header".into(),
            ));
        }
        let signing = SignatureScheme::from_wire(signing_raw).ok_or_else(|| {
            Error::MalformedTrailer(format!("bad signing technique {signing_raw} in header"))
        })?;

        let mut expected = EXTENDED_HEADER_SIZE;
        match encryption {
            EncryptionScheme::None | EncryptionScheme::StreamCipher => {}
            EncryptionScheme::Tea => {
                expected += (TEA_HEADER_SIZE + ENCRYPTION_HEADER_SIZE) as u64;
            }
            EncryptionScheme::StreamCipherKeyTable => {
                expected += ENCRYPTION_HEADER_SIZE as u64;
            }
            EncryptionScheme::StreamCipherKeyTable2 => {
                expected += (ENCRYPTION_HEADER_SIZE + ENCRYPTION_HEADER_SIZE2) as u64;
            }
        }
        if signing != SignatureScheme::None {
            expected += SIGNATURE_HEADER_SIZE as u64;
        }
        if comment.len() as u64 != expected {
            return Err(Error::MalformedTrailer(format!(
                "comment field is the wrong length: {} declared, {} expected",
                comment.len(),
                expected
            )));
        }

        let signature = if signing != SignatureScheme::None {
            let size = r.read_u32()?;
            if size != SIGNATURE_HEADER_SIZE {
                return Err(Error::MalformedTrailer(format!(
                    "bad signature header size {size}"
                )));
            }
            let mut cdr_signed = [0u8; RSA_MESSAGE_LEN];
            cdr_signed.copy_from_slice(r.read_bytes(RSA_MESSAGE_LEN)?);
            Some(SignatureHeader { cdr_signed })
        } else {
            None
        };

        let tea = if encryption == EncryptionScheme::Tea {
            let size = r.read_u32()?;
            // The packer records the combined TEA + encryption header size here.
            if size != TEA_HEADER_SIZE + ENCRYPTION_HEADER_SIZE {
                return Err(Error::MalformedTrailer(format!(
                    "bad encryption header size {size}"
                )));
            }
            let mut opaque = [0u8; TEA_HEADER_OPAQUE as usize];
            opaque.copy_from_slice(r.read_bytes(TEA_HEADER_OPAQUE as usize)?);
            Some(TeaHeader { opaque })
        } else {
            None
        };

        let keys = if encryption.has_key_table() {
            let size = r.read_u32()?;
            let is_v2 = encryption == EncryptionScheme::StreamCipherKeyTable2;
            let shadow = if is_v2 {
                Some((r.read_u32()?, r.read_u32()?))
            } else {
                None
            };
            let expected_size =
                ENCRYPTION_HEADER_SIZE + if is_v2 { ENCRYPTION_HEADER_SIZE2 } else { 0 };
            if encryption != EncryptionScheme::Tea && size != expected_size {
                return Err(Error::MalformedTrailer(format!(
                    "bad encryption header size {size}"
                )));
            }
            let wrapped_iv = r.read_bytes(RSA_MESSAGE_LEN)?.to_vec();
            let wrapped_keys = r.read_bytes(KEY_COUNT * RSA_MESSAGE_LEN)?.to_vec();
            Some(EncryptionHeader {
                shadow,
                wrapped_iv,
                wrapped_keys,
            })
        } else {
            None
        };

        Ok(Trailer {
            encryption,
            signing,
            signature,
            tea,
            keys,
        })
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Trailer byte builders for fixtures.

    use super::*;

    pub fn extended_header(encryption: u16, signing: u16) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&(EXTENDED_HEADER_SIZE as u32).to_le_bytes());
        out.extend_from_slice(&encryption.to_le_bytes());
        out.extend_from_slice(&signing.to_le_bytes());
        out
    }

    pub fn encryption_header(
        v2: bool,
        wrapped_iv: &[u8],
        wrapped_keys: &[u8],
    ) -> Vec<u8> {
        let size = ENCRYPTION_HEADER_SIZE + if v2 { ENCRYPTION_HEADER_SIZE2 } else { 0 };
        let mut out = Vec::new();
        out.extend_from_slice(&size.to_le_bytes());
        if v2 {
            out.extend_from_slice(&0u32.to_le_bytes());
            out.extend_from_slice(&0u32.to_le_bytes());
        }
        out.extend_from_slice(wrapped_iv);
        out.extend_from_slice(wrapped_keys);
        out
    }

    pub fn signature_header(signature: &[u8; RSA_MESSAGE_LEN]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&SIGNATURE_HEADER_SIZE.to_le_bytes());
        out.extend_from_slice(signature);
        out
    }
}
