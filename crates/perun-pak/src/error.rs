//! Error types for the perun-pak crate.

use thiserror::Error;

use crate::trailer::EncryptionScheme;

/// Errors that can occur when working with PAK/P4K archives.
///
/// Errors raised while reading the directory are fatal to the whole open;
/// errors raised for a single entry are scoped to that entry.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Common library error.
    #[error("{0}")]
    Common(#[from] perun_common::Error),

    /// No end of central directory record was found.
    #[error("cannot find end of central directory record")]
    NotAnArchive,

    /// The custom trailer in the archive comment is inconsistent.
    #[error("malformed archive trailer: {0}")]
    MalformedTrailer(String),

    /// The legacy EOCD hint and the trailer disagree about the encryption
    /// technique.
    #[error("encryption scheme conflict: EOCD hint {hint:?}, trailer declares {declared:?}")]
    SchemeConflict {
        hint: EncryptionScheme,
        declared: EncryptionScheme,
    },

    /// ZIP64 fields are saturated but no ZIP64 locator exists.
    #[error("cannot find Zip64 locator")]
    Zip64Required,

    /// The ZIP64 locator pointed at something that is not a ZIP64 EOCD record.
    #[error("invalid Zip64 central directory signature at {offset:#x}: {actual:#010x}")]
    BadZip64Record { offset: u64, actual: u32 },

    /// The start-of-archive correction for an embedded archive is not positive.
    #[error("invalid embedded archive")]
    InvalidEmbeddedArchive,

    /// A central directory record is damaged.
    #[error("corrupt central directory: {0}")]
    CorruptDirectory(String),

    /// RSA-OAEP recovery of the key table or IV failed.
    #[error("key recovery failed: {0}")]
    KeyRecoveryFailed(String),

    /// Decrypting the raw central directory bytes failed.
    #[error("failed to decrypt archive headers: {0}")]
    HeaderDecryptFailed(String),

    /// CDR signature verification failed under the strict policy.
    #[error("archive directory signature verification failed")]
    SignatureInvalid,

    /// The local header requires Zip64 information that is absent.
    #[error("required Zip64 extended information missing")]
    Zip64InfoMissing,

    /// Wrong magic at a local file header.
    #[error("wrong local header signature at {offset:#x}, expected {expected:#010x}, actual {actual:#010x}")]
    BadLocalSignature {
        offset: u64,
        expected: u32,
        actual: u32,
    },

    /// A local header field does not agree with the central directory.
    #[error("local header cross-check failed on {field}: {detail}")]
    LocalHeaderMismatch {
        field: &'static str,
        detail: String,
    },

    /// Unsupported compression method code.
    #[error("unsupported compression method {0}")]
    UnsupportedMethod(u16),

    /// A decrypting transform for an entry could not be built or applied.
    #[error("unable to decrypt this entry: {0}")]
    UnableToDecrypt(String),

    /// Entry lookup failed.
    #[error("entry not found: {0}")]
    EntryNotFound(String),

    /// Decompression error.
    #[error("decompression error: {0}")]
    Decompression(String),

    /// A cipher primitive was handed a buffer violating its block-size
    /// precondition.
    #[error("cipher input length {len} is not a multiple of {multiple}")]
    InvalidCipherLength { multiple: usize, len: usize },
}

/// Result type for PAK operations.
pub type Result<T> = std::result::Result<T, Error>;
