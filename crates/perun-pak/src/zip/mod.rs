//! ZIP format structures.
//!
//! This module contains the low-level structures for parsing ZIP archives,
//! including ZIP64 extensions and the engine's private method codes.

pub mod central_dir;
mod eocd;
mod local;

pub use central_dir::CentralDirectoryHeader;
pub use eocd::{Eocd64Locator, Eocd64Record, EocdRecord};
pub use local::LocalFileHeader;

/// Raw compression method codes as stored in headers.
///
/// Codes 11-14 are engine-private combinations of a compression method with
/// one of the legacy encryption techniques; they only carry that meaning in
/// Cry3-style archives. 12 doubles as standard BZip2 in P4K-style archives.
pub mod method {
    /// No compression.
    pub const STORED: u16 = 0;
    /// DEFLATE compression.
    pub const DEFLATED: u16 = 8;
    /// Deflate + TEA encryption.
    pub const DEFLATE_TEA: u16 = 11;
    /// Deflate + per-file stream cipher.
    pub const DEFLATE_STREAMCIPHER: u16 = 12;
    /// BZip2 compression (standard ZIP code, P4K archives only).
    pub const BZIP2: u16 = 12;
    /// Store + per-file key-table stream cipher.
    pub const STORE_KEYTABLE: u16 = 13;
    /// Deflate + per-file key-table stream cipher.
    pub const DEFLATE_KEYTABLE: u16 = 14;
    /// Zstandard compression (engine custom).
    pub const ZSTD: u16 = 100;
}

/// A compression method after any engine-private encryption wrapping has
/// been resolved away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvedMethod {
    /// No compression (stored).
    Stored,
    /// Raw DEFLATE stream.
    Deflated,
    /// BZip2 stream.
    BZip2,
    /// Zstandard frame (possibly with a stripped header, see the magic sniff).
    Zstd,
}

/// General purpose bit flag masks.
pub mod gp_flags {
    /// Entry data is encrypted (traditional PKWARE encryption).
    pub const ENCRYPTED: u16 = 0x0001;
    /// CRC and sizes follow the data in a trailing descriptor.
    pub const DESCRIPTOR: u16 = 0x0008;
    /// Reserved by PKWARE (bit 4).
    pub const RESERVED_PKWARE_4: u16 = 0x0010;
    /// Compressed patched data.
    pub const PATCHED: u16 = 0x0020;
    /// Strong encryption.
    pub const STRONG_ENCRYPTION: u16 = 0x0040;
    /// Name and comment are UTF-8.
    pub const UNICODE_TEXT: u16 = 0x0800;
    /// Enhanced compression.
    pub const ENHANCED_COMPRESS: u16 = 0x1000;
    /// Local header fields are masked.
    pub const HEADER_MASKED: u16 = 0x2000;
    /// Reserved by PKWARE (bit 14).
    pub const RESERVED_PKWARE_14: u16 = 0x4000;
    /// Reserved by PKWARE (bit 15).
    pub const RESERVED_PKWARE_15: u16 = 0x8000;
}

/// Data descriptor signature (optional record trailing entry data).
pub const DATA_DESCRIPTOR_SIGNATURE: u32 = 0x08074b50;

/// Fixed size of a local file header including its signature.
pub const LOCAL_HEADER_BASE_SIZE: u64 = 30;

/// Fixed size of the end of central directory record including its signature.
pub const EOCD_BASE_SIZE: u64 = 22;

/// Version needed to extract Zip64 archives.
pub const VERSION_ZIP64: u16 = 45;

/// Highest "version made by" this implementation understands.
pub const VERSION_MADE_BY: u16 = 51;
