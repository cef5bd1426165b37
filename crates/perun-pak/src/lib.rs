//! Reader for CryEngine-family PAK/P4K archives.
//!
//! These containers are structurally ZIP/ZIP64 files extended by the
//! engine with custom compression codes, custom encryption and signature
//! schemes layered over the ZIP trailer, and per-entry key material
//! derived from entry metadata. Five mutually exclusive encryption
//! techniques exist:
//!
//! - plain (no encryption)
//! - a legacy stream cipher (unobserved keystream, treated as plaintext)
//! - TEA over the directory with XXTEA per entry
//! - a Twofish keystream keyed from an RSA-wrapped 16-key table
//! - the "Hunt" variant of the key table, preferring AES
//!
//! The technique is negotiated from a 2-bit hint in the end-of-central-
//! directory record and/or a custom trailer in the archive comment; the
//! two signals must agree.
//!
//! # Example
//!
//! ```no_run
//! use perun_pak::PakArchive;
//!
//! let archive = PakArchive::open("Data.p4k")?;
//!
//! for entry in archive.entries() {
//!     println!("{}: {} bytes", entry.name(), entry.uncompressed_size());
//! }
//!
//! if let Some(entry) = archive.find("Data/Scripts/config.xml") {
//!     let data = archive.read(entry.index())?;
//! }
//! # Ok::<(), perun_pak::Error>(())
//! ```

mod archive;
pub mod crypto;
pub mod decompress;
mod entry;
mod error;
mod integrity;
pub mod keytable;
mod local_header;
mod storage;
mod stream;
pub mod stream_cipher;
pub mod tea;
mod trailer;
pub mod zip;
pub mod zipcrypto;

pub use archive::{OpenOptions, PakArchive, PakFlavor, SignaturePolicy};
pub use entry::PakEntry;
pub use error::{Error, Result};
pub use integrity::{TestOperation, TestStatus, TestStrategy};
pub use keytable::{KeyTable, OaepDigest};
pub use local_header::HeaderTest;
pub use stream::EntryReader;
pub use trailer::{EncryptionScheme, SignatureScheme};
