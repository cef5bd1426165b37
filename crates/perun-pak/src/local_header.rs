//! Local header location and cross-validation.
//!
//! This is the single source of truth for "where does an entry's
//! compressed data start": extraction calls it in locate mode, integrity
//! testing in full-validation mode. When the directory itself is under
//! legacy header encryption no local header is consulted at all, because
//! the engine's packer guarantees no extra data between name and payload.

use perun_common::BinaryReader;

use crate::archive::{PakArchive, PakFlavor};
use crate::entry::PakEntry;
use crate::trailer::EncryptionScheme;
use crate::zip::central_dir::extra_field;
use crate::zip::{
    gp_flags, method, LocalFileHeader, LOCAL_HEADER_BASE_SIZE, VERSION_MADE_BY, VERSION_ZIP64,
};
use crate::{zipcrypto, Error, Result};

/// What to check while locating an entry's data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderTest {
    /// Locate the data and verify only what extraction needs.
    LocateOnly,
    /// Additionally cross-check every local field against the central
    /// directory.
    FullValidate,
}

fn mismatch(field: &'static str, detail: impl Into<String>) -> Error {
    Error::LocalHeaderMismatch {
        field,
        detail: detail.into(),
    }
}

pub(crate) fn is_method_supported(flavor: PakFlavor, code: u16) -> bool {
    match flavor {
        PakFlavor::P4k => matches!(
            code,
            method::STORED | method::DEFLATED | method::BZIP2 | method::ZSTD
        ),
        PakFlavor::Pak => matches!(
            code,
            method::STORED
                | method::DEFLATED
                | method::ZSTD
                | method::DEFLATE_TEA
                | method::DEFLATE_STREAMCIPHER
                | method::STORE_KEYTABLE
                | method::DEFLATE_KEYTABLE
        ),
    }
}

fn is_valid_name(name: &[u8]) -> bool {
    if name.contains(&0) {
        return false;
    }
    if name.first().is_some_and(|&b| b == b'/' || b == b'\\') {
        return false;
    }
    // Reject rooted Windows names ("C:...").
    if name.len() >= 2 && name[1] == b':' {
        return false;
    }
    true
}

/// Locate (and optionally validate) one entry's data, returning the
/// absolute offset at which compressed data begins.
pub(crate) fn locate_entry_data(
    archive: &PakArchive,
    entry: &PakEntry,
    test: HeaderTest,
) -> Result<u64> {
    if archive.encryption_scheme() != EncryptionScheme::None {
        // The packer asserts there is no extra data at the end of the local
        // header in this mode, so the offset is pure arithmetic.
        return Ok(archive.offset_of_first_entry()
            + entry.local_header_offset()
            + LOCAL_HEADER_BASE_SIZE
            + entry.name_raw().len() as u64);
    }

    let full = test == HeaderTest::FullValidate;
    let abs_offset = archive.offset_of_first_entry() + entry.local_header_offset();

    let mut head = [0u8; LOCAL_HEADER_BASE_SIZE as usize];
    archive.backing().read_exact_at(abs_offset, &mut head)?;
    let mut reader = BinaryReader::new(&head);

    let signature = reader.read_u32()?;
    if signature != LocalFileHeader::SIGNATURE && signature != LocalFileHeader::SIGNATURE_ENCRYPTED
    {
        return Err(Error::BadLocalSignature {
            offset: abs_offset,
            expected: LocalFileHeader::SIGNATURE,
            actual: signature,
        });
    }
    let header: LocalFileHeader = reader.read_struct()?;

    let extract_version = header.version_needed & 0x00ff;
    let local_flags = header.flags;
    let local_method = header.compression_method;
    let file_time = header.last_mod_time;
    let file_date = header.last_mod_date;
    let crc_value = header.crc32;
    let header_compressed = header.compressed_size;
    let header_uncompressed = header.uncompressed_size;
    let name_len = header.file_name_length as usize;
    let extra_len = header.extra_field_length as usize;

    let name_data = archive
        .backing()
        .read_vec_at(abs_offset + LOCAL_HEADER_BASE_SIZE, name_len)?;
    let extra_data = archive
        .backing()
        .read_vec_at(abs_offset + LOCAL_HEADER_BASE_SIZE + name_len as u64, extra_len)?;

    let mut size = header_uncompressed as u64;
    let mut compressed = header_compressed as u64;
    let mut have_zip64_extra = false;
    {
        let mut er = BinaryReader::new(&extra_data);
        while er.remaining() >= 4 {
            let (Ok(tag), Ok(len)) = (er.read_u16(), er.read_u16()) else {
                break;
            };
            let Ok(data) = er.read_bytes(len as usize) else {
                break;
            };
            if tag == extra_field::ZIP64 && data.len() >= 16 {
                have_zip64_extra = true;
                let mut zr = BinaryReader::new(data);
                size = zr.read_u64()?;
                compressed = zr.read_u64()?;
            }
        }
    }

    if have_zip64_extra {
        if local_flags & gp_flags::DESCRIPTOR != 0 {
            // Sentinel values may be valid if patched later.
            if size != u64::MAX && size != entry.uncompressed_size() {
                return Err(mismatch("size", "invalid for descriptor"));
            }
            if compressed != u64::MAX && compressed != entry.compressed_size() {
                return Err(mismatch("compressed size", "invalid for descriptor"));
            }
        }
    } else if extract_version >= VERSION_ZIP64
        && (header_uncompressed == u32::MAX || header_compressed == u32::MAX)
    {
        return Err(Error::Zip64InfoMissing);
    }

    // Prerequisites for extracting the data.
    if entry.is_file() {
        if !is_method_supported(archive.flavor(), entry.method()) {
            return Err(Error::UnsupportedMethod(entry.method()));
        }
        if extract_version > VERSION_MADE_BY
            || (extract_version > 20 && extract_version < VERSION_ZIP64)
        {
            return Err(mismatch(
                "extract version",
                format!("version required to extract not supported ({extract_version})"),
            ));
        }
        if local_flags
            & (gp_flags::PATCHED
                | gp_flags::STRONG_ENCRYPTION
                | gp_flags::ENHANCED_COMPRESS
                | gp_flags::HEADER_MASKED)
            != 0
        {
            return Err(mismatch(
                "flags",
                "entry requires unsupported zip features",
            ));
        }
    }

    if full {
        const VALID_VERSIONS: &[u16] = &[10, 11, 20, 21, 25, 27, 45, 46, 50, 51, 52, 61, 62, 63];
        // Later versions are ignored as unknown.
        if extract_version <= 63 && !VALID_VERSIONS.contains(&extract_version) {
            return Err(mismatch(
                "extract version",
                format!("version required to extract is invalid ({extract_version})"),
            ));
        }

        if local_flags
            & (gp_flags::RESERVED_PKWARE_4 | gp_flags::RESERVED_PKWARE_14 | gp_flags::RESERVED_PKWARE_15)
            != 0
        {
            return Err(mismatch("reserved flags", "reserved bit flags cannot be set"));
        }

        if local_flags & gp_flags::ENCRYPTED != 0 && extract_version < 20 {
            return Err(mismatch(
                "encryption version",
                format!("extract version too low for encryption ({extract_version})"),
            ));
        }

        if local_flags & gp_flags::STRONG_ENCRYPTION != 0 {
            if local_flags & gp_flags::ENCRYPTED == 0 {
                return Err(mismatch(
                    "strong encryption",
                    "strong encryption flag set but encryption flag is not",
                ));
            }
            if extract_version < 50 {
                return Err(mismatch(
                    "strong encryption",
                    format!("extract version too low for encryption ({extract_version})"),
                ));
            }
        }

        if local_flags & gp_flags::PATCHED != 0 && extract_version < 27 {
            return Err(mismatch(
                "patched data",
                format!("patched data requires higher version than ({extract_version})"),
            ));
        }

        if local_flags != entry.flags() {
            return Err(mismatch(
                "flags",
                format!(
                    "central {:#06x} does not match local {:#06x}",
                    entry.flags(),
                    local_flags
                ),
            ));
        }

        if local_method != entry.method() {
            return Err(mismatch(
                "compression method",
                format!(
                    "central {} does not match local {}",
                    entry.method(),
                    local_method
                ),
            ));
        }

        if entry.version_needed() & 0x00ff != extract_version {
            return Err(mismatch("extract version", "central and local versions differ"));
        }

        if local_flags & gp_flags::STRONG_ENCRYPTION != 0 && extract_version < 62 {
            return Err(mismatch(
                "strong encryption",
                "flag set but version not high enough",
            ));
        }

        if local_flags & gp_flags::HEADER_MASKED != 0 && (file_time != 0 || file_date != 0) {
            return Err(mismatch(
                "time/date",
                "header masked set but date/time values non-zero",
            ));
        }

        if local_flags & gp_flags::DESCRIPTOR == 0 && crc_value != entry.crc32() {
            return Err(mismatch(
                "crc",
                format!(
                    "central {:#010x} does not match local {:#010x}",
                    entry.crc32(),
                    crc_value
                ),
            ));
        }

        // Also covers streamed entries whose header was never patched.
        if size == 0 && compressed == 0 && crc_value != 0 {
            return Err(mismatch("crc", "invalid CRC for an empty entry"));
        }

        if entry.name_raw().len() > name_len {
            return Err(mismatch("name length", "central name longer than local"));
        }

        if name_data != entry.name_raw() {
            return Err(mismatch(
                "file name",
                "central and local file names differ",
            ));
        }

        if entry.is_dir() {
            if size > 0 {
                return Err(mismatch("directory size", "directory cannot have size"));
            }
            // A compressed size of 2 is valid when the true size was unknown
            // at write time.
            let limit = if entry.is_crypted() {
                zipcrypto::HEADER_LEN as u64 + 2
            } else {
                2
            };
            if compressed > limit {
                return Err(mismatch(
                    "directory compressed size",
                    "directory compressed size invalid",
                ));
            }
        }

        if !is_valid_name(&name_data) {
            return Err(mismatch("name", "name is invalid"));
        }
    }

    // Tests that apply to both modes. Sizes can only be verified when known
    // in the local header; the central header always knows them.
    if local_flags & gp_flags::DESCRIPTOR == 0
        || ((size > 0 || compressed > 0) && entry.uncompressed_size() > 0)
    {
        if size != 0 && size != entry.uncompressed_size() {
            return Err(mismatch(
                "size",
                format!(
                    "central ({}) does not match local ({})",
                    entry.uncompressed_size(),
                    size
                ),
            ));
        }
        if compressed != 0
            && compressed != entry.compressed_size()
            && compressed != 0xFFFFFFFF
            && compressed != u64::MAX
        {
            return Err(mismatch(
                "compressed size",
                format!(
                    "central ({}) does not match local ({})",
                    entry.compressed_size(),
                    compressed
                ),
            ));
        }
    }

    Ok(abs_offset + LOCAL_HEADER_BASE_SIZE + name_len as u64 + extra_len as u64)
}
