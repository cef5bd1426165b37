//! Archive entry metadata.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use perun_common::BinaryReader;

use crate::archive::PakFlavor;
use crate::zip::central_dir::extra_field;
use crate::zip::{gp_flags, CentralDirectoryHeader};

/// One logical file or directory inside the archive.
///
/// Built once per central-directory record during the initial read and
/// never mutated afterwards. The entry's `index` into the archive's entry
/// sequence is stable for the archive's lifetime and is the fast-path
/// lookup key; name lookup is the fallback when an index is stale.
#[derive(Debug, Clone)]
pub struct PakEntry {
    index: usize,
    name: String,
    name_raw: Vec<u8>,
    flags: u16,
    method: u16,
    dos_time: u32,
    crc32: u32,
    compressed_size: u64,
    uncompressed_size: u64,
    local_header_offset: u64,
    version_made_by: u16,
    version_needed: u16,
    external_attrs: u32,
    extra: Vec<u8>,
    comment: Option<String>,
    crypto_check_value: u8,
    is_aes_crypted: bool,
}

impl PakEntry {
    pub(crate) fn from_central(
        index: usize,
        header: &CentralDirectoryHeader,
        name_raw: Vec<u8>,
        extra: Vec<u8>,
        comment: Option<String>,
        flavor: PakFlavor,
    ) -> Self {
        let flags = header.flags;
        let dos_time = header.last_modified;
        let crc32 = header.crc32;
        let header_compressed = header.compressed_size;
        let header_uncompressed = header.uncompressed_size;
        let header_offset = header.local_header_offset;
        let disk_start = header.disk_number_start;

        let mut compressed_size = header_compressed as u64;
        let mut uncompressed_size = header_uncompressed as u64;
        let mut local_header_offset = header_offset as u64;

        // Zip64 extended information overrides saturated 32-bit fields.
        let mut reader = BinaryReader::new(&extra);
        while reader.remaining() >= 4 {
            let (Ok(tag), Ok(len)) = (reader.read_u16(), reader.read_u16()) else {
                break;
            };
            let Ok(data) = reader.read_bytes(len as usize) else {
                break;
            };
            if tag == extra_field::ZIP64 {
                let mut zr = BinaryReader::new(data);
                if header_uncompressed == u32::MAX {
                    if let Ok(v) = zr.read_u64() {
                        uncompressed_size = v;
                    }
                }
                if header_compressed == u32::MAX {
                    if let Ok(v) = zr.read_u64() {
                        compressed_size = v;
                    }
                }
                if header_offset == u32::MAX {
                    if let Ok(v) = zr.read_u64() {
                        local_header_offset = v;
                    }
                }
                if disk_start == u16::MAX {
                    let _ = zr.read_u32();
                }
            }
        }

        // Keying material for the classic cipher check byte: the high CRC
        // byte, or a DOS time byte when a trailing descriptor hides the CRC.
        let crypto_check_value = if flags & gp_flags::DESCRIPTOR == 0 {
            (crc32 >> 24) as u8
        } else {
            ((dos_time >> 8) & 0xff) as u8
        };

        let is_aes_crypted = flavor == PakFlavor::P4k
            && extra.len() > extra_field::P4K_AES_MARKER_OFFSET
            && extra[extra_field::P4K_AES_MARKER_OFFSET] > 0;

        let name = String::from_utf8_lossy(&name_raw).into_owned();

        Self {
            index,
            name,
            name_raw,
            flags,
            method: header.compression_method,
            dos_time,
            crc32,
            compressed_size,
            uncompressed_size,
            local_header_offset,
            version_made_by: header.version_made_by,
            version_needed: header.version_needed,
            external_attrs: header.external_attrs,
            extra,
            comment,
            crypto_check_value,
            is_aes_crypted,
        }
    }

    /// Index into the archive's entry sequence.
    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Entry name as stored (decoded per the entry's encoding flag).
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The exact name bytes from the central directory.
    #[inline]
    pub fn name_raw(&self) -> &[u8] {
        &self.name_raw
    }

    /// General purpose bit flags.
    #[inline]
    pub fn flags(&self) -> u16 {
        self.flags
    }

    /// Raw compression method code; may be an engine-private value.
    #[inline]
    pub fn method(&self) -> u16 {
        self.method
    }

    /// CRC-32 of the decrypted, decompressed content.
    #[inline]
    pub fn crc32(&self) -> u32 {
        self.crc32
    }

    /// Compressed size in bytes.
    #[inline]
    pub fn compressed_size(&self) -> u64 {
        self.compressed_size
    }

    /// Uncompressed size in bytes.
    #[inline]
    pub fn uncompressed_size(&self) -> u64 {
        self.uncompressed_size
    }

    /// Offset of the local header, relative to the start of the embedded
    /// archive.
    #[inline]
    pub fn local_header_offset(&self) -> u64 {
        self.local_header_offset
    }

    /// Version needed to extract.
    #[inline]
    pub fn version_needed(&self) -> u16 {
        self.version_needed
    }

    /// Version made by.
    #[inline]
    pub fn version_made_by(&self) -> u16 {
        self.version_made_by
    }

    /// External file attributes.
    #[inline]
    pub fn external_attrs(&self) -> u32 {
        self.external_attrs
    }

    /// Raw extra-field bytes.
    #[inline]
    pub fn extra(&self) -> &[u8] {
        &self.extra
    }

    /// Entry comment, if any.
    #[inline]
    pub fn comment(&self) -> Option<&str> {
        self.comment.as_deref()
    }

    /// Check byte for the classic cipher header.
    #[inline]
    pub(crate) fn crypto_check_value(&self) -> u8 {
        self.crypto_check_value
    }

    /// Whether the traditional encryption bit is set.
    #[inline]
    pub fn is_crypted(&self) -> bool {
        self.flags & gp_flags::ENCRYPTED != 0
    }

    /// Whether CRC and sizes trail the data in a descriptor record.
    #[inline]
    pub fn uses_descriptor(&self) -> bool {
        self.flags & gp_flags::DESCRIPTOR != 0
    }

    /// Whether the name and comment are flagged as UTF-8.
    #[inline]
    pub fn is_unicode(&self) -> bool {
        self.flags & gp_flags::UNICODE_TEXT != 0
    }

    /// Whether the P4K extra-field marker flags this entry as AES-protected.
    #[inline]
    pub fn is_aes_crypted(&self) -> bool {
        self.is_aes_crypted
    }

    /// Whether this entry represents a directory.
    #[inline]
    pub fn is_dir(&self) -> bool {
        self.name.ends_with('/') || self.name.ends_with('\\')
    }

    /// Whether this entry represents a file.
    #[inline]
    pub fn is_file(&self) -> bool {
        !self.is_dir()
    }

    /// Whether the local header must carry Zip64 sizes.
    pub(crate) fn local_header_requires_zip64(&self) -> bool {
        self.compressed_size >= u32::MAX as u64 || self.uncompressed_size >= u32::MAX as u64
    }

    /// Get the relative output path for extraction.
    ///
    /// Converts Windows path separators to forward slashes.
    pub fn output_path(&self) -> PathBuf {
        PathBuf::from(self.name.replace('\\', "/"))
    }

    /// Get the file extension, if any.
    pub fn extension(&self) -> Option<&str> {
        Path::new(&self.name)
            .extension()
            .and_then(|ext| ext.to_str())
    }

    /// Get the last modification time as a SystemTime.
    ///
    /// Returns None if the DOS datetime is invalid.
    pub fn last_modified(&self) -> Option<SystemTime> {
        dos_datetime_to_system_time(self.dos_time)
    }
}

/// Convert DOS date/time format to SystemTime.
///
/// DOS date/time format:
/// - Time: bits 0-4 = seconds/2, bits 5-10 = minutes, bits 11-15 = hours
/// - Date: bits 16-20 = day, bits 21-24 = month, bits 25-31 = year-1980
fn dos_datetime_to_system_time(datetime: u32) -> Option<SystemTime> {
    let year = 1980 + ((datetime >> 25) & 0x7F) as i32;
    let month = (datetime >> 21) & 0x0F;
    let day = (datetime >> 16) & 0x1F;
    let hour = (datetime >> 11) & 0x1F;
    let minute = (datetime >> 5) & 0x3F;
    let second = (datetime & 0x1F) * 2;

    if !(1..=12).contains(&month) || !(1..=31).contains(&day) || hour > 23 || minute > 59 {
        return None;
    }

    let mut days = 0i64;
    for y in 1970..year {
        days += if is_leap_year(y) { 366 } else { 365 };
    }

    const DAYS_IN_MONTH: [u32; 12] = [31, 28, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31];
    for m in 1..month {
        days += DAYS_IN_MONTH[(m - 1) as usize] as i64;
        if m == 2 && is_leap_year(year) {
            days += 1;
        }
    }
    days += (day - 1) as i64;

    let secs = days * 86400 + hour as i64 * 3600 + minute as i64 * 60 + second as i64;
    std::time::UNIX_EPOCH.checked_add(std::time::Duration::from_secs(secs as u64))
}

fn is_leap_year(year: i32) -> bool {
    (year % 4 == 0 && year % 100 != 0) || (year % 400 == 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use zerocopy::FromZeros;

    fn entry_with(name: &str, flags: u16, crc: u32, dos_time: u32) -> PakEntry {
        let mut header = CentralDirectoryHeader::new_zeroed();
        header.flags = flags;
        header.crc32 = crc;
        header.last_modified = dos_time;
        PakEntry::from_central(
            0,
            &header,
            name.as_bytes().to_vec(),
            Vec::new(),
            None,
            PakFlavor::Pak,
        )
    }

    #[test]
    fn test_crypto_check_value_from_crc() {
        let entry = entry_with("a.txt", 0, 0xDEADBEEF, 0);
        assert_eq!(entry.crypto_check_value(), 0xDE);
    }

    #[test]
    fn test_crypto_check_value_from_dos_time_with_descriptor() {
        let entry = entry_with("a.txt", gp_flags::DESCRIPTOR, 0xDEADBEEF, 0x0000AB00);
        assert_eq!(entry.crypto_check_value(), 0xAB);
    }

    #[test]
    fn test_is_dir() {
        assert!(entry_with("Data/Objects/", 0, 0, 0).is_dir());
        assert!(!entry_with("Data/Objects/test.cgf", 0, 0, 0).is_dir());
    }

    #[test]
    fn test_output_path_normalization() {
        let entry = entry_with(r"Data\Objects\test.cgf", 0, 0, 0);
        assert_eq!(entry.output_path(), PathBuf::from("Data/Objects/test.cgf"));
    }

    #[test]
    fn test_zip64_extra_overrides_sizes() {
        let mut header = CentralDirectoryHeader::new_zeroed();
        header.compressed_size = u32::MAX;
        header.uncompressed_size = u32::MAX;

        let mut extra = Vec::new();
        extra.extend_from_slice(&1u16.to_le_bytes());
        extra.extend_from_slice(&16u16.to_le_bytes());
        extra.extend_from_slice(&0x1_0000_0001u64.to_le_bytes()); // uncompressed
        extra.extend_from_slice(&0x1_0000_0002u64.to_le_bytes()); // compressed

        let entry = PakEntry::from_central(
            0,
            &header,
            b"big.bin".to_vec(),
            extra,
            None,
            PakFlavor::Pak,
        );
        assert_eq!(entry.uncompressed_size(), 0x1_0000_0001);
        assert_eq!(entry.compressed_size(), 0x1_0000_0002);
    }
}
