//! Archive facade: open, directory reading, scheme negotiation, lookup.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use memchr::memmem;
use perun_common::BinaryReader;

use crate::entry::PakEntry;
use crate::keytable::{self, KeyTable, OaepDigest};
use crate::local_header::{self, HeaderTest};
use crate::storage::Backing;
use crate::stream::{self, EntryReader};
use crate::stream_cipher::{self, StreamEngine};
use crate::tea;
use crate::trailer::{EncryptionScheme, SignatureScheme, Trailer, EXTENDED_HEADER_SIZE};
use crate::zip::{CentralDirectoryHeader, Eocd64Locator, Eocd64Record, EocdRecord, EOCD_BASE_SIZE};
use crate::{Error, Result};

/// Which dialect of the container an archive uses.
///
/// The two dialects disagree about method code 12 (BZip2 vs
/// Deflate+stream-cipher) and about where per-entry AES markers live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PakFlavor {
    /// Cry3-style `.pak`: comment trailer schemes, engine-private method
    /// codes 11-14.
    Pak,
    /// `.p4k`: ZIP64 containers with per-entry AES markers in the extra
    /// field.
    P4k,
}

/// What to do when the directory signature does not verify.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SignaturePolicy {
    /// Log the failure and keep going, the way shipped titles behave.
    #[default]
    Permissive,
    /// Reject the archive.
    Strict,
}

/// Options controlling how an archive is opened.
#[derive(Debug, Clone, Default)]
pub struct OpenOptions {
    flavor: Option<PakFlavor>,
    key: Option<Vec<u8>>,
    signature_policy: SignaturePolicy,
    oaep_digest: Option<OaepDigest>,
}

impl OpenOptions {
    /// Options for a Cry3-style `.pak` archive.
    pub fn pak() -> Self {
        Self {
            flavor: Some(PakFlavor::Pak),
            ..Self::default()
        }
    }

    /// Options for a `.p4k` archive.
    pub fn p4k() -> Self {
        Self {
            flavor: Some(PakFlavor::P4k),
            ..Self::default()
        }
    }

    /// Supply key material: DER public key bytes for key-table/signed
    /// archives, or the 16-byte AES key for P4K entries. Without this the
    /// compiled-in defaults are used.
    pub fn with_key(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Set the signature verification policy.
    pub fn signature_policy(mut self, policy: SignaturePolicy) -> Self {
        self.signature_policy = policy;
        self
    }

    /// Override the OAEP digest used for key unwrapping (title variants).
    pub fn oaep_digest(mut self, digest: OaepDigest) -> Self {
        self.oaep_digest = Some(digest);
        self
    }
}

/// An open archive: backing storage, parsed directory, and unwrapped key
/// material. The directory is immutable after the initial read.
pub struct PakArchive {
    backing: Backing,
    name: String,
    flavor: PakFlavor,
    key: Option<Vec<u8>>,
    entries: Vec<PakEntry>,
    offset_of_first_entry: u64,
    scheme: EncryptionScheme,
    signature: SignatureScheme,
    key_table: Option<KeyTable>,
    comment: Vec<u8>,
}

fn flavor_from_path(path: &Path) -> PakFlavor {
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("p4k") => PakFlavor::P4k,
        _ => PakFlavor::Pak,
    }
}

fn base_name(name: &str) -> &str {
    name.rsplit(['/', '\\']).next().unwrap_or(name)
}

impl PakArchive {
    /// Open an archive file, memory-mapped, with the flavor inferred from
    /// the file extension.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let options = OpenOptions {
            flavor: Some(flavor_from_path(path.as_ref())),
            ..OpenOptions::default()
        };
        Self::open_with(path, options)
    }

    /// Open an archive file, memory-mapped, with explicit options.
    pub fn open_with<P: AsRef<Path>>(path: P, options: OpenOptions) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let backing = Backing::from_file_mmap(&file)?;
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unknown")
            .to_string();
        let flavor = options.flavor.unwrap_or_else(|| flavor_from_path(path));
        Self::from_backing(backing, name, flavor, options)
    }

    /// Open from an already-open file handle.
    ///
    /// Reads go through a shared seek cursor serialized by a lock, rather
    /// than a memory map.
    pub fn from_file(file: File, name: &str, options: OpenOptions) -> Result<Self> {
        let backing = Backing::from_file(file)?;
        let flavor = options.flavor.unwrap_or(PakFlavor::Pak);
        Self::from_backing(backing, name.to_string(), flavor, options)
    }

    /// Open from an in-memory archive image.
    pub fn from_bytes(data: Vec<u8>, name: &str, options: OpenOptions) -> Result<Self> {
        let backing = Backing::from_bytes(data);
        let flavor = options.flavor.unwrap_or(PakFlavor::Pak);
        Self::from_backing(backing, name.to_string(), flavor, options)
    }

    fn from_backing(
        backing: Backing,
        name: String,
        flavor: PakFlavor,
        options: OpenOptions,
    ) -> Result<Self> {
        let mut archive = Self {
            backing,
            name,
            flavor,
            key: options.key,
            entries: Vec::new(),
            offset_of_first_entry: 0,
            scheme: EncryptionScheme::None,
            signature: SignatureScheme::None,
            key_table: None,
            comment: Vec::new(),
        };
        archive.read_entries(options.signature_policy, options.oaep_digest)?;
        Ok(archive)
    }

    /// Archive file name.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The archive dialect this instance was opened as.
    #[inline]
    pub fn flavor(&self) -> PakFlavor {
        self.flavor
    }

    /// The negotiated encryption scheme.
    #[inline]
    pub fn encryption_scheme(&self) -> EncryptionScheme {
        self.scheme
    }

    /// The declared signature scheme.
    #[inline]
    pub fn signature_scheme(&self) -> SignatureScheme {
        self.signature
    }

    /// Number of entries in the directory.
    #[inline]
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// All entries, in central-directory order.
    #[inline]
    pub fn entries(&self) -> &[PakEntry] {
        &self.entries
    }

    /// Get an entry by its stable index.
    #[inline]
    pub fn get(&self, index: usize) -> Option<&PakEntry> {
        self.entries.get(index)
    }

    /// Raw archive comment (empty when the comment carries a trailer).
    #[inline]
    pub fn comment(&self) -> &[u8] {
        &self.comment
    }

    /// Find an entry by exact name. Case-sensitive; separators normalize
    /// to forward slashes.
    pub fn find(&self, name: &str) -> Option<&PakEntry> {
        self.find_index(name).map(|i| &self.entries[i])
    }

    /// Find an entry's index by exact name.
    pub fn find_index(&self, name: &str) -> Option<usize> {
        let wanted = name.replace('\\', "/");
        self.entries
            .iter()
            .position(|e| e.name().replace('\\', "/") == wanted)
    }

    pub(crate) fn backing(&self) -> &Backing {
        &self.backing
    }

    #[inline]
    pub(crate) fn offset_of_first_entry(&self) -> u64 {
        self.offset_of_first_entry
    }

    pub(crate) fn key_table(&self) -> Option<&KeyTable> {
        self.key_table.as_ref()
    }

    pub(crate) fn key(&self) -> Option<&[u8]> {
        self.key.as_deref()
    }

    /// Open the decoded stream for the entry at `index`.
    pub fn open_stream(&self, index: usize) -> Result<EntryReader<'_>> {
        let entry = self
            .entries
            .get(index)
            .ok_or_else(|| Error::EntryNotFound(format!("index {index}")))?;
        stream::open_entry_stream(self, entry)
    }

    /// Open the decoded stream for an entry value.
    ///
    /// The entry's index is the fast path; when it is stale (does not name
    /// the same entry in this archive) a name lookup is the fallback.
    pub fn stream_by_entry(&self, entry: &PakEntry) -> Result<EntryReader<'_>> {
        let index = entry.index();
        let current = self.entries.get(index).filter(|e| e.name() == entry.name());
        let index = match current {
            Some(_) => index,
            None => self
                .find_index(entry.name())
                .ok_or_else(|| Error::EntryNotFound(entry.name().to_string()))?,
        };
        self.open_stream(index)
    }

    /// Read the entry at `index` fully into memory.
    pub fn read(&self, index: usize) -> Result<Vec<u8>> {
        let expected = self
            .entries
            .get(index)
            .map(|e| e.uncompressed_size() as usize)
            .unwrap_or(0);
        let mut out = Vec::with_capacity(expected);
        self.open_stream(index)?.read_to_end(&mut out)?;
        Ok(out)
    }

    /// Locate the absolute offset of an entry's compressed data.
    pub(crate) fn locate_entry(&self, entry: &PakEntry, test: HeaderTest) -> Result<u64> {
        local_header::locate_entry_data(self, entry, test)
    }

    /// Locate one entry's data, optionally cross-validating its local
    /// header against the central directory. Returns the absolute offset
    /// at which compressed data begins.
    pub fn validate_entry(&self, index: usize, test: HeaderTest) -> Result<u64> {
        let entry = self
            .entries
            .get(index)
            .ok_or_else(|| Error::EntryNotFound(format!("index {index}")))?;
        local_header::locate_entry_data(self, entry, test)
    }

    /// Search for and read the central directory, negotiating the
    /// encryption and signature schemes on the way.
    fn read_entries(
        &mut self,
        signature_policy: SignaturePolicy,
        oaep_digest: Option<OaepDigest>,
    ) -> Result<()> {
        let file_len = self.backing.len();

        // The EOCD sits within the last 64 KiB + record size, scanning
        // backwards to allow for a trailing comment.
        let tail_len = (0xFFFF + EOCD_BASE_SIZE).min(file_len);
        let tail_start = file_len - tail_len;
        let tail = self.backing.read_vec_at(tail_start, tail_len as usize)?;
        let eocd_pos = tail_start
            + find_last_record(&tail, &EocdRecord::MAGIC, EOCD_BASE_SIZE as usize)
                .ok_or(Error::NotAnArchive)? as u64;

        let eocd: EocdRecord = {
            let mut reader =
                BinaryReader::new_at(&tail, (eocd_pos - tail_start) as usize + 4);
            reader.read_struct()?
        };

        // Earlier encryption techniques stored the technique in the high
        // bits of the disk number; newer ones use the comment trailer so
        // signed archives stay readable by stock tools.
        let hint = match eocd.encryption_hint() {
            1 => EncryptionScheme::StreamCipher,
            2 => EncryptionScheme::Tea,
            _ => EncryptionScheme::None,
        };

        let mut entry_count = eocd.central_dir_count_disk as u64;
        let mut cd_size = eocd.central_dir_size as u64;
        let mut cd_offset = eocd.central_dir_offset as u64;
        let comment_len = eocd.comment_length as u64;

        let mut scheme = hint;
        let mut signing = SignatureScheme::None;
        let mut trailer: Option<Trailer> = None;

        if comment_len >= EXTENDED_HEADER_SIZE {
            // The trailer is located from the nominal directory end; when
            // the 32-bit fields are saturated fall back to the comment's
            // actual position after the EOCD record.
            let mut comment_pos = cd_offset + cd_size + EOCD_BASE_SIZE;
            let nominal_fits = comment_pos
                .checked_add(comment_len)
                .is_some_and(|end| end <= file_len);
            if eocd.central_dir_offset == u32::MAX || !nominal_fits {
                comment_pos = eocd_pos + EOCD_BASE_SIZE;
            }
            let comment = self.backing.read_vec_at(comment_pos, comment_len as usize)?;
            let parsed = Trailer::parse(&comment)?;
            if hint != EncryptionScheme::None && parsed.encryption != hint {
                return Err(Error::SchemeConflict {
                    hint,
                    declared: parsed.encryption,
                });
            }
            scheme = parsed.encryption;
            signing = parsed.signing;
            trailer = Some(parsed);
        } else if comment_len > 0 {
            self.comment = self
                .backing
                .read_vec_at(eocd_pos + EOCD_BASE_SIZE, comment_len as usize)?;
        }

        // The Zip64 locator, when present, sits directly before the EOCD.
        let require_zip64 = eocd.requires_zip64();
        let mut is_zip64 = false;
        if let Some(locator_pos) = eocd_pos.checked_sub(Eocd64Locator::SIZE) {
            let mut magic = [0u8; 4];
            if self.backing.read_exact_at(locator_pos, &mut magic).is_ok()
                && magic == Eocd64Locator::MAGIC
            {
                is_zip64 = true;
                let locator_bytes = self
                    .backing
                    .read_vec_at(locator_pos + 4, std::mem::size_of::<Eocd64Locator>())?;
                let locator: Eocd64Locator =
                    BinaryReader::new(&locator_bytes).read_struct()?;
                let record_offset = locator.zip64_eocd_offset;

                let mut sig = [0u8; 4];
                self.backing.read_exact_at(record_offset, &mut sig)?;
                if sig != Eocd64Record::MAGIC {
                    return Err(Error::BadZip64Record {
                        offset: record_offset,
                        actual: u32::from_le_bytes(sig),
                    });
                }
                let record_bytes = self
                    .backing
                    .read_vec_at(record_offset + 4, std::mem::size_of::<Eocd64Record>())?;
                let record: Eocd64Record = BinaryReader::new(&record_bytes).read_struct()?;
                entry_count = record.central_dir_count_disk;
                cd_size = record.central_dir_size;
                cd_offset = record.central_dir_offset;
            }
        }
        if !is_zip64 && require_zip64 {
            return Err(Error::Zip64Required);
        }

        // Archives appended to an executable stub carry offsets relative
        // to the embedded start; recover the correction from where the
        // directory actually ends.
        if !is_zip64 && (cd_offset as i64) < eocd_pos as i64 - cd_size as i64 {
            let correction = eocd_pos as i64 - cd_size as i64 - cd_offset as i64;
            if correction <= 0 {
                return Err(Error::InvalidEmbeddedArchive);
            }
            self.offset_of_first_entry = correction as u64;
        }

        let cd_abs = self.offset_of_first_entry + cd_offset;
        let cd_len = usize::try_from(cd_size)
            .map_err(|_| Error::CorruptDirectory("directory size out of range".into()))?;
        let mut raw_cdr = self.backing.read_vec_at(cd_abs, cd_len)?;

        // Keyed schemes ship their table in the trailer; recover it before
        // touching the directory bytes.
        if scheme.has_key_table() {
            if let Some(keys) = trailer.as_ref().and_then(|t| t.keys.as_ref()) {
                let digest = oaep_digest.unwrap_or(match scheme {
                    EncryptionScheme::Tea => OaepDigest::Sha1,
                    _ => OaepDigest::Sha256,
                });
                self.key_table = Some(keytable::unwrap_key_table(
                    self.key.as_deref(),
                    &keys.wrapped_iv,
                    &keys.wrapped_keys,
                    digest,
                )?);
            }
        }

        raw_cdr = self.decode_directory(scheme, raw_cdr)?;

        if signing != SignatureScheme::None {
            if let Some(sig) = trailer.as_ref().and_then(|t| t.signature.as_ref()) {
                let base = base_name(&self.name);
                let verified = keytable::verify_cdr_signature(
                    self.key.as_deref(),
                    &raw_cdr,
                    base.as_bytes(),
                    &sig.cdr_signed,
                );
                if !verified {
                    match signature_policy {
                        SignaturePolicy::Strict => return Err(Error::SignatureInvalid),
                        SignaturePolicy::Permissive => {
                            tracing::warn!(
                                archive = %self.name,
                                "failed to verify RSA signature of archive directory"
                            );
                        }
                    }
                }
            }
        }

        self.entries = parse_central_directory(&raw_cdr, entry_count, self.flavor)?;
        self.scheme = scheme;
        self.signature = signing;
        Ok(())
    }

    /// Decrypt the raw central directory image per the negotiated scheme.
    fn decode_directory(&self, scheme: EncryptionScheme, raw: Vec<u8>) -> Result<Vec<u8>> {
        match scheme {
            EncryptionScheme::None => Ok(raw),
            EncryptionScheme::Tea => Ok(tea::decrypt_directory(&raw)),
            EncryptionScheme::StreamCipher => {
                tracing::warn!(
                    archive = %self.name,
                    "legacy stream-cipher header encryption is unsupported; \
                     treating directory as plaintext"
                );
                let mut raw = raw;
                stream_cipher::legacy_stream_cipher(
                    &mut raw,
                    stream_cipher::reference_crc_for_pak(),
                );
                Ok(raw)
            }
            EncryptionScheme::StreamCipherKeyTable | EncryptionScheme::StreamCipherKeyTable2 => {
                let table = self.key_table.as_ref().ok_or_else(|| {
                    Error::HeaderDecryptFailed("no key table was recovered".into())
                })?;
                let engine = if scheme == EncryptionScheme::StreamCipherKeyTable2 {
                    StreamEngine::Aes
                } else {
                    StreamEngine::Twofish
                };
                let mut raw = raw;
                stream_cipher::apply_sic_reversed(engine, &table.keys[0], &table.iv, &mut raw)
                    .map_err(|e| Error::HeaderDecryptFailed(e.to_string()))?;
                Ok(raw)
            }
        }
    }
}

impl std::fmt::Debug for PakArchive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PakArchive")
            .field("name", &self.name)
            .field("flavor", &self.flavor)
            .field("scheme", &self.scheme)
            .field("entries", &self.entries.len())
            .finish()
    }
}

/// Find the last occurrence of `magic` in `haystack` that leaves room for
/// a record of `min_record` bytes.
fn find_last_record(haystack: &[u8], magic: &[u8; 4], min_record: usize) -> Option<usize> {
    let mut end = haystack.len();
    while let Some(pos) = memmem::rfind(&haystack[..end], magic) {
        if pos + min_record <= haystack.len() {
            return Some(pos);
        }
        // Too close to the end for a full record; keep scanning backwards.
        end = pos;
    }
    None
}

/// Parse `count` central file headers sequentially from the (decrypted)
/// directory image. Any record with a wrong signature fails the whole
/// open; no partial directory is ever returned.
fn parse_central_directory(
    data: &[u8],
    count: u64,
    flavor: PakFlavor,
) -> Result<Vec<PakEntry>> {
    let mut reader = BinaryReader::new(data);
    let mut entries = Vec::new();

    for index in 0..count {
        let signature = reader
            .read_u32()
            .map_err(|_| Error::CorruptDirectory(format!("directory truncated at entry {index}")))?;
        if signature != CentralDirectoryHeader::SIGNATURE {
            return Err(Error::CorruptDirectory(format!(
                "wrong central directory signature at entry {index}"
            )));
        }
        let header: CentralDirectoryHeader = reader
            .read_struct()
            .map_err(|_| Error::CorruptDirectory(format!("directory truncated at entry {index}")))?;

        let name_len = header.file_name_length as usize;
        let extra_len = header.extra_field_length as usize;
        let comment_len = header.file_comment_length as usize;

        let read_var = |reader: &mut BinaryReader<'_>, len: usize| -> Result<Vec<u8>> {
            reader
                .read_bytes(len)
                .map(|b| b.to_vec())
                .map_err(|_| Error::CorruptDirectory(format!("directory truncated at entry {index}")))
        };

        let name_raw = read_var(&mut reader, name_len)?;
        let extra = read_var(&mut reader, extra_len)?;
        let comment = if comment_len > 0 {
            Some(String::from_utf8_lossy(&read_var(&mut reader, comment_len)?).into_owned())
        } else {
            None
        };

        entries.push(PakEntry::from_central(
            index as usize,
            &header,
            name_raw,
            extra,
            comment,
            flavor,
        ));
    }

    Ok(entries)
}
