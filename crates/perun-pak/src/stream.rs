//! Entry stream pipeline.
//!
//! Builds the decoded byte stream for one entry: a bounded view over the
//! backing storage, zero or more decrypting transforms, and exactly one
//! decompressing transform selected from the entry's method code. Entries
//! under engine-private method codes are read eagerly and decrypted in
//! memory; those modes were not designed for partial decryption.

use std::io::{Read, Seek, SeekFrom};

use crate::archive::{PakArchive, PakFlavor};
use crate::entry::PakEntry;
use crate::local_header::{locate_entry_data, HeaderTest};
use crate::storage::Backing;
use crate::stream_cipher::StreamEngine;
use crate::trailer::EncryptionScheme;
use crate::zip::{method, ResolvedMethod};
use crate::{crypto, decompress, stream_cipher, tea, zipcrypto, Error, Result};

/// A read-only, seekable stream of one entry's decoded bytes.
///
/// Holds a borrow of the owning archive's storage: the archive must
/// outlive every stream derived from it, which the lifetime enforces.
pub struct EntryReader<'a> {
    source: Source<'a>,
    pos: u64,
}

enum Source<'a> {
    /// Zero-copy window into the backing store.
    Bounded {
        backing: &'a Backing,
        start: u64,
        len: u64,
    },
    /// Decoded bytes held in memory.
    Buffer(Vec<u8>),
}

impl<'a> EntryReader<'a> {
    pub(crate) fn bounded(backing: &'a Backing, start: u64, len: u64) -> Self {
        Self {
            source: Source::Bounded {
                backing,
                start,
                len,
            },
            pos: 0,
        }
    }

    pub(crate) fn from_vec(data: Vec<u8>) -> Self {
        Self {
            source: Source::Buffer(data),
            pos: 0,
        }
    }

    /// Total length of the decoded stream in bytes.
    pub fn len(&self) -> u64 {
        match &self.source {
            Source::Bounded { len, .. } => *len,
            Source::Buffer(data) => data.len() as u64,
        }
    }

    /// Whether the stream is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Read for EntryReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let remaining = self.len().saturating_sub(self.pos);
        let want = remaining.min(buf.len() as u64) as usize;
        if want == 0 {
            return Ok(0);
        }
        match &self.source {
            Source::Bounded { backing, start, .. } => {
                backing
                    .read_exact_at(*start + self.pos, &mut buf[..want])
                    .map_err(|e| std::io::Error::other(e.to_string()))?;
            }
            Source::Buffer(data) => {
                let at = self.pos as usize;
                buf[..want].copy_from_slice(&data[at..at + want]);
            }
        }
        self.pos += want as u64;
        Ok(want)
    }
}

impl Seek for EntryReader<'_> {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        let len = self.len() as i64;
        let target = match pos {
            SeekFrom::Start(offset) => offset as i64,
            SeekFrom::Current(delta) => self.pos as i64 + delta,
            SeekFrom::End(delta) => len + delta,
        };
        if target < 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "negative position is invalid",
            ));
        }
        if target > len {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "cannot seek past end",
            ));
        }
        self.pos = target as u64;
        Ok(self.pos)
    }
}

/// Map a raw method code to its decompressing transform for the flavor.
fn resolve_method(flavor: PakFlavor, code: u16) -> Result<ResolvedMethod> {
    match (flavor, code) {
        (_, method::STORED) => Ok(ResolvedMethod::Stored),
        (_, method::DEFLATED) => Ok(ResolvedMethod::Deflated),
        (_, method::ZSTD) => Ok(ResolvedMethod::Zstd),
        (PakFlavor::P4k, method::BZIP2) => Ok(ResolvedMethod::BZip2),
        (_, other) => Err(Error::UnsupportedMethod(other)),
    }
}

fn decrypt_with_key_table(
    archive: &PakArchive,
    entry: &PakEntry,
    engine: StreamEngine,
    data: &mut [u8],
) -> Result<()> {
    let table = archive
        .key_table()
        .ok_or_else(|| Error::UnableToDecrypt("no key table was recovered".into()))?;
    let index = stream_cipher::entry_key_index(entry.crc32());
    let iv = stream_cipher::entry_iv(
        entry.uncompressed_size(),
        entry.compressed_size(),
        entry.crc32(),
    );
    stream_cipher::apply_sic_reversed(engine, &table.keys[index], &iv, data)
        .map_err(|_| Error::UnableToDecrypt("data is corrupt".into()))
}

pub(crate) fn open_entry_stream<'a>(
    archive: &'a PakArchive,
    entry: &PakEntry,
) -> Result<EntryReader<'a>> {
    let data_start = locate_entry_data(archive, entry, HeaderTest::LocateOnly)?;
    let compressed_len = usize::try_from(entry.compressed_size()).map_err(|_| {
        Error::Decompression(format!(
            "compressed size {} exceeds addressable memory",
            entry.compressed_size()
        ))
    })?;

    let raw_method = entry.method();
    let engine_private = archive.flavor() == PakFlavor::Pak
        && (matches!(
            raw_method,
            method::DEFLATE_TEA
                | method::DEFLATE_STREAMCIPHER
                | method::STORE_KEYTABLE
                | method::DEFLATE_KEYTABLE
        ) || archive.encryption_scheme() == EncryptionScheme::StreamCipherKeyTable2);

    // Stage 1: raw compressed bytes, engine-decrypted where needed.
    let (mut buffer, resolved_code) = if engine_private {
        let mut data = archive.backing().read_vec_at(data_start, compressed_len)?;
        let resolved = match raw_method {
            method::DEFLATE_TEA => {
                tea::decrypt_entry_tea(&mut data);
                method::DEFLATED
            }
            method::DEFLATE_STREAMCIPHER | method::DEFLATE_KEYTABLE => {
                decrypt_with_key_table(archive, entry, StreamEngine::Twofish, &mut data)?;
                method::DEFLATED
            }
            method::STORE_KEYTABLE => {
                decrypt_with_key_table(archive, entry, StreamEngine::Twofish, &mut data)?;
                method::STORED
            }
            other => {
                // Method codes were not repurposed, but v2 archives key
                // every entry individually.
                if archive.encryption_scheme() == EncryptionScheme::StreamCipherKeyTable2 {
                    decrypt_with_key_table(archive, entry, StreamEngine::Aes, &mut data)?;
                }
                other
            }
        };
        (Some(data), resolved)
    } else {
        (None, raw_method)
    };

    // Stage 2: traditional PKWARE encryption layer.
    if entry.is_crypted() {
        let data = match buffer.take() {
            Some(data) => data,
            None => archive.backing().read_vec_at(data_start, compressed_len)?,
        };
        let key = archive
            .key()
            .ok_or_else(|| Error::UnableToDecrypt("no key material for encrypted entry".into()))?;
        buffer = Some(zipcrypto::decrypt_entry(
            key,
            entry.crypto_check_value(),
            &data,
        )?);
    }

    // Stage 3: P4K per-entry AES layer.
    if archive.flavor() == PakFlavor::P4k && entry.is_aes_crypted() {
        let data = match buffer.take() {
            Some(data) => data,
            None => archive.backing().read_vec_at(data_start, compressed_len)?,
        };
        let key = archive.key().unwrap_or(&crypto::DEFAULT_P4K_KEY);
        buffer = Some(crypto::decrypt(key, &data)?);
    }

    // Stage 4: exactly one decompressing transform.
    let resolved = resolve_method(archive.flavor(), resolved_code)?;
    let expected = usize::try_from(entry.uncompressed_size()).unwrap_or(0);
    let raw = match buffer {
        Some(data) => EntryReader::from_vec(data),
        None => EntryReader::bounded(archive.backing(), data_start, entry.compressed_size()),
    };

    match resolved {
        ResolvedMethod::Stored => Ok(raw),
        ResolvedMethod::Deflated => Ok(EntryReader::from_vec(decompress::inflate_raw_sized(
            raw, expected,
        )?)),
        ResolvedMethod::BZip2 => Ok(EntryReader::from_vec(decompress::decompress_bzip2_sized(
            raw, expected,
        )?)),
        ResolvedMethod::Zstd => decode_zstd_sniffed(raw, expected),
    }
}

/// Zstandard entries are sniffed: a payload opening with the frame magic is
/// decoded, anything else passes through undecoded (stripped-frame
/// payloads carry no decodable header).
fn decode_zstd_sniffed(mut raw: EntryReader<'_>, expected: usize) -> Result<EntryReader<'static>> {
    let mut magic = [0u8; 4];
    let mut got = 0;
    while got < 4 {
        let n = raw
            .read(&mut magic[got..])
            .map_err(|e| Error::Decompression(e.to_string()))?;
        if n == 0 {
            break;
        }
        got += n;
    }

    if got == 4 && magic == decompress::ZSTD_MAGIC {
        raw.seek(SeekFrom::Start(0))
            .map_err(|e| Error::Decompression(e.to_string()))?;
        Ok(EntryReader::from_vec(decompress::decompress_zstd_sized(
            raw, expected,
        )?))
    } else {
        let mut out = magic[..got].to_vec();
        raw.read_to_end(&mut out)
            .map_err(|e| Error::Decompression(e.to_string()))?;
        Ok(EntryReader::from_vec(out))
    }
}
