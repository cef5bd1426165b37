//! Whole-archive tests over synthetic in-memory fixtures.

use std::io::Read;

use perun_pak::{
    Error, HeaderTest, OpenOptions, PakArchive, TestStrategy,
};

const LOCAL_SIG: u32 = 0x04034b50;
const CENTRAL_SIG: u32 = 0x02014b50;
const EOCD_SIG: u32 = 0x06054b50;
const ZIP64_LOCATOR_SIG: u32 = 0x07064b50;
const DESCRIPTOR_SIG: u32 = 0x08074b50;

#[derive(Clone)]
struct EntrySpec {
    name: String,
    method: u16,
    flags: u16,
    crc: u32,
    uncompressed: u32,
    payload: Vec<u8>,
    version: u16,
    local_crc: Option<u32>,
    local_sizes: Option<(u32, u32)>, // (compressed, uncompressed)
    central_extra: Vec<u8>,
    descriptor: Vec<u8>,
}

impl EntrySpec {
    fn new(name: &str, method: u16, payload: Vec<u8>, uncompressed: u32, crc: u32) -> Self {
        Self {
            name: name.to_string(),
            method,
            flags: 0,
            crc,
            uncompressed,
            payload,
            version: 20,
            local_crc: None,
            local_sizes: None,
            central_extra: Vec::new(),
            descriptor: Vec::new(),
        }
    }

    fn stored(name: &str, content: &[u8]) -> Self {
        Self::new(
            name,
            0,
            content.to_vec(),
            content.len() as u32,
            crc32fast::hash(content),
        )
    }
}

#[derive(Default)]
struct ArchiveBuilder {
    entries: Vec<EntrySpec>,
    disk_number: u16,
    comment: Vec<u8>,
    prefix: Vec<u8>,
    count_override: Option<u16>,
    zip64_locator_target: Option<u64>,
}

impl ArchiveBuilder {
    fn new() -> Self {
        Self::default()
    }

    fn entry(mut self, entry: EntrySpec) -> Self {
        self.entries.push(entry);
        self
    }

    fn prefix(mut self, stub: &[u8]) -> Self {
        self.prefix = stub.to_vec();
        self
    }

    fn count_override(mut self, count: u16) -> Self {
        self.count_override = Some(count);
        self
    }

    fn zip64_locator(mut self, record_offset: u64) -> Self {
        self.zip64_locator_target = Some(record_offset);
        self
    }

    fn build(self) -> Vec<u8> {
        let mut out = self.prefix.clone();
        let logical_base = self.prefix.len() as u32;
        let mut centrals = Vec::new();

        for entry in &self.entries {
            // Offsets are recorded relative to the embedded archive start.
            let offset = out.len() as u32 - logical_base;
            let (local_compressed, local_uncompressed) = entry
                .local_sizes
                .unwrap_or((entry.payload.len() as u32, entry.uncompressed));

            out.extend(LOCAL_SIG.to_le_bytes());
            out.extend(entry.version.to_le_bytes());
            out.extend(entry.flags.to_le_bytes());
            out.extend(entry.method.to_le_bytes());
            out.extend(0u32.to_le_bytes()); // dos time
            out.extend(entry.local_crc.unwrap_or(entry.crc).to_le_bytes());
            out.extend(local_compressed.to_le_bytes());
            out.extend(local_uncompressed.to_le_bytes());
            out.extend((entry.name.len() as u16).to_le_bytes());
            out.extend(0u16.to_le_bytes()); // extra len
            out.extend(entry.name.as_bytes());
            out.extend(&entry.payload);
            out.extend(&entry.descriptor);
            centrals.push(offset);
        }

        let cd_offset = out.len() as u32 - logical_base;
        let mut cd_size = 0u32;
        for (entry, offset) in self.entries.iter().zip(&centrals) {
            let before = out.len();
            out.extend(CENTRAL_SIG.to_le_bytes());
            out.extend(20u16.to_le_bytes()); // version made by
            out.extend(entry.version.to_le_bytes());
            out.extend(entry.flags.to_le_bytes());
            out.extend(entry.method.to_le_bytes());
            out.extend(0u32.to_le_bytes()); // dos time
            out.extend(entry.crc.to_le_bytes());
            out.extend((entry.payload.len() as u32).to_le_bytes());
            out.extend(entry.uncompressed.to_le_bytes());
            out.extend((entry.name.len() as u16).to_le_bytes());
            out.extend((entry.central_extra.len() as u16).to_le_bytes());
            out.extend(0u16.to_le_bytes()); // comment len
            out.extend(0u16.to_le_bytes()); // disk start
            out.extend(0u16.to_le_bytes()); // internal attrs
            out.extend(0u32.to_le_bytes()); // external attrs
            out.extend(offset.to_le_bytes());
            out.extend(entry.name.as_bytes());
            out.extend(&entry.central_extra);
            cd_size += (out.len() - before) as u32;
        }

        if let Some(target) = self.zip64_locator_target {
            out.extend(ZIP64_LOCATOR_SIG.to_le_bytes());
            out.extend(0u32.to_le_bytes()); // disk with the zip64 EOCD
            out.extend(target.to_le_bytes());
            out.extend(1u32.to_le_bytes()); // total disks
        }

        let count = self.count_override.unwrap_or(self.entries.len() as u16);
        out.extend(EOCD_SIG.to_le_bytes());
        out.extend(self.disk_number.to_le_bytes());
        out.extend(0u16.to_le_bytes());
        out.extend(count.to_le_bytes());
        out.extend(count.to_le_bytes());
        out.extend(cd_size.to_le_bytes());
        out.extend(cd_offset.to_le_bytes());
        out.extend((self.comment.len() as u16).to_le_bytes());
        out.extend(&self.comment);
        out
    }
}

fn deflate(data: &[u8]) -> Vec<u8> {
    use std::io::Write;
    let mut encoder = flate2::write::DeflateEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

fn open_pak(bytes: Vec<u8>) -> perun_pak::Result<PakArchive> {
    PakArchive::from_bytes(bytes, "fixture.pak", OpenOptions::pak())
}

fn mismatch_field(err: Error) -> &'static str {
    match err {
        Error::LocalHeaderMismatch { field, .. } => field,
        other => panic!("expected LocalHeaderMismatch, got {other:?}"),
    }
}

#[test]
fn end_to_end_stored_entry() {
    let content = b"hello world";
    let crc = crc32fast::hash(content);
    assert_eq!(crc, 0x0D4A1185);

    let bytes = ArchiveBuilder::new()
        .entry(EntrySpec::stored("readme.txt", content))
        .build();
    let archive = open_pak(bytes).unwrap();

    let entry = archive.find("readme.txt").expect("entry by name");
    assert_eq!(entry.index(), 0);
    assert_eq!(entry.crc32(), 0x0D4A1185);
    assert_eq!(entry.uncompressed_size(), 11);

    let mut out = Vec::new();
    archive.open_stream(0).unwrap().read_to_end(&mut out).unwrap();
    assert_eq!(out, content);

    let mut errors = 0;
    let passed = archive.test_archive_with(true, TestStrategy::FindAllErrors, |status, msg| {
        if msg.is_some() {
            errors += 1;
        }
        assert_eq!(errors, status.error_count as usize);
    });
    assert!(passed);
    assert_eq!(errors, 0);
}

#[test]
fn crc_invariant_for_deflated_entry() {
    let content = b"compressible compressible compressible compressible";
    let bytes = ArchiveBuilder::new()
        .entry(EntrySpec::new(
            "doc.txt",
            8,
            deflate(content),
            content.len() as u32,
            crc32fast::hash(content),
        ))
        .build();
    let archive = open_pak(bytes).unwrap();

    assert_eq!(archive.read(0).unwrap(), content);
    assert!(archive.test_archive(true));
}

#[test]
fn find_is_case_sensitive_and_normalizes_separators() {
    let bytes = ArchiveBuilder::new()
        .entry(EntrySpec::stored(r"Data\Scripts\main.xml", b"<xml/>"))
        .build();
    let archive = open_pak(bytes).unwrap();

    assert!(archive.find("Data/Scripts/main.xml").is_some());
    assert!(archive.find(r"Data\Scripts\main.xml").is_some());
    assert!(archive.find("data/scripts/main.xml").is_none());
}

fn mutated_archive(patch_offset: usize, patch: impl FnOnce(&mut u8)) -> PakArchive {
    let mut bytes = ArchiveBuilder::new()
        .entry(EntrySpec::stored("victim.txt", b"cross checked content"))
        .build();
    patch(&mut bytes[patch_offset]);
    open_pak(bytes).unwrap()
}

// Local header layout for entry 0: flags at 6, method at 8, crc at 14,
// version at 4, name at 30.

#[test]
fn full_validate_reports_flag_mismatch() {
    let archive = mutated_archive(6, |b| *b = 0x02);
    let err = archive.validate_entry(0, HeaderTest::FullValidate).unwrap_err();
    assert_eq!(mismatch_field(err), "flags");
}

#[test]
fn full_validate_reports_method_mismatch() {
    let archive = mutated_archive(8, |b| *b = 8);
    let err = archive.validate_entry(0, HeaderTest::FullValidate).unwrap_err();
    assert_eq!(mismatch_field(err), "compression method");
}

#[test]
fn full_validate_reports_crc_mismatch() {
    let archive = mutated_archive(14, |b| *b ^= 0xFF);
    let err = archive.validate_entry(0, HeaderTest::FullValidate).unwrap_err();
    assert_eq!(mismatch_field(err), "crc");
}

#[test]
fn full_validate_reports_name_mismatch() {
    let archive = mutated_archive(30, |b| *b = b'X');
    let err = archive.validate_entry(0, HeaderTest::FullValidate).unwrap_err();
    assert_eq!(mismatch_field(err), "file name");
}

#[test]
fn full_validate_reports_version_mismatch() {
    let archive = mutated_archive(4, |b| *b = 10);
    let err = archive.validate_entry(0, HeaderTest::FullValidate).unwrap_err();
    assert_eq!(mismatch_field(err), "extract version");
}

#[test]
fn locate_only_skips_cross_checks() {
    let archive = mutated_archive(6, |b| *b = 0x02);
    assert!(archive.validate_entry(0, HeaderTest::LocateOnly).is_ok());
    assert!(archive.validate_entry(0, HeaderTest::FullValidate).is_err());
}

#[test]
fn zip64_info_missing_in_local_header() {
    let mut spec = EntrySpec::stored("big.bin", b"not actually big");
    spec.version = 45;
    spec.local_sizes = Some((u32::MAX, u32::MAX));
    let bytes = ArchiveBuilder::new().entry(spec).build();
    let archive = open_pak(bytes).unwrap();

    assert!(matches!(
        archive.validate_entry(0, HeaderTest::FullValidate),
        Err(Error::Zip64InfoMissing)
    ));
}

#[test]
fn full_validate_passes_on_clean_archive() {
    let bytes = ArchiveBuilder::new()
        .entry(EntrySpec::stored("clean.txt", b"nothing wrong here"))
        .build();
    let archive = open_pak(bytes).unwrap();
    assert!(archive.validate_entry(0, HeaderTest::FullValidate).is_ok());
}

#[test]
fn bad_local_signature_is_reported() {
    let archive = mutated_archive(0, |b| *b = b'Q');
    let err = archive.validate_entry(0, HeaderTest::FullValidate).unwrap_err();
    assert!(matches!(err, Error::BadLocalSignature { .. }));
}

#[test]
fn zip64_required_without_locator() {
    let bytes = ArchiveBuilder::new()
        .entry(EntrySpec::stored("tiny.txt", b"x"))
        .count_override(0xFFFF)
        .build();
    assert!(matches!(open_pak(bytes), Err(Error::Zip64Required)));
}

#[test]
fn zip64_locator_to_bad_record_is_a_distinct_error() {
    // The locator points at offset 0, where a local header sits instead of
    // a Zip64 EOCD record.
    let bytes = ArchiveBuilder::new()
        .entry(EntrySpec::stored("tiny.txt", b"x"))
        .count_override(0xFFFF)
        .zip64_locator(0)
        .build();
    match open_pak(bytes) {
        Err(Error::BadZip64Record { offset, actual }) => {
            assert_eq!(offset, 0);
            assert_eq!(actual, LOCAL_SIG);
        }
        other => panic!("expected BadZip64Record, got {other:?}"),
    }
}

#[test]
fn embedded_archive_offsets_are_corrected() {
    let content = b"embedded after a stub";
    let bytes = ArchiveBuilder::new()
        .prefix(&[0xEEu8; 64])
        .entry(EntrySpec::stored("inner.txt", content))
        .build();
    let archive = open_pak(bytes).unwrap();

    assert_eq!(archive.read(0).unwrap(), content);
    assert!(archive.test_archive(true));
}

#[test]
fn garbage_is_not_an_archive() {
    let bytes = vec![0x42u8; 4096];
    assert!(matches!(open_pak(bytes), Err(Error::NotAnArchive)));
}

#[test]
fn zipcrypto_entry_round_trip() {
    let content = b"secret stored payload";
    let crc = crc32fast::hash(content);
    let key = b"pak password bytes";
    // No descriptor bit, so the check byte is the high CRC byte.
    let payload = perun_pak::zipcrypto::encrypt_entry(key, (crc >> 24) as u8, content);

    let mut spec = EntrySpec::new("locked.txt", 0, payload, content.len() as u32, crc);
    spec.flags = 0x0001;
    let bytes = ArchiveBuilder::new().entry(spec).build();

    let archive =
        PakArchive::from_bytes(bytes.clone(), "fixture.pak", OpenOptions::pak().with_key(*key))
            .unwrap();
    assert_eq!(archive.read(0).unwrap(), content);
    assert!(archive.test_archive(true));

    // A wrong key fails the crypto header check for that entry only.
    let archive =
        PakArchive::from_bytes(bytes, "fixture.pak", OpenOptions::pak().with_key(*b"wrong key bytes  "))
            .unwrap();
    assert!(matches!(
        archive.read(0),
        Err(Error::UnableToDecrypt(_))
    ));
}

#[test]
fn p4k_aes_marked_entry_is_decrypted_and_trimmed() {
    use aes::cipher::generic_array::GenericArray;
    use aes::cipher::{BlockEncryptMut, KeyIvInit};

    let content = b"<CryXmlB>vehicle definition</CryXmlB>!";
    assert_ne!(content.len() % 16, 0);

    let mut padded = content.to_vec();
    while padded.len() % 16 != 0 {
        padded.push(0);
    }
    let len = padded.len();
    cbc::Encryptor::<aes::Aes128>::new(
        GenericArray::from_slice(&perun_pak::crypto::DEFAULT_P4K_KEY),
        GenericArray::from_slice(&[0u8; 16]),
    )
    .encrypt_padded_mut::<aes::cipher::block_padding::NoPadding>(&mut padded, len)
    .unwrap();

    let mut spec = EntrySpec::new(
        "Data/enc.xml",
        0,
        padded.clone(),
        padded.len() as u32,
        crc32fast::hash(content),
    );
    // Marker byte at the fixed extra-field offset.
    let mut extra = vec![0u8; 170];
    extra[168] = 1;
    spec.central_extra = extra;

    let bytes = ArchiveBuilder::new().entry(spec).build();
    let archive = PakArchive::from_bytes(bytes, "fixture.p4k", OpenOptions::p4k()).unwrap();

    let entry = archive.get(0).unwrap();
    assert!(entry.is_aes_crypted());
    assert_eq!(archive.read(0).unwrap(), content);

    // AES-keyed entries sit outside the CRC trust boundary but still pass.
    assert!(archive.test_archive(true));
}

#[test]
fn p4k_bzip2_entry_round_trip() {
    let content = b"bzip2 compressed entry content, repeated repeated repeated";
    let mut compressed = Vec::new();
    bzip2::read::BzEncoder::new(&content[..], bzip2::Compression::default())
        .read_to_end(&mut compressed)
        .unwrap();

    let bytes = ArchiveBuilder::new()
        .entry(EntrySpec::new(
            "blob.bz2",
            12,
            compressed,
            content.len() as u32,
            crc32fast::hash(content),
        ))
        .build();
    let archive = PakArchive::from_bytes(bytes, "fixture.p4k", OpenOptions::p4k()).unwrap();
    assert_eq!(archive.read(0).unwrap(), content);
    assert!(archive.test_archive(true));
}

#[test]
fn data_descriptor_is_cross_checked() {
    let content = b"descriptor guarded content";
    let crc = crc32fast::hash(content);

    let mut descriptor = Vec::new();
    descriptor.extend(DESCRIPTOR_SIG.to_le_bytes());
    descriptor.extend(crc.to_le_bytes());
    descriptor.extend((content.len() as u32).to_le_bytes());
    descriptor.extend((content.len() as u32).to_le_bytes());

    let mut spec = EntrySpec::stored("logged.txt", content);
    spec.flags = 0x0008;
    spec.local_crc = Some(0);
    spec.local_sizes = Some((0, 0));
    spec.descriptor = descriptor;

    let bytes = ArchiveBuilder::new().entry(spec.clone()).build();
    let archive = open_pak(bytes).unwrap();
    assert!(archive.test_archive(true));

    // Corrupting the descriptor CRC is caught by the data test.
    let mut spec = spec;
    spec.descriptor[4] ^= 0xFF;
    let bytes = ArchiveBuilder::new().entry(spec).build();
    let archive = open_pak(bytes).unwrap();

    let mut messages = Vec::new();
    let passed = archive.test_archive_with(true, TestStrategy::FindAllErrors, |_, msg| {
        if let Some(msg) = msg {
            messages.push(msg.to_string());
        }
    });
    assert!(!passed);
    assert!(messages.iter().any(|m| m.contains("Descriptor CRC mismatch")));
}

#[test]
fn stale_entry_index_falls_back_to_name_lookup() {
    let a = ArchiveBuilder::new()
        .entry(EntrySpec::stored("first.txt", b"first"))
        .entry(EntrySpec::stored("shared.txt", b"from archive a"))
        .build();
    let b = ArchiveBuilder::new()
        .entry(EntrySpec::stored("shared.txt", b"from archive b"))
        .build();

    let archive_a = open_pak(a).unwrap();
    let archive_b = open_pak(b).unwrap();

    // An entry value taken from B carries a stale index for A.
    let foreign = archive_b.get(0).unwrap().clone();
    assert_eq!(foreign.index(), 0);

    let mut out = Vec::new();
    archive_a
        .stream_by_entry(&foreign)
        .unwrap()
        .read_to_end(&mut out)
        .unwrap();
    assert_eq!(out, b"from archive a");
}

#[test]
fn unsupported_method_is_scoped_to_one_entry() {
    let good = b"still readable";
    let bytes = ArchiveBuilder::new()
        .entry(EntrySpec::new("weird.bin", 99, b"????".to_vec(), 4, 0))
        .entry(EntrySpec::stored("ok.txt", good))
        .build();
    let archive = open_pak(bytes).unwrap();

    assert!(matches!(
        archive.open_stream(0),
        Err(Error::UnsupportedMethod(99))
    ));
    assert_eq!(archive.read(1).unwrap(), good);
}

#[test]
fn directory_entries_validate() {
    let bytes = ArchiveBuilder::new()
        .entry(EntrySpec::new("Data/Objects/", 0, Vec::new(), 0, 0))
        .entry(EntrySpec::stored("Data/Objects/a.txt", b"leaf"))
        .build();
    let archive = open_pak(bytes).unwrap();

    assert!(archive.get(0).unwrap().is_dir());
    assert!(archive.test_archive(true));
}
