//! Whole-archive integrity testing.
//!
//! Sequential single pass over the directory: every entry's local header
//! is cross-validated, and optionally its data is fully decoded while a
//! CRC-32 accumulates. Discrepancies surface through the progress handler
//! with a human-readable reason; the strategy decides whether the first
//! error stops the run.

use std::io::Read;

use perun_common::crc::Hasher;
use perun_common::BinaryReader;

use crate::archive::PakArchive;
use crate::entry::PakEntry;
use crate::local_header::HeaderTest;
use crate::zip::DATA_DESCRIPTOR_SIGNATURE;
use crate::{Error, Result};

/// The test strategy to apply during an archive test.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestStrategy {
    /// Stop on the first error found.
    FindFirstError,
    /// Visit every entry regardless of errors.
    FindAllErrors,
}

/// The operation in progress during an archive test.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestOperation {
    /// Setting up the test.
    Initialising,
    /// Testing an entry's local header against the central directory.
    EntryHeader,
    /// Decoding and checksumming an entry's data.
    EntryData,
    /// Finished one entry.
    EntryComplete,
    /// Tests not tied to one entry.
    MiscellaneousTests,
    /// The test run is finished.
    Complete,
}

/// Status snapshot passed to the progress handler.
pub struct TestStatus<'a> {
    /// The entry under test, if any.
    pub entry: Option<&'a PakEntry>,
    /// The operation in progress.
    pub operation: TestOperation,
    /// Bytes of entry data tested so far for the current entry.
    pub bytes_tested: u64,
    /// Errors found so far.
    pub error_count: u32,
}

struct DescriptorData {
    crc: u32,
    compressed_size: u64,
    size: u64,
}

impl PakArchive {
    /// Test the archive for integrity, stopping at the first error.
    ///
    /// When `test_data` is set, each entry is fully decoded and its CRC
    /// checked in addition to the header cross-checks.
    pub fn test_archive(&self, test_data: bool) -> bool {
        self.test_archive_with(test_data, TestStrategy::FindFirstError, |_, _| {})
    }

    /// Test the archive with an explicit strategy and progress handler.
    ///
    /// The handler receives a status snapshot at each phase transition and
    /// a reason string for every discrepancy. Returns true when no errors
    /// were found.
    pub fn test_archive_with<F>(
        &self,
        test_data: bool,
        strategy: TestStrategy,
        mut handler: F,
    ) -> bool
    where
        F: FnMut(&TestStatus<'_>, Option<&str>),
    {
        let mut status = TestStatus {
            entry: None,
            operation: TestOperation::Initialising,
            bytes_tested: 0,
            error_count: 0,
        };
        handler(&status, None);

        let mut testing = true;
        let mut index = 0;
        while testing && index < self.entries().len() {
            let entry = &self.entries()[index];
            status.entry = Some(entry);
            status.bytes_tested = 0;
            status.operation = TestOperation::EntryHeader;
            handler(&status, None);

            if let Err(err) = self.locate_entry(entry, HeaderTest::FullValidate) {
                status.error_count += 1;
                let reason = format!("exception during test - '{err}'");
                handler(&status, Some(reason.as_str()));
                testing &= strategy != TestStrategy::FindFirstError;
            }

            if testing && test_data && entry.is_file() {
                // AES-keyed entries sit outside the CRC trust boundary.
                let check_crc = !entry.is_aes_crypted();

                status.operation = TestOperation::EntryData;
                handler(&status, None);

                match self.open_stream(index) {
                    Ok(mut stream) => {
                        let mut crc = Hasher::new();
                        let mut buffer = [0u8; 4096];
                        let mut total = 0u64;
                        loop {
                            match stream.read(&mut buffer) {
                                Ok(0) => break,
                                Ok(n) => {
                                    if check_crc {
                                        crc.update(&buffer[..n]);
                                    }
                                    total += n as u64;
                                    status.bytes_tested = total;
                                    handler(&status, None);
                                }
                                Err(err) => {
                                    status.error_count += 1;
                                    let reason = format!("exception during test - '{err}'");
                                    handler(&status, Some(reason.as_str()));
                                    testing &= strategy != TestStrategy::FindFirstError;
                                    break;
                                }
                            }
                        }

                        if check_crc && entry.crc32() != crc.finalize() {
                            status.error_count += 1;
                            handler(&status, Some("CRC mismatch"));
                            testing &= strategy != TestStrategy::FindFirstError;
                        }

                        if entry.uses_descriptor() {
                            match self.read_descriptor(entry) {
                                Ok(descriptor) => {
                                    if check_crc && entry.crc32() != descriptor.crc {
                                        status.error_count += 1;
                                        handler(&status, Some("Descriptor CRC mismatch"));
                                    }
                                    if entry.compressed_size() != descriptor.compressed_size {
                                        status.error_count += 1;
                                        handler(
                                            &status,
                                            Some("Descriptor compressed size mismatch"),
                                        );
                                    }
                                    if entry.uncompressed_size() != descriptor.size {
                                        status.error_count += 1;
                                        handler(&status, Some("Descriptor size mismatch"));
                                    }
                                }
                                Err(err) => {
                                    status.error_count += 1;
                                    let reason = format!("exception during test - '{err}'");
                                    handler(&status, Some(reason.as_str()));
                                }
                            }
                        }
                    }
                    Err(err) => {
                        status.error_count += 1;
                        let reason = format!("exception during test - '{err}'");
                        handler(&status, Some(reason.as_str()));
                        testing &= strategy != TestStrategy::FindFirstError;
                    }
                }
            }

            status.operation = TestOperation::EntryComplete;
            handler(&status, None);
            index += 1;
        }

        status.entry = None;
        status.operation = TestOperation::MiscellaneousTests;
        handler(&status, None);

        status.operation = TestOperation::Complete;
        handler(&status, None);

        status.error_count == 0
    }

    /// Read and parse the data descriptor trailing an entry's data.
    fn read_descriptor(&self, entry: &PakEntry) -> Result<DescriptorData> {
        let data_start = self.locate_entry(entry, HeaderTest::LocateOnly)?;
        let offset = data_start + entry.compressed_size();
        let zip64 = entry.local_header_requires_zip64();
        let record_len = if zip64 { 4 + 4 + 8 + 8 } else { 4 + 4 + 4 + 4 };

        let bytes = self.backing().read_vec_at(offset, record_len)?;
        let mut reader = BinaryReader::new(&bytes);
        let signature = reader.read_u32()?;
        if signature != DATA_DESCRIPTOR_SIGNATURE {
            return Err(Error::LocalHeaderMismatch {
                field: "data descriptor",
                detail: format!("signature not found at {offset:#x}"),
            });
        }
        let crc = reader.read_u32()?;
        let (compressed_size, size) = if zip64 {
            (reader.read_u64()?, reader.read_u64()?)
        } else {
            (reader.read_u32()? as u64, reader.read_u32()? as u64)
        };
        Ok(DescriptorData {
            crc,
            compressed_size,
            size,
        })
    }
}
