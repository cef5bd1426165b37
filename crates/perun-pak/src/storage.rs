//! Backing storage for an open archive.
//!
//! Entry streams and the local-header validator perform positioned reads
//! against a single shared resource. For the file-handle variant the seek
//! position is shared mutable state: the mutex is scoped around the
//! seek+read pair so interleaved readers cannot corrupt each other's
//! position. The mmap and memory variants have no cursor and need no lock.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::sync::Mutex;

use memmap2::Mmap;

use crate::{Error, Result};

pub(crate) enum Backing {
    /// Memory-mapped file, zero-copy positioned reads.
    Mmap(Mmap),
    /// Plain file handle; reads serialize on the lock.
    File { file: Mutex<File>, len: u64 },
    /// Owned in-memory archive image.
    Memory(Vec<u8>),
}

impl Backing {
    pub(crate) fn from_file_mmap(file: &File) -> Result<Self> {
        let mmap = unsafe { Mmap::map(file)? };
        Ok(Backing::Mmap(mmap))
    }

    pub(crate) fn from_file(file: File) -> Result<Self> {
        let len = file.metadata()?.len();
        Ok(Backing::File {
            file: Mutex::new(file),
            len,
        })
    }

    pub(crate) fn from_bytes(data: Vec<u8>) -> Self {
        Backing::Memory(data)
    }

    pub(crate) fn len(&self) -> u64 {
        match self {
            Backing::Mmap(map) => map.len() as u64,
            Backing::File { len, .. } => *len,
            Backing::Memory(data) => data.len() as u64,
        }
    }

    /// Read exactly `buf.len()` bytes starting at `offset`.
    pub(crate) fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        match self {
            Backing::Mmap(map) => copy_from_slice(map, offset, buf),
            Backing::Memory(data) => copy_from_slice(data, offset, buf),
            Backing::File { file, .. } => {
                let mut file = file.lock().map_err(|_| {
                    Error::Io(std::io::Error::other("archive storage lock poisoned"))
                })?;
                file.seek(SeekFrom::Start(offset))?;
                file.read_exact(buf)?;
                Ok(())
            }
        }
    }

    /// Read up to `buf.len()` bytes starting at `offset`, returning the
    /// number of bytes read (0 at end of storage).
    pub(crate) fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let len = self.len();
        if offset >= len {
            return Ok(0);
        }
        let avail = (len - offset).min(buf.len() as u64) as usize;
        self.read_exact_at(offset, &mut buf[..avail])?;
        Ok(avail)
    }

    /// Read a fresh buffer of `count` bytes starting at `offset`.
    pub(crate) fn read_vec_at(&self, offset: u64, count: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; count];
        self.read_exact_at(offset, &mut buf)?;
        Ok(buf)
    }
}

fn copy_from_slice(data: &[u8], offset: u64, buf: &mut [u8]) -> Result<()> {
    let start = usize::try_from(offset)
        .map_err(|_| Error::Io(std::io::Error::from(std::io::ErrorKind::UnexpectedEof)))?;
    let end = start.checked_add(buf.len());
    match end {
        Some(end) if end <= data.len() => {
            buf.copy_from_slice(&data[start..end]);
            Ok(())
        }
        _ => Err(Error::Io(std::io::Error::from(
            std::io::ErrorKind::UnexpectedEof,
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_reads() {
        let backing = Backing::from_bytes(vec![1, 2, 3, 4, 5]);
        assert_eq!(backing.len(), 5);

        let mut buf = [0u8; 3];
        backing.read_exact_at(1, &mut buf).unwrap();
        assert_eq!(buf, [2, 3, 4]);

        assert!(backing.read_exact_at(3, &mut buf).is_err());
        assert_eq!(backing.read_at(3, &mut buf).unwrap(), 2);
        assert_eq!(backing.read_at(5, &mut buf).unwrap(), 0);
    }
}
