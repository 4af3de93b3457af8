//! Offline memory snapshots.
//!
//! A snapshot file records the base address of the captured region in its
//! first 8 bytes (host byte order), followed by the raw bytes: the byte
//! at file offset `8 + k` is exposed at address `start + k`.

use {
    crate::{
        file::{FileError, FileReader},
        range::RangeReader,
        source::MemorySource,
    },
    std::{
        path::{Path, PathBuf},
        sync::Arc,
    },
};

#[derive(Debug, thiserror::Error)]
pub enum OfflineError {
    #[error(transparent)]
    File(#[from] FileError),
    #[error("snapshot {path:?} is too short for its base-address header")]
    TruncatedHeader { path: PathBuf },
}

/// Reads a memory snapshot file at the addresses it was captured from.
pub struct OfflineReader {
    inner: RangeReader,
}

impl OfflineReader {
    pub fn new(path: &Path, offset: u64) -> Result<Self, OfflineError> {
        let file = Arc::new(FileReader::open(path, offset)?);

        let mut header = [0u8; 8];
        if !file.read_fully(0, &mut header) {
            return Err(OfflineError::TruncatedHeader { path: path.to_path_buf() });
        }
        let start = u64::from_ne_bytes(header);

        let length = (file.len() as u64)
            .checked_sub(header.len() as u64)
            .ok_or_else(|| OfflineError::TruncatedHeader { path: path.to_path_buf() })?;

        Ok(Self {
            inner: RangeReader::new(file, header.len() as u64, length, start),
        })
    }
}

impl MemorySource for OfflineReader {
    #[inline]
    fn read(&self, addr: u64, dst: &mut [u8]) -> usize {
        self.inner.read(addr, dst)
    }
}

/// An in-memory capture with an explicit base: exposes `[start, end)`.
pub struct OfflineBuffer {
    data: Vec<u8>,
    start: u64,
    end: u64,
}

impl OfflineBuffer {
    pub fn new(data: Vec<u8>, start: u64, end: u64) -> Self {
        Self { data, start, end }
    }

    /// Swap in a different capture.
    pub fn reset(&mut self, data: Vec<u8>, start: u64, end: u64) {
        self.data = data;
        self.start = start;
        self.end = end;
    }
}

impl MemorySource for OfflineBuffer {
    fn read(&self, addr: u64, dst: &mut [u8]) -> usize {
        if addr < self.start || addr >= self.end {
            return 0;
        }

        let rel = (addr - self.start) as usize;
        if rel >= self.data.len() {
            return 0;
        }
        let len = dst
            .len()
            .min((self.end - addr) as usize)
            .min(self.data.len() - rel);
        dst[..len].copy_from_slice(&self.data[rel..rel + len]);
        len
    }
}

/// An ordered collection of snapshots probed first-to-last.
///
/// The first part that returns bytes wins, and its result is returned as
/// is. A read straddling two parts gets only the first part's
/// contribution; the caller reissues at the boundary.
#[derive(Default)]
pub struct OfflinePartsReader {
    parts: Vec<OfflineReader>,
}

impl OfflinePartsReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, part: OfflineReader) {
        self.parts.push(part);
    }
}

impl MemorySource for OfflinePartsReader {
    fn read(&self, addr: u64, dst: &mut [u8]) -> usize {
        for part in &self.parts {
            let bytes = part.read(addr, dst);
            if bytes != 0 {
                return bytes;
            }
        }
        0
    }
}
