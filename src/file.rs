//! Memory-mapped file source.

use {
    crate::source::MemorySource,
    memmap2::{Mmap, MmapOptions},
    std::{
        fs::File,
        io,
        path::{Path, PathBuf},
    },
};

#[derive(Debug, thiserror::Error)]
pub enum FileError {
    #[error("failed to open {path:?}: {source}")]
    Open { path: PathBuf, source: io::Error },
    #[error("failed to stat {path:?}: {source}")]
    Stat { path: PathBuf, source: io::Error },
    #[error("offset {offset:#x} is at or past the end of {path:?} ({size} bytes)")]
    OffsetPastEnd { path: PathBuf, offset: u64, size: u64 },
    #[error("failed to map {path:?}: {source}")]
    Mmap { path: PathBuf, source: io::Error },
}

/// Reads from a read-only mapping of a file window.
///
/// Logical address 0 corresponds to the byte at file offset `offset`,
/// which does not have to be page-aligned: the mapping starts at the
/// containing page and the exposed window is shifted into it. The file
/// descriptor is closed as soon as the mapping exists; the mapping keeps
/// the pages alive and is released exactly on drop.
pub struct FileReader {
    map: Mmap,
}

impl FileReader {
    /// Map the window of `path` starting at byte `offset`, exposing at
    /// most `max_size` bytes (clamped to the end of the file).
    pub fn new(path: &Path, offset: u64, max_size: u64) -> Result<Self, FileError> {
        let err_path = || path.to_path_buf();

        let file = loop {
            match File::open(path) {
                Ok(file) => break file,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(source) => return Err(FileError::Open { path: err_path(), source }),
            }
        };

        let size = file
            .metadata()
            .map_err(|source| FileError::Stat { path: err_path(), source })?
            .len();
        if offset >= size {
            return Err(FileError::OffsetPastEnd { path: err_path(), offset, size });
        }

        let len = max_size.min(size - offset) as usize;
        // SAFETY: the mapping is private and read-only; concurrent
        // truncation of the underlying file is the caller's hazard, the
        // same one every mapped read of a foreign file carries.
        let map = unsafe { MmapOptions::new().offset(offset).len(len).map(&file) }
            .map_err(|source| FileError::Mmap { path: err_path(), source })?;

        Ok(Self { map })
    }

    /// Map from `offset` to the end of the file.
    #[inline]
    pub fn open(path: &Path, offset: u64) -> Result<Self, FileError> {
        Self::new(path, offset, u64::MAX)
    }

    /// Number of bytes exposed by the window.
    #[inline]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl MemorySource for FileReader {
    fn read(&self, addr: u64, dst: &mut [u8]) -> usize {
        let Ok(offset) = usize::try_from(addr) else {
            return 0;
        };
        if offset >= self.map.len() {
            return 0;
        }

        let len = dst.len().min(self.map.len() - offset);
        dst[..len].copy_from_slice(&self.map[offset..offset + len]);
        len
    }
}
