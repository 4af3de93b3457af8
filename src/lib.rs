//! Uniform byte-level memory access for stack unwinding.
//!
//! Register unwinders, DWARF evaluators, and symbol readers all need to
//! read bytes at arbitrary addresses without caring where the bytes come
//! from. This crate puts every backing store behind one contract,
//! [`MemorySource`]: the current process, a traced remote process, a
//! memory-mapped file window, an in-RAM buffer, offline snapshot files,
//! and rebased or cached views composed over any of those.
//!
//! The single primitive is a best-effort `read` that reports how many
//! bytes it moved; a short count is the only failure signal a read has.
//! Construction failures are real errors, reads are not.
//!
//! ```no_run
//! use unwind_mem::MemorySource;
//!
//! let mem = unwind_mem::process_memory_cached(1234);
//! let mut frame = [0u8; 8];
//! if mem.read_fully(0x7fff_5000_1000, &mut frame) {
//!     let return_addr = u64::from_ne_bytes(frame);
//! }
//! ```

pub mod buffer;
pub mod cache;
pub mod file;
pub mod offline;
pub mod range;
pub mod source;

#[cfg(any(target_os = "linux", target_os = "android"))]
pub mod local;
#[cfg(any(target_os = "linux", target_os = "android"))]
pub mod remote;

pub use crate::{
    buffer::BufferReader,
    cache::{CachedReader, ThreadCachedReader},
    file::{FileError, FileReader},
    offline::{OfflineBuffer, OfflineError, OfflinePartsReader, OfflineReader},
    range::{RangeReader, RangesReader},
    source::MemorySource,
};

#[cfg(any(target_os = "linux", target_os = "android"))]
pub use crate::{local::LocalReader, remote::RemoteReader};

use std::{path::Path, sync::Arc};

/// A reader over the window of `path` starting at byte `offset`, up to
/// `max_size` bytes.
pub fn file_memory(
    path: &Path,
    offset: u64,
    max_size: u64,
) -> Result<Arc<dyn MemorySource>, FileError> {
    Ok(Arc::new(FileReader::new(path, offset, max_size)?))
}

/// A reader over an in-memory capture exposed at `[start, end)`.
pub fn offline_buffer(data: &[u8], start: u64, end: u64) -> Arc<dyn MemorySource> {
    Arc::new(OfflineBuffer::new(data.to_vec(), start, end))
}

/// A reader over the address space of `pid`: direct reads for our own
/// process, syscall-backed reads for any other.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub fn process_memory(pid: libc::pid_t) -> Arc<dyn MemorySource> {
    if pid == nix::unistd::getpid().as_raw() {
        Arc::new(LocalReader::new())
    } else {
        Arc::new(RemoteReader::new(pid))
    }
}

/// [`process_memory`] behind a process-wide page cache.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub fn process_memory_cached(pid: libc::pid_t) -> Arc<dyn MemorySource> {
    Arc::new(CachedReader::new(process_memory(pid)))
}

/// [`process_memory`] behind a per-thread page cache.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub fn process_memory_thread_cached(pid: libc::pid_t) -> Arc<dyn MemorySource> {
    Arc::new(ThreadCachedReader::new(process_memory(pid)))
}
