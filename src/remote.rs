//! Reading another process's address space.

use {
    crate::source::MemorySource,
    nix::{sys::uio, unistd::Pid},
    std::{io::IoSliceMut, sync::OnceLock},
    tracing::debug,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Strategy {
    /// Uses [`process_vm_readv`](https://man7.org/linux/man-pages/man2/process_vm_readv.2.html)
    /// to read the memory.
    ///
    /// Fast (one syscall moves many pages), but may be denied outright by
    /// seccomp policies even when ptrace would be allowed
    VirtualMem,
    /// Reads the memory with [ptrace (`PTRACE_PEEKTEXT`)](https://man7.org/linux/man-pages/man2/ptrace.2.html)
    ///
    /// One word per syscall, so slow, but works anywhere the process can
    /// be ptraced
    Ptrace,
}

/// Reads a traced process's memory, probing for a usable mechanism on
/// first access.
///
/// The first mechanism that moves at least one byte is kept for every
/// later read; a first access where neither works leaves the slot empty
/// and the next read probes again.
pub struct RemoteReader {
    /// The pid of the process to read
    pid: Pid,
    strategy: OnceLock<Strategy>,
}

impl std::fmt::Debug for RemoteReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self.strategy.get() {
            Some(Strategy::VirtualMem) => "process_vm_readv",
            Some(Strategy::Ptrace) => "PTRACE_PEEKTEXT",
            None => "unprobed",
        };
        write!(f, "RemoteReader(pid {}, {s})", self.pid)
    }
}

impl RemoteReader {
    #[inline]
    pub fn new(pid: libc::pid_t) -> Self {
        Self {
            pid: Pid::from_raw(pid),
            strategy: OnceLock::new(),
        }
    }

    #[inline]
    pub fn pid(&self) -> libc::pid_t {
        self.pid.as_raw()
    }
}

impl MemorySource for RemoteReader {
    fn read(&self, addr: u64, dst: &mut [u8]) -> usize {
        // Cannot read an address greater than 32 bits in a 32 bit context.
        if cfg!(not(target_pointer_width = "64")) && addr > u64::from(u32::MAX) {
            return 0;
        }

        match self.strategy.get() {
            Some(Strategy::VirtualMem) => vm_read(self.pid, addr, dst),
            Some(Strategy::Ptrace) => ptrace_read(self.pid, addr, dst),
            None => {
                // Attempt in order of speed. If the vectored read works
                // once it will keep working for this process. Redundant
                // stores from concurrent first readers pick the same
                // value, so losing the race is harmless.
                let bytes = vm_read(self.pid, addr, dst);
                if bytes > 0 {
                    let _ = self.strategy.set(Strategy::VirtualMem);
                    return bytes;
                }
                let bytes = ptrace_read(self.pid, addr, dst);
                if bytes > 0 {
                    debug!(
                        "pid {}: process_vm_readv moved nothing, latching PTRACE_PEEKTEXT",
                        self.pid
                    );
                    let _ = self.strategy.set(Strategy::Ptrace);
                }
                bytes
            }
        }
    }
}

/// Iovec elements per `process_vm_readv` call.
const MAX_IOVECS: usize = 64;

/// Vectored read of `dst.len()` bytes at `addr` in `pid`.
///
/// The remote side is sliced so no iovec crosses an OS page: the kernel
/// only does partial transfers at iovec granularity, and a per-page iovec
/// confines an unreadable page to its own element instead of sinking the
/// whole request.
pub(crate) fn vm_read(pid: Pid, addr: u64, dst: &mut [u8]) -> usize {
    let page = page_size();
    let mut cur = addr;
    let mut remaining = dst.len();
    let mut total = 0;

    while remaining > 0 {
        let mut src_iovs = Vec::with_capacity(MAX_IOVECS);
        let mut batch = 0;
        while remaining > 0 && src_iovs.len() < MAX_IOVECS {
            // iovec bases are pointers; past this point the address space
            // cannot represent the cursor.
            if cur >= usize::MAX as u64 {
                return total;
            }
            let misalignment = cur as usize & (page - 1);
            let len = (page - misalignment).min(remaining);
            src_iovs.push(uio::RemoteIoVec { base: cur as usize, len });
            remaining -= len;
            batch += len;
            cur = match cur.checked_add(len as u64) {
                Some(next) => next,
                None => return total,
            };
        }

        let rc = match uio::process_vm_readv(
            pid,
            &mut [IoSliceMut::new(&mut dst[total..])],
            &src_iovs,
        ) {
            Ok(rc) => rc,
            Err(_) => return total,
        };
        total += rc;
        if rc < batch {
            // The transfer stopped at an unreadable page; anything a
            // further batch returned would land after a hole.
            return total;
        }
    }
    total
}

/// Word-at-a-time ptrace read of `dst.len()` bytes at `addr` in `pid`.
///
/// `nix::sys::ptrace::read` disambiguates a legitimate `-1` word from a
/// failure via errno, so a word either arrives intact or stops the walk.
pub(crate) fn ptrace_read(pid: Pid, addr: u64, dst: &mut [u8]) -> usize {
    const WORD: usize = std::mem::size_of::<usize>();

    if addr.checked_add(dst.len() as u64).is_none() {
        return 0;
    }

    let mut addr = addr;
    let mut read = 0;

    // A misaligned start still has to issue an aligned peek; take the
    // tail bytes of the word that covers `addr`.
    let misalign = (addr & (WORD as u64 - 1)) as usize;
    if misalign != 0 {
        let aligned = addr & !(WORD as u64 - 1);
        let Ok(word) = nix::sys::ptrace::read(pid, aligned as usize as *mut std::ffi::c_void)
        else {
            return 0;
        };
        let take = (WORD - misalign).min(dst.len());
        dst[..take].copy_from_slice(&word.to_ne_bytes()[misalign..misalign + take]);
        addr += take as u64;
        read += take;
    }

    let mut chunks = dst[read..].chunks_exact_mut(WORD);
    for chunk in chunks.by_ref() {
        match nix::sys::ptrace::read(pid, addr as usize as *mut std::ffi::c_void) {
            Ok(word) => chunk.copy_from_slice(&word.to_ne_bytes()),
            Err(_) => return read,
        }
        addr += WORD as u64;
        read += WORD;
    }

    let last = chunks.into_remainder();
    if !last.is_empty() {
        match nix::sys::ptrace::read(pid, addr as usize as *mut std::ffi::c_void) {
            Ok(word) => last.copy_from_slice(&word.to_ne_bytes()[..last.len()]),
            Err(_) => return read,
        }
        read += last.len();
    }

    read
}

#[inline]
pub(crate) fn page_size() -> usize {
    // SAFETY: plain constant lookup with no preconditions
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}
