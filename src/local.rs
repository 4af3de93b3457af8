//! Reading the current process's address space.

use {
    crate::{remote::vm_read, source::MemorySource},
    nix::unistd::getpid,
};

/// Reads this process's own memory.
///
/// Prefers `process_vm_readv` on the current pid; if the syscall moves
/// nothing for a non-empty request (sandboxed out, for instance), falls
/// back to copying through the address directly. The fallback is tried on
/// every call, there is no latch: the caller may legitimately probe
/// addresses that only one of the two paths can serve.
#[derive(Debug, Default)]
pub struct LocalReader;

impl LocalReader {
    #[inline]
    pub fn new() -> Self {
        Self
    }
}

impl MemorySource for LocalReader {
    fn read(&self, addr: u64, dst: &mut [u8]) -> usize {
        let bytes = vm_read(getpid(), addr, dst);
        if bytes == 0 && !dst.is_empty() {
            let Ok(src) = usize::try_from(addr) else {
                return 0;
            };
            // SAFETY: the address is in our own address space and the
            // destination is exclusively borrowed; an unmapped source
            // faults here the same way the caller's own load from it
            // would.
            unsafe {
                std::ptr::copy_nonoverlapping(src as *const u8, dst.as_mut_ptr(), dst.len());
            }
            return dst.len();
        }
        bytes
    }
}
