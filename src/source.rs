//! The polymorphic read contract every backing store implements.

/// A byte source indexed by 64-bit address.
///
/// The single primitive is [`read`](Self::read), which transfers as many
/// bytes as are available at `addr` and reports the count. A return of 0
/// means "no bytes available at this address" — end of range, unreadable
/// page, or the target is gone. There is no error channel; callers decide
/// what a short transfer means for them.
pub trait MemorySource: Send + Sync {
    /// Read up to `dst.len()` bytes at `addr` into `dst`.
    ///
    /// Returns the number of bytes actually transferred (`0..=dst.len()`).
    /// Bytes of `dst` beyond the returned prefix are left unspecified,
    /// but nothing past `dst.len()` is ever written.
    fn read(&self, addr: u64, dst: &mut [u8]) -> usize;

    /// Read exactly `dst.len()` bytes at `addr`, or report failure.
    #[inline]
    fn read_fully(&self, addr: u64, dst: &mut [u8]) -> bool {
        self.read(addr, dst) == dst.len()
    }

    /// Read a NUL-terminated byte string starting at `addr` into `dst`,
    /// scanning at most `max_read` bytes.
    ///
    /// The terminator is not included in `dst`. Returns `false` if no
    /// terminator is found within `max_read` bytes or the source stops
    /// yielding bytes before one is seen.
    fn read_string(&self, addr: u64, dst: &mut Vec<u8>, max_read: usize) -> bool {
        // Large enough for the overwhelming majority of symbol names, so
        // the common case does a single read and a single allocation of
        // the exact length.
        let mut buffer = [0u8; 256];
        let mut offset = 0;
        while offset < max_read {
            let Some(block_addr) = addr.checked_add(offset as u64) else {
                return false;
            };
            let block = buffer.len().min(max_read - offset);
            let size = self.read(block_addr, &mut buffer[..block]);
            if size == 0 {
                // No terminator yet and no more data to scan.
                return false;
            }
            if let Some(len) = buffer[..size].iter().position(|&b| b == 0) {
                if offset == 0 {
                    dst.clear();
                    dst.extend_from_slice(&buffer[..len]);
                    return true;
                }
                // The scratch only holds the last block. Now that the
                // exact length is known, re-read the whole string in one
                // pass rather than stitching blocks together.
                dst.clear();
                dst.resize(offset + len, 0);
                return self.read_fully(addr, dst);
            }
            offset += size;
        }
        false
    }

    /// Read a native-endian `u32` at `addr`.
    #[inline]
    fn read_u32(&self, addr: u64) -> Option<u32> {
        let mut bytes = [0u8; 4];
        self.read_fully(addr, &mut bytes).then(|| u32::from_ne_bytes(bytes))
    }

    /// Read a native-endian `u64` at `addr`.
    #[inline]
    fn read_u64(&self, addr: u64) -> Option<u64> {
        let mut bytes = [0u8; 8];
        self.read_fully(addr, &mut bytes).then(|| u64::from_ne_bytes(bytes))
    }
}

#[cfg(test)]
mod tests {
    use {super::*, crate::buffer::BufferReader};

    #[test]
    fn read_fully_is_all_or_nothing() {
        let mem = BufferReader::new(vec![1, 2, 3, 4]);
        let mut dst = [0u8; 4];
        assert!(mem.read_fully(0, &mut dst));
        assert_eq!(dst, [1, 2, 3, 4]);

        let mut dst = [0u8; 4];
        assert!(!mem.read_fully(2, &mut dst));
    }

    #[test]
    fn read_string_short() {
        let mem = BufferReader::new(b"abc\0xyz".to_vec());
        let mut out = Vec::new();
        assert!(mem.read_string(0, &mut out, 16));
        assert_eq!(out, b"abc");
    }

    #[test]
    fn read_string_at_offset() {
        let mem = BufferReader::new(b"abc\0xyz\0".to_vec());
        let mut out = Vec::new();
        assert!(mem.read_string(4, &mut out, 16));
        assert_eq!(out, b"xyz");
    }

    #[test]
    fn read_string_longer_than_scratch() {
        // Terminator beyond the 256-byte scratch forces the exact-length
        // second pass.
        let mut data = vec![b'a'; 300];
        data.push(0);
        let mem = BufferReader::new(data);
        let mut out = Vec::new();
        assert!(mem.read_string(0, &mut out, 512));
        assert_eq!(out.len(), 300);
        assert!(out.iter().all(|&b| b == b'a'));
    }

    #[test]
    fn read_string_no_terminator_within_limit() {
        let mem = BufferReader::new(b"abcdef\0".to_vec());
        let mut out = Vec::new();
        assert!(!mem.read_string(0, &mut out, 4));
    }

    #[test]
    fn read_string_runs_out_of_bytes() {
        let mem = BufferReader::new(b"abcdef".to_vec());
        let mut out = Vec::new();
        assert!(!mem.read_string(0, &mut out, 64));
    }

    #[test]
    fn typed_reads() {
        let mem = BufferReader::new(0x1122_3344_5566_7788u64.to_ne_bytes().to_vec());
        assert_eq!(mem.read_u64(0), Some(0x1122_3344_5566_7788));
        assert_eq!(
            mem.read_u32(0),
            Some(u32::from_ne_bytes(0x1122_3344_5566_7788u64.to_ne_bytes()[..4].try_into().unwrap()))
        );
        assert_eq!(mem.read_u64(1), None);
    }
}
