//! Page caches that amortize syscalls for address-clustered reads.
//!
//! Unwinding reads cluster tightly (return addresses, CFI records, stack
//! slots), so filling a small page once and serving later reads from it
//! saves most of the syscall traffic. The cache grows monotonically and
//! never ages entries out; a trace touches a small bounded working set.

use {
    crate::source::MemorySource,
    std::{
        cell::RefCell,
        collections::HashMap,
        sync::{
            atomic::{AtomicU64, Ordering},
            Arc, Mutex, PoisonError,
        },
    },
};

/// Cache slot granularity: 1024-byte pages. Independent of the OS page
/// size; must be a power of two.
const DEFAULT_PAGE_BITS: u32 = 10;

/// A map of fixed-size page slots keyed by `addr >> bits`.
struct PageCache {
    bits: u32,
    pages: HashMap<u64, Box<[u8]>>,
}

impl PageCache {
    fn new() -> Self {
        Self::with_page_bits(DEFAULT_PAGE_BITS)
    }

    fn with_page_bits(bits: u32) -> Self {
        Self { bits, pages: HashMap::new() }
    }

    #[inline]
    fn page_len(&self) -> usize {
        1 << self.bits
    }

    fn clear(&mut self) {
        self.pages.clear();
    }

    /// The slot for `page`, filling it from `source` on a miss. A slot
    /// that cannot be filled completely is not kept.
    fn fill(&mut self, source: &dyn MemorySource, page: u64) -> Option<&[u8]> {
        if !self.pages.contains_key(&page) {
            let mut slot = vec![0u8; self.page_len()].into_boxed_slice();
            if !source.read_fully(page << self.bits, &mut slot) {
                return None;
            }
            self.pages.insert(page, slot);
        }
        self.pages.get(&page).map(|slot| &**slot)
    }

    fn read(&mut self, source: &dyn MemorySource, addr: u64, dst: &mut [u8]) -> usize {
        let bits = self.bits;
        let mask = (1u64 << bits) - 1;
        let size = dst.len();

        // At most one page crossing can be served from two slots; larger
        // requests go straight to the source.
        if size > self.page_len() {
            return source.read(addr, dst);
        }

        let mut page = addr >> bits;
        let Some(page_end) = (page << bits).checked_add(1 << bits) else {
            // The last page of the address space; serve uncached.
            return source.read(addr, dst);
        };

        let first = match self.fill(source, page) {
            Some(slot) => slot,
            None => return source.read(addr, dst),
        };
        let slot_off = (addr & mask) as usize;
        let max_read = (page_end - addr) as usize;
        if size <= max_read {
            dst.copy_from_slice(&first[slot_off..slot_off + size]);
            return size;
        }

        // The read crosses into the next slot. A read can only cross
        // into one extra page, so no loop.
        dst[..max_read].copy_from_slice(&first[slot_off..]);
        page += 1;
        let rest = &mut dst[max_read..];
        match self.fill(source, page) {
            Some(slot) => {
                rest.copy_from_slice(&slot[..size - max_read]);
                size
            }
            // `page << bits` and `addr + max_read` coincide by
            // construction of `max_read`.
            None => source.read(page << bits, rest) + max_read,
        }
    }
}

/// A page-caching wrapper shared freely across threads.
///
/// A single mutex guards the whole cache for the whole call. The design
/// target is one reader at a time; the lock serializes occasional
/// concurrent use rather than scaling it.
pub struct CachedReader {
    source: Arc<dyn MemorySource>,
    cache: Mutex<PageCache>,
}

impl CachedReader {
    pub fn new(source: Arc<dyn MemorySource>) -> Self {
        Self {
            source,
            cache: Mutex::new(PageCache::new()),
        }
    }

    /// Drop every cached page.
    pub fn clear(&self) {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl MemorySource for CachedReader {
    fn read(&self, addr: u64, dst: &mut [u8]) -> usize {
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        cache.read(&*self.source, addr, dst)
    }
}

static NEXT_CACHE_ID: AtomicU64 = AtomicU64::new(0);

thread_local! {
    /// Per-thread slot maps, keyed by reader id. A thread's map is
    /// dropped when the thread exits.
    static THREAD_CACHES: RefCell<HashMap<u64, PageCache>> = RefCell::new(HashMap::new());
}

/// A page-caching wrapper with an independent cache per thread.
///
/// Threads never exchange cache slots, so reads take no lock at all.
/// [`clear`](Self::clear) empties only the calling thread's cache; other
/// threads' caches go away when those threads exit (or when the reader
/// itself is dropped on them).
pub struct ThreadCachedReader {
    source: Arc<dyn MemorySource>,
    id: u64,
}

impl ThreadCachedReader {
    pub fn new(source: Arc<dyn MemorySource>) -> Self {
        Self {
            source,
            id: NEXT_CACHE_ID.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Drop the calling thread's cached pages.
    pub fn clear(&self) {
        let _ = THREAD_CACHES.try_with(|caches| {
            caches.borrow_mut().remove(&self.id);
        });
    }
}

impl MemorySource for ThreadCachedReader {
    fn read(&self, addr: u64, dst: &mut [u8]) -> usize {
        let buf = &mut *dst;
        let served = THREAD_CACHES.try_with(move |caches| {
            let mut caches = caches.borrow_mut();
            let cache = caches.entry(self.id).or_insert_with(PageCache::new);
            cache.read(&*self.source, addr, buf)
        });
        match served {
            Ok(bytes) => bytes,
            // Thread-local storage is gone (thread teardown); the read
            // still has to work, just uncached.
            Err(_) => self.source.read(addr, dst),
        }
    }
}

impl Drop for ThreadCachedReader {
    fn drop(&mut self) {
        let _ = THREAD_CACHES.try_with(|caches| {
            caches.borrow_mut().remove(&self.id);
        });
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::buffer::BufferReader,
        std::sync::atomic::{AtomicUsize, Ordering::Relaxed},
    };

    /// Counts how many reads reach the underlying store.
    struct MockSource {
        data: Vec<u8>,
        reads: AtomicUsize,
    }

    impl MockSource {
        fn ramp(len: usize) -> Self {
            Self {
                data: (0..len).map(|i| i as u8).collect(),
                reads: AtomicUsize::new(0),
            }
        }

        fn reads(&self) -> usize {
            self.reads.load(Relaxed)
        }
    }

    impl MemorySource for MockSource {
        fn read(&self, addr: u64, dst: &mut [u8]) -> usize {
            self.reads.fetch_add(1, Relaxed);
            let Ok(offset) = usize::try_from(addr) else {
                return 0;
            };
            if offset >= self.data.len() {
                return 0;
            }
            let len = dst.len().min(self.data.len() - offset);
            dst[..len].copy_from_slice(&self.data[offset..offset + len]);
            len
        }
    }

    #[test]
    fn crossing_read_fills_both_pages() {
        let source = MockSource::ramp(32);
        let mut cache = PageCache::with_page_bits(3);

        let mut dst = [0u8; 4];
        assert_eq!(cache.read(&source, 6, &mut dst), 4);
        assert_eq!(dst, [6, 7, 8, 9]);
        assert!(cache.pages.contains_key(&0));
        assert!(cache.pages.contains_key(&1));
        assert_eq!(source.reads(), 2);

        // Both pages are hot now; no further source traffic.
        assert_eq!(cache.read(&source, 0, &mut dst), 4);
        assert_eq!(dst, [0, 1, 2, 3]);
        assert_eq!(cache.read(&source, 12, &mut dst), 4);
        assert_eq!(dst, [12, 13, 14, 15]);
        assert_eq!(source.reads(), 2);
    }

    #[test]
    fn crossing_read_with_default_page_size() {
        let source = MockSource::ramp(4096);
        let mut cache = PageCache::new();

        let mut dst = [0u8; 8];
        assert_eq!(cache.read(&source, 1020, &mut dst), 8);
        let expected: Vec<u8> = (1020..1028).map(|i| i as u8).collect();
        assert_eq!(dst[..], expected[..]);
        assert_eq!(cache.pages.len(), 2);
        assert!(cache.pages.contains_key(&0));
        assert!(cache.pages.contains_key(&1));
    }

    #[test]
    fn first_fill_failure_falls_through_uncached() {
        // 12 bytes cannot fill the 8-byte page at index 1.
        let source = MockSource::ramp(12);
        let mut cache = PageCache::with_page_bits(3);

        let mut dst = [0u8; 8];
        assert_eq!(cache.read(&source, 8, &mut dst), 4);
        assert_eq!(&dst[..4], &[8, 9, 10, 11]);
        assert!(!cache.pages.contains_key(&1));
    }

    #[test]
    fn second_fill_failure_reads_the_tail_uncached() {
        let source = MockSource::ramp(12);
        let mut cache = PageCache::with_page_bits(3);

        let mut dst = [0u8; 6];
        assert_eq!(cache.read(&source, 6, &mut dst), 6);
        assert_eq!(dst, [6, 7, 8, 9, 10, 11]);
        assert!(cache.pages.contains_key(&0));
        assert!(!cache.pages.contains_key(&1));
    }

    #[test]
    fn oversized_reads_bypass_the_cache() {
        let source = MockSource::ramp(32);
        let mut cache = PageCache::with_page_bits(3);

        let mut dst = [0u8; 20];
        assert_eq!(cache.read(&source, 2, &mut dst), 20);
        let expected: Vec<u8> = (2..22).collect();
        assert_eq!(dst[..], expected[..]);
        assert!(cache.pages.is_empty());
        assert_eq!(source.reads(), 1);
    }

    #[test]
    fn clear_empties_the_slot_map() {
        let source = MockSource::ramp(32);
        let mut cache = PageCache::with_page_bits(3);

        let mut dst = [0u8; 2];
        assert_eq!(cache.read(&source, 0, &mut dst), 2);
        assert_eq!(cache.pages.len(), 1);
        cache.clear();
        assert!(cache.pages.is_empty());
    }

    #[test]
    fn shared_cache_matches_the_uncached_source() {
        let backing: Vec<u8> = (0..4096).map(|i| (i % 251) as u8).collect();
        let plain = BufferReader::new(backing.clone());
        let cached = CachedReader::new(Arc::new(BufferReader::new(backing)));

        for &(addr, size) in &[
            (0u64, 10usize),
            (1020, 8),
            (1023, 2),
            (4090, 10),
            (4096, 4),
            (2048, 1024),
        ] {
            let mut a = vec![0u8; size];
            let mut b = vec![0u8; size];
            let na = plain.read(addr, &mut a);
            let nb = cached.read(addr, &mut b);
            assert_eq!(na, nb, "count mismatch at {addr:#x}+{size}");
            assert_eq!(a[..na], b[..nb], "bytes mismatch at {addr:#x}+{size}");
        }
    }

    #[test]
    fn shared_cache_is_usable_from_many_threads() {
        let backing: Vec<u8> = (0..8192).map(|i| (i % 247) as u8).collect();
        let cached = CachedReader::new(Arc::new(BufferReader::new(backing.clone())));

        std::thread::scope(|scope| {
            for t in 0..4 {
                let cached = &cached;
                let backing = &backing;
                scope.spawn(move || {
                    for i in 0..64 {
                        let addr = ((t * 1021 + i * 97) % 8000) as u64;
                        let mut dst = [0u8; 16];
                        let n = cached.read(addr, &mut dst);
                        assert_eq!(n, 16.min(8192 - addr as usize));
                        assert_eq!(dst[..n], backing[addr as usize..addr as usize + n]);
                    }
                });
            }
        });
    }

    #[test]
    fn thread_cache_keeps_threads_independent() {
        let source = Arc::new(MockSource::ramp(4096));
        let cached = ThreadCachedReader::new(source.clone());

        let mut dst = [0u8; 4];
        assert_eq!(cached.read(0, &mut dst), 4);
        assert_eq!(cached.read(4, &mut dst), 4);
        let after_main = source.reads();

        std::thread::scope(|scope| {
            let cached = &cached;
            scope.spawn(move || {
                // This thread has its own empty cache, so the same page
                // is filled again.
                let mut dst = [0u8; 4];
                assert_eq!(cached.read(0, &mut dst), 4);
                assert_eq!(dst, [0, 1, 2, 3]);
            });
        });

        assert!(source.reads() > after_main);
    }

    #[test]
    fn thread_cache_clear_only_touches_the_calling_thread() {
        let source = Arc::new(MockSource::ramp(4096));
        let cached = ThreadCachedReader::new(source.clone());

        let mut dst = [0u8; 4];
        assert_eq!(cached.read(0, &mut dst), 4);
        let filled = source.reads();

        // A warm page costs nothing...
        assert_eq!(cached.read(1, &mut dst), 4);
        assert_eq!(source.reads(), filled);

        // ...until this thread's cache is dropped.
        cached.clear();
        assert_eq!(cached.read(1, &mut dst), 4);
        assert!(source.reads() > filled);
    }

    #[test]
    fn thread_cached_reads_match_the_source() {
        let backing: Vec<u8> = (0..2048).map(|i| (i % 253) as u8).collect();
        let cached = ThreadCachedReader::new(Arc::new(BufferReader::new(backing.clone())));

        for &(addr, size) in &[(0u64, 16usize), (1016, 16), (2040, 16), (2048, 1)] {
            let mut dst = vec![0u8; size];
            let n = cached.read(addr, &mut dst);
            assert_eq!(n, size.min(backing.len().saturating_sub(addr as usize)));
            assert_eq!(dst[..n], backing[addr as usize..addr as usize + n]);
        }
    }
}
