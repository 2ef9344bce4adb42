//! Cache-line durability primitives.
//!
//! Three operations cover everything the runtime needs: [`cl_flush`] writes
//! one cache line back toward the persistence domain, [`store_fence`] orders
//! prior stores before later ones, and [`pm_drain`] waits for in-flight
//! flushes to complete. Every other module calls these wrappers and never
//! issues raw flush instructions.
//!
//! The active backend is swappable through [`set_backend`], which lets tests
//! count flushes or inject faults without touching the hot path's callers.
//! Building with the `disable-flushes` feature compiles every primitive to a
//! no-op; crash-consistency guarantees are void in that configuration.

use std::fs;
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;

/// Pluggable implementation of the three durability operations.
///
/// The default backend issues real hardware instructions. Tests substitute
/// counting or fault-injecting backends.
pub trait FlushBackend: Send + Sync {
    /// Flush the cache line containing `addr`.
    fn cl_flush(&self, addr: usize);
    /// Order prior stores before later stores from this core.
    fn store_fence(&self);
    /// Wait until previously issued flushes reach the persistence domain.
    fn pm_drain(&self);
}

/// Hardware backend: `clflush` + `sfence` on x86-64, fence-only elsewhere.
struct HwBackend;

impl FlushBackend for HwBackend {
    #[inline]
    fn cl_flush(&self, addr: usize) {
        #[cfg(all(target_arch = "x86_64", not(feature = "disable-flushes")))]
        unsafe {
            core::arch::x86_64::_mm_clflush(addr as *const u8);
        }
        #[cfg(not(all(target_arch = "x86_64", not(feature = "disable-flushes"))))]
        let _ = addr;
    }

    #[inline]
    fn store_fence(&self) {
        #[cfg(all(target_arch = "x86_64", not(feature = "disable-flushes")))]
        unsafe {
            core::arch::x86_64::_mm_sfence();
        }
        #[cfg(not(all(target_arch = "x86_64", not(feature = "disable-flushes"))))]
        std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
    }

    #[inline]
    fn pm_drain(&self) {
        // clflush is ordered by sfence; draining is a fence on this
        // microarchitecture family.
        self.store_fence();
    }
}

fn backend_slot() -> &'static RwLock<Arc<dyn FlushBackend>> {
    static BACKEND: OnceLock<RwLock<Arc<dyn FlushBackend>>> = OnceLock::new();
    BACKEND.get_or_init(|| RwLock::new(Arc::new(HwBackend)))
}

/// Install a replacement backend, returning the previous one.
///
/// Intended for tests and benchmarking harnesses.
pub fn set_backend(backend: Arc<dyn FlushBackend>) -> Arc<dyn FlushBackend> {
    std::mem::replace(&mut *backend_slot().write(), backend)
}

/// Cache line size in bytes, probed once from sysfs with a 64-byte fallback.
pub fn cache_line_size() -> usize {
    static SIZE: OnceLock<usize> = OnceLock::new();
    *SIZE.get_or_init(|| {
        fs::read_to_string("/sys/devices/system/cpu/cpu0/cache/index0/coherency_line_size")
            .ok()
            .and_then(|s| s.trim().parse::<usize>().ok())
            .filter(|&n| n.is_power_of_two() && n >= 16)
            .unwrap_or(64)
    })
}

/// Flush the cache line containing `addr`.
#[inline]
pub fn cl_flush(addr: usize) {
    backend_slot().read().cl_flush(addr);
}

/// Order prior stores before later stores from this core.
#[inline]
pub fn store_fence() {
    backend_slot().read().store_fence();
}

/// Wait for in-flight flushes to reach the persistence domain.
#[inline]
pub fn pm_drain() {
    backend_slot().read().pm_drain();
}

/// Flush every cache line overlapping `[addr, addr + len)`.
#[inline]
pub fn flush_range(addr: usize, len: usize) {
    if len == 0 {
        return;
    }
    let line = cache_line_size();
    let backend = backend_slot().read();
    let mut cursor = addr & !(line - 1);
    let end = addr + len;
    while cursor < end {
        backend.cl_flush(cursor);
        cursor += line;
    }
}

/// Make the store at `addr` durable: fence, flush its line, fence.
#[inline]
pub fn nvm_barrier(addr: usize) {
    let backend = backend_slot().read();
    backend.store_fence();
    backend.cl_flush(addr);
    backend.store_fence();
}

/// Flush a byte range and drain. Precondition: all log entries covering the
/// range are already durable.
#[inline]
pub fn psync(addr: usize, len: usize) {
    store_fence();
    flush_range(addr, len);
    pm_drain();
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Backend that records every flushed line for assertions.
    pub struct CountingBackend {
        /// Number of `cl_flush` calls.
        pub flushes: AtomicUsize,
        /// Number of `store_fence` calls.
        pub fences: AtomicUsize,
        /// Number of `pm_drain` calls.
        pub drains: AtomicUsize,
    }

    impl CountingBackend {
        pub fn new() -> Self {
            Self {
                flushes: AtomicUsize::new(0),
                fences: AtomicUsize::new(0),
                drains: AtomicUsize::new(0),
            }
        }
    }

    impl FlushBackend for CountingBackend {
        fn cl_flush(&self, _addr: usize) {
            self.flushes.fetch_add(1, Ordering::SeqCst);
        }
        fn store_fence(&self) {
            self.fences.fetch_add(1, Ordering::SeqCst);
        }
        fn pm_drain(&self) {
            self.drains.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::CountingBackend;
    use super::*;
    use std::sync::atomic::Ordering as AtomicOrdering;
    use std::sync::Mutex;

    // Backend swaps are process-global; serialize the tests that do them.
    static SWAP_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn test_cache_line_size_sane() {
        let line = cache_line_size();
        assert!(line.is_power_of_two());
        assert!(line >= 16);
    }

    #[test]
    fn test_flush_range_line_count() {
        let _guard = SWAP_LOCK.lock().unwrap();
        let counting = Arc::new(CountingBackend::new());
        let prev = set_backend(counting.clone());

        let line = cache_line_size();
        // A range starting one byte before a line boundary and extending one
        // byte into the next line touches exactly two lines.
        flush_range(line - 1, 2);
        assert_eq!(counting.flushes.load(AtomicOrdering::SeqCst), 2);

        counting.flushes.store(0, AtomicOrdering::SeqCst);
        flush_range(0, 0);
        assert_eq!(counting.flushes.load(AtomicOrdering::SeqCst), 0);

        counting.flushes.store(0, AtomicOrdering::SeqCst);
        flush_range(line, line);
        assert_eq!(counting.flushes.load(AtomicOrdering::SeqCst), 1);

        set_backend(prev);
    }

    #[test]
    fn test_nvm_barrier_fences_around_flush() {
        let _guard = SWAP_LOCK.lock().unwrap();
        let counting = Arc::new(CountingBackend::new());
        let prev = set_backend(counting.clone());

        nvm_barrier(0x1000);
        assert_eq!(counting.flushes.load(AtomicOrdering::SeqCst), 1);
        assert_eq!(counting.fences.load(AtomicOrdering::SeqCst), 2);

        set_backend(prev);
    }

    #[test]
    fn test_psync_drains() {
        let _guard = SWAP_LOCK.lock().unwrap();
        let counting = Arc::new(CountingBackend::new());
        let prev = set_backend(counting.clone());

        psync(0x2000, 256);
        assert!(counting.flushes.load(AtomicOrdering::SeqCst) >= 4);
        assert_eq!(counting.drains.load(AtomicOrdering::SeqCst), 1);

        set_backend(prev);
    }

    #[test]
    fn test_hw_backend_on_live_memory() {
        // Exercise the real instructions against heap memory; clflush is
        // valid on any mapped address.
        let value = Box::new(42u64);
        let addr = &*value as *const u64 as usize;
        nvm_barrier(addr);
        psync(addr, 8);
        assert_eq!(*value, 42);
    }
}
