//! Space management inside the log region.
//!
//! Entry chunks (fixed size, one writer at a time) and memop side-buffers
//! (variable size) are carved from a persistent bump cursor. Reclaimed
//! chunks and buffers recycle through volatile free lists — after a crash
//! the cursor alone over-approximates the used space, which is fine because
//! recovery deletes the whole log region when it finishes.

use parking_lot::Mutex;

use crate::error::{NvError, Result};
use crate::log::structure::LogStructure;

use std::sync::atomic::Ordering;

/// Allocator over a log region's data area.
pub struct LogArena {
    header: LogStructure,
    end_offset: u64,
    chunk_bytes: u64,
    free_chunks: Mutex<Vec<u64>>,
    free_buffers: Mutex<Vec<(u64, u64)>>,
}

impl LogArena {
    /// Create an arena over the data area of the region behind `header`,
    /// spanning `region_len` bytes, using `chunk_bytes` entry chunks.
    pub fn new(header: LogStructure, region_len: u64, chunk_bytes: u64) -> Self {
        assert!(chunk_bytes >= 512, "log chunks must hold several entries");
        Self {
            header,
            end_offset: region_len,
            chunk_bytes,
            free_chunks: Mutex::new(Vec::new()),
            free_buffers: Mutex::new(Vec::new()),
        }
    }

    /// Entry chunk size in bytes.
    #[inline]
    pub fn chunk_bytes(&self) -> u64 {
        self.chunk_bytes
    }

    fn bump(&self, len: u64) -> Result<u64> {
        let cursor = self.header.arena_cursor();
        let offset = cursor
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                let next = current.checked_add(len)?;
                (next <= self.end_offset).then_some(next)
            })
            .map_err(|_| NvError::LogFull)?;
        Ok(self.header.base() + offset)
    }

    /// Allocate one entry chunk, recycled or fresh. Returns its absolute
    /// base address.
    pub fn alloc_chunk(&self) -> Result<u64> {
        if let Some(addr) = self.free_chunks.lock().pop() {
            return Ok(addr);
        }
        self.bump(self.chunk_bytes)
    }

    /// Return a fully reclaimed chunk for reuse.
    pub fn free_chunk(&self, addr: u64) {
        self.free_chunks.lock().push(addr);
    }

    /// Allocate a side-buffer of `len` bytes (8-byte aligned).
    pub fn alloc_buffer(&self, len: u64) -> Result<u64> {
        let len = len.max(8).next_multiple_of(8);
        {
            let mut free = self.free_buffers.lock();
            if let Some(pos) = free.iter().position(|&(_, l)| l >= len) {
                let (addr, have) = free.swap_remove(pos);
                if have > len {
                    free.push((addr + len, have - len));
                }
                return Ok(addr);
            }
        }
        self.bump(len)
    }

    /// Return a reclaimed side-buffer for reuse.
    pub fn free_buffer(&self, addr: u64, len: u64) {
        let len = len.max(8).next_multiple_of(8);
        self.free_buffers.lock().push((addr, len));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::structure::LOG_DATA_OFFSET;

    struct Fixture {
        _storage: Vec<u64>,
        arena: LogArena,
        base: u64,
    }

    fn fixture(len: u64) -> Fixture {
        let storage = vec![0u64; (len / 8) as usize];
        let base = storage.as_ptr() as u64;
        let header = unsafe { LogStructure::from_raw(base) };
        header.initialize();
        Fixture {
            _storage: storage,
            arena: LogArena::new(header, len, 1024),
            base,
        }
    }

    #[test]
    fn test_chunks_carve_from_data_area() {
        let f = fixture(64 * 1024);
        let c1 = f.arena.alloc_chunk().unwrap();
        let c2 = f.arena.alloc_chunk().unwrap();
        assert_eq!(c1, f.base + LOG_DATA_OFFSET);
        assert_eq!(c2, c1 + 1024);
    }

    #[test]
    fn test_chunk_recycling() {
        let f = fixture(64 * 1024);
        let c1 = f.arena.alloc_chunk().unwrap();
        f.arena.free_chunk(c1);
        assert_eq!(f.arena.alloc_chunk().unwrap(), c1);
    }

    #[test]
    fn test_buffer_split_and_reuse() {
        let f = fixture(64 * 1024);
        let b = f.arena.alloc_buffer(64).unwrap();
        f.arena.free_buffer(b, 64);
        // A smaller request splits the recycled buffer.
        let b1 = f.arena.alloc_buffer(16).unwrap();
        let b2 = f.arena.alloc_buffer(16).unwrap();
        assert_eq!(b1, b);
        assert_eq!(b2, b + 16);
    }

    #[test]
    fn test_exhaustion() {
        let f = fixture(8 * 1024);
        // Data area is 8 KiB - 4 KiB header = 4 chunks of 1 KiB.
        for _ in 0..4 {
            f.arena.alloc_chunk().unwrap();
        }
        assert!(matches!(f.arena.alloc_chunk(), Err(NvError::LogFull)));
    }
}
