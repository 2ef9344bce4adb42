//! Address-range to region-id classification.
//!
//! The extent map is read on every logged store, so `find` must be wait-free
//! for readers: it acquire-loads an immutable snapshot, binary-searches a
//! sorted extent array, and drops the snapshot. Mutation is copy-on-write —
//! the PRM serializes writers through its table lock, builds a new array,
//! publishes it by CAS, and retires the displaced version through the epoch
//! drain list once every reader has moved on.

use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Arc;

use crate::epoch::{self, Epoch};

/// One mapped region's address interval. `hi` is inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    /// First address of the region.
    pub lo: u64,
    /// Last address of the region.
    pub hi: u64,
    /// Region id owning the interval.
    pub id: u32,
}

#[derive(Debug, Default)]
struct ExtentTable {
    /// Sorted by `lo`; intervals never overlap.
    extents: Vec<Extent>,
}

impl ExtentTable {
    fn lookup(&self, addr: u64, size: u64) -> Option<u32> {
        if size == 0 {
            return None;
        }
        let idx = match self.extents.binary_search_by(|e| e.lo.cmp(&addr)) {
            Ok(idx) => idx,
            Err(0) => return None,
            Err(idx) => idx - 1,
        };
        let extent = &self.extents[idx];
        let last = addr.checked_add(size - 1)?;
        // A span spilling past the region boundary classifies as transient.
        if addr >= extent.lo && last <= extent.hi {
            Some(extent.id)
        } else {
            None
        }
    }
}

/// Concurrently readable interval map over the open regions.
pub struct ExtentMap {
    root: AtomicPtr<ExtentTable>,
    epoch: Arc<Epoch>,
}

impl ExtentMap {
    /// Create an empty map.
    pub fn new() -> Self {
        Self {
            root: AtomicPtr::new(Box::into_raw(Box::new(ExtentTable::default()))),
            epoch: Arc::new(Epoch::new()),
        }
    }

    /// Classify `[addr, addr + size)`. Returns the owning region id, or
    /// `None` when the span is outside every region or crosses a boundary.
    #[inline]
    pub fn find(&self, addr: u64, size: u64) -> Option<u32> {
        let slot = epoch::thread_slot().ok()?;
        self.epoch.protect(slot);
        let table = unsafe { &*self.root.load(Ordering::Acquire) };
        let result = table.lookup(addr, size);
        self.epoch.unprotect(slot);
        result
    }

    /// Insert the interval for a newly mapped region.
    ///
    /// Callers serialize through the PRM table lock.
    pub fn insert(&self, lo: u64, hi: u64, id: u32) {
        debug_assert!(lo <= hi);
        self.mutate(|extents| {
            let pos = extents.partition_point(|e| e.lo < lo);
            extents.insert(pos, Extent { lo, hi, id });
        });
    }

    /// Remove the interval of a closed or deleted region.
    pub fn delete(&self, lo: u64, hi: u64, id: u32) {
        self.mutate(|extents| {
            extents.retain(|e| !(e.lo == lo && e.hi == hi && e.id == id));
        });
    }

    fn mutate(&self, edit: impl Fn(&mut Vec<Extent>)) {
        loop {
            let old_ptr = self.root.load(Ordering::Acquire);
            let mut extents = unsafe { (*old_ptr).extents.clone() };
            edit(&mut extents);
            let new_ptr = Box::into_raw(Box::new(ExtentTable { extents }));

            match self.root.compare_exchange_weak(
                old_ptr,
                new_ptr,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    // Retire the displaced table once no reader can hold it.
                    let retired = old_ptr as usize;
                    self.epoch.bump_with_action(move || {
                        drop(unsafe { Box::from_raw(retired as *mut ExtentTable) });
                    });
                    return;
                }
                Err(_) => {
                    drop(unsafe { Box::from_raw(new_ptr) });
                }
            }
        }
    }

    /// Snapshot the current extents (diagnostics and recovery).
    pub fn snapshot(&self) -> Vec<Extent> {
        let slot = match epoch::thread_slot() {
            Ok(slot) => slot,
            Err(_) => return Vec::new(),
        };
        self.epoch.protect(slot);
        let table = unsafe { &*self.root.load(Ordering::Acquire) };
        let extents = table.extents.clone();
        self.epoch.unprotect(slot);
        extents
    }
}

impl Default for ExtentMap {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ExtentMap {
    fn drop(&mut self) {
        let ptr = self.root.load(Ordering::Acquire);
        if !ptr.is_null() {
            drop(unsafe { Box::from_raw(ptr) });
        }
    }
}

unsafe impl Send for ExtentMap {}
unsafe impl Sync for ExtentMap {}
