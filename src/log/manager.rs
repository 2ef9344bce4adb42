//! Log Manager: the logging API called by instrumentation hooks.
//!
//! A process-wide singleton owning the log region, the per-lane writers,
//! the volatile lock-publisher table, and the helper thread. Every
//! operation no-ops when the instance is absent, so instrumented code is
//! safe to run before `nvm_initialize` and after `nvm_finalize`.
//!
//! Cross-thread ordering is materialized lazily: an acquire-class entry
//! records the last release entry published for its lock (0 if none), and a
//! release-class entry publishes itself after it is durable. Recovery
//! inverts those pointers into the release→acquire graph.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{info, warn};

use crate::constants::{MAX_LOG_THREADS, RGN_SIZE};
use crate::durability;
use crate::epoch;
use crate::error::{NvError, Result};
use crate::heap;
use crate::log::arena::LogArena;
use crate::log::entry::{EntryKind, LogEntry, FLAG_FASE_START};
use crate::log::flush_worker::FlushWorker;
use crate::log::structure::LogStructure;
use crate::log::writer::WriterSlot;
use crate::region::{region_base, RegionManager, F_READWRITE};

/// State shared between the logging API and the helper thread.
pub(crate) struct LogCore {
    pub(crate) header: LogStructure,
    pub(crate) arena: LogArena,
    pub(crate) writers: Vec<Mutex<WriterSlot>>,
    /// Last release-class entry published per lock (or in-use flag)
    /// address. Volatile by design; rebuilt empty on every start.
    pub(crate) publishers: Mutex<HashMap<u64, u64>>,
    /// Helper-batched data flushing enabled.
    pub(crate) batched: bool,
    /// Background reclamation enabled.
    pub(crate) reclaim: bool,
}

/// Process-wide undo log manager.
pub struct LogManager {
    core: Arc<LogCore>,
    worker: FlushWorker,
    region_name: String,
}

static INSTANCE: RwLock<Option<Arc<LogManager>>> = RwLock::new(None);

impl LogManager {
    /// Create and install the process-wide instance, creating the log
    /// region `logs_<progname>` as needed.
    pub fn create_instance(regions: &Arc<RegionManager>) -> Result<Arc<LogManager>> {
        let mut guard = INSTANCE.write();
        if let Some(existing) = guard.as_ref() {
            return Ok(existing.clone());
        }

        let cfg = regions.config().clone();
        let region_name = cfg.log_region_name();
        let (id, created) = regions.find_or_create(&region_name, F_READWRITE)?;
        let base = region_base(id);
        let header = unsafe { LogStructure::from_raw(base) };

        if !created && header.is_initialized() {
            warn!(
                region = %region_name,
                "stale undo log found; run `recover` before restarting to roll back \
                 interrupted sections — reinitializing"
            );
        }
        header.initialize();

        let arena = LogArena::new(header, RGN_SIZE, cfg.chunk_bytes);
        let writers = (0..MAX_LOG_THREADS).map(|lane| Mutex::new(WriterSlot::new(lane))).collect();

        let core = Arc::new(LogCore {
            header,
            arena,
            writers,
            publishers: Mutex::new(HashMap::new()),
            batched: cfg.helper_batched,
            reclaim: cfg.helper_reclaim,
        });
        let worker = FlushWorker::spawn(core.clone());

        let manager = Arc::new(LogManager {
            core,
            worker,
            region_name,
        });
        info!(batched = cfg.helper_batched, "log manager initialized");
        *guard = Some(manager.clone());
        Ok(manager)
    }

    /// Whether the process-wide instance exists.
    pub fn has_instance() -> bool {
        INSTANCE.read().is_some()
    }

    /// Get the process-wide instance.
    pub fn instance() -> Option<Arc<LogManager>> {
        INSTANCE.read().clone()
    }

    /// Clean shutdown: stop the helper, flush every remaining chain's data,
    /// and unlink the log region — after this there is nothing to recover.
    pub fn delete_instance() {
        let taken = INSTANCE.write().take();
        if let Some(manager) = taken {
            manager.worker.stop();
            manager.flush_all_data();
            if let Some(regions) = RegionManager::instance() {
                if let Err(err) = regions.delete(&manager.region_name) {
                    warn!(%err, "failed to unlink log region at shutdown");
                }
            }
            info!("log manager shut down cleanly");
        }
    }

    /// Tear down without the clean-shutdown flush and unlink, leaving the
    /// on-PM log exactly as an instantaneous crash would. Crash-testing
    /// surface.
    pub fn delete_instance_unclean() {
        let taken = INSTANCE.write().take();
        if let Some(manager) = taken {
            manager.worker.abort();
        }
    }

    /// Whether helper-batched data flushing is active.
    #[inline]
    pub fn batched(&self) -> bool {
        self.core.batched
    }

    // ---- logging operations ----

    /// Log the pre-image of an upcoming store of `bits` bits at `addr`.
    ///
    /// Transient addresses (not inside any open region, or spanning two)
    /// are filtered here and not logged. Stores wider than 128 bits are
    /// rejected; 65–128-bit stores produce two entries.
    pub fn log_store(&self, addr: u64, bits: u32) -> Result<()> {
        if bits > 128 {
            return Err(NvError::StoreTooWide(bits));
        }
        let bytes = (bits as u64).div_ceil(8);
        if !self.is_persistent(addr, bytes) {
            return Ok(());
        }

        let lane = epoch::thread_slot()?;
        let mut writer = self.core.writers[lane].lock();

        if bits <= 64 {
            let old = unsafe { read_pre_image(addr, bytes as usize) };
            let generation = writer.next_generation();
            writer.append(
                &self.core.header,
                &self.core.arena,
                LogEntry {
                    kind: EntryKind::Str,
                    flags: 0,
                    size: bits,
                    addr,
                    value_or_ptr: old,
                    next: 0,
                    generation,
                },
            )?;
        } else {
            // Wide store: two entries, the head word plus a tail of at most
            // 64 bits.
            let head = unsafe { read_pre_image(addr, 8) };
            let tail_bits = bits - 64;
            let tail = unsafe { read_pre_image(addr + 8, (tail_bits as usize).div_ceil(8)) };
            for (offset, part_bits, value) in [(0u64, 64u32, head), (8, tail_bits, tail)] {
                let generation = writer.next_generation();
                writer.append(
                    &self.core.header,
                    &self.core.arena,
                    LogEntry {
                        kind: EntryKind::Str,
                        flags: 0,
                        size: part_bits,
                        addr: addr + offset,
                        value_or_ptr: value,
                        next: 0,
                        generation,
                    },
                )?;
            }
        }
        Ok(())
    }

    /// Log a `memset` pre-image over `[dst, dst + len)`.
    pub fn log_memset(&self, dst: u64, len: u64) -> Result<()> {
        self.log_memop(EntryKind::Memset, dst, len)
    }

    /// Log a `memcpy` destination pre-image.
    pub fn log_memcpy(&self, dst: u64, len: u64) -> Result<()> {
        self.log_memop(EntryKind::Memcpy, dst, len)
    }

    /// Log a `memmove` destination pre-image.
    pub fn log_memmove(&self, dst: u64, len: u64) -> Result<()> {
        self.log_memop(EntryKind::Memmove, dst, len)
    }

    /// Log a `strcpy` destination pre-image.
    pub fn log_strcpy(&self, dst: u64, len: u64) -> Result<()> {
        self.log_memop(EntryKind::Strcpy, dst, len)
    }

    /// Log a `strcat` destination pre-image.
    pub fn log_strcat(&self, dst: u64, len: u64) -> Result<()> {
        self.log_memop(EntryKind::Strcat, dst, len)
    }

    fn log_memop(&self, kind: EntryKind, dst: u64, len: u64) -> Result<()> {
        if len == 0 || !self.is_persistent(dst, len) {
            return Ok(());
        }
        let lane = epoch::thread_slot()?;
        let mut writer = self.core.writers[lane].lock();

        let buffer = self.core.arena.alloc_buffer(len)?;
        unsafe {
            std::ptr::copy_nonoverlapping(dst as *const u8, buffer as *mut u8, len as usize);
        }
        durability::flush_range(buffer as usize, len as usize);
        durability::store_fence();

        let generation = writer.next_generation();
        let entry = writer.append(
            &self.core.header,
            &self.core.arena,
            LogEntry {
                kind,
                flags: 0,
                size: len as u32,
                addr: dst,
                value_or_ptr: buffer,
                next: 0,
                generation,
            },
        )?;
        writer.track_buffer(entry, buffer, len);
        Ok(())
    }

    /// Log a mutex acquire, recording the release it observed.
    pub fn log_acquire(&self, lock: u64) -> Result<()> {
        self.log_section_open(EntryKind::Acquire, lock)
    }

    /// Log a reader-lock acquire.
    pub fn log_rdlock(&self, lock: u64) -> Result<()> {
        self.log_section_open(EntryKind::RdLock, lock)
    }

    /// Log a writer-lock acquire.
    pub fn log_wrlock(&self, lock: u64) -> Result<()> {
        self.log_section_open(EntryKind::WrLock, lock)
    }

    /// Open an explicit durable section.
    pub fn log_begin_durable(&self) -> Result<()> {
        self.log_section_open(EntryKind::BeginDurable, 0)
    }

    fn log_section_open(&self, kind: EntryKind, lock: u64) -> Result<()> {
        let lane = epoch::thread_slot()?;
        let mut writer = self.core.writers[lane].lock();

        let flags = if writer.depth == 0 { FLAG_FASE_START } else { 0 };
        let generation = writer.next_generation();

        if kind.observes_publisher() && lock != 0 {
            // The publisher lookup and the append happen under the table
            // lock so the helper's reclamation scan cannot miss an acquire
            // that observed a release it is about to purge.
            let publishers = self.core.publishers.lock();
            let observed = publishers.get(&lock).copied().unwrap_or(0);
            writer.append(
                &self.core.header,
                &self.core.arena,
                LogEntry {
                    kind,
                    flags,
                    size: 0,
                    addr: lock,
                    value_or_ptr: observed,
                    next: 0,
                    generation,
                },
            )?;
        } else {
            writer.append(
                &self.core.header,
                &self.core.arena,
                LogEntry {
                    kind,
                    flags,
                    size: 0,
                    addr: lock,
                    value_or_ptr: 0,
                    next: 0,
                    generation,
                },
            )?;
        }
        writer.depth += 1;
        Ok(())
    }

    /// Log a mutex release; at depth zero this closes the FASE.
    pub fn log_release(&self, lock: u64) -> Result<()> {
        self.log_section_close(EntryKind::Release, lock)
    }

    /// Log a reader-writer unlock.
    pub fn log_rwunlock(&self, lock: u64) -> Result<()> {
        self.log_section_close(EntryKind::RwUnlock, lock)
    }

    /// Close an explicit durable section.
    pub fn log_end_durable(&self) -> Result<()> {
        self.log_section_close(EntryKind::EndDurable, 0)
    }

    fn log_section_close(&self, kind: EntryKind, lock: u64) -> Result<()> {
        let lane = epoch::thread_slot()?;
        let mut writer = self.core.writers[lane].lock();

        let generation = writer.next_generation();
        let entry = writer.append(
            &self.core.header,
            &self.core.arena,
            LogEntry {
                kind,
                flags: 0,
                size: 0,
                addr: lock,
                value_or_ptr: 0,
                next: 0,
                generation,
            },
        )?;

        writer.depth = writer.depth.saturating_sub(1);
        let closed_fase = writer.depth == 0;
        if closed_fase {
            writer.committed_upto = entry;
        }

        // The entry is durable; only now may later acquirers observe it.
        if kind.publishes() && lock != 0 {
            self.core.publishers.lock().insert(lock, entry);
        }
        drop(writer);

        if closed_fase {
            self.worker.wake();
        }
        Ok(())
    }

    /// Log an allocation. `flag` is the block's in-use flag address; its
    /// pre-state is implicitly "free", so `value_or_ptr` carries the
    /// observed publisher instead (the free that made the block available).
    pub fn log_alloc(&self, flag: u64) -> Result<()> {
        let lane = epoch::thread_slot()?;
        let mut writer = self.core.writers[lane].lock();

        let generation = heap::generation_of(flag);
        let publishers = self.core.publishers.lock();
        let observed = publishers.get(&flag).copied().unwrap_or(0);
        writer.append(
            &self.core.header,
            &self.core.arena,
            LogEntry {
                kind: EntryKind::Alloc,
                flags: 0,
                size: 1,
                addr: flag,
                value_or_ptr: observed,
                next: 0,
                generation,
            },
        )?;
        Ok(())
    }

    /// Log a free. Acts as a pseudo-release on the flag address so the
    /// block cannot be reused before the freeing FASE is durable.
    pub fn log_free(&self, flag: u64) -> Result<()> {
        let lane = epoch::thread_slot()?;
        let mut writer = self.core.writers[lane].lock();

        let generation = heap::generation_of(flag);
        let entry = writer.append(
            &self.core.header,
            &self.core.arena,
            LogEntry {
                kind: EntryKind::Free,
                flags: 0,
                size: 1,
                addr: flag,
                value_or_ptr: 0,
                next: 0,
                generation,
            },
        )?;
        self.core.publishers.lock().insert(flag, entry);
        Ok(())
    }

    /// Flush `[addr, addr + len)` and drain. Precondition: all log entries
    /// covering the range are durable (they are — `append` flushes).
    pub fn psync(&self, addr: u64, len: u64) {
        durability::psync(addr as usize, len as usize);
    }

    // ---- internals ----

    fn is_persistent(&self, addr: u64, len: u64) -> bool {
        match RegionManager::instance() {
            Some(regions) => regions.open_region_id(addr, len).is_some(),
            None => false,
        }
    }

    /// Flush the data lines of every live entry; used at clean shutdown.
    fn flush_all_data(&self) {
        for lane in 0..MAX_LOG_THREADS {
            let writer = self.core.writers[lane].lock();
            let mut cursor = writer.first;
            while cursor != 0 {
                let Some(entry) = (unsafe { LogEntry::read_from(cursor) }) else {
                    break;
                };
                if entry.kind.is_data() {
                    let len = if entry.kind == EntryKind::Str {
                        (entry.size as u64).div_ceil(8)
                    } else {
                        entry.size as u64
                    };
                    durability::flush_range(entry.addr as usize, len as usize);
                }
                cursor = entry.next;
            }
        }
        durability::pm_drain();
    }
}

/// Read `nbytes` (1..=8) little-endian bytes at `addr` into a word.
///
/// # Safety
///
/// `addr` must point at `nbytes` readable bytes.
pub(crate) unsafe fn read_pre_image(addr: u64, nbytes: usize) -> u64 {
    debug_assert!((1..=8).contains(&nbytes));
    let mut word = [0u8; 8];
    std::ptr::copy_nonoverlapping(addr as *const u8, word.as_mut_ptr(), nbytes);
    u64::from_le_bytes(word)
}

/// Write the low `nbytes` of `value` back to `addr`, little-endian.
///
/// # Safety
///
/// `addr` must point at `nbytes` writable bytes.
pub(crate) unsafe fn write_pre_image(addr: u64, nbytes: usize, value: u64) {
    debug_assert!((1..=8).contains(&nbytes));
    let word = value.to_le_bytes();
    std::ptr::copy_nonoverlapping(word.as_ptr(), addr as *mut u8, nbytes);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pre_image_roundtrip() {
        let mut cell = 0u64;
        let addr = &mut cell as *mut u64 as u64;
        unsafe {
            write_pre_image(addr, 8, 0x1122_3344_5566_7788);
            assert_eq!(read_pre_image(addr, 8), 0x1122_3344_5566_7788);
            // Partial widths touch only the low bytes.
            write_pre_image(addr, 2, 0xabcd);
            assert_eq!(read_pre_image(addr, 8), 0x1122_3344_5566_abcd);
            assert_eq!(read_pre_image(addr, 2), 0xabcd);
        }
    }

}
