//! Persistent Region Manager.
//!
//! Process-wide owner of the region table, the open-region state, and the
//! extent map. Regions are files mapped `MAP_SHARED` at fixed virtual
//! addresses — `REGION_VA_START + id * RGN_SIZE` — so persistent pointers
//! stay valid across runs. The kernel returning any other address is fatal.
//!
//! Mutating operations hold the intra-process table mutex plus an exclusive
//! `flock` on the table file, serializing against other processes. I/O
//! failures on region files abort: recovery is the only retry mechanism.

use std::fs::{self, File, OpenOptions};
use std::os::fd::AsRawFd;
use std::path::Path;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::RuntimeConfig;
use crate::constants::{MAX_REGIONS, REGION_VA_START, RGN_SIZE, TABLE_BYTES, TABLE_VA_BASE};
use crate::error::{NvError, Result};
use crate::heap::RegionHeap;
use crate::region::extent_map::ExtentMap;
use crate::region::table::{RegionTable, SlotRecord, MAX_NAME_LEN};

/// Region opened for reading and writing.
pub const F_READWRITE: u32 = 0x1;
/// Region opened read-only.
pub const F_READONLY: u32 = 0x2;

/// Fixed base address for region `id`.
#[inline]
pub fn region_base(id: u32) -> u64 {
    REGION_VA_START + id as u64 * RGN_SIZE
}

/// Region id owning `addr` if it lies in the reserved window.
#[inline]
fn region_id_of(addr: u64) -> Option<u32> {
    if addr < REGION_VA_START {
        return None;
    }
    let id = (addr - REGION_VA_START) / RGN_SIZE;
    (id < MAX_REGIONS as u64).then_some(id as u32)
}

struct OpenRegion {
    _file: File,
    base: u64,
    heap: Option<RegionHeap>,
}

struct ManagerInner {
    open: Vec<Option<OpenRegion>>,
}

/// Process-wide singleton managing persistent regions.
pub struct RegionManager {
    cfg: RuntimeConfig,
    table_file: File,
    table: RegionTable,
    inner: Mutex<ManagerInner>,
    extents: ExtentMap,
}

static INSTANCE: RwLock<Option<Arc<RegionManager>>> = RwLock::new(None);

/// Exclusive cross-process lock on the region table file.
struct TableFileLock<'a> {
    file: &'a File,
}

impl<'a> TableFileLock<'a> {
    fn acquire(file: &'a File) -> Self {
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
        assert!(rc == 0, "flock on region table failed: {}", last_os_error());
        Self { file }
    }
}

impl Drop for TableFileLock<'_> {
    fn drop(&mut self) {
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
    }
}

fn last_os_error() -> std::io::Error {
    std::io::Error::last_os_error()
}

/// Map `file` at exactly `base`. Any failure or address mismatch aborts.
fn map_fixed(file: &File, base: u64, len: u64, prot: libc::c_int) {
    #[cfg(target_os = "linux")]
    let flags = libc::MAP_SHARED | libc::MAP_FIXED_NOREPLACE;
    #[cfg(not(target_os = "linux"))]
    let flags = libc::MAP_SHARED;

    let ptr = unsafe {
        libc::mmap(
            base as *mut libc::c_void,
            len as libc::size_t,
            prot,
            flags,
            file.as_raw_fd(),
            0,
        )
    };
    assert!(
        ptr != libc::MAP_FAILED,
        "mmap of persistent region at {base:#x} failed: {}",
        last_os_error()
    );
    assert!(
        ptr as u64 == base,
        "kernel mapped persistent region at {:#x}, requested {base:#x}",
        ptr as u64
    );
}

fn unmap(base: u64, len: u64) {
    unsafe {
        libc::munmap(base as *mut libc::c_void, len as libc::size_t);
    }
}

/// Fsync the directory containing `path`, required by some storage hardware
/// after create/unlink.
fn sync_parent_dir(path: &Path) {
    if let Some(parent) = path.parent() {
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }
}

impl RegionManager {
    /// Create and install the process-wide instance.
    ///
    /// Creates the user directory tree and maps the region table at its
    /// fixed base. Idempotent per process: a second call returns the
    /// existing instance.
    pub fn create_instance(cfg: RuntimeConfig) -> Result<Arc<RegionManager>> {
        let mut guard = INSTANCE.write();
        if let Some(existing) = guard.as_ref() {
            return Ok(existing.clone());
        }

        fs::create_dir_all(cfg.regions_dir())?;

        let table_path = cfg.table_path();
        let created = !table_path.exists();
        let table_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&table_path)?;
        table_file.set_len(TABLE_BYTES)?;
        if created {
            sync_parent_dir(&table_path);
        }

        map_fixed(
            &table_file,
            TABLE_VA_BASE,
            TABLE_BYTES,
            libc::PROT_READ | libc::PROT_WRITE,
        );
        let table = unsafe { RegionTable::from_raw(TABLE_VA_BASE as usize, MAX_REGIONS as u32) };

        let manager = Arc::new(RegionManager {
            cfg,
            table_file,
            table,
            inner: Mutex::new(ManagerInner {
                open: (0..MAX_REGIONS).map(|_| None).collect(),
            }),
            extents: ExtentMap::new(),
        });

        info!(
            regions = manager.table.count(),
            "region manager initialized"
        );
        *guard = Some(manager.clone());
        Ok(manager)
    }

    /// Whether the process-wide instance exists.
    pub fn has_instance() -> bool {
        INSTANCE.read().is_some()
    }

    /// Get the process-wide instance.
    pub fn instance() -> Option<Arc<RegionManager>> {
        INSTANCE.read().clone()
    }

    /// Tear down the process-wide instance: unmap every open region and the
    /// table. On-PM state is untouched.
    pub fn delete_instance() {
        let taken = INSTANCE.write().take();
        if let Some(manager) = taken {
            let mut inner = manager.inner.lock();
            for slot in inner.open.iter_mut() {
                if let Some(open) = slot.take() {
                    unmap(open.base, RGN_SIZE);
                }
            }
            drop(inner);
            unmap(TABLE_VA_BASE, TABLE_BYTES);
        }
    }

    /// The configuration this instance was created with.
    pub fn config(&self) -> &RuntimeConfig {
        &self.cfg
    }

    /// Find an existing region or create it, returning `(id, created)`.
    pub fn find_or_create(&self, name: &str, flags: u32) -> Result<(u32, bool)> {
        validate_name(name)?;
        let mut inner = self.inner.lock();
        let _file_lock = TableFileLock::acquire(&self.table_file);

        if let Some(idx) = self.scan(name, false) {
            self.map_slot(&mut inner, idx, flags)?;
            return Ok((idx, false));
        }
        let id = self.create_locked(&mut inner, name, flags)?;
        Ok((id, true))
    }

    /// Find an existing region. `in_recovery` also resurrects deleted slots
    /// whose file still exists — recovery uses this to reach the log region
    /// after a crash.
    pub fn find(&self, name: &str, flags: u32, in_recovery: bool) -> Result<u32> {
        validate_name(name)?;
        let mut inner = self.inner.lock();
        let _file_lock = TableFileLock::acquire(&self.table_file);

        let idx = self
            .scan(name, in_recovery)
            .ok_or_else(|| NvError::RegionNotFound(name.to_string()))?;
        self.map_slot(&mut inner, idx, flags)?;
        Ok(idx)
    }

    /// Create a region; fails if it exists and is not deleted.
    pub fn create(&self, name: &str, flags: u32) -> Result<u32> {
        validate_name(name)?;
        let mut inner = self.inner.lock();
        let _file_lock = TableFileLock::acquire(&self.table_file);

        if self.scan(name, false).is_some() {
            return Err(NvError::RegionExists(name.to_string()));
        }
        self.create_locked(&mut inner, name, flags)
    }

    /// Unmap a region and close its file. The table slot is kept.
    pub fn close(&self, id: u32) {
        let mut inner = self.inner.lock();
        let open = inner.open[id as usize]
            .take()
            .unwrap_or_else(|| panic!("close of region {id} that is not mapped"));
        self.extents
            .delete(open.base, open.base + RGN_SIZE - 1, id);
        unmap(open.base, RGN_SIZE);
        debug!(id, "region closed");
    }

    /// Delete a region: mark the slot, close the mapping if open, unlink
    /// the file.
    pub fn delete(&self, name: &str) -> Result<()> {
        validate_name(name)?;
        let mut inner = self.inner.lock();
        let _file_lock = TableFileLock::acquire(&self.table_file);

        let idx = self
            .scan(name, false)
            .ok_or_else(|| NvError::RegionNotFound(name.to_string()))?;

        self.table.set_deleted(idx, true);

        if let Some(open) = inner.open[idx as usize].take() {
            self.extents
                .delete(open.base, open.base + RGN_SIZE - 1, idx);
            unmap(open.base, RGN_SIZE);
        }

        let path = self.cfg.region_path(name);
        match fs::remove_file(&path) {
            Ok(()) => sync_parent_dir(&path),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => panic!("unlink of region file {path:?} failed: {err}"),
        }
        info!(name, id = idx, "region deleted");
        Ok(())
    }

    /// Mark every slot deleted and unlink every region file.
    pub fn delete_forcefully_all(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        let _file_lock = TableFileLock::acquire(&self.table_file);

        for idx in 0..self.table.count() {
            let slot = self.table.read_slot(idx);
            if slot.deleted {
                continue;
            }
            self.table.set_deleted(idx, true);
            if let Some(open) = inner.open[idx as usize].take() {
                self.extents
                    .delete(open.base, open.base + RGN_SIZE - 1, idx);
                unmap(open.base, RGN_SIZE);
            }
            let path = self.cfg.region_path(&slot.name);
            match fs::remove_file(&path) {
                Ok(()) => sync_parent_dir(&path),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => panic!("unlink of region file {path:?} failed: {err}"),
            }
        }
        Ok(())
    }

    /// Publish the root pointer of region `id`.
    pub fn set_root(&self, id: u32, root: u64) {
        let inner = self.inner.lock();
        assert!(
            inner.open[id as usize].is_some(),
            "set_root on region {id} that is not mapped"
        );
        self.table.set_root(id, root);
    }

    /// Read the root pointer of region `id`.
    pub fn get_root(&self, id: u32) -> u64 {
        self.table.get_root(id)
    }

    /// Classify `[addr, addr + size)` against the open regions. The
    /// logger's hot-path primitive; wait-free.
    #[inline]
    pub fn open_region_id(&self, addr: u64, size: u64) -> Option<u32> {
        self.extents.find(addr, size)
    }

    /// Whether the span lies entirely within one open region.
    #[inline]
    pub fn is_in_open_region(&self, addr: u64, size: u64) -> bool {
        self.open_region_id(addr, size).is_some()
    }

    /// Map the region containing `addr` if it is not already mapped.
    /// Recovery uses this to demand-map user regions named by log entries.
    pub fn ensure_mapped(&self, addr: u64) -> Result<(u64, u32)> {
        if let Some(id) = self.extents.find(addr, 1) {
            return Ok((region_base(id), id));
        }

        let id = region_id_of(addr).ok_or(NvError::RegionNotFound(format!("addr {addr:#x}")))?;
        let mut inner = self.inner.lock();
        let _file_lock = TableFileLock::acquire(&self.table_file);

        if id >= self.table.count() {
            return Err(NvError::RegionNotFound(format!("addr {addr:#x}")));
        }
        // Deleted slots map too: a crash may have torn the deletion.
        self.map_slot(&mut inner, id, F_READWRITE)?;
        Ok((region_base(id), id))
    }

    /// Allocate `size` bytes from region `id`'s heap. The block's in-use
    /// flag is still clear; the caller logs the allocation and then sets it.
    pub fn alloc(&self, id: u32, size: u64) -> Result<u64> {
        let mut inner = self.inner.lock();
        let open = inner.open[id as usize]
            .as_mut()
            .unwrap_or_else(|| panic!("alloc from region {id} that is not mapped"));
        let base = open.base;
        let heap = open
            .heap
            .get_or_insert_with(|| unsafe { RegionHeap::attach(base, RGN_SIZE) });
        heap.alloc(size)
    }

    /// Return a block to its region's free list after the caller logged the
    /// free and cleared the flag.
    pub fn release_block(&self, payload: u64) -> Result<()> {
        let id = self
            .open_region_id(payload, 1)
            .ok_or(NvError::RegionNotFound(format!("addr {payload:#x}")))?;
        let mut inner = self.inner.lock();
        let open = inner.open[id as usize]
            .as_mut()
            .unwrap_or_else(|| panic!("free into region {id} that is not mapped"));
        let base = open.base;
        let heap = open
            .heap
            .get_or_insert_with(|| unsafe { RegionHeap::attach(base, RGN_SIZE) });
        heap.release(payload);
        Ok(())
    }

    // ---- internals ----

    /// Find the slot index for `name`. Deleted slots match only when
    /// `include_deleted`.
    fn scan(&self, name: &str, include_deleted: bool) -> Option<u32> {
        for idx in 0..self.table.count() {
            let slot = self.table.read_slot(idx);
            if slot.name == name && (!slot.deleted || include_deleted) {
                return Some(idx);
            }
        }
        None
    }

    /// Map slot `idx` if not already mapped, registering its extent.
    fn map_slot(&self, inner: &mut ManagerInner, idx: u32, flags: u32) -> Result<()> {
        if inner.open[idx as usize].is_some() {
            return Ok(());
        }
        let slot = self.table.read_slot(idx);
        let path = self.cfg.region_path(&slot.name);
        let file = match OpenOptions::new().read(true).write(true).open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound && slot.deleted => {
                return Err(NvError::RegionNotFound(slot.name));
            }
            Err(err) => panic!("open of region file {path:?} failed: {err}"),
        };

        let prot = if flags & F_READONLY != 0 {
            libc::PROT_READ
        } else {
            libc::PROT_READ | libc::PROT_WRITE
        };
        map_fixed(&file, slot.base, RGN_SIZE, prot);

        self.extents.insert(slot.base, slot.base + RGN_SIZE - 1, idx);
        inner.open[idx as usize] = Some(OpenRegion {
            _file: file,
            base: slot.base,
            heap: None,
        });
        debug!(id = idx, base = slot.base, "region mapped");
        Ok(())
    }

    /// Create a region under the held locks, preferring a deleted slot with
    /// the same name, then any deleted slot, then a fresh one.
    fn create_locked(&self, inner: &mut ManagerInner, name: &str, flags: u32) -> Result<u32> {
        let count = self.table.count();

        let mut reuse = None;
        for idx in 0..count {
            let slot = self.table.read_slot(idx);
            if slot.deleted {
                if slot.name == name {
                    reuse = Some(idx);
                    break;
                }
                if reuse.is_none() {
                    reuse = Some(idx);
                }
            }
        }

        let (idx, fresh) = match reuse {
            Some(idx) => (idx, false),
            None => {
                if count as usize >= MAX_REGIONS {
                    return Err(NvError::TooManyRegions);
                }
                (count, true)
            }
        };
        let base = region_base(idx);

        if !fresh {
            // A torn deletion may have left the previous file behind.
            let old = self.table.read_slot(idx);
            let stale = self.cfg.region_path(&old.name);
            if stale.exists() {
                warn!(name = %old.name, "removing file left by a torn deletion");
                let _ = fs::remove_file(&stale);
                sync_parent_dir(&stale);
            }
        }

        let path = self.cfg.region_path(name);
        let file = match OpenOptions::new().read(true).write(true).create(true).open(&path) {
            Ok(file) => file,
            Err(err) => panic!("create of region file {path:?} failed: {err}"),
        };
        if let Err(err) = file.set_len(RGN_SIZE) {
            panic!("sizing of region file {path:?} failed: {err}");
        }
        sync_parent_dir(&path);

        let record = SlotRecord {
            name: name.to_string(),
            id: idx,
            flags,
            // Reused slots commit by clearing the deleted byte after the
            // full slot is durable; fresh slots commit via the count word.
            deleted: !fresh,
            base,
            root: 0,
        };
        self.table.write_slot(idx, &record)?;
        if fresh {
            self.table.bump_count();
        } else {
            self.table.set_deleted(idx, false);
        }

        let prot = if flags & F_READONLY != 0 {
            libc::PROT_READ
        } else {
            libc::PROT_READ | libc::PROT_WRITE
        };
        map_fixed(&file, base, RGN_SIZE, prot);
        self.extents.insert(base, base + RGN_SIZE - 1, idx);
        inner.open[idx as usize] = Some(OpenRegion {
            _file: file,
            base,
            heap: None,
        });
        info!(name, id = idx, base, "region created");
        Ok(idx)
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(NvError::RegionNameTooLong(name.to_string()));
    }
    Ok(())
}
