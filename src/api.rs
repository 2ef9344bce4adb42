//! Instrumentation ABI and region API.
//!
//! The free functions here are the runtime's outer surface: the compiler
//! pass (or a hand-instrumented program) calls the `nvm_*` hooks around
//! ordinary stores, memory intrinsics, and lock operations. Every logging
//! hook is a silent no-op until [`nvm_initialize`] runs and after
//! [`nvm_finalize`] — the safety net that lets instrumented code run
//! outside the runtime's lifetime.
//!
//! Addresses are plain `u64` virtual addresses. Pointers into persistent
//! regions are stable across runs, so callers may persist them freely.

use std::sync::Arc;

use tracing::warn;

use crate::config::RuntimeConfig;
use crate::durability;
use crate::error::{NvError, Result};
use crate::heap;
use crate::log::LogManager;
use crate::recovery::{self, RecoveryOutcome};
use crate::region::RegionManager;

/// Initialize the runtime using environment-derived configuration.
pub fn nvm_initialize() -> Result<()> {
    nvm_initialize_with(RuntimeConfig::load_from_env()?)
}

/// Initialize the runtime with an explicit configuration.
pub fn nvm_initialize_with(cfg: RuntimeConfig) -> Result<()> {
    let regions = RegionManager::create_instance(cfg)?;
    LogManager::create_instance(&regions)?;
    Ok(())
}

/// Whether the runtime is initialized.
pub fn nvm_is_initialized() -> bool {
    LogManager::has_instance()
}

/// Clean shutdown: flush outstanding work, unlink the log, unmap regions.
pub fn nvm_finalize() {
    LogManager::delete_instance();
    RegionManager::delete_instance();
}

/// Tear down process state while leaving every on-PM byte exactly as an
/// instantaneous crash would. Crash-testing surface: a subsequent
/// [`recover_program`] run behaves as if the process had died here.
pub fn nvm_exit_unclean() {
    LogManager::delete_instance_unclean();
    RegionManager::delete_instance();
}

/// Run crash recovery for the program named by `cfg.progname`.
pub fn recover_program(cfg: RuntimeConfig) -> Result<RecoveryOutcome> {
    recovery::recover(cfg)
}

fn with_log(op: &'static str, f: impl FnOnce(&LogManager) -> Result<()>) {
    if let Some(manager) = LogManager::instance() {
        if let Err(err) = f(&manager) {
            warn!(op, %err, "logging hook failed");
            debug_assert!(false, "{op} failed: {err}");
        }
    }
}

fn regions() -> Result<Arc<RegionManager>> {
    RegionManager::instance().ok_or(NvError::NoInstance)
}

// ---- lock and section hooks ----

/// Record a mutex acquire at `lock`.
pub fn nvm_acquire(lock: u64) {
    with_log("acquire", |m| m.log_acquire(lock));
}

/// Record a mutex release at `lock`.
pub fn nvm_release(lock: u64) {
    with_log("release", |m| m.log_release(lock));
}

/// Record a read-lock of the reader-writer lock at `lock`.
pub fn nvm_rwlock_rdlock(lock: u64) {
    with_log("rdlock", |m| m.log_rdlock(lock));
}

/// Record a write-lock of the reader-writer lock at `lock`.
pub fn nvm_rwlock_wrlock(lock: u64) {
    with_log("wrlock", |m| m.log_wrlock(lock));
}

/// Record an unlock of the reader-writer lock at `lock`.
pub fn nvm_rwlock_unlock(lock: u64) {
    with_log("rwunlock", |m| m.log_rwunlock(lock));
}

/// Open an explicit durable section regardless of lock nesting.
pub fn nvm_begin_durable() {
    with_log("begin_durable", |m| m.log_begin_durable());
}

/// Close an explicit durable section.
pub fn nvm_end_durable() {
    with_log("end_durable", |m| m.log_end_durable());
}

// ---- store and memory-op hooks ----

/// Record the pre-image of an upcoming `bits`-bit store to `addr`. The
/// caller performs the store next, then calls [`nvm_barrier`].
pub fn nvm_store(addr: u64, bits: u32) {
    with_log("store", |m| m.log_store(addr, bits));
}

/// Record the pre-image of an upcoming `memset` over `[addr, addr+len)`.
pub fn nvm_memset(addr: u64, len: u64) {
    with_log("memset", |m| m.log_memset(addr, len));
}

/// Record the destination pre-image of an upcoming `memcpy`.
pub fn nvm_memcpy(dst: u64, len: u64) {
    with_log("memcpy", |m| m.log_memcpy(dst, len));
}

/// Record the destination pre-image of an upcoming `memmove`.
pub fn nvm_memmove(dst: u64, len: u64) {
    with_log("memmove", |m| m.log_memmove(dst, len));
}

/// Record the destination pre-image of an upcoming `strcpy` of `len` bytes
/// (including the terminator).
pub fn nvm_strcpy(dst: u64, len: u64) {
    with_log("strcpy", |m| m.log_strcpy(dst, len));
}

/// Record the destination pre-image of an upcoming `strcat`.
pub fn nvm_strcat(dst: u64, len: u64) {
    with_log("strcat", |m| m.log_strcat(dst, len));
}

/// Length of the NUL-terminated string at `s`, in bytes.
///
/// # Safety contract
///
/// `s` must point at a NUL-terminated byte string in mapped memory; the
/// instrumentation only calls this on such operands.
pub fn nvm_strlen(s: u64) -> u64 {
    let mut len = 0u64;
    unsafe {
        while std::ptr::read_volatile((s + len) as *const u8) != 0 {
            len += 1;
        }
    }
    len
}

// ---- allocator hooks ----

/// Record an allocation; `flag` is the block's in-use flag address.
pub fn nvm_log_alloc(flag: u64) {
    with_log("log_alloc", |m| m.log_alloc(flag));
}

/// Record a free; `flag` is the block's in-use flag address.
pub fn nvm_log_free(flag: u64) {
    with_log("log_free", |m| m.log_free(flag));
}

// ---- durability hooks ----

/// Make the store at `addr` durable. In helper-batched mode this is a
/// no-op on the user thread; the helper supplies the data flush in bulk.
pub fn nvm_barrier(addr: u64) {
    if let Some(manager) = LogManager::instance() {
        if manager.batched() {
            return;
        }
    }
    durability::nvm_barrier(addr as usize);
}

/// Flush `[addr, addr+len)` and drain. Precondition: all log entries for
/// the range are durable.
pub fn nvm_psync(addr: u64, len: u64) {
    durability::psync(addr as usize, len as usize);
}

/// Acquire-flavored [`nvm_psync`]: used by the instrumentation after
/// memcpy-class intrinsics before dependent loads.
pub fn nvm_psync_acq(addr: u64, len: u64) {
    durability::psync(addr as usize, len as usize);
}

/// Helper-batched replacement for the post-store barrier; present so the
/// instrumentation can bind it unconditionally.
pub fn async_data_flush(addr: u64) {
    nvm_barrier(addr);
}

/// Helper-batched replacement for the post-memop flush.
pub fn async_memop_data_flush(addr: u64, len: u64) {
    if let Some(manager) = LogManager::instance() {
        if manager.batched() {
            return;
        }
    }
    durability::psync(addr as usize, len as usize);
}

// ---- region API ----

/// Find the named region or create it. Returns `(id, created)`.
pub fn find_or_create_region(name: &str, flags: u32) -> Result<(u32, bool)> {
    regions()?.find_or_create(name, flags)
}

/// Find an existing region.
pub fn find_region(name: &str, flags: u32) -> Result<u32> {
    regions()?.find(name, flags, false)
}

/// Create a region; fails if it already exists.
pub fn create_region(name: &str, flags: u32) -> Result<u32> {
    regions()?.create(name, flags)
}

/// Unmap a region, keeping its table slot.
pub fn close_region(id: u32) -> Result<()> {
    regions()?.close(id);
    Ok(())
}

/// Delete a region: mark its slot, unlink its file.
pub fn delete_region(name: &str) -> Result<()> {
    regions()?.delete(name)
}

/// Read the root pointer of region `id`.
pub fn get_region_root(id: u32) -> Result<u64> {
    Ok(regions()?.get_root(id))
}

/// Publish the root pointer of region `id`; behaves as a release.
pub fn set_region_root(id: u32, root: u64) -> Result<()> {
    regions()?.set_root(id, root);
    Ok(())
}

/// Whether `[addr, addr+size)` lies inside one open region.
pub fn is_in_open_region(addr: u64, size: u64) -> bool {
    match RegionManager::instance() {
        Some(regions) => regions.is_in_open_region(addr, size),
        None => false,
    }
}

/// Allocate `size` bytes in region `id`, logging the allocation when the
/// runtime is initialized. Returns the payload address.
pub fn nvm_alloc(size: u64, id: u32) -> Result<u64> {
    let payload = regions()?.alloc(id, size)?;
    let flag = heap::flag_addr(payload);
    nvm_log_alloc(flag);
    heap::set_in_use(flag, true);
    Ok(payload)
}

/// Free a block previously returned by [`nvm_alloc`], logging the free.
pub fn nvm_free(addr: u64) -> Result<()> {
    let flag = heap::flag_addr(addr);
    nvm_log_free(flag);
    heap::set_in_use(flag, false);
    regions()?.release_block(addr)
}
