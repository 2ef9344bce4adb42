//! Shared utilities for region-lifecycle and crash-recovery tests.
//!
//! Regions map at fixed virtual addresses and the managers are process-wide
//! singletons, so only one runtime may exist at a time: every test acquires
//! the runtime lock for its whole duration through [`setup`].

#![allow(dead_code)]

use std::sync::{Mutex, MutexGuard};

use tempfile::TempDir;

use nvrt::RuntimeConfig;

static RUNTIME_LOCK: Mutex<()> = Mutex::new(());

/// One test's isolated runtime environment: a private mount directory and
/// exclusive ownership of the fixed mapping window.
pub struct TestEnv {
    /// Temporary PM mount; removed on drop.
    pub dir: TempDir,
    /// Configuration pointing at the mount.
    pub cfg: RuntimeConfig,
    _guard: MutexGuard<'static, ()>,
}

/// Acquire the runtime lock and build a fresh environment for `progname`.
pub fn setup(progname: &str) -> TestEnv {
    let guard = RUNTIME_LOCK
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    let dir = TempDir::new().expect("tempdir");
    let cfg = RuntimeConfig {
        mount: dir.path().to_path_buf(),
        user: "tester".to_string(),
        progname: progname.to_string(),
        helper_batched: false,
        helper_reclaim: true,
        chunk_bytes: 4096,
    };
    TestEnv {
        dir,
        cfg,
        _guard: guard,
    }
}

/// Read a u64 from a mapped persistent address.
pub fn read_u64(addr: u64) -> u64 {
    unsafe { std::ptr::read_volatile(addr as *const u64) }
}

/// Write a u64 to a mapped persistent address (the raw store an
/// instrumented program would perform between `nvm_store` and
/// `nvm_barrier`).
pub fn write_u64(addr: u64, value: u64) {
    unsafe { std::ptr::write_volatile(addr as *mut u64, value) }
}

/// Read one byte from a mapped persistent address.
pub fn read_u8(addr: u64) -> u8 {
    unsafe { std::ptr::read_volatile(addr as *const u8) }
}

/// Read `len` bytes from a mapped persistent address.
pub fn read_bytes(addr: u64, len: usize) -> Vec<u8> {
    let mut out = vec![0u8; len];
    unsafe {
        std::ptr::copy_nonoverlapping(addr as *const u8, out.as_mut_ptr(), len);
    }
    out
}

/// Write `bytes` to a mapped persistent address.
pub fn write_bytes(addr: u64, bytes: &[u8]) {
    unsafe {
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), addr as *mut u8, bytes.len());
    }
}
