//! nvrt - failure-atomic persistent memory runtime
//!
//! Gives multithreaded programs durable, crash-consistent updates to
//! byte-addressable persistent memory using ordinary lock-based code:
//! - **Persistent regions**: named files mapped at fixed virtual addresses,
//!   so pointers stored in PM stay valid across runs
//! - **Undo logging**: per-thread logs of pre-images, lock operations, and
//!   allocator events, flushed before the data they describe
//! - **Crash recovery**: an offline pass that rolls back every interrupted
//!   failure-atomic section together with the sections that observed it
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use nvrt::api;
//!
//! api::nvm_initialize()?;
//! let (id, _created) = api::find_or_create_region("inventory", nvrt::region::F_READWRITE)?;
//! let slot = api::nvm_alloc(8, id)?;
//!
//! api::nvm_acquire(lock_addr);            // instrumentation hook
//! api::nvm_store(slot, 64);               // log the pre-image
//! unsafe { *(slot as *mut u64) = 42 };    // the actual store
//! api::nvm_barrier(slot);                 // make it durable
//! api::nvm_release(lock_addr);
//!
//! api::nvm_finalize();
//! ```
//!
//! After a crash, run `recover <progname>` (or [`api::recover_program`])
//! before restarting the program.

#![warn(missing_docs)]
#![allow(dead_code)]

pub mod api;
pub mod config;
pub mod durability;
pub mod epoch;
pub mod error;
pub mod heap;
pub mod log;
pub mod recovery;
pub mod region;

// Re-exports for convenience
pub use config::RuntimeConfig;
pub use error::{NvError, Result};
pub use recovery::RecoveryOutcome;

/// Constants fixed at compile time.
pub mod constants {
    /// Size of every persistent region in bytes (256 MiB).
    pub const RGN_SIZE: u64 = 1 << 28;

    /// Maximum number of region slots in the table.
    pub const MAX_REGIONS: usize = 1024;

    /// Maximum number of threads that may log concurrently.
    pub const MAX_LOG_THREADS: usize = 64;

    /// Fixed virtual address of the region metadata table.
    pub const TABLE_VA_BASE: u64 = 0x5F00_0000_0000;

    /// Size of the region table mapping.
    pub const TABLE_BYTES: u64 = 1 << 17;

    /// First byte of the reserved window where regions map; region `id`
    /// lands at `REGION_VA_START + id * RGN_SIZE`.
    pub const REGION_VA_START: u64 = 0x6000_0000_0000;
}

/// Prelude module for common imports
pub mod prelude {
    pub use crate::api;
    pub use crate::config::RuntimeConfig;
    pub use crate::error::{NvError, Result};
    pub use crate::region::{F_READONLY, F_READWRITE};
}

#[cfg(test)]
mod tests {
    use super::constants::*;

    #[test]
    fn test_va_layout_disjoint() {
        // The table mapping must sit below the region window.
        assert!(TABLE_VA_BASE + TABLE_BYTES <= REGION_VA_START);
        // And the table must hold every slot.
        assert!(
            TABLE_BYTES as usize
                >= crate::region::table::SLOTS_OFFSET
                    + MAX_REGIONS * crate::region::table::SLOT_SIZE
        );
    }

    #[test]
    fn test_region_window_fits_user_space() {
        let end = REGION_VA_START + MAX_REGIONS as u64 * RGN_SIZE;
        assert!(end < 0x7FFF_0000_0000);
    }
}
