//! Thread registry and epoch-based reclamation.
//!
//! Two facilities live here. First, a process-wide allocator of small thread
//! slots: every thread that touches the logger or the extent map gets a
//! stable index below [`MAX_LOG_THREADS`](crate::constants::MAX_LOG_THREADS),
//! recycled when the thread exits. The slot doubles as the thread's log lane
//! and its row in the epoch table.
//!
//! Second, a lightweight epoch scheme used to retire displaced extent maps:
//! readers protect their slot around a lock-free traversal, mutators bump
//! the global epoch with a deferred drop, and the drain list runs the drop
//! once no reader can still hold the old version.

use std::cell::{RefCell, UnsafeCell};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::OnceLock;

use parking_lot::Mutex;

use crate::constants::MAX_LOG_THREADS;
use crate::error::{NvError, Result};

// ============ Thread slot allocation ============

static NEXT_SLOT: AtomicUsize = AtomicUsize::new(0);

static FREE_SLOTS: OnceLock<Mutex<Vec<usize>>> = OnceLock::new();

fn free_slots() -> &'static Mutex<Vec<usize>> {
    FREE_SLOTS.get_or_init(|| Mutex::new(Vec::new()))
}

#[derive(Debug)]
struct SlotGuard {
    id: usize,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        if let Some(free) = FREE_SLOTS.get() {
            free.lock().push(self.id);
        }
    }
}

fn try_allocate_slot() -> Option<SlotGuard> {
    if let Some(id) = free_slots().lock().pop() {
        return Some(SlotGuard { id });
    }

    match NEXT_SLOT.fetch_update(Ordering::AcqRel, Ordering::Acquire, |next| {
        if next < MAX_LOG_THREADS {
            Some(next + 1)
        } else {
            None
        }
    }) {
        Ok(id) => Some(SlotGuard { id }),
        // Another thread may have just returned a slot. Re-check before
        // giving up.
        Err(_) => free_slots().lock().pop().map(|id| SlotGuard { id }),
    }
}

thread_local! {
    static THREAD_SLOT: RefCell<Option<SlotGuard>> = const { RefCell::new(None) };
}

/// Get the calling thread's slot index, allocating one on first use.
///
/// # Errors
///
/// Returns [`NvError::TooManyThreads`] when more than `MAX_LOG_THREADS`
/// threads use the runtime concurrently.
#[inline]
pub fn thread_slot() -> Result<usize> {
    THREAD_SLOT
        .with(|slot| {
            let mut slot = slot.borrow_mut();
            if let Some(guard) = slot.as_ref() {
                return Some(guard.id);
            }
            let guard = try_allocate_slot()?;
            let id = guard.id;
            *slot = Some(guard);
            Some(id)
        })
        .ok_or(NvError::TooManyThreads)
}

// ============ Epoch protection ============

/// Epoch value meaning "this slot holds no protection".
pub const UNPROTECTED: u64 = 0;

const DRAIN_LIST_SIZE: usize = 64;

#[repr(C, align(64))]
struct Entry {
    local_epoch: AtomicU64,
}

impl Entry {
    const fn new() -> Self {
        Self {
            local_epoch: AtomicU64::new(UNPROTECTED),
        }
    }
}

/// Deferred action slot: a drop callback tagged with the epoch after which
/// it may run.
struct EpochAction {
    epoch: AtomicU64,
    callback: UnsafeCell<Option<Box<dyn FnOnce() + Send + 'static>>>,
}

impl EpochAction {
    const FREE: u64 = u64::MAX;
    const LOCKED: u64 = u64::MAX - 1;

    const fn new() -> Self {
        Self {
            epoch: AtomicU64::new(Self::FREE),
            callback: UnsafeCell::new(None),
        }
    }

    fn try_pop(&self, expected_epoch: u64) -> bool {
        match self.epoch.compare_exchange(
            expected_epoch,
            Self::LOCKED,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                let callback = unsafe { (*self.callback.get()).take() };
                self.epoch.store(Self::FREE, Ordering::Release);
                if let Some(cb) = callback {
                    cb();
                }
                true
            }
            Err(_) => false,
        }
    }

    fn try_push<F>(&self, trigger_epoch: u64, callback: F) -> std::result::Result<(), F>
    where
        F: FnOnce() + Send + 'static,
    {
        match self.epoch.compare_exchange(
            Self::FREE,
            Self::LOCKED,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                unsafe {
                    *self.callback.get() = Some(Box::new(callback));
                }
                self.epoch.store(trigger_epoch, Ordering::Release);
                Ok(())
            }
            Err(_) => Err(callback),
        }
    }
}

unsafe impl Send for EpochAction {}
unsafe impl Sync for EpochAction {}

/// Epoch protection table with a deferred-action drain list.
pub struct Epoch {
    table: Box<[Entry]>,
    drain_list: Box<[EpochAction]>,
    drain_count: AtomicU32,
    current: AtomicU64,
    safe_to_reclaim: AtomicU64,
}

impl Epoch {
    /// Create a fresh epoch table.
    pub fn new() -> Self {
        let table = (0..MAX_LOG_THREADS)
            .map(|_| Entry::new())
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let drain_list = (0..DRAIN_LIST_SIZE)
            .map(|_| EpochAction::new())
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            table,
            drain_list,
            drain_count: AtomicU32::new(0),
            current: AtomicU64::new(1),
            safe_to_reclaim: AtomicU64::new(0),
        }
    }

    /// Enter the protected region for `slot`.
    #[inline]
    pub fn protect(&self, slot: usize) -> u64 {
        debug_assert!(slot < MAX_LOG_THREADS);
        let epoch = self.current.load(Ordering::Acquire);
        self.table[slot].local_epoch.store(epoch, Ordering::Release);
        epoch
    }

    /// Leave the protected region for `slot`, draining ripe actions.
    #[inline]
    pub fn unprotect(&self, slot: usize) {
        debug_assert!(slot < MAX_LOG_THREADS);
        self.table[slot]
            .local_epoch
            .store(UNPROTECTED, Ordering::Release);
        if self.drain_count.load(Ordering::Acquire) > 0 {
            self.drain(self.current.load(Ordering::Acquire));
        }
    }

    /// Check whether `slot` currently holds protection.
    #[inline]
    pub fn is_protected(&self, slot: usize) -> bool {
        self.table[slot].local_epoch.load(Ordering::Acquire) != UNPROTECTED
    }

    /// Bump the epoch and register `callback` to run once every reader has
    /// moved past the displaced version.
    pub fn bump_with_action<F>(&self, callback: F) -> u64
    where
        F: FnOnce() + Send + 'static,
    {
        let prior_epoch = self.current.fetch_add(1, Ordering::AcqRel);

        let mut callback = Some(callback);
        for action in self.drain_list.iter() {
            if let Some(cb) = callback.take() {
                match action.try_push(prior_epoch, cb) {
                    Ok(()) => {
                        self.drain_count.fetch_add(1, Ordering::AcqRel);
                        self.drain(prior_epoch + 1);
                        return prior_epoch + 1;
                    }
                    Err(returned) => callback = Some(returned),
                }
            }
        }

        // Drain list saturated; wait for quiescence and run inline. Mutation
        // is bounded by the region count, so this path is cold.
        tracing::warn!("epoch drain list full; running retirement inline");
        self.wait_for_quiescence(prior_epoch);
        if let Some(cb) = callback {
            cb();
        }
        prior_epoch + 1
    }

    /// Recompute the safe-to-reclaim epoch and run any ripe actions.
    pub fn drain(&self, current_epoch: u64) {
        let safe = self.compute_safe_epoch(current_epoch);
        for action in self.drain_list.iter() {
            let trigger = action.epoch.load(Ordering::Acquire);
            if trigger == EpochAction::FREE || trigger == EpochAction::LOCKED || trigger > safe {
                continue;
            }
            if action.try_pop(trigger) && self.drain_count.fetch_sub(1, Ordering::AcqRel) == 1 {
                break;
            }
        }
    }

    /// Scan the table for the oldest ongoing epoch; everything strictly
    /// older is safe to reclaim.
    pub fn compute_safe_epoch(&self, current_epoch: u64) -> u64 {
        let mut oldest = current_epoch;
        for entry in self.table.iter() {
            let seen = entry.local_epoch.load(Ordering::Acquire);
            if seen != UNPROTECTED && seen < oldest {
                oldest = seen;
            }
        }
        let safe = oldest.saturating_sub(1);
        self.safe_to_reclaim.store(safe, Ordering::Release);
        safe
    }

    fn wait_for_quiescence(&self, target: u64) {
        loop {
            if self.compute_safe_epoch(self.current.load(Ordering::Acquire)) >= target {
                return;
            }
            std::thread::yield_now();
        }
    }
}

impl Default for Epoch {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    #[test]
    fn test_slot_allocation_stable_per_thread() {
        let a = thread_slot().unwrap();
        let b = thread_slot().unwrap();
        assert_eq!(a, b);
        assert!(a < MAX_LOG_THREADS);
    }

    #[test]
    fn test_slots_recycled_under_churn() {
        for _ in 0..(MAX_LOG_THREADS * 2) {
            std::thread::spawn(|| {
                let id = thread_slot().unwrap();
                assert!(id < MAX_LOG_THREADS);
            })
            .join()
            .unwrap();
        }
    }

    #[test]
    fn test_protect_unprotect() {
        let epoch = Epoch::new();
        assert!(!epoch.is_protected(0));
        epoch.protect(0);
        assert!(epoch.is_protected(0));
        epoch.unprotect(0);
        assert!(!epoch.is_protected(0));
    }

    #[test]
    fn test_action_runs_after_quiescence() {
        let epoch = Arc::new(Epoch::new());
        let fired = Arc::new(AtomicBool::new(false));

        // A protected reader pins the old epoch.
        epoch.protect(1);

        let fired_clone = fired.clone();
        epoch.bump_with_action(move || {
            fired_clone.store(true, Ordering::Release);
        });

        // Still protected: the action must not have run.
        epoch.drain(epoch.current.load(Ordering::Acquire));
        assert!(!fired.load(Ordering::Acquire));

        // Reader leaves; the action becomes ripe.
        epoch.unprotect(1);
        epoch.drain(epoch.current.load(Ordering::Acquire));
        assert!(fired.load(Ordering::Acquire));
    }

    #[test]
    fn test_safe_epoch_tracks_oldest_reader() {
        let epoch = Epoch::new();
        epoch.current.store(5, Ordering::Release);
        epoch.protect(0);
        let safe = epoch.compute_safe_epoch(10);
        assert_eq!(safe, 4);
        epoch.unprotect(0);
        let safe = epoch.compute_safe_epoch(10);
        assert_eq!(safe, 9);
    }
}
