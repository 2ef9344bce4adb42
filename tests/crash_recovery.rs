//! Crash-consistency tests.
//!
//! Each test drives the instrumentation hooks the way a compiled program
//! would, simulates a crash by tearing the process state down without the
//! clean-shutdown unlink, runs the recovery driver in-process, then reopens
//! the regions and checks what survived.

mod common;

use std::sync::mpsc;
use std::thread;

use common::{read_bytes, read_u64, read_u8, setup, write_bytes, write_u64, TestEnv};
use nvrt::api;
use nvrt::region::F_READWRITE;

/// Initialize the runtime, create one region, and allocate a word in it.
fn init_with_word(env: &TestEnv, region: &str) -> (u32, u64) {
    api::nvm_initialize_with(env.cfg.clone()).unwrap();
    let (id, _) = api::find_or_create_region(region, F_READWRITE).unwrap();
    let p = api::nvm_alloc(8, id).unwrap();
    (id, p)
}

/// The instrumented equivalent of `*addr = value` inside a critical
/// section.
fn logged_store(addr: u64, value: u64) {
    api::nvm_store(addr, 64);
    write_u64(addr, value);
    api::nvm_barrier(addr);
}

// S1: a store inside a never-released critical section rolls back.
#[test]
fn test_uncommitted_store_rolled_back() {
    let env = setup("s1_store");
    let (_, x) = init_with_word(&env, "r");

    let lock = 0x10c0u64;

    api::nvm_acquire(lock);
    logged_store(x, 7);
    // Crash before the release reaches the log.
    api::nvm_exit_unclean();

    let outcome = api::recover_program(env.cfg.clone()).unwrap();
    assert!(!outcome.nothing_to_do);
    assert!(outcome.sections_undone >= 1);
    // The log region is gone after a successful run.
    assert!(!env.cfg.region_path("logs_s1_store").exists());

    api::nvm_initialize_with(env.cfg.clone()).unwrap();
    api::find_region("r", F_READWRITE).unwrap();
    assert_eq!(read_u64(x), 0);
    api::nvm_finalize();
}

// S2: both sections completed; recovery preserves both.
#[test]
fn test_completed_sections_preserved() {
    let env = setup("s2_preserved");
    api::nvm_initialize_with(env.cfg.clone()).unwrap();
    let (id, _) = api::find_or_create_region("r", F_READWRITE).unwrap();
    let x = api::nvm_alloc(8, id).unwrap();
    let y = api::nvm_alloc(8, id).unwrap();
    let lock = 0x10c2u64;

    let t1 = thread::spawn(move || {
        api::nvm_acquire(lock);
        logged_store(x, 7);
        api::nvm_release(lock);
    });
    t1.join().unwrap();

    let t2 = thread::spawn(move || {
        api::nvm_acquire(lock);
        let seen = read_u64(x);
        logged_store(y, seen);
        api::nvm_release(lock);
    });
    t2.join().unwrap();

    api::nvm_exit_unclean();

    api::recover_program(env.cfg.clone()).unwrap();

    api::nvm_initialize_with(env.cfg.clone()).unwrap();
    api::find_region("r", F_READWRITE).unwrap();
    assert_eq!(read_u64(x), 7);
    assert_eq!(read_u64(y), 7);
    api::nvm_finalize();
}

// S3: the observer's section is incomplete, so the observed section rolls
// back with it — never a mixed state.
#[test]
fn test_observer_rollback_drags_publisher() {
    let mut env = setup("s3_dragged");
    // Keep the publisher's section in the log: background reclamation
    // could otherwise make it durable-in-place before the observer
    // acquires, which severs the edge (and legitimately preserves it).
    env.cfg.helper_reclaim = false;
    api::nvm_initialize_with(env.cfg.clone()).unwrap();
    let (id, _) = api::find_or_create_region("r", F_READWRITE).unwrap();
    let x = api::nvm_alloc(8, id).unwrap();
    let y = api::nvm_alloc(8, id).unwrap();
    let lock = 0x10c3u64;

    // Thread 1 completes its section.
    let t1 = thread::spawn(move || {
        api::nvm_acquire(lock);
        logged_store(x, 7);
        api::nvm_release(lock);
    });
    t1.join().unwrap();

    // Thread 2 observes it and crashes mid-section. The thread parks
    // until the crash so its log lane cannot be recycled.
    let (ready_tx, ready_rx) = mpsc::channel();
    let (crash_tx, crash_rx) = mpsc::channel::<()>();
    let t2 = thread::spawn(move || {
        api::nvm_acquire(lock);
        let seen = read_u64(x);
        logged_store(y, seen);
        ready_tx.send(()).unwrap();
        // No release: wait for the "crash".
        let _ = crash_rx.recv();
    });
    ready_rx.recv().unwrap();

    api::nvm_exit_unclean();
    drop(crash_tx);
    t2.join().unwrap();

    api::recover_program(env.cfg.clone()).unwrap();

    api::nvm_initialize_with(env.cfg.clone()).unwrap();
    api::find_region("r", F_READWRITE).unwrap();
    assert_eq!(read_u64(x), 0, "publisher section must roll back with its observer");
    assert_eq!(read_u64(y), 0);
    api::nvm_finalize();
}

// S4: memcpy undo restores the destination from the side-buffer.
#[test]
fn test_memcpy_rolled_back() {
    let env = setup("s4_memcpy");
    api::nvm_initialize_with(env.cfg.clone()).unwrap();
    let (id, _) = api::find_or_create_region("r", F_READWRITE).unwrap();
    let dst = api::nvm_alloc(64, id).unwrap();
    let lock = 0x10c4u64;

    // Committed contents.
    let before: Vec<u8> = (0..64u8).collect();
    api::nvm_begin_durable();
    api::nvm_memset(dst, 64);
    write_bytes(dst, &before);
    api::nvm_psync(dst, 64);
    api::nvm_end_durable();

    // Overwrite inside a section that never closes.
    let src = [0xa5u8; 64];
    api::nvm_acquire(lock);
    api::nvm_memcpy(dst, 64);
    write_bytes(dst, &src);
    api::nvm_psync(dst, 64);
    api::nvm_exit_unclean();

    api::recover_program(env.cfg.clone()).unwrap();

    api::nvm_initialize_with(env.cfg.clone()).unwrap();
    api::find_region("r", F_READWRITE).unwrap();
    assert_eq!(read_bytes(dst, 64), before);
    api::nvm_finalize();
}

// S5: an allocation whose section never committed becomes invisible.
#[test]
fn test_uncommitted_alloc_released() {
    let env = setup("s5_alloc");
    api::nvm_initialize_with(env.cfg.clone()).unwrap();
    let (id, _) = api::find_or_create_region("r", F_READWRITE).unwrap();
    let lock = 0x10c5u64;

    api::nvm_acquire(lock);
    let p = api::nvm_alloc(32, id).unwrap();
    let flag = nvrt::heap::flag_addr(p);
    assert_eq!(read_u8(flag), 1);
    logged_store(p, 0x5eed);
    api::nvm_exit_unclean();

    api::recover_program(env.cfg.clone()).unwrap();

    api::nvm_initialize_with(env.cfg.clone()).unwrap();
    api::find_region("r", F_READWRITE).unwrap();
    assert_eq!(read_u8(flag), 0, "in-use flag must roll back to free");
    api::nvm_finalize();
}

// A free in the same never-committed section restores the flag through
// both undos: free → in-use, then alloc → free.
#[test]
fn test_alloc_free_same_section() {
    let env = setup("s5b_alloc_free");
    api::nvm_initialize_with(env.cfg.clone()).unwrap();
    let (id, _) = api::find_or_create_region("r", F_READWRITE).unwrap();
    let lock = 0x10c6u64;

    api::nvm_acquire(lock);
    let p = api::nvm_alloc(32, id).unwrap();
    let flag = nvrt::heap::flag_addr(p);
    api::nvm_free(p).unwrap();
    assert_eq!(read_u8(flag), 0);
    api::nvm_exit_unclean();

    api::recover_program(env.cfg.clone()).unwrap();

    api::nvm_initialize_with(env.cfg.clone()).unwrap();
    api::find_region("r", F_READWRITE).unwrap();
    assert_eq!(read_u8(flag), 0);
    api::nvm_finalize();
}

// S6 lives in region_lifecycle.rs; here: recovery is idempotent.
#[test]
fn test_recovery_idempotent() {
    let env = setup("p6_idempotent");
    let (_, x) = init_with_word(&env, "r");
    let lock = 0x10c7u64;

    api::nvm_acquire(lock);
    logged_store(x, 41);
    api::nvm_exit_unclean();

    let first = api::recover_program(env.cfg.clone()).unwrap();
    assert!(!first.nothing_to_do);

    // The log is gone; a second run is a clean no-op.
    let second = api::recover_program(env.cfg.clone()).unwrap();
    assert!(second.nothing_to_do);

    api::nvm_initialize_with(env.cfg.clone()).unwrap();
    api::find_region("r", F_READWRITE).unwrap();
    assert_eq!(read_u64(x), 0);
    api::nvm_finalize();
}

// Recovery with no log at all exits cleanly.
#[test]
fn test_recover_nothing_to_do() {
    let env = setup("no_log");
    let outcome = api::recover_program(env.cfg.clone()).unwrap();
    assert!(outcome.nothing_to_do);
}

// A 128-bit store emits two entries and both halves roll back.
#[test]
fn test_wide_store_rolled_back() {
    let env = setup("wide_store");
    api::nvm_initialize_with(env.cfg.clone()).unwrap();
    let (id, _) = api::find_or_create_region("r", F_READWRITE).unwrap();
    let p = api::nvm_alloc(16, id).unwrap();
    let lock = 0x10c8u64;

    // Committed baseline.
    api::nvm_begin_durable();
    logged_store(p, 0x1111);
    logged_store(p + 8, 0x2222);
    api::nvm_end_durable();

    api::nvm_acquire(lock);
    api::nvm_store(p, 128);
    write_u64(p, 0xaaaa);
    write_u64(p + 8, 0xbbbb);
    api::nvm_barrier(p);
    api::nvm_barrier(p + 8);
    api::nvm_exit_unclean();

    api::recover_program(env.cfg.clone()).unwrap();

    api::nvm_initialize_with(env.cfg.clone()).unwrap();
    api::find_region("r", F_READWRITE).unwrap();
    assert_eq!(read_u64(p), 0x1111);
    assert_eq!(read_u64(p + 8), 0x2222);
    api::nvm_finalize();
}

// An explicit durable section behaves like a lock-bracketed one.
#[test]
fn test_durable_section_rollback_and_commit() {
    let env = setup("durable_sections");
    let (_, x) = init_with_word(&env, "r");

    // Committed section survives.
    api::nvm_begin_durable();
    logged_store(x, 5);
    api::nvm_end_durable();

    // Open section rolls back.
    api::nvm_begin_durable();
    logged_store(x, 9);
    api::nvm_exit_unclean();

    api::recover_program(env.cfg.clone()).unwrap();

    api::nvm_initialize_with(env.cfg.clone()).unwrap();
    api::find_region("r", F_READWRITE).unwrap();
    assert_eq!(read_u64(x), 5);
    api::nvm_finalize();
}

// Nested acquires form one section: only the outermost release commits.
#[test]
fn test_nested_locks_single_section() {
    let env = setup("nested_locks");
    let (_, x) = init_with_word(&env, "r");
    let outer = 0xaaa1u64;
    let inner = 0xaaa2u64;

    api::nvm_acquire(outer);
    api::nvm_acquire(inner);
    logged_store(x, 3);
    api::nvm_release(inner);
    // Inner released, outer still held: the section is not committed.
    api::nvm_exit_unclean();

    api::recover_program(env.cfg.clone()).unwrap();

    api::nvm_initialize_with(env.cfg.clone()).unwrap();
    api::find_region("r", F_READWRITE).unwrap();
    assert_eq!(read_u64(x), 0);
    api::nvm_finalize();
}

// An open section's acquire observed the release of an earlier completed
// section on the same lock, so both share the rollback — the release and
// its observer are never split.
#[test]
fn test_same_lock_history_dragged() {
    let mut env = setup("same_lock_cascade");
    env.cfg.helper_reclaim = false;
    let (_, x) = init_with_word(&env, "r");
    let lock = 0xddd1u64;

    api::nvm_acquire(lock);
    logged_store(x, 1);
    api::nvm_release(lock);

    api::nvm_acquire(lock);
    logged_store(x, 2);
    api::nvm_exit_unclean();

    api::recover_program(env.cfg.clone()).unwrap();

    api::nvm_initialize_with(env.cfg.clone()).unwrap();
    api::find_region("r", F_READWRITE).unwrap();
    // The completed section rolls back with its observer: back to the
    // original zero, not the intermediate 1.
    assert_eq!(read_u64(x), 0);
    api::nvm_finalize();
}

// Randomized pre-image check: every store logged before the crash reads
// back its committed pre-image after recovery.
#[test]
fn test_random_preimages_restored() {
    use rand::{Rng, SeedableRng};
    let mut rng = rand::rngs::StdRng::seed_from_u64(0x5eed);

    let env = setup("random_preimages");
    api::nvm_initialize_with(env.cfg.clone()).unwrap();
    let (id, _) = api::find_or_create_region("r", F_READWRITE).unwrap();
    // Distinct locks: had the scribbling section taken the baseline's
    // lock, its rollback would drag the baseline section with it.
    let baseline_lock = 0xabc1u64;
    let scribble_lock = 0xabc2u64;

    let slots: Vec<u64> = (0..32)
        .map(|_| api::nvm_alloc(8, id).unwrap())
        .collect();

    // Committed baseline values.
    let baseline: Vec<u64> = (0..32).map(|_| rng.gen()).collect();
    api::nvm_acquire(baseline_lock);
    for (&slot, &value) in slots.iter().zip(&baseline) {
        logged_store(slot, value);
    }
    api::nvm_release(baseline_lock);

    // Scribble over everything in an uncommitted section.
    api::nvm_acquire(scribble_lock);
    for &slot in &slots {
        logged_store(slot, rng.gen());
    }
    api::nvm_exit_unclean();

    api::recover_program(env.cfg.clone()).unwrap();

    api::nvm_initialize_with(env.cfg.clone()).unwrap();
    api::find_region("r", F_READWRITE).unwrap();
    for (&slot, &value) in slots.iter().zip(&baseline) {
        assert_eq!(read_u64(slot), value);
    }
    api::nvm_finalize();
}

// Helper-batched mode: the user thread skips data flushes, the helper
// supplies them, and committed sections still survive the crash.
#[test]
fn test_helper_batched_mode() {
    let mut env = setup("batched_mode");
    env.cfg.helper_batched = true;

    api::nvm_initialize_with(env.cfg.clone()).unwrap();
    let (id, _) = api::find_or_create_region("r", F_READWRITE).unwrap();
    let x = api::nvm_alloc(8, id).unwrap();
    let lock = 0xbbb1u64;

    api::nvm_acquire(lock);
    logged_store(x, 77);
    api::nvm_release(lock);

    // Give the helper a moment to flush and reclaim, then crash.
    thread::sleep(std::time::Duration::from_millis(50));
    api::nvm_exit_unclean();

    api::recover_program(env.cfg.clone()).unwrap();

    api::nvm_initialize_with(env.cfg.clone()).unwrap();
    api::find_region("r", F_READWRITE).unwrap();
    assert_eq!(read_u64(x), 77);
    api::nvm_finalize();
}

// Reader-writer locks: two readers may observe the same release; both
// stay consistent with it.
#[test]
fn test_rwlock_readers_preserved() {
    let env = setup("rw_readers");
    api::nvm_initialize_with(env.cfg.clone()).unwrap();
    let (id, _) = api::find_or_create_region("r", F_READWRITE).unwrap();
    let x = api::nvm_alloc(8, id).unwrap();
    let y = api::nvm_alloc(8, id).unwrap();
    let z = api::nvm_alloc(8, id).unwrap();
    let rw = 0xcc01u64;

    let writer = thread::spawn(move || {
        api::nvm_rwlock_wrlock(rw);
        logged_store(x, 10);
        api::nvm_rwlock_unlock(rw);
    });
    writer.join().unwrap();

    for &target in &[y, z] {
        let reader = thread::spawn(move || {
            api::nvm_rwlock_rdlock(rw);
            let seen = read_u64(x);
            logged_store(target, seen);
            api::nvm_rwlock_unlock(rw);
        });
        reader.join().unwrap();
    }

    api::nvm_exit_unclean();
    api::recover_program(env.cfg.clone()).unwrap();

    api::nvm_initialize_with(env.cfg.clone()).unwrap();
    api::find_region("r", F_READWRITE).unwrap();
    assert_eq!(read_u64(x), 10);
    assert_eq!(read_u64(y), 10);
    assert_eq!(read_u64(z), 10);
    api::nvm_finalize();
}
