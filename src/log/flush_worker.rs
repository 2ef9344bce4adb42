//! Helper thread: batched data flushing and log reclamation.
//!
//! The worker blocks on a channel and is woken on each outermost FASE
//! close and at shutdown. A round walks every lane's committed prefix,
//! decides which closed FASEs are globally reclaimable, optionally batch-
//! flushes their data cache lines, advances the lane heads (each advance is
//! a single flushed word, so every lane publishes its recovery view
//! atomically), and returns the reclaimed chunks and side-buffers to the
//! arena.
//!
//! A closed FASE is reclaimable only when none of its releases is still
//! observed by an acquire that survives the round — otherwise a crash
//! could preserve the releaser while rolling back the observer. The
//! fixpoint below retracts candidates until that holds, and the publisher
//! table is purged of pointers into reclaimed space under the same lock
//! that serializes acquires, so no later acquire can observe a reclaimed
//! release.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::thread;

use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::constants::MAX_LOG_THREADS;
use crate::durability;
use crate::log::entry::{load_next, EntryKind, LogEntry};
use crate::log::manager::LogCore;

pub(crate) enum WorkerMsg {
    /// A FASE closed; run a reclamation round.
    Wake,
    /// Clean shutdown: run a final round, then exit.
    Stop,
    /// Crash-simulation shutdown: exit without touching PM.
    Abort,
}

/// Handle to the helper thread.
pub(crate) struct FlushWorker {
    tx: Sender<WorkerMsg>,
    handle: Mutex<Option<thread::JoinHandle<()>>>,
}

impl FlushWorker {
    pub(crate) fn spawn(core: Arc<LogCore>) -> Self {
        let (tx, rx) = unbounded::<WorkerMsg>();
        let handle = thread::Builder::new()
            .name("nvrt-flush".to_string())
            .spawn(move || worker_loop(core, rx))
            .expect("failed to spawn flush helper");
        Self {
            tx,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Signal that a FASE closed.
    pub(crate) fn wake(&self) {
        let _ = self.tx.send(WorkerMsg::Wake);
    }

    /// Run a final round and join.
    pub(crate) fn stop(&self) {
        if let Some(handle) = self.handle.lock().take() {
            let _ = self.tx.send(WorkerMsg::Stop);
            let _ = handle.join();
        }
    }

    /// Join without a final round; on-PM state is left untouched.
    pub(crate) fn abort(&self) {
        if let Some(handle) = self.handle.lock().take() {
            let _ = self.tx.send(WorkerMsg::Abort);
            let _ = handle.join();
        }
    }
}

impl Drop for FlushWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(core: Arc<LogCore>, rx: Receiver<WorkerMsg>) {
    if !core.reclaim {
        // Reclamation disabled: the log retains its full history until the
        // clean-shutdown unlink. Wait out the shutdown message.
        while let Ok(msg) = rx.recv() {
            match msg {
                WorkerMsg::Wake => continue,
                WorkerMsg::Stop | WorkerMsg::Abort => return,
            }
        }
        return;
    }

    while let Ok(msg) = rx.recv() {
        match msg {
            WorkerMsg::Wake => {
                // Coalesce a burst of FASE closes into one round.
                while let Ok(extra) = rx.try_recv() {
                    match extra {
                        WorkerMsg::Wake => continue,
                        WorkerMsg::Stop => {
                            run_round(&core);
                            return;
                        }
                        WorkerMsg::Abort => return,
                    }
                }
                run_round(&core);
            }
            WorkerMsg::Stop => {
                run_round(&core);
                return;
            }
            WorkerMsg::Abort => return,
        }
    }
}

/// One closed FASE (or a self-committed entry outside any FASE).
struct Segment {
    entries: Vec<u64>,
    /// Release-class entry addresses within the segment.
    releases: Vec<u64>,
    /// Publisher pointers observed by acquire-class entries within.
    observed: Vec<u64>,
}

struct LaneScan {
    /// Closed segments inside the committed prefix, in order.
    segments: Vec<Segment>,
    /// Last entry of the committed prefix (0 when none).
    committed: u64,
}

/// Sentinel lane index for observers outside every candidate.
const OUTSIDE: usize = usize::MAX;

fn run_round(core: &LogCore) {
    // Phase 1: snapshot each lane's stable prefix.
    let mut snapshots = Vec::with_capacity(MAX_LOG_THREADS);
    for lane in 0..MAX_LOG_THREADS {
        let writer = core.writers[lane].lock();
        snapshots.push((writer.first, writer.committed_upto));
    }

    // Phase 2: segment the committed prefixes. Entries up to
    // `committed_upto` are stable: the owning writer only appends past
    // them, and reclamation (us) is single-threaded.
    let mut scans = Vec::with_capacity(MAX_LOG_THREADS);
    for &(first, committed) in &snapshots {
        scans.push(scan_lane(first, committed));
    }

    // Phase 3: decide what is reclaimable. The publisher lock serializes
    // this against new acquires, whose observed pointers we must not miss.
    let mut prune_upto: Vec<usize> = scans.iter().map(|s| s.segments.len()).collect();
    let pruned_sets: Vec<HashSet<u64>>;
    {
        let mut publishers = core.publishers.lock();

        // Who observes which release.
        let mut observers: HashMap<u64, Vec<(usize, usize)>> = HashMap::new();
        for (lane, scan) in scans.iter().enumerate() {
            for (seg_idx, seg) in scan.segments.iter().enumerate() {
                for &observed in &seg.observed {
                    observers.entry(observed).or_default().push((lane, seg_idx));
                }
            }
            // Acquires in the open suffix observe from outside the round.
            let suffix_start = if scan.committed != 0 {
                unsafe { load_next(scan.committed) }
            } else {
                snapshots[lane].0
            };
            for observed in scan_open_suffix(suffix_start) {
                observers.entry(observed).or_default().push((OUTSIDE, 0));
            }
        }

        // Retract candidates until no reclaimed release is observed from
        // outside the reclaimed set.
        loop {
            let mut changed = false;
            for lane in 0..scans.len() {
                'seg: for seg_idx in 0..prune_upto[lane] {
                    for &release in &scans[lane].segments[seg_idx].releases {
                        let Some(watchers) = observers.get(&release) else {
                            continue;
                        };
                        for &(w_lane, w_seg) in watchers {
                            let outside = w_lane == OUTSIDE || w_seg >= prune_upto[w_lane];
                            if outside {
                                prune_upto[lane] = seg_idx;
                                changed = true;
                                break 'seg;
                            }
                        }
                    }
                }
            }
            if !changed {
                break;
            }
        }

        // Collect the reclaimed entries and purge publisher slots pointing
        // into them; later acquires then record 0, a graph leaf.
        pruned_sets = scans
            .iter()
            .enumerate()
            .map(|(lane, scan)| {
                scan.segments[..prune_upto[lane]]
                    .iter()
                    .flat_map(|seg| seg.entries.iter().copied())
                    .collect::<HashSet<u64>>()
            })
            .collect();
        let all_pruned: HashSet<u64> = pruned_sets.iter().flatten().copied().collect();
        if !all_pruned.is_empty() {
            publishers.retain(|_, entry| !all_pruned.contains(entry));
        }
    }

    let reclaimed: usize = pruned_sets.iter().map(|s| s.len()).sum();
    if reclaimed == 0 {
        return;
    }

    // Phase 4: in batched mode the user threads skipped their data
    // flushes; supply them in bulk before anything is declared durable.
    if core.batched {
        for set in &pruned_sets {
            for &entry_addr in set {
                let Some(entry) = (unsafe { LogEntry::read_from(entry_addr) }) else {
                    continue;
                };
                if entry.kind.is_data() {
                    let len = if entry.kind == EntryKind::Str {
                        (entry.size as u64).div_ceil(8)
                    } else {
                        entry.size as u64
                    };
                    durability::flush_range(entry.addr as usize, len as usize);
                }
            }
        }
    }
    durability::pm_drain();

    // Phase 5: advance each lane head past its reclaimed prefix, then
    // recycle the space.
    for (lane, scan) in scans.iter().enumerate() {
        if pruned_sets[lane].is_empty() {
            continue;
        }
        let mut writer = core.writers[lane].lock();
        let new_head = match scan.segments.get(prune_upto[lane]) {
            Some(next_seg) => next_seg.entries[0],
            // Everything we saw went; whatever was appended since is the
            // new chain (its link is already on PM).
            None => {
                let last = scan.segments[prune_upto[lane] - 1]
                    .entries
                    .last()
                    .copied()
                    .unwrap_or(0);
                unsafe { load_next(last) }
            }
        };
        writer.prune(&core.header, &core.arena, new_head, &pruned_sets[lane]);
    }

    debug!(reclaimed, "log reclamation round complete");
}

/// Split `[first ..= committed]` into closed segments.
fn scan_lane(first: u64, committed: u64) -> LaneScan {
    let mut scan = LaneScan {
        segments: Vec::new(),
        committed,
    };
    if first == 0 || committed == 0 {
        return scan;
    }

    let mut depth = 0u32;
    let mut current = Segment {
        entries: Vec::new(),
        releases: Vec::new(),
        observed: Vec::new(),
    };
    let mut cursor = first;
    loop {
        let Some(entry) = (unsafe { LogEntry::read_from(cursor) }) else {
            warn!(addr = cursor, "unreadable log entry during reclamation scan");
            scan.segments.clear();
            return scan;
        };

        current.entries.push(cursor);
        if entry.kind.observes_publisher() && entry.value_or_ptr != 0 {
            current.observed.push(entry.value_or_ptr);
        }
        if entry.kind.publishes() {
            current.releases.push(cursor);
        }
        if entry.kind.opens_section() {
            depth += 1;
        } else if entry.kind.closes_section() {
            depth = depth.saturating_sub(1);
        }

        if depth == 0 {
            scan.segments.push(current);
            current = Segment {
                entries: Vec::new(),
                releases: Vec::new(),
                observed: Vec::new(),
            };
        }

        if cursor == committed {
            break;
        }
        // Acquire load: the owning writer may be appending concurrently.
        cursor = unsafe { load_next(cursor) };
        if cursor == 0 {
            break;
        }
    }

    // A trailing unclosed segment is not a candidate.
    scan
}

/// Collect the publisher pointers observed by acquire-class entries in the
/// open suffix starting at `cursor`.
fn scan_open_suffix(mut cursor: u64) -> Vec<u64> {
    let mut observed = Vec::new();
    while cursor != 0 {
        let Some(entry) = (unsafe { LogEntry::read_from(cursor) }) else {
            break;
        };
        if entry.kind.observes_publisher() && entry.value_or_ptr != 0 {
            observed.push(entry.value_or_ptr);
        }
        cursor = unsafe { load_next(cursor) };
    }
    observed
}
