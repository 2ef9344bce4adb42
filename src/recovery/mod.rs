//! Offline crash recovery.
//!
//! Invoked after a crash — normally as the separate `recover` process —
//! with the name of the crashed program. Only the log region is opened
//! eagerly; user regions demand-map when an undo touches them.
//!
//! The driver walks each lane once to rebuild the per-lane chains and the
//! release→acquire graph, then decides which sections roll back:
//!
//! * a section left open at the crash rolls back, along with everything
//!   after it on the same lane;
//! * a rolled-back acquire drags in the section that published the release
//!   it observed, and a rolled-back release drags in every section that
//!   observed it — so a release/acquire pair is always preserved or undone
//!   together, never split.
//!
//! Undo then runs per lane in reverse program order, recursing into
//! observer lanes at each release so pre-images restore in reverse
//! happens-before order. Alloc and free entries restore the block's in-use
//! flag, skipped when the block generation shows the address was reused by
//! a later, durable lifetime. On success the log region is deleted;
//! running again is a no-op.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::RuntimeConfig;
use crate::constants::MAX_LOG_THREADS;
use crate::durability;
use crate::error::{NvError, Result};
use crate::heap;
use crate::log::entry::{EntryKind, LogEntry, FLAG_DELETED};
use crate::log::manager::write_pre_image;
use crate::log::structure::LogStructure;
use crate::region::{region_base, RegionManager, F_READWRITE};

/// What a recovery run did.
#[derive(Debug, Default)]
pub struct RecoveryOutcome {
    /// No log region existed; nothing was rolled back.
    pub nothing_to_do: bool,
    /// Lanes that held log entries.
    pub lanes: usize,
    /// Data pre-images and allocator flags restored.
    pub entries_undone: usize,
    /// Sections rolled back.
    pub sections_undone: usize,
}

/// Run recovery for `progname` using `cfg` for filesystem layout.
pub fn recover(cfg: RuntimeConfig) -> Result<RecoveryOutcome> {
    let created_instance = !RegionManager::has_instance();
    let regions = RegionManager::create_instance(cfg)?;

    let result = recover_with(&regions);

    if created_instance {
        RegionManager::delete_instance();
    }
    result
}

fn recover_with(regions: &Arc<RegionManager>) -> Result<RecoveryOutcome> {
    let log_name = regions.config().log_region_name();

    let id = match regions.find(&log_name, F_READWRITE, true) {
        Ok(id) => id,
        Err(NvError::RegionNotFound(_)) => {
            warn!(program = %regions.config().progname, "no undo log; nothing to recover");
            return Ok(RecoveryOutcome {
                nothing_to_do: true,
                ..Default::default()
            });
        }
        Err(err) => return Err(err),
    };

    let header = unsafe { LogStructure::from_raw(region_base(id)) };
    if !header.is_initialized() {
        warn!("log region header is torn; the crash predated any logging");
        remove_log_region(regions, &log_name, id);
        return Ok(RecoveryOutcome {
            nothing_to_do: true,
            ..Default::default()
        });
    }

    let mut driver = Driver::load(regions, &header)?;
    driver.compute_rollback();
    let outcome = driver.undo()?;
    durability::pm_drain();

    remove_log_region(regions, &log_name, id);
    info!(
        lanes = outcome.lanes,
        sections = outcome.sections_undone,
        entries = outcome.entries_undone,
        "recovery complete"
    );
    Ok(outcome)
}

fn remove_log_region(regions: &Arc<RegionManager>, name: &str, id: u32) {
    match regions.delete(name) {
        Ok(()) => {}
        Err(NvError::RegionNotFound(_)) => {
            // The slot was already marked deleted (the crash tore a
            // deletion); close the mapping and drop the file directly.
            regions.close(id);
            let path = regions.config().region_path(name);
            if let Err(err) = fs::remove_file(&path) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    warn!(%err, "failed to unlink log region file");
                }
            }
        }
        Err(err) => warn!(%err, "failed to delete log region"),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LaneStatus {
    Pending,
    InProgress,
    Done,
}

struct SegmentInfo {
    /// Index of the segment's first entry in the lane.
    start: usize,
    /// Whether the section's closing release made it to PM.
    closed: bool,
}

struct Lane {
    /// Entry addresses in program order.
    addrs: Vec<u64>,
    /// Decoded entries, parallel to `addrs`.
    entries: Vec<LogEntry>,
    /// Segment index of each entry.
    seg_of: Vec<usize>,
    segments: Vec<SegmentInfo>,
}

struct Driver<'a> {
    regions: &'a Arc<RegionManager>,
    lanes: Vec<Lane>,
    /// Entry address → (lane, index).
    index: HashMap<u64, (usize, usize)>,
    /// Release entry address → observing acquire entry addresses.
    r2a: HashMap<u64, Vec<u64>>,
    /// First rolled-back segment per lane (`segments.len()` = none).
    rollback_from: Vec<usize>,
}

impl<'a> Driver<'a> {
    /// Walk every lane chain once, building the tables the undo needs.
    fn load(regions: &'a Arc<RegionManager>, header: &LogStructure) -> Result<Self> {
        let mut lanes = Vec::with_capacity(MAX_LOG_THREADS);
        let mut index = HashMap::new();

        for lane_idx in 0..MAX_LOG_THREADS {
            let mut lane = Lane {
                addrs: Vec::new(),
                entries: Vec::new(),
                seg_of: Vec::new(),
                segments: Vec::new(),
            };

            let mut depth = 0u32;
            let mut cursor = header.head(lane_idx);
            while cursor != 0 {
                let entry = unsafe { LogEntry::read_from(cursor) }
                    .ok_or(NvError::CorruptLog("unknown entry kind in chain"))?;

                if depth == 0 {
                    lane.segments.push(SegmentInfo {
                        start: lane.addrs.len(),
                        closed: false,
                    });
                }
                let seg = lane.segments.len() - 1;

                if entry.kind.opens_section() {
                    depth += 1;
                } else if entry.kind.closes_section() {
                    depth = depth.saturating_sub(1);
                }
                if depth == 0 {
                    lane.segments[seg].closed = true;
                }

                index.insert(cursor, (lane_idx, lane.addrs.len()));
                lane.addrs.push(cursor);
                lane.entries.push(entry);
                lane.seg_of.push(seg);
                cursor = entry.next;
            }
            lanes.push(lane);
        }

        // Invert the observed-publisher pointers into the R2A multimap.
        let mut r2a: HashMap<u64, Vec<u64>> = HashMap::new();
        for lane in &lanes {
            for (idx, entry) in lane.entries.iter().enumerate() {
                if entry.kind.observes_publisher() && entry.value_or_ptr != 0 {
                    r2a.entry(entry.value_or_ptr)
                        .or_default()
                        .push(lane.addrs[idx]);
                }
            }
        }

        let rollback_from = lanes.iter().map(|lane| lane.segments.len()).collect();
        Ok(Self {
            regions,
            lanes,
            index,
            r2a,
            rollback_from,
        })
    }

    /// Decide which segments roll back: open segments seed the set, and
    /// release→acquire edges propagate it in both directions until stable.
    fn compute_rollback(&mut self) {
        let mut worklist: Vec<(usize, usize)> = Vec::new();

        for (lane_idx, lane) in self.lanes.iter().enumerate() {
            if let Some(first_open) = lane.segments.iter().position(|seg| !seg.closed) {
                worklist.push((lane_idx, first_open));
            }
        }

        while let Some((lane_idx, seg_idx)) = worklist.pop() {
            if seg_idx >= self.rollback_from[lane_idx] {
                continue;
            }
            let old_from = self.rollback_from[lane_idx];
            self.rollback_from[lane_idx] = seg_idx;

            // Everything in the newly rolled-back range propagates edges.
            let range_start = self.lanes[lane_idx].segments[seg_idx].start;
            let range_end = match self.lanes[lane_idx].segments.get(old_from) {
                Some(seg) => seg.start,
                None => self.lanes[lane_idx].addrs.len(),
            };

            let mut follow: Vec<(usize, usize)> = Vec::new();
            {
                let lane = &self.lanes[lane_idx];
                for idx in range_start..range_end {
                    let entry = &lane.entries[idx];
                    // A rolled-back acquire drags in its publisher's
                    // section.
                    if entry.kind.observes_publisher() && entry.value_or_ptr != 0 {
                        if let Some(&(r_lane, r_idx)) = self.index.get(&entry.value_or_ptr) {
                            follow.push((r_lane, self.lanes[r_lane].seg_of[r_idx]));
                        }
                    }
                    // A rolled-back release drags in every observer.
                    if entry.kind.publishes() {
                        if let Some(observers) = self.r2a.get(&lane.addrs[idx]) {
                            for acquire in observers {
                                if let Some(&(a_lane, a_idx)) = self.index.get(acquire) {
                                    follow.push((a_lane, self.lanes[a_lane].seg_of[a_idx]));
                                }
                            }
                        }
                    }
                }
            }
            worklist.extend(follow);
        }
    }

    /// Reverse undo over every lane's rollback suffix.
    fn undo(&mut self) -> Result<RecoveryOutcome> {
        let lane_count = self.lanes.len();
        let mut state = UndoState {
            cursor: (0..lane_count)
                .map(|l| self.lanes[l].addrs.len() as isize - 1)
                .collect(),
            boundary: (0..lane_count)
                .map(|l| match self.lanes[l].segments.get(self.rollback_from[l]) {
                    Some(seg) => seg.start as isize,
                    None => self.lanes[l].addrs.len() as isize,
                })
                .collect(),
            status: vec![LaneStatus::Pending; lane_count],
            replayed: HashSet::new(),
            entries_undone: 0,
        };

        for lane_idx in 0..lane_count {
            self.recover_lane(lane_idx, &mut state)?;
        }

        let mut outcome = RecoveryOutcome {
            nothing_to_do: false,
            lanes: self.lanes.iter().filter(|l| !l.addrs.is_empty()).count(),
            entries_undone: state.entries_undone,
            sections_undone: 0,
        };
        for (lane_idx, lane) in self.lanes.iter().enumerate() {
            outcome.sections_undone += lane.segments.len() - self.rollback_from[lane_idx];
        }
        Ok(outcome)
    }

    fn recover_lane(&self, lane_idx: usize, state: &mut UndoState) -> Result<()> {
        if state.status[lane_idx] != LaneStatus::Pending {
            return Ok(());
        }
        state.status[lane_idx] = LaneStatus::InProgress;

        while state.cursor[lane_idx] >= state.boundary[lane_idx] {
            let idx = state.cursor[lane_idx] as usize;
            let addr = self.lanes[lane_idx].addrs[idx];
            let entry = self.lanes[lane_idx].entries[idx];

            if entry.flags & FLAG_DELETED == 0 {
                self.undo_entry(lane_idx, addr, &entry, state)?;
            }
            state.cursor[lane_idx] -= 1;
        }

        state.status[lane_idx] = LaneStatus::Done;
        Ok(())
    }

    fn undo_entry(
        &self,
        lane_idx: usize,
        addr: u64,
        entry: &LogEntry,
        state: &mut UndoState,
    ) -> Result<()> {
        match entry.kind {
            EntryKind::Release | EntryKind::RwUnlock | EntryKind::Free => {
                // Observers are later in happens-before; their undo must
                // land first.
                if let Some(observers) = self.r2a.get(&addr) {
                    for &acquire in observers.iter() {
                        if state.replayed.contains(&acquire) {
                            continue;
                        }
                        let (a_lane, _) = self.index[&acquire];
                        if a_lane != lane_idx && state.status[a_lane] == LaneStatus::Pending {
                            self.recover_lane(a_lane, state)?;
                        }
                    }
                }
                if entry.kind == EntryKind::Free {
                    // Roll the block back to "in use".
                    self.undo_alloc_flag(entry, true, state)?;
                }
            }
            EntryKind::Acquire
            | EntryKind::RdLock
            | EntryKind::WrLock
            | EntryKind::BeginDurable
            | EntryKind::EndDurable => {
                state.replayed.insert(addr);
            }
            EntryKind::Alloc => {
                state.replayed.insert(addr);
                // Roll the block back to "free".
                self.undo_alloc_flag(entry, false, state)?;
            }
            EntryKind::Str => {
                self.regions.ensure_mapped(entry.addr)?;
                let nbytes = (entry.size as usize).div_ceil(8);
                unsafe {
                    write_pre_image(entry.addr, nbytes, entry.value_or_ptr);
                }
                durability::flush_range(entry.addr as usize, nbytes);
                state.entries_undone += 1;
                debug!(addr = entry.addr, bits = entry.size, "store rolled back");
            }
            EntryKind::Memset
            | EntryKind::Memcpy
            | EntryKind::Memmove
            | EntryKind::Strcpy
            | EntryKind::Strcat => {
                self.regions.ensure_mapped(entry.addr)?;
                let len = entry.size as usize;
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        entry.value_or_ptr as *const u8,
                        entry.addr as *mut u8,
                        len,
                    );
                }
                durability::flush_range(entry.addr as usize, len);
                state.entries_undone += 1;
            }
        }
        Ok(())
    }

    fn undo_alloc_flag(&self, entry: &LogEntry, in_use: bool, state: &mut UndoState) -> Result<()> {
        self.regions.ensure_mapped(entry.addr)?;
        // The address was handed out again by a later, durable lifetime;
        // this entry is already undone.
        if heap::generation_of(entry.addr) != entry.generation {
            debug!(flag = entry.addr, "generation mismatch; allocator entry skipped");
            return Ok(());
        }
        unsafe {
            std::ptr::write_volatile(entry.addr as *mut u8, in_use as u8);
        }
        durability::flush_range(entry.addr as usize, 1);
        state.entries_undone += 1;
        Ok(())
    }
}

struct UndoState {
    cursor: Vec<isize>,
    boundary: Vec<isize>,
    status: Vec<LaneStatus>,
    replayed: HashSet<u64>,
    entries_undone: usize,
}
