//! Per-thread log append state.
//!
//! Each thread lane owns a [`WriterSlot`]: the current chunk and cursor,
//! FASE depth, a monotonic generation counter, and the volatile bookkeeping
//! the helper needs to reclaim space. The append protocol is the heart of
//! the undo contract: the entry is written and flushed, then linked into
//! the lane (predecessor `next` or the lane head) and the link flushed —
//! so an entry is durable before the store it describes can be.

use std::collections::VecDeque;

use crate::durability;
use crate::error::Result;
use crate::log::arena::LogArena;
use crate::log::entry::{next_field, LogEntry, ENTRY_SIZE};
use crate::log::structure::LogStructure;

use std::collections::HashSet;
use std::sync::atomic::Ordering;

/// Side-buffer bookkeeping: which entry owns which buffer.
#[derive(Debug, Clone, Copy)]
pub struct BufferRec {
    /// Entry holding the buffer pointer.
    pub entry: u64,
    /// Buffer address.
    pub addr: u64,
    /// Buffer length in bytes.
    pub len: u64,
}

/// Append state for one thread lane.
pub struct WriterSlot {
    lane: usize,
    /// Oldest live entry; mirrors the lane head in the log header.
    pub(crate) first: u64,
    /// Newest entry (chain tail).
    pub(crate) tail: u64,
    /// Newest entry of the last closed FASE; everything up to here is a
    /// candidate for reclamation.
    pub(crate) committed_upto: u64,
    /// Nesting depth of the current FASE (0 = outside).
    pub(crate) depth: u32,
    chunk_cursor: u64,
    chunk_end: u64,
    generation: u64,
    /// Live chunks in allocation order; the last one is the open chunk.
    chunks: VecDeque<u64>,
    /// Side-buffers in append order.
    buffers: VecDeque<BufferRec>,
}

impl WriterSlot {
    /// Fresh lane state.
    pub fn new(lane: usize) -> Self {
        Self {
            lane,
            first: 0,
            tail: 0,
            committed_upto: 0,
            depth: 0,
            chunk_cursor: 0,
            chunk_end: 0,
            generation: 0,
            chunks: VecDeque::new(),
            buffers: VecDeque::new(),
        }
    }

    /// Lane index.
    #[inline]
    pub fn lane(&self) -> usize {
        self.lane
    }

    /// Bump and return the lane's generation counter.
    #[inline]
    pub fn next_generation(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }

    /// Append `entry` to the lane. Returns the entry's PM address once the
    /// entry and its link are durable.
    pub fn append(
        &mut self,
        header: &LogStructure,
        arena: &LogArena,
        mut entry: LogEntry,
    ) -> Result<u64> {
        if self.chunk_cursor + ENTRY_SIZE as u64 > self.chunk_end {
            let chunk = arena.alloc_chunk()?;
            self.chunks.push_back(chunk);
            self.chunk_cursor = chunk;
            self.chunk_end = chunk + arena.chunk_bytes();
        }
        let addr = self.chunk_cursor;
        self.chunk_cursor += ENTRY_SIZE as u64;

        entry.next = 0;
        unsafe {
            entry.write_to(addr);
        }
        durability::flush_range(addr as usize, ENTRY_SIZE);
        durability::store_fence();

        if self.tail != 0 {
            // Link from the predecessor, then flush the link.
            unsafe { next_field(self.tail) }.store(addr, Ordering::Release);
            durability::nvm_barrier((self.tail + 24) as usize);
        } else {
            self.first = addr;
            header.set_head(self.lane, addr);
        }
        self.tail = addr;

        if self.depth == 0 {
            // Outside any FASE the entry commits by itself.
            self.committed_upto = addr;
        }
        Ok(addr)
    }

    /// Record a side-buffer owned by `entry`.
    pub fn track_buffer(&mut self, entry: u64, addr: u64, len: u64) {
        self.buffers.push_back(BufferRec { entry, addr, len });
    }

    /// Reclaim the durable prefix of this lane.
    ///
    /// `new_head` is the first surviving entry (0 when the whole lane was
    /// reclaimed); `pruned` holds the addresses of every reclaimed entry.
    /// Publishes the new head, then returns chunks and buffers to the
    /// arena — in that order, so a crash mid-reclaim never leaves the head
    /// pointing into recycled space.
    pub fn prune(
        &mut self,
        header: &LogStructure,
        arena: &LogArena,
        new_head: u64,
        pruned: &HashSet<u64>,
    ) {
        if pruned.is_empty() {
            return;
        }

        self.first = new_head;
        if new_head == 0 {
            self.tail = 0;
        }
        if new_head == 0 || pruned.contains(&self.committed_upto) {
            self.committed_upto = 0;
        }
        header.set_head(self.lane, new_head);

        while let Some(front) = self.buffers.front() {
            if !pruned.contains(&front.entry) {
                break;
            }
            let rec = self.buffers.pop_front().unwrap();
            arena.free_buffer(rec.addr, rec.len);
        }

        let chunk_bytes = arena.chunk_bytes();
        while let Some(&chunk) = self.chunks.front() {
            let holds_survivor = new_head != 0 && (chunk..chunk + chunk_bytes).contains(&new_head);
            if holds_survivor {
                break;
            }
            self.chunks.pop_front();
            arena.free_chunk(chunk);
        }
        if new_head == 0 {
            // The open chunk went back too; the next append starts fresh.
            self.chunk_cursor = 0;
            self.chunk_end = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::entry::{EntryKind, FLAG_FASE_START};
    use crate::log::structure::LOG_DATA_OFFSET;

    struct Fixture {
        _storage: Vec<u64>,
        header: LogStructure,
        arena: LogArena,
    }

    fn fixture() -> Fixture {
        let len = 64 * 1024u64;
        let storage = vec![0u64; (len / 8) as usize];
        let base = storage.as_ptr() as u64;
        let header = unsafe { LogStructure::from_raw(base) };
        header.initialize();
        Fixture {
            _storage: storage,
            header,
            arena: LogArena::new(header, len, 1024),
        }
    }

    fn store_entry(addr: u64, value: u64) -> LogEntry {
        LogEntry {
            kind: EntryKind::Str,
            flags: 0,
            size: 64,
            addr,
            value_or_ptr: value,
            next: 0,
            generation: 0,
        }
    }

    #[test]
    fn test_first_append_installs_head() {
        let f = fixture();
        let mut writer = WriterSlot::new(0);
        let addr = writer
            .append(&f.header, &f.arena, store_entry(0x1000, 7))
            .unwrap();
        assert_eq!(f.header.head(0), addr);
        assert_eq!(writer.first, addr);
        assert_eq!(writer.tail, addr);
        assert_eq!(addr, f.header.base() + LOG_DATA_OFFSET);
    }

    #[test]
    fn test_chain_links_in_program_order() {
        let f = fixture();
        let mut writer = WriterSlot::new(0);
        let a = writer
            .append(&f.header, &f.arena, store_entry(0x1000, 1))
            .unwrap();
        let b = writer
            .append(&f.header, &f.arena, store_entry(0x1008, 2))
            .unwrap();
        let c = writer
            .append(&f.header, &f.arena, store_entry(0x1010, 3))
            .unwrap();

        let ea = unsafe { LogEntry::read_from(a) }.unwrap();
        let eb = unsafe { LogEntry::read_from(b) }.unwrap();
        let ec = unsafe { LogEntry::read_from(c) }.unwrap();
        assert_eq!(ea.next, b);
        assert_eq!(eb.next, c);
        assert_eq!(ec.next, 0);
        assert_eq!(f.header.head(0), a);
    }

    #[test]
    fn test_chunk_rollover() {
        let f = fixture();
        let mut writer = WriterSlot::new(0);
        // 1024-byte chunks hold 25 forty-byte entries.
        let per_chunk = 1024 / ENTRY_SIZE as u64;
        let mut last = 0;
        for i in 0..per_chunk + 1 {
            last = writer
                .append(&f.header, &f.arena, store_entry(0x1000 + i * 8, i))
                .unwrap();
        }
        // The chain stays walkable across the chunk boundary.
        let mut cursor = f.header.head(0);
        let mut count = 0;
        while cursor != 0 {
            count += 1;
            cursor = unsafe { LogEntry::read_from(cursor) }.unwrap().next;
        }
        assert_eq!(count, per_chunk + 1);
        assert_eq!(writer.tail, last);
    }

    #[test]
    fn test_depth_zero_appends_self_commit() {
        let f = fixture();
        let mut writer = WriterSlot::new(0);
        let a = writer
            .append(&f.header, &f.arena, store_entry(0x1000, 1))
            .unwrap();
        assert_eq!(writer.committed_upto, a);

        writer.depth = 1;
        let b = writer
            .append(
                &f.header,
                &f.arena,
                LogEntry {
                    kind: EntryKind::Acquire,
                    flags: FLAG_FASE_START,
                    size: 0,
                    addr: 0x2000,
                    value_or_ptr: 0,
                    next: 0,
                    generation: 0,
                },
            )
            .unwrap();
        // Inside a FASE nothing self-commits.
        assert_eq!(writer.committed_upto, a);
        assert_ne!(writer.committed_upto, b);
    }

    #[test]
    fn test_prune_whole_lane() {
        let f = fixture();
        let mut writer = WriterSlot::new(0);
        let mut pruned = HashSet::new();
        for i in 0..4u64 {
            let addr = writer
                .append(&f.header, &f.arena, store_entry(0x1000 + i * 8, i))
                .unwrap();
            pruned.insert(addr);
        }

        writer.prune(&f.header, &f.arena, 0, &pruned);
        assert_eq!(f.header.head(0), 0);
        assert_eq!(writer.first, 0);
        assert_eq!(writer.tail, 0);

        // The lane restarts cleanly afterwards.
        let addr = writer
            .append(&f.header, &f.arena, store_entry(0x3000, 9))
            .unwrap();
        assert_eq!(f.header.head(0), addr);
    }

    #[test]
    fn test_prune_prefix_keeps_suffix() {
        let f = fixture();
        let mut writer = WriterSlot::new(0);
        let mut addrs = Vec::new();
        for i in 0..6u64 {
            addrs.push(
                writer
                    .append(&f.header, &f.arena, store_entry(0x1000 + i * 8, i))
                    .unwrap(),
            );
        }
        let pruned: HashSet<u64> = addrs[..3].iter().copied().collect();
        writer.prune(&f.header, &f.arena, addrs[3], &pruned);

        assert_eq!(f.header.head(0), addrs[3]);
        assert_eq!(writer.first, addrs[3]);
        assert_eq!(writer.tail, addrs[5]);

        // Appends continue on the surviving chain.
        let tail = writer
            .append(&f.header, &f.arena, store_entry(0x2000, 42))
            .unwrap();
        assert_eq!(
            unsafe { LogEntry::read_from(addrs[5]) }.unwrap().next,
            tail
        );
    }
}
