//! On-PM region metadata table.
//!
//! The table file holds a 32-bit count word followed by an array of 64-byte
//! slots, one per region ever created. The count is the commit point for
//! creation: a slot is written and flushed first, then the count is bumped
//! and flushed. A slot's `(id, base)` pair is write-once — deletion marks
//! the slot and unlinks the file but keeps id and base so a recreated
//! region maps at the same address.
//!
//! Slot layout (little-endian, natural alignment):
//!
//! | offset | field |
//! |---|---|
//! | 0  | `name[32]` (NUL-padded) |
//! | 32 | `id: u32` |
//! | 36 | `flags: u32` |
//! | 40 | `deleted: u8` + 7 pad bytes |
//! | 48 | `base: u64` |
//! | 56 | `root: u64` |

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::durability;
use crate::error::{NvError, Result};

/// Encoded size of one region slot.
pub const SLOT_SIZE: usize = 64;

/// Byte offset of the first slot; the count word and its padding occupy the
/// first cache line.
pub const SLOTS_OFFSET: usize = 64;

/// Maximum region name length (the slot stores 32 NUL-padded bytes).
pub const MAX_NAME_LEN: usize = 31;

const NAME_OFFSET: usize = 0;
const ID_OFFSET: usize = 32;
const FLAGS_OFFSET: usize = 36;
const DELETED_OFFSET: usize = 40;
const BASE_OFFSET: usize = 48;
const ROOT_OFFSET: usize = 56;

/// Decoded view of one region slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotRecord {
    /// Region name (at most [`MAX_NAME_LEN`] bytes).
    pub name: String,
    /// Region id; equals the slot index.
    pub id: u32,
    /// Open mode flags.
    pub flags: u32,
    /// Deletion marker; a deleted slot is reusable but keeps id and base.
    pub deleted: bool,
    /// Fixed virtual base address of the region.
    pub base: u64,
    /// Root pointer published by `set_root`.
    pub root: u64,
}

impl SlotRecord {
    /// Encode into a 64-byte slot image.
    pub fn encode(&self, buf: &mut [u8]) -> Result<()> {
        if self.name.len() > MAX_NAME_LEN {
            return Err(NvError::RegionNameTooLong(self.name.clone()));
        }
        assert!(buf.len() >= SLOT_SIZE);
        buf[..SLOT_SIZE].fill(0);
        buf[NAME_OFFSET..NAME_OFFSET + self.name.len()].copy_from_slice(self.name.as_bytes());
        buf[ID_OFFSET..ID_OFFSET + 4].copy_from_slice(&self.id.to_le_bytes());
        buf[FLAGS_OFFSET..FLAGS_OFFSET + 4].copy_from_slice(&self.flags.to_le_bytes());
        buf[DELETED_OFFSET] = self.deleted as u8;
        buf[BASE_OFFSET..BASE_OFFSET + 8].copy_from_slice(&self.base.to_le_bytes());
        buf[ROOT_OFFSET..ROOT_OFFSET + 8].copy_from_slice(&self.root.to_le_bytes());
        Ok(())
    }

    /// Decode a 64-byte slot image.
    pub fn decode(buf: &[u8]) -> Self {
        assert!(buf.len() >= SLOT_SIZE);
        let name_len = buf[NAME_OFFSET..NAME_OFFSET + 32]
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(32);
        let name = String::from_utf8_lossy(&buf[NAME_OFFSET..NAME_OFFSET + name_len]).into_owned();
        Self {
            name,
            id: u32::from_le_bytes(buf[ID_OFFSET..ID_OFFSET + 4].try_into().unwrap()),
            flags: u32::from_le_bytes(buf[FLAGS_OFFSET..FLAGS_OFFSET + 4].try_into().unwrap()),
            deleted: buf[DELETED_OFFSET] != 0,
            base: u64::from_le_bytes(buf[BASE_OFFSET..BASE_OFFSET + 8].try_into().unwrap()),
            root: u64::from_le_bytes(buf[ROOT_OFFSET..ROOT_OFFSET + 8].try_into().unwrap()),
        }
    }
}

/// Accessor over the mapped region table.
///
/// All mutation happens under the PRM's table lock; the count word and the
/// root field use atomics because readers may classify concurrently.
#[derive(Clone, Copy)]
pub struct RegionTable {
    base: usize,
    capacity: u32,
}

impl RegionTable {
    /// Wrap a table mapped at `base` with room for `capacity` slots.
    ///
    /// # Safety
    ///
    /// `base` must point at a live mapping of at least
    /// `SLOTS_OFFSET + capacity * SLOT_SIZE` bytes.
    pub unsafe fn from_raw(base: usize, capacity: u32) -> Self {
        Self { base, capacity }
    }

    /// Number of slots the mapping can hold.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    fn count_word(&self) -> &AtomicU32 {
        unsafe { &*(self.base as *const AtomicU32) }
    }

    fn slot_addr(&self, idx: u32) -> usize {
        assert!(idx < self.capacity, "slot index out of range");
        self.base + SLOTS_OFFSET + idx as usize * SLOT_SIZE
    }

    /// Number of slots ever created.
    pub fn count(&self) -> u32 {
        self.count_word().load(Ordering::Acquire)
    }

    /// Read and decode slot `idx`.
    pub fn read_slot(&self, idx: u32) -> SlotRecord {
        let addr = self.slot_addr(idx);
        let buf = unsafe { std::slice::from_raw_parts(addr as *const u8, SLOT_SIZE) };
        SlotRecord::decode(buf)
    }

    /// Write and flush slot `idx`. Does not touch the count word.
    pub fn write_slot(&self, idx: u32, record: &SlotRecord) -> Result<()> {
        let mut image = [0u8; SLOT_SIZE];
        record.encode(&mut image)?;
        let addr = self.slot_addr(idx);
        unsafe {
            std::ptr::copy_nonoverlapping(image.as_ptr(), addr as *mut u8, SLOT_SIZE);
        }
        durability::flush_range(addr, SLOT_SIZE);
        durability::store_fence();
        Ok(())
    }

    /// Commit a freshly written slot by bumping the count, then flush it.
    pub fn bump_count(&self) {
        self.count_word().fetch_add(1, Ordering::AcqRel);
        durability::nvm_barrier(self.base);
    }

    /// Set or clear the deletion marker of slot `idx` and flush it.
    pub fn set_deleted(&self, idx: u32, deleted: bool) {
        let addr = self.slot_addr(idx) + DELETED_OFFSET;
        unsafe {
            std::ptr::write_volatile(addr as *mut u8, deleted as u8);
        }
        durability::nvm_barrier(addr);
    }

    /// Publish the root pointer of slot `idx` with release semantics: prior
    /// flushes are ordered before the root becomes visible, then the slot
    /// line is flushed.
    pub fn set_root(&self, idx: u32, root: u64) {
        let addr = self.slot_addr(idx) + ROOT_OFFSET;
        durability::store_fence();
        durability::pm_drain();
        unsafe { &*(addr as *const AtomicU64) }.store(root, Ordering::Release);
        durability::nvm_barrier(addr);
    }

    /// Read the root pointer of slot `idx`.
    pub fn get_root(&self, idx: u32) -> u64 {
        let addr = self.slot_addr(idx) + ROOT_OFFSET;
        unsafe { &*(addr as *const AtomicU64) }.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SlotRecord {
        SlotRecord {
            name: "btree".to_string(),
            id: 7,
            flags: 1,
            deleted: false,
            base: 0x6000_7000_0000,
            root: 0x6000_7000_1040,
        }
    }

    #[test]
    fn test_slot_roundtrip() {
        let record = sample();
        let mut buf = [0u8; SLOT_SIZE];
        record.encode(&mut buf).unwrap();
        assert_eq!(SlotRecord::decode(&buf), record);
    }

    #[test]
    fn test_slot_field_offsets() {
        let record = sample();
        let mut buf = [0u8; SLOT_SIZE];
        record.encode(&mut buf).unwrap();

        assert_eq!(&buf[..5], b"btree");
        assert_eq!(buf[5], 0);
        assert_eq!(u32::from_le_bytes(buf[32..36].try_into().unwrap()), 7);
        assert_eq!(u32::from_le_bytes(buf[36..40].try_into().unwrap()), 1);
        assert_eq!(buf[40], 0);
        assert_eq!(
            u64::from_le_bytes(buf[48..56].try_into().unwrap()),
            0x6000_7000_0000
        );
        assert_eq!(
            u64::from_le_bytes(buf[56..64].try_into().unwrap()),
            0x6000_7000_1040
        );
    }

    #[test]
    fn test_name_too_long_rejected() {
        let mut record = sample();
        record.name = "x".repeat(MAX_NAME_LEN + 1);
        let mut buf = [0u8; SLOT_SIZE];
        assert!(matches!(
            record.encode(&mut buf),
            Err(NvError::RegionNameTooLong(_))
        ));
    }

    #[test]
    fn test_max_length_name() {
        let mut record = sample();
        record.name = "y".repeat(MAX_NAME_LEN);
        let mut buf = [0u8; SLOT_SIZE];
        record.encode(&mut buf).unwrap();
        assert_eq!(SlotRecord::decode(&buf).name, record.name);
    }

    #[test]
    fn test_table_over_heap_buffer() {
        // Exercise the accessor against plain memory; the protocol does not
        // care what backs the mapping. u64 storage keeps the atomics aligned.
        let mut buf = vec![0u64; (SLOTS_OFFSET + 4 * SLOT_SIZE) / 8];
        let table = unsafe { RegionTable::from_raw(buf.as_mut_ptr() as usize, 4) };

        assert_eq!(table.count(), 0);
        table.write_slot(0, &sample()).unwrap();
        table.bump_count();
        assert_eq!(table.count(), 1);
        assert_eq!(table.read_slot(0), sample());

        table.set_deleted(0, true);
        assert!(table.read_slot(0).deleted);
        table.set_deleted(0, false);
        assert!(!table.read_slot(0).deleted);

        table.set_root(0, 0xabcd);
        assert_eq!(table.get_root(0), 0xabcd);
        assert_eq!(table.read_slot(0).root, 0xabcd);
    }
}
