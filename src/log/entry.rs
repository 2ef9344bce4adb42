//! Undo log entry format.
//!
//! Entries are fixed 40-byte records living in chunks inside the log
//! region. Layout, little-endian, natural alignment:
//!
//! | offset | field |
//! |---|---|
//! | 0  | `kind: u8` |
//! | 1  | `flags: u8` + 2 pad bytes |
//! | 4  | `size: u32` (bits for stores, bytes for memops) |
//! | 8  | `addr: u64` |
//! | 16 | `value_or_ptr: u64` |
//! | 24 | `next: u64` (program-order successor, 0 = tail) |
//! | 32 | `generation: u64` |
//!
//! `value_or_ptr` is overloaded by kind: the pre-store word for `Str`, the
//! side-buffer address for memops, and the observed release-entry address
//! for acquire-class records (0 when the lock was never released on PM).

use std::sync::atomic::{AtomicU64, Ordering};

/// Size of one encoded log entry.
pub const ENTRY_SIZE: usize = 40;

/// Entry opens a FASE (set on the outermost acquire or begin-durable).
pub const FLAG_FASE_START: u8 = 1 << 0;
/// Entry was logically deleted; recovery skips it.
pub const FLAG_DELETED: u8 = 1 << 1;

const NEXT_OFFSET: u64 = 24;

/// Discriminates what a log entry undoes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EntryKind {
    /// Single word store (up to 64 bits).
    Str = 1,
    /// `memset` over a byte range.
    Memset = 2,
    /// `memcpy` destination range.
    Memcpy = 3,
    /// `memmove` destination range.
    Memmove = 4,
    /// `strcpy` destination range.
    Strcpy = 5,
    /// `strcat` destination range.
    Strcat = 6,
    /// Mutex acquire.
    Acquire = 7,
    /// Mutex release.
    Release = 8,
    /// Read-lock of a reader-writer lock.
    RdLock = 9,
    /// Write-lock of a reader-writer lock.
    WrLock = 10,
    /// Unlock of a reader-writer lock.
    RwUnlock = 11,
    /// Allocation of a heap block (addr = in-use flag byte).
    Alloc = 12,
    /// Free of a heap block (addr = in-use flag byte).
    Free = 13,
    /// Explicit durable-section open.
    BeginDurable = 14,
    /// Explicit durable-section close.
    EndDurable = 15,
}

impl EntryKind {
    /// Decode a kind byte.
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            1 => Self::Str,
            2 => Self::Memset,
            3 => Self::Memcpy,
            4 => Self::Memmove,
            5 => Self::Strcpy,
            6 => Self::Strcat,
            7 => Self::Acquire,
            8 => Self::Release,
            9 => Self::RdLock,
            10 => Self::WrLock,
            11 => Self::RwUnlock,
            12 => Self::Alloc,
            13 => Self::Free,
            14 => Self::BeginDurable,
            15 => Self::EndDurable,
            _ => return None,
        })
    }

    /// Kinds that open or deepen a FASE.
    #[inline]
    pub const fn opens_section(&self) -> bool {
        matches!(
            self,
            Self::Acquire | Self::RdLock | Self::WrLock | Self::BeginDurable
        )
    }

    /// Kinds that close or shallow a FASE.
    #[inline]
    pub const fn closes_section(&self) -> bool {
        matches!(self, Self::Release | Self::RwUnlock | Self::EndDurable)
    }

    /// Kinds that record an observed publisher in `value_or_ptr` —
    /// recovery turns these into incoming release→acquire edges.
    #[inline]
    pub const fn observes_publisher(&self) -> bool {
        matches!(self, Self::Acquire | Self::RdLock | Self::WrLock | Self::Alloc)
    }

    /// Kinds that publish themselves for later observers.
    #[inline]
    pub const fn publishes(&self) -> bool {
        matches!(self, Self::Release | Self::RwUnlock | Self::Free)
    }

    /// Kinds carrying a data pre-image to restore.
    #[inline]
    pub const fn is_data(&self) -> bool {
        matches!(
            self,
            Self::Str | Self::Memset | Self::Memcpy | Self::Memmove | Self::Strcpy | Self::Strcat
        )
    }

    /// Data kinds whose pre-image lives in a side-buffer.
    #[inline]
    pub const fn uses_side_buffer(&self) -> bool {
        self.is_data() && !matches!(self, Self::Str)
    }
}

/// Decoded log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogEntry {
    /// What this entry undoes.
    pub kind: EntryKind,
    /// `FLAG_*` bits.
    pub flags: u8,
    /// Bits for stores, bytes for memops, unused otherwise.
    pub size: u32,
    /// Target user address, lock address, or in-use flag address.
    pub addr: u64,
    /// Kind-dependent payload; see the module docs.
    pub value_or_ptr: u64,
    /// Program-order successor entry, 0 at the chain tail.
    pub next: u64,
    /// Writer counter, or the block generation for alloc/free.
    pub generation: u64,
}

impl LogEntry {
    /// Encode into a 40-byte image.
    pub fn encode(&self, buf: &mut [u8]) {
        assert!(buf.len() >= ENTRY_SIZE);
        buf[..ENTRY_SIZE].fill(0);
        buf[0] = self.kind as u8;
        buf[1] = self.flags;
        buf[4..8].copy_from_slice(&self.size.to_le_bytes());
        buf[8..16].copy_from_slice(&self.addr.to_le_bytes());
        buf[16..24].copy_from_slice(&self.value_or_ptr.to_le_bytes());
        buf[24..32].copy_from_slice(&self.next.to_le_bytes());
        buf[32..40].copy_from_slice(&self.generation.to_le_bytes());
    }

    /// Decode a 40-byte image. Returns `None` on an unknown kind byte.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        assert!(buf.len() >= ENTRY_SIZE);
        Some(Self {
            kind: EntryKind::from_u8(buf[0])?,
            flags: buf[1],
            size: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
            addr: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
            value_or_ptr: u64::from_le_bytes(buf[16..24].try_into().unwrap()),
            next: u64::from_le_bytes(buf[24..32].try_into().unwrap()),
            generation: u64::from_le_bytes(buf[32..40].try_into().unwrap()),
        })
    }

    /// Write this entry to PM at `addr` (flushing is the caller's job).
    ///
    /// # Safety
    ///
    /// `addr` must point at `ENTRY_SIZE` writable mapped bytes.
    pub unsafe fn write_to(&self, addr: u64) {
        let mut image = [0u8; ENTRY_SIZE];
        self.encode(&mut image);
        std::ptr::copy_nonoverlapping(image.as_ptr(), addr as *mut u8, ENTRY_SIZE);
    }

    /// Read an entry from PM at `addr`.
    ///
    /// # Safety
    ///
    /// `addr` must point at `ENTRY_SIZE` readable mapped bytes.
    pub unsafe fn read_from(addr: u64) -> Option<Self> {
        let buf = std::slice::from_raw_parts(addr as *const u8, ENTRY_SIZE);
        Self::decode(buf)
    }

    /// Whether the first-in-FASE flag is set.
    #[inline]
    pub fn starts_fase(&self) -> bool {
        self.flags & FLAG_FASE_START != 0
    }
}

/// The `next` field of the entry at `addr`, as an atomic for cross-thread
/// publication (writer stores release, helper and recovery load acquire).
///
/// # Safety
///
/// `addr` must point at a live entry.
#[inline]
pub unsafe fn next_field(addr: u64) -> &'static AtomicU64 {
    &*((addr + NEXT_OFFSET) as *const AtomicU64)
}

/// Load the program-order successor of the entry at `addr`.
///
/// # Safety
///
/// `addr` must point at a live entry.
#[inline]
pub unsafe fn load_next(addr: u64) -> u64 {
    next_field(addr).load(Ordering::Acquire)
}
