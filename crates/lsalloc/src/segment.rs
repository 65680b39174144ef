//! Segments and their descriptors.
//!
//! A segment is a fixed-size block aligned to its own size, so the high bits
//! of any interior address identify the segment. Segments hold only user
//! bytes; per-segment metadata lives in the pool's dense descriptor array.

use std::cell::{Cell, RefCell};
use std::ptr::NonNull;
use std::rc::Weak;

use crate::buffer::BufLink;
use crate::occupancy::OccupancyStats;
use crate::region::RegionImpl;

pub const SEGMENT_SIZE_SHIFT: usize = 17;
/// 128 KiB. The unit of reclamation.
pub const SEGMENT_SIZE: usize = 1 << SEGMENT_SIZE_SHIFT;

/// Objects above this size bypass segments and go to the standard allocator.
pub const MAX_MANAGED_OBJECT_SIZE: usize = SEGMENT_SIZE / 10;

pub const MAX_USED_SPACE_RATIO_FOR_COMPACTION_PERCENT: usize = 85;
pub const MAX_USED_SPACE_FOR_COMPACTION: usize =
    SEGMENT_SIZE * MAX_USED_SPACE_RATIO_FOR_COMPACTION_PERCENT / 100;
pub const MIN_FREE_SPACE_FOR_COMPACTION: usize = SEGMENT_SIZE - MAX_USED_SPACE_FOR_COMPACTION;

// Segments which cannot absorb a max-size object must never be considered
// compactible, or compaction could fail to make forward progress.
const _: () = assert!(MIN_FREE_SPACE_FOR_COMPACTION >= MAX_MANAGED_OBJECT_SIZE);

/// All buffers returned by `alloc_buf` are aligned to this.
pub const BUF_ALIGN: usize = 4096;
const _: () = assert!(SEGMENT_SIZE % BUF_ALIGN == 0);

const FREE_SPACE_BITS: u32 = (SEGMENT_SIZE_SHIFT + 1) as u32;
const FREE_SPACE_MASK: u32 = (1 << FREE_SPACE_BITS) - 1;
const KIND_MASK: u32 = 1 << FREE_SPACE_BITS;

/// What a segment holds.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SegmentKind {
    /// Small objects with inline descriptors.
    Regular,
    /// Page-aligned buffers tracked by external pointer links.
    Bufs,
}

/// Base address of one segment. The block itself carries no metadata.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Segment(NonNull<u8>);

impl Segment {
    /// # Safety
    /// `base` must be the start of a live segment-sized, segment-aligned
    /// block.
    pub unsafe fn from_base(base: NonNull<u8>) -> Segment {
        debug_assert!(crate::util::is_aligned(base.as_ptr() as usize, SEGMENT_SIZE));
        Segment(base)
    }

    #[inline]
    pub fn base(self) -> *mut u8 {
        self.0.as_ptr()
    }

    #[inline]
    pub fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }

    /// Pointer to `offset` bytes into the segment.
    ///
    /// # Safety
    /// `offset <= SEGMENT_SIZE`.
    #[inline]
    pub unsafe fn at(self, offset: usize) -> *mut u8 {
        debug_assert!(offset <= SEGMENT_SIZE);
        self.0.as_ptr().add(offset)
    }
}

/// Sentinel for an unlinked histogram hook.
pub(crate) const HIST_UNLINKED: u32 = u32::MAX;

/// Per-segment metadata, stored in a dense array indexed by segment index.
pub(crate) struct SegmentDescriptor {
    /// Packed `(free_space, kind)` word: kind bit sits above the free-space
    /// bits.
    packed: Cell<u32>,
    /// Owning region; null iff the segment is free or not LSA-managed.
    region: Cell<*const RegionImpl>,
    /// Index of this descriptor within the pool, fixed at pool construction.
    index: u32,
    /// Histogram-heap hook: bucket and slot within the bucket.
    pub(crate) hist_bucket: Cell<u32>,
    pub(crate) hist_slot: Cell<u32>,
    /// Valid for `SegmentKind::Bufs` only: links to the `LsaBuffer` handles
    /// of live buffers in this segment, so compaction can update them when
    /// it moves the buffers. Order is irrelevant; entries may be dead.
    pub(crate) buf_pointers: RefCell<Vec<Weak<BufLink>>>,
}

impl SegmentDescriptor {
    pub(crate) fn new(index: u32) -> Self {
        SegmentDescriptor {
            packed: Cell::new(0),
            region: Cell::new(std::ptr::null()),
            index,
            hist_bucket: Cell::new(HIST_UNLINKED),
            hist_slot: Cell::new(HIST_UNLINKED),
            buf_pointers: RefCell::new(Vec::new()),
        }
    }

    #[inline]
    pub(crate) fn index(&self) -> u32 {
        self.index
    }

    #[inline]
    pub(crate) fn free_space(&self) -> usize {
        (self.packed.get() & FREE_SPACE_MASK) as usize
    }

    pub(crate) fn set_free_space(&self, free_space: usize) {
        debug_assert!(free_space <= SEGMENT_SIZE);
        self.packed
            .set((self.packed.get() & !FREE_SPACE_MASK) | free_space as u32);
    }

    #[inline]
    pub(crate) fn kind(&self) -> SegmentKind {
        if self.packed.get() & KIND_MASK != 0 {
            SegmentKind::Bufs
        } else {
            SegmentKind::Regular
        }
    }

    pub(crate) fn set_kind(&self, kind: SegmentKind) {
        match kind {
            SegmentKind::Regular => self.packed.set(self.packed.get() & !KIND_MASK),
            SegmentKind::Bufs => self.packed.set(self.packed.get() | KIND_MASK),
        }
    }

    #[inline]
    pub(crate) fn region(&self) -> *const RegionImpl {
        self.region.get()
    }

    pub(crate) fn set_region(&self, region: *const RegionImpl) {
        self.region.set(region);
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.free_space() == SEGMENT_SIZE
    }

    pub(crate) fn occupancy(&self) -> OccupancyStats {
        OccupancyStats::new(self.free_space(), SEGMENT_SIZE)
    }

    pub(crate) fn record_alloc(&self, size: usize) {
        debug_assert!(self.free_space() >= size);
        self.set_free_space(self.free_space() - size);
    }

    pub(crate) fn record_free(&self, size: usize) {
        let free = self.free_space() + size;
        debug_assert!(free <= SEGMENT_SIZE);
        self.set_free_space(free);
    }
}
