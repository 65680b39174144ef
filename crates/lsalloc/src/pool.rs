//! The shard's segment pool.
//!
//! Owns every LSA segment, keeps per-segment descriptors in a dense array
//! indexed by segment index, and tracks ownership in two bitmaps:
//! `lsa_owned` (belongs to LSA) and `lsa_free` (owned but unused, a subset).
//!
//! We prefer handing out high-index segments and releasing low-index ones to
//! the system allocator, keeping LSA memory contiguous at the top of the
//! address range and reducing fragmentation against non-LSA allocations
//! below.

use std::alloc::Layout;
use std::cell::{Cell, RefCell};
use std::ptr::NonNull;

use hashbrown::HashMap;
use tracing::{debug, trace};

use crate::bitset::{DynamicBitset, NPOS};
use crate::memory;
use crate::region::RegionImpl;
use crate::runtime::{need_preempt, Preempt};
use crate::segment::{Segment, SegmentDescriptor, SegmentKind, SEGMENT_SIZE};
use crate::tracker::{self, ReclaimTimer, TrackerReclaimerLock};
use crate::util::lsa_abort;
use crate::{Error, Result};

fn segment_layout() -> Layout {
    // SAFETY: size and alignment are equal powers of two.
    unsafe { Layout::from_size_align_unchecked(SEGMENT_SIZE, SEGMENT_SIZE) }
}

/// Cumulative pool counters, exported through the metrics snapshot.
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub struct PoolStats {
    pub segments_compacted: u64,
    pub lsa_buffer_segments: i64,
    pub memory_allocated: u64,
    pub memory_freed: u64,
    pub memory_compacted: u64,
    pub memory_evicted: u64,
}

/// Backing store: which segment index maps to which block.
/// Index 0 is reserved as the "no segment" marker.
struct SegmentStore {
    segments: Vec<Option<Segment>>,
    index: HashMap<usize, usize>,
}

impl SegmentStore {
    fn new(max_segments: usize) -> Self {
        SegmentStore {
            segments: vec![None; max_segments],
            index: HashMap::with_capacity(max_segments),
        }
    }

    fn find_empty(&self) -> Option<usize> {
        self.segments[1..].iter().position(|s| s.is_none()).map(|p| p + 1)
    }

    fn new_idx_for_segment(&mut self, seg: Segment) -> usize {
        let idx = match self.find_empty() {
            Some(idx) => idx,
            None => lsa_abort("segment store exhausted"),
        };
        self.segments[idx] = Some(seg);
        self.index.insert(seg.addr(), idx);
        idx
    }

    fn free_segment(&mut self, seg: Segment) {
        let idx = match self.index.remove(&seg.addr()) {
            Some(idx) => idx,
            None => lsa_abort("releasing a segment the store does not know"),
        };
        self.segments[idx] = None;
    }

    fn can_allocate_more_segments(&self) -> bool {
        self.find_empty().is_some()
    }
}

/// Per-shard pool of segments and their descriptors.
///
/// Segment states:
///   in use:  owned bit set, free bit clear, counted in `segments_in_use`
///   free:    owned bit set, free bit set, counted in `free_segments`
///   non-LSA: both bits clear
pub(crate) struct SegmentPool {
    store: RefCell<SegmentStore>,
    descriptors: Vec<SegmentDescriptor>,
    segments_in_use: Cell<usize>,
    lsa_owned: RefCell<DynamicBitset>,
    lsa_free: RefCell<DynamicBitset>,
    free_segments: Cell<usize>,
    current_emergency_reserve_goal: Cell<usize>,
    emergency_reserve_max: Cell<usize>,
    allocation_failure_flag: Cell<bool>,
    allocation_enabled: Cell<bool>,
    non_lsa_memory_in_use: Cell<usize>,
    non_lsa_reserve: Cell<usize>,
    stats: Cell<PoolStats>,
}

impl SegmentPool {
    fn new() -> Self {
        let max_segments = memory::total_memory() / SEGMENT_SIZE;
        SegmentPool {
            store: RefCell::new(SegmentStore::new(max_segments)),
            descriptors: (0..max_segments)
                .map(|i| SegmentDescriptor::new(i as u32))
                .collect(),
            segments_in_use: Cell::new(0),
            lsa_owned: RefCell::new(DynamicBitset::new(max_segments)),
            lsa_free: RefCell::new(DynamicBitset::new(max_segments)),
            free_segments: Cell::new(0),
            current_emergency_reserve_goal: Cell::new(1),
            emergency_reserve_max: Cell::new(30),
            allocation_failure_flag: Cell::new(false),
            allocation_enabled: Cell::new(true),
            non_lsa_memory_in_use: Cell::new(0),
            non_lsa_reserve: Cell::new(0),
            stats: Cell::new(PoolStats::default()),
        }
    }

    pub(crate) fn descriptors(&self) -> &[SegmentDescriptor] {
        &self.descriptors
    }

    pub(crate) fn descriptor_at(&self, idx: u32) -> &SegmentDescriptor {
        &self.descriptors[idx as usize]
    }

    pub(crate) fn descriptor(&self, seg: Segment) -> &SegmentDescriptor {
        let idx = match self.store.borrow().index.get(&seg.addr()) {
            Some(&idx) => idx,
            None => lsa_abort("descriptor lookup for an unknown segment"),
        };
        &self.descriptors[idx]
    }

    pub(crate) fn segment_at(&self, idx: u32) -> Segment {
        match self.store.borrow().segments.get(idx as usize).copied().flatten() {
            Some(seg) => seg,
            None => lsa_abort("segment index not backed by a segment"),
        }
    }

    pub(crate) fn segment_from(&self, desc: &SegmentDescriptor) -> Segment {
        debug_assert!(!desc.region().is_null());
        self.segment_at(desc.index())
    }

    /// Segment containing `obj`, or None when the pointer is not inside any
    /// in-use LSA segment.
    pub(crate) fn containing_segment(&self, obj: *const u8) -> Option<Segment> {
        let base = obj as usize & !(SEGMENT_SIZE - 1);
        let idx = self.store.borrow().index.get(&base).copied()?;
        if self.descriptors[idx].region().is_null() {
            None
        } else {
            Some(self.segment_at(idx as u32))
        }
    }

    fn can_allocate_more_segments(&self) -> bool {
        self.allocation_enabled.get()
            && self.store.borrow().can_allocate_more_segments()
            && memory::free_memory() >= self.non_lsa_reserve.get() + SEGMENT_SIZE
    }

    /// Obtain a segment: the highest-indexed free one when above `reserve`,
    /// else a fresh block from the system allocator, else whatever
    /// compaction and eviction can liberate.
    fn allocate_segment(&self, reserve: usize) -> Option<Segment> {
        loop {
            {
                let _no_reclaim = TrackerReclaimerLock::new();
                if self.free_segments.get() > reserve {
                    let free_idx = self.lsa_free.borrow().find_last_set();
                    debug_assert_ne!(free_idx, NPOS);
                    self.lsa_free.borrow_mut().clear(free_idx);
                    self.free_segments.set(self.free_segments.get() - 1);
                    return Some(self.segment_at(free_idx as u32));
                }
                if self.can_allocate_more_segments() {
                    let ptr = memory::alloc(segment_layout());
                    if !ptr.is_null() {
                        // SAFETY: freshly allocated segment-aligned block.
                        let seg = unsafe { Segment::from_base(NonNull::new_unchecked(ptr)) };
                        let idx = self.store.borrow_mut().new_idx_for_segment(seg);
                        self.lsa_owned.borrow_mut().set(idx);
                        return Some(seg);
                    }
                }
            }
            let step = tracker::reclamation_step() * SEGMENT_SIZE;
            if tracker::compact_and_evict(reserve, step, Preempt::No) == 0 {
                return None;
            }
        }
    }

    fn allocate_or_fallback_to_reserve(&self) -> Result<Segment> {
        match self.allocate_segment(self.current_emergency_reserve_goal.get()) {
            Some(seg) => Ok(seg),
            None => {
                self.allocation_failure_flag.set(true);
                Err(Error::BadAlloc)
            }
        }
    }

    pub(crate) fn new_segment(&self, region: *const RegionImpl) -> Result<Segment> {
        let seg = self.allocate_or_fallback_to_reserve()?;
        self.segments_in_use.set(self.segments_in_use.get() + 1);
        let desc = self.descriptor(seg);
        desc.set_free_space(SEGMENT_SIZE);
        desc.set_kind(SegmentKind::Regular);
        desc.set_region(region);
        Ok(seg)
    }

    fn deallocate_segment(&self, seg: Segment) {
        let idx = self.descriptor(seg).index() as usize;
        debug_assert!(self.lsa_owned.borrow().test(idx));
        self.lsa_free.borrow_mut().set(idx);
        self.free_segments.set(self.free_segments.get() + 1);
    }

    pub(crate) fn free_segment(&self, seg: Segment) {
        let desc = self.descriptor(seg);
        self.free_segment_desc(seg, desc);
    }

    pub(crate) fn free_segment_desc(&self, seg: Segment, desc: &SegmentDescriptor) {
        trace!(target: "lsa", "releasing segment {:#x}", seg.addr());
        if desc.kind() == SegmentKind::Bufs {
            self.update_stats(|s| s.lsa_buffer_segments -= 1);
            desc.set_kind(SegmentKind::Regular);
        }
        desc.set_region(std::ptr::null());
        self.deallocate_segment(seg);
        self.segments_in_use.set(self.segments_in_use.get() - 1);
    }

    /// Raise the number of free segments to `emergency_reserve_max`, so a
    /// pool of segments exists even once reclamation has begun.
    pub(crate) fn refill_emergency_reserve(&self) -> Result<()> {
        while self.free_segments.get() < self.emergency_reserve_max.get() {
            let seg = self
                .allocate_segment(self.emergency_reserve_max.get())
                .ok_or(Error::BadAlloc)?;
            self.segments_in_use.set(self.segments_in_use.get() + 1);
            self.free_segment(seg);
        }
        Ok(())
    }

    /// Compact one in-use segment away so it can be released. Fails when the
    /// owning region has reclaim disabled.
    fn compact_segment(&self, seg: Segment) -> bool {
        let desc = self.descriptor(seg);
        // SAFETY: an in-use segment always has a live owning region.
        let region = unsafe { &*desc.region() };
        if !region.reclaiming_enabled() {
            return false;
        }

        // Called with the emergency reserve engaged; open it so alloc_small
        // does not fail if it needs one more segment.
        let _goal = ReservationGoal::new(self, 0);
        let _no_alloc = AllocationLock::new(self);
        let _no_reclaim = TrackerReclaimerLock::new();

        region.compact_one_segment(self, seg, desc);
        true
    }

    /// Return up to `target` segments to the system allocator, walking owned
    /// segments from the lowest address upward and migrating live contents
    /// out of in-use ones.
    pub(crate) fn reclaim_segments(&self, target: usize, preempt: Preempt) -> usize {
        debug!(target: "lsa", "trying to reclaim {} segments", target);

        let mut reclaimed = 0;
        let timer =
            ReclaimTimer::start("reclaim_segments", preempt, target.saturating_mul(SEGMENT_SIZE));

        // A region with reclaim disabled (usually inside an allocating
        // section) fails the compaction of its segments. Unbounded retries
        // on pinned low addresses would fragment the reclaimed memory and
        // livelock the caller, so the failures are bounded: after 10 of them
        // give up, letting the allocating section grow its reserves and
        // retry with every region reclaimable again.
        let mut failed_reclaims_allowance = 10;

        let mut src_idx = self.lsa_owned.borrow().find_first_set();
        while reclaimed != target
            && src_idx != NPOS
            && self.free_segments.get() > self.current_emergency_reserve_goal.get()
        {
            let seg = self.segment_at(src_idx as u32);
            if !self.lsa_free.borrow().test(src_idx) {
                if !self.compact_segment(seg) {
                    failed_reclaims_allowance -= 1;
                    if failed_reclaims_allowance == 0 {
                        break;
                    }
                    src_idx = self.lsa_owned.borrow().find_next_set(src_idx);
                    continue;
                }
            }
            self.lsa_free.borrow_mut().clear(src_idx);
            self.lsa_owned.borrow_mut().clear(src_idx);
            self.store.borrow_mut().free_segment(seg);
            // SAFETY: the segment came from memory::alloc with this layout.
            unsafe { memory::dealloc(seg.base(), segment_layout()) };
            reclaimed += 1;
            self.free_segments.set(self.free_segments.get() - 1);
            if preempt.is_yes() && need_preempt() {
                break;
            }
            src_idx = self.lsa_owned.borrow().find_next_set(src_idx);
        }

        debug!(target: "lsa", "reclaimed {} segments (requested {})", reclaimed, target);
        timer.finish(reclaimed * SEGMENT_SIZE);
        reclaimed
    }

    pub(crate) fn reclaim_all_free_segments(&self) {
        self.reclaim_segments(usize::MAX, Preempt::No);
    }

    /// Grab all of memory so LSA occupies the top of the address range, then
    /// release enough low segments for general use.
    pub(crate) fn prime(&self, available_memory: usize, min_free_memory: usize) {
        let old_reserve_max = self.emergency_reserve_max.replace(usize::MAX);
        self.non_lsa_reserve.set(0);
        if self.refill_emergency_reserve().is_err() {
            self.emergency_reserve_max.set(old_reserve_max);
        }
        // Leave more free memory than the bare minimum to reduce the
        // frequency of segment-migrating reclaim driven by the system
        // allocator.
        let min_gap = 1024 * 1024;
        let max_gap = 32 * 1024 * 1024;
        let gap = (available_memory / 16).clamp(min_gap, max_gap);
        self.non_lsa_reserve.set(min_free_memory + gap);
        self.reclaim_segments(self.non_lsa_reserve.get() / SEGMENT_SIZE, Preempt::No);
    }

    pub(crate) fn segments_in_use(&self) -> usize {
        self.segments_in_use.get()
    }

    pub(crate) fn free_segments(&self) -> usize {
        self.free_segments.get()
    }

    pub(crate) fn unreserved_free_segments(&self) -> usize {
        self.free_segments.get() - self.free_segments.get().min(self.emergency_reserve_max.get())
    }

    pub(crate) fn current_emergency_reserve_goal(&self) -> usize {
        self.current_emergency_reserve_goal.get()
    }

    pub(crate) fn set_current_emergency_reserve_goal(&self, goal: usize) {
        self.current_emergency_reserve_goal.set(goal);
    }

    pub(crate) fn emergency_reserve_max(&self) -> usize {
        self.emergency_reserve_max.get()
    }

    pub(crate) fn set_emergency_reserve_max(&self, max: usize) {
        self.emergency_reserve_max.set(max);
    }

    pub(crate) fn allocation_failure_flag(&self) -> bool {
        self.allocation_failure_flag.get()
    }

    pub(crate) fn clear_allocation_failure_flag(&self) {
        self.allocation_failure_flag.set(false);
    }

    pub(crate) fn add_non_lsa_memory_in_use(&self, n: usize) {
        self.non_lsa_memory_in_use.set(self.non_lsa_memory_in_use.get() + n);
    }

    pub(crate) fn subtract_non_lsa_memory_in_use(&self, n: usize) {
        debug_assert!(self.non_lsa_memory_in_use.get() >= n);
        self.non_lsa_memory_in_use.set(self.non_lsa_memory_in_use.get() - n);
    }

    pub(crate) fn non_lsa_memory_in_use(&self) -> usize {
        self.non_lsa_memory_in_use.get()
    }

    pub(crate) fn total_memory_in_use(&self) -> usize {
        self.non_lsa_memory_in_use.get() + self.segments_in_use.get() * SEGMENT_SIZE
    }

    pub(crate) fn total_free_memory(&self) -> usize {
        self.free_segments.get() * SEGMENT_SIZE
    }

    pub(crate) fn statistics(&self) -> PoolStats {
        self.stats.get()
    }

    fn update_stats(&self, f: impl FnOnce(&mut PoolStats)) {
        let mut stats = self.stats.get();
        f(&mut stats);
        self.stats.set(stats);
    }

    pub(crate) fn on_segment_compaction(&self, used_size: usize) {
        self.update_stats(|s| {
            s.segments_compacted += 1;
            s.memory_compacted += used_size as u64;
        });
    }

    pub(crate) fn on_buf_segment_created(&self) {
        self.update_stats(|s| s.lsa_buffer_segments += 1);
    }

    pub(crate) fn on_memory_allocation(&self, size: usize) {
        self.update_stats(|s| s.memory_allocated += size as u64);
    }

    pub(crate) fn on_memory_deallocation(&self, size: usize) {
        self.update_stats(|s| s.memory_freed += size as u64);
    }

    pub(crate) fn on_memory_eviction(&self, size: usize) {
        self.update_stats(|s| s.memory_evicted += size as u64);
    }
}

/// Scoped override of the emergency reserve goal, used to dip into reserves
/// while compaction itself needs a destination segment.
pub(crate) struct ReservationGoal<'a> {
    pool: &'a SegmentPool,
    old_goal: usize,
}

impl<'a> ReservationGoal<'a> {
    pub(crate) fn new(pool: &'a SegmentPool, goal: usize) -> Self {
        let old_goal = pool.current_emergency_reserve_goal();
        pool.set_current_emergency_reserve_goal(goal);
        ReservationGoal { pool, old_goal }
    }
}

impl Drop for ReservationGoal<'_> {
    fn drop(&mut self) {
        self.pool.set_current_emergency_reserve_goal(self.old_goal);
    }
}

/// Scoped flag preventing new system-allocator calls, held across segment
/// compaction.
pub(crate) struct AllocationLock<'a> {
    pool: &'a SegmentPool,
    prev: bool,
}

impl<'a> AllocationLock<'a> {
    pub(crate) fn new(pool: &'a SegmentPool) -> Self {
        let prev = pool.allocation_enabled.replace(false);
        AllocationLock { pool, prev }
    }
}

impl Drop for AllocationLock<'_> {
    fn drop(&mut self) {
        self.pool.allocation_enabled.set(self.prev);
    }
}

thread_local! {
    static SEGMENT_POOL: SegmentPool = SegmentPool::new();
}

/// Run `f` against the shard's segment pool.
pub(crate) fn with_pool<R>(f: impl FnOnce(&SegmentPool) -> R) -> R {
    SEGMENT_POOL.with(f)
}

/// Like [`with_pool`], but a no-op during thread teardown when the pool is
/// already gone.
pub(crate) fn try_with_pool<R>(f: impl FnOnce(&SegmentPool) -> R) -> Option<R> {
    SEGMENT_POOL.try_with(f).ok()
}
