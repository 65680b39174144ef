//! Log-structured allocator regions.
//!
//! Objects allocated from a region are owned by it and must be freed through
//! it; ownership moves across regions only via `merge`. Allocation dynamics:
//! objects are bump-allocated into fixed-size segments and never cross a
//! segment boundary. When the active segment fills up it is closed and
//! parked in a histogram heap ordered by free space. Frees mark records dead
//! in place; sparse closed segments are eventually compacted — every live
//! object migrated out through its registered migrator — and released.
//! Objects too large for a segment go to the standard allocator instead.
//!
//! Segment layout: each object is preceded by an inline descriptor. Object
//! alignment is respected by stretching the descriptor encoding over the
//! gap, so the descriptor always ends where the object begins and `free`
//! can decode it backwards from the object pointer alone.

use std::cell::{Cell, RefCell};
use std::ptr::NonNull;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, trace};

use crate::buffer::{BufLink, LsaBuffer};
use crate::descriptor::ObjectDescriptor;
use crate::group::RegionListener;
use crate::hist::SegmentHist;
use crate::memory::ReclaimResult;
use crate::migrate::MigratorId;
use crate::occupancy::OccupancyStats;
use crate::pool::{with_pool, SegmentPool};
use crate::sanitizer::RegionSanitizer;
use crate::segment::{
    Segment, SegmentDescriptor, SegmentKind, BUF_ALIGN, MAX_MANAGED_OBJECT_SIZE, SEGMENT_SIZE,
};
use crate::strategy::{standard_allocator, AllocationStrategy};
use crate::tracker;
use crate::util::{align_up, lsa_abort, POISON_BYTE};
use crate::{Error, Result};

/// Frees some amount of objects from the region it is attached to. Assuming
/// no new objects arrive, repeated calls must eventually report
/// `ReclaimedNothing`.
pub type EvictionFn = Box<dyn FnMut() -> ReclaimResult>;

/// Trailing sentinel on objects that bypassed the segments, so a free routed
/// through the wrong path is caught.
const NON_LSA_COOKIE: u64 = 0xbadc_affe;
const COOKIE_SIZE: usize = std::mem::size_of::<u64>();

static NEXT_REGION_ID: AtomicU64 = AtomicU64::new(0);

/// Scoped flag preventing this region from compacting itself while inside
/// one of its own methods.
struct CompactionLock<'a> {
    region: &'a RegionImpl,
    prev: bool,
}

impl<'a> CompactionLock<'a> {
    fn new(region: &'a RegionImpl) -> Self {
        let prev = region.reclaiming_enabled.replace(false);
        CompactionLock { region, prev }
    }
}

impl Drop for CompactionLock<'_> {
    fn drop(&mut self) {
        self.region.reclaiming_enabled.set(self.prev);
    }
}

pub(crate) struct RegionImpl {
    reclaiming_enabled: Cell<bool>,
    active: Cell<Option<Segment>>,
    active_offset: Cell<usize>,
    buf_active: Cell<Option<Segment>>,
    buf_active_offset: Cell<usize>,
    /// Emergency storage for the slot table of a fresh buffer segment, so
    /// `new_buf_active` cannot fail to allocate it mid-compaction.
    buf_ptrs_reserve: RefCell<Vec<Weak<BufLink>>>,
    /// Closed segments only.
    segment_descs: RefCell<SegmentHist>,
    closed_occupancy: Cell<OccupancyStats>,
    non_lsa_occupancy: Cell<OccupancyStats>,
    /// Usage as reported to the listener. Coarser than `occupancy()`.
    evictable_space: Cell<usize>,
    /// And-mask applied to `evictable_space` on read; zeroed by
    /// `ground_evictable_occupancy` to force empty reports.
    evictable_space_mask: Cell<usize>,
    evictable: Cell<bool>,
    invalidate_counter: Cell<u64>,
    id: u64,
    eviction_fn: RefCell<Option<EvictionFn>>,
    listener: RefCell<Option<Rc<dyn RegionListener>>>,
    sanitizer: RegionSanitizer,
}

impl RegionImpl {
    fn create() -> Rc<RegionImpl> {
        let region = Rc::new(RegionImpl {
            reclaiming_enabled: Cell::new(true),
            active: Cell::new(None),
            active_offset: Cell::new(0),
            buf_active: Cell::new(None),
            buf_active_offset: Cell::new(0),
            buf_ptrs_reserve: RefCell::new(Vec::with_capacity(SEGMENT_SIZE / BUF_ALIGN)),
            segment_descs: RefCell::new(SegmentHist::new()),
            closed_occupancy: Cell::new(OccupancyStats::default()),
            non_lsa_occupancy: Cell::new(OccupancyStats::default()),
            evictable_space: Cell::new(0),
            evictable_space_mask: Cell::new(usize::MAX),
            evictable: Cell::new(false),
            invalidate_counter: Cell::new(0),
            id: NEXT_REGION_ID.fetch_add(1, Ordering::Relaxed),
            eviction_fn: RefCell::new(None),
            listener: RefCell::new(None),
            sanitizer: RegionSanitizer::default(),
        });
        tracker::register_region(&region);
        region
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn reclaiming_enabled(&self) -> bool {
        self.reclaiming_enabled.get()
    }

    pub(crate) fn set_reclaiming_enabled(&self, enabled: bool) {
        self.reclaiming_enabled.set(enabled);
    }

    pub(crate) fn invalidate_counter(&self) -> u64 {
        self.invalidate_counter.get()
    }

    pub(crate) fn invalidate_references(&self) {
        self.invalidate_counter.set(self.invalidate_counter.get() + 1);
    }

    fn listener(&self) -> Option<Rc<dyn RegionListener>> {
        self.listener.borrow().clone()
    }

    fn new_segment(&self, pool: &SegmentPool) -> Result<Segment> {
        let seg = pool.new_segment(self as *const RegionImpl)?;
        if let Some(listener) = self.listener() {
            self.evictable_space.set(self.evictable_space.get() + SEGMENT_SIZE);
            listener.increase_usage(SEGMENT_SIZE);
        }
        Ok(seg)
    }

    fn free_segment_desc(&self, pool: &SegmentPool, seg: Segment, desc: &SegmentDescriptor) {
        pool.free_segment_desc(seg, desc);
        if let Some(listener) = self.listener() {
            self.evictable_space.set(self.evictable_space.get() - SEGMENT_SIZE);
            listener.decrease_usage(SEGMENT_SIZE);
        }
    }

    fn close_active(&self, pool: &SegmentPool) {
        let Some(seg) = self.active.get() else { return };
        let offset = self.active_offset.get();
        if offset < SEGMENT_SIZE {
            let dead = ObjectDescriptor::make_dead(SEGMENT_SIZE - offset);
            // SAFETY: the tail is unused and large enough for the encoding.
            unsafe {
                dead.encode(seg.at(offset));
            }
        }
        let desc = pool.descriptor(seg);
        trace!(
            target: "lsa",
            "closing segment {:#x}, used={}, waste={} [B]",
            seg.addr(), desc.occupancy(), SEGMENT_SIZE - offset
        );
        self.closed_occupancy.set(self.closed_occupancy.get() + desc.occupancy());
        self.segment_descs.borrow_mut().push(pool.descriptors(), desc.index());
        self.active.set(None);
    }

    fn close_buf_active(&self, pool: &SegmentPool) {
        let Some(seg) = self.buf_active.get() else { return };
        let desc = pool.descriptor(seg);
        trace!(
            target: "lsa",
            "closing buf segment {:#x}, used={}",
            seg.addr(), desc.occupancy()
        );
        self.closed_occupancy.set(self.closed_occupancy.get() + desc.occupancy());
        self.segment_descs.borrow_mut().push(pool.descriptors(), desc.index());
        self.buf_active.set(None);
    }

    fn close_and_open(&self, pool: &SegmentPool) -> Result<()> {
        let new_active = self.new_segment(pool)?;
        self.close_active(pool);
        self.active.set(Some(new_active));
        self.active_offset.set(0);
        Ok(())
    }

    /// Bump-allocate one record in the active segment, closing and opening
    /// segments as needed. Returns the object pointer; the descriptor ends
    /// exactly where the object starts.
    unsafe fn alloc_small(
        &self,
        pool: &SegmentPool,
        desc: ObjectDescriptor,
        size: usize,
        alignment: usize,
    ) -> Result<*mut u8> {
        loop {
            let seg = match self.active.get() {
                Some(seg) => seg,
                None => {
                    let seg = self.new_segment(pool)?;
                    self.active.set(Some(seg));
                    self.active_offset.set(0);
                    seg
                }
            };

            let offset = self.active_offset.get();
            let obj_offset = align_up(offset + desc.encoded_size(), alignment);
            if obj_offset + size > SEGMENT_SIZE {
                self.close_and_open(pool)?;
                continue;
            }

            // Non-canonical encoding spans the alignment pad so the
            // descriptor still immediately precedes the object.
            let obj = desc.encode_padded(seg.at(offset), obj_offset - offset);
            self.active_offset.set(obj_offset + size);
            pool.descriptor(seg).record_alloc(self.active_offset.get() - offset);
            return Ok(obj);
        }
    }

    /// Walk every record of `seg`, calling `f` on the live ones.
    ///
    /// # Safety
    /// `seg` must hold a well-formed descriptor chain and `f` must not
    /// allocate from or free into `seg`.
    unsafe fn for_each_live(
        &self,
        seg: Segment,
        mut f: impl FnMut(&ObjectDescriptor, *mut u8, usize),
    ) {
        let end = seg.at(SEGMENT_SIZE) as *const u8;
        let mut pos = seg.at(0) as *const u8;
        while pos < end {
            let record_start = pos;
            let (desc, obj) = ObjectDescriptor::decode_forward(pos);
            if desc.is_live() {
                let size = desc.live_size(obj);
                f(&desc, obj as *mut u8, size);
                pos = obj.add(size);
            } else {
                pos = record_start.add(desc.dead_size());
            }
        }
    }

    pub(crate) unsafe fn do_alloc(
        &self,
        pool: &SegmentPool,
        migrator: MigratorId,
        size: usize,
        alignment: usize,
    ) -> Result<NonNull<u8>> {
        let _lock = CompactionLock::new(self);
        pool.on_memory_allocation(size);
        if size > MAX_MANAGED_OBJECT_SIZE {
            let ptr = standard_allocator().alloc(migrator, size + COOKIE_SIZE, alignment)?;
            let allocated_size = standard_allocator().usable_size(ptr.as_ptr());
            (ptr.as_ptr().add(allocated_size - COOKIE_SIZE) as *mut u64)
                .write_unaligned(NON_LSA_COOKIE);
            self.non_lsa_occupancy
                .set(self.non_lsa_occupancy.get() + OccupancyStats::new(0, allocated_size));
            if let Some(listener) = self.listener() {
                self.evictable_space.set(self.evictable_space.get() + allocated_size);
                listener.increase_usage(allocated_size);
            }
            pool.add_non_lsa_memory_in_use(allocated_size);
            Ok(ptr)
        } else {
            let obj = self.alloc_small(pool, ObjectDescriptor::live(migrator), size, alignment)?;
            self.sanitizer.on_allocation(obj, size);
            // SAFETY: alloc_small never returns null.
            Ok(NonNull::new_unchecked(obj))
        }
    }

    unsafe fn on_non_lsa_free(&self, pool: &SegmentPool, obj: *mut u8) {
        let allocated_size = standard_allocator().usable_size(obj);
        let cookie = (obj.add(allocated_size - COOKIE_SIZE) as *const u64).read_unaligned();
        if cookie != NON_LSA_COOKIE {
            lsa_abort("corrupt sentinel behind a non-LSA object");
        }
        self.non_lsa_occupancy
            .set(self.non_lsa_occupancy.get() - OccupancyStats::new(0, allocated_size));
        if let Some(listener) = self.listener() {
            self.evictable_space.set(self.evictable_space.get() - allocated_size);
            listener.decrease_usage(allocated_size);
        }
        pool.subtract_non_lsa_memory_in_use(allocated_size);
    }

    pub(crate) unsafe fn do_free(&self, pool: &SegmentPool, obj: *mut u8) {
        let _lock = CompactionLock::new(self);
        if pool.containing_segment(obj).is_none() {
            self.on_non_lsa_free(pool, obj);
            standard_allocator().free(obj);
            return;
        }
        let (desc, _) = ObjectDescriptor::decode_backward(obj);
        #[cfg(debug_assertions)]
        if !desc.is_live() {
            lsa_abort("double free of an object");
        }
        self.do_free_sized(pool, obj, desc.live_size(obj));
    }

    pub(crate) unsafe fn do_free_sized(&self, pool: &SegmentPool, obj: *mut u8, size: usize) {
        let _lock = CompactionLock::new(self);
        let seg = match pool.containing_segment(obj) {
            None => {
                self.on_non_lsa_free(pool, obj);
                // The block is one sentinel cookie larger than the object.
                standard_allocator().free_sized(obj, size + COOKIE_SIZE);
                return;
            }
            Some(seg) => seg,
        };

        self.sanitizer.on_free(obj, size);

        let seg_desc = pool.descriptor(seg);
        let (desc, desc_start) = ObjectDescriptor::decode_backward(obj);
        #[cfg(debug_assertions)]
        {
            if !desc.is_live() {
                lsa_abort("double free of an object");
            }
            if desc.live_size(obj) != size {
                lsa_abort("free size does not match the allocated size");
            }
        }
        let _ = desc;

        let dead_size = size + (obj as usize - desc_start as usize);
        let dead = ObjectDescriptor::make_dead(dead_size);
        let after_dead = dead.encode(desc_start as *mut u8);
        if cfg!(debug_assertions) {
            let poisoned = dead_size - (after_dead as usize - desc_start as usize);
            std::ptr::write_bytes(after_dead, POISON_BYTE, poisoned);
        }

        let is_active = self.active.get() == Some(seg);
        if !is_active {
            self.closed_occupancy.set(self.closed_occupancy.get() - seg_desc.occupancy());
        }

        seg_desc.record_free(dead_size);
        pool.on_memory_deallocation(dead_size);

        if !is_active {
            if seg_desc.is_empty() {
                self.segment_descs.borrow_mut().erase(pool.descriptors(), seg_desc.index());
                self.free_segment_desc(pool, seg, seg_desc);
            } else {
                self.segment_descs.borrow_mut().adjust(pool.descriptors(), seg_desc.index());
                self.closed_occupancy.set(self.closed_occupancy.get() + seg_desc.occupancy());
            }
        }
    }

    pub(crate) unsafe fn do_object_memory_size(&self, pool: &SegmentPool, obj: *const u8) -> usize {
        if pool.containing_segment(obj).is_none() {
            return standard_allocator().object_memory_size(obj);
        }
        let (desc, _) = ObjectDescriptor::decode_backward(obj);
        desc.encoded_size() + desc.live_size(obj)
    }

    pub(crate) fn alloc_buf(&self, pool: &SegmentPool, buf_size: usize) -> Result<LsaBuffer> {
        // Can be re-entered from the allocation below when reclamation
        // triggers segment compaction.
        if buf_size > SEGMENT_SIZE {
            return Err(Error::BufferTooLarge { size: buf_size });
        }

        if self.buf_active_offset.get() + buf_size > SEGMENT_SIZE {
            self.close_buf_active(pool);
        }
        if self.buf_active.get().is_none() {
            self.new_buf_active(pool)?;
        }

        let seg = match self.buf_active.get() {
            Some(seg) => seg,
            None => lsa_abort("no active buffer segment after refill"),
        };
        let offset = self.buf_active_offset.get();
        // SAFETY: offset + buf_size fits the segment by the check above.
        let buf = unsafe { seg.at(offset) };

        let desc = pool.descriptor(seg);
        let mut links = desc.buf_pointers.borrow_mut();
        let link = BufLink::new(buf, buf_size, desc.index(), links.len() as u32);
        links.push(Rc::downgrade(&link));
        drop(links);

        let alloc_size = align_up(buf_size, BUF_ALIGN);
        desc.record_alloc(alloc_size);
        self.buf_active_offset.set(offset + alloc_size);

        Ok(LsaBuffer::engage(link))
    }

    pub(crate) fn free_buf(&self, pool: &SegmentPool, link: &BufLink) {
        let idx = link.seg_index.get();
        let desc = pool.descriptor_at(idx);
        let seg = pool.segment_at(idx);
        let is_active = self.buf_active.get() == Some(seg);

        if !is_active {
            self.closed_occupancy.set(self.closed_occupancy.get() - desc.occupancy());
        }

        desc.record_free(align_up(link.size.get(), BUF_ALIGN));

        // Keep the slot table packed so compaction only walks live buffers:
        // replace this link's slot with the last one.
        {
            let mut links = desc.buf_pointers.borrow_mut();
            let slot = link.slot.get() as usize;
            links.swap_remove(slot);
            if let Some(moved) = links.get(slot).and_then(Weak::upgrade) {
                moved.slot.set(slot as u32);
            }
        }
        link.disengage();

        if !is_active {
            if desc.is_empty() {
                debug_assert!(desc.buf_pointers.borrow().is_empty());
                self.segment_descs.borrow_mut().erase(pool.descriptors(), idx);
                // Drop the slot-table storage before the segment goes back
                // to the pool as a generic one.
                *desc.buf_pointers.borrow_mut() = Vec::new();
                self.free_segment_desc(pool, seg, desc);
            } else {
                self.segment_descs.borrow_mut().adjust(pool.descriptors(), idx);
                self.closed_occupancy.set(self.closed_occupancy.get() + desc.occupancy());
            }
        }
    }

    fn new_buf_active(&self, pool: &SegmentPool) -> Result<()> {
        let mut slots = std::mem::take(&mut *self.buf_ptrs_reserve.borrow_mut());
        slots.clear();
        if slots.capacity() < SEGMENT_SIZE / BUF_ALIGN {
            slots = Vec::with_capacity(SEGMENT_SIZE / BUF_ALIGN);
        }
        let seg = match self.new_segment(pool) {
            Ok(seg) => seg,
            Err(e) => {
                *self.buf_ptrs_reserve.borrow_mut() = slots;
                return Err(e);
            }
        };
        if self.buf_active.get().is_some() {
            // The allocation above can re-enter through compaction and open
            // an active buffer segment of its own; close it.
            self.close_buf_active(pool);
        }
        debug_assert!(crate::util::is_aligned(seg.addr(), BUF_ALIGN));
        let desc = pool.descriptor(seg);
        *desc.buf_pointers.borrow_mut() = slots;
        desc.set_kind(SegmentKind::Bufs);
        pool.on_buf_segment_created();
        self.buf_active.set(Some(seg));
        self.buf_active_offset.set(0);
        Ok(())
    }

    fn compact_segment_locked(&self, pool: &SegmentPool, seg: Segment, desc: &SegmentDescriptor) {
        let seg_occupancy = desc.occupancy();
        debug!(
            target: "lsa",
            "compacting segment {:#x} from region {}, {}",
            seg.addr(), self.id, seg_occupancy
        );

        self.invalidate_references();

        if desc.kind() == SegmentKind::Bufs {
            // Moving the slot table out hands its storage back to the
            // reserve afterwards, keeping alloc_buf able to make progress.
            let links = std::mem::take(&mut *desc.buf_pointers.borrow_mut());
            for old_link in links.iter().filter_map(Weak::upgrade) {
                debug_assert_eq!(old_link.seg_index.get(), desc.index());
                let size = old_link.size.get();
                let mut dst = match self.alloc_buf(pool, size) {
                    Ok(dst) => dst,
                    Err(_) => lsa_abort("allocation failure during buffer segment compaction"),
                };
                let Some(new_link) = dst.link.take() else {
                    lsa_abort("buffer allocated without a link");
                };
                // SAFETY: source and destination are live, disjoint buffers
                // of `size` bytes.
                unsafe {
                    std::ptr::copy_nonoverlapping(old_link.buf.get(), new_link.buf.get(), size);
                }
                // Transfer the new slot to the client's link; the handle
                // keeps pointing at live bytes without client action.
                old_link.buf.set(new_link.buf.get());
                old_link.seg_index.set(new_link.seg_index.get());
                old_link.slot.set(new_link.slot.get());
                let dst_desc = pool.descriptor_at(old_link.seg_index.get());
                dst_desc.buf_pointers.borrow_mut()[old_link.slot.get() as usize] =
                    Rc::downgrade(&old_link);
            }
            let mut links = links;
            links.clear();
            *self.buf_ptrs_reserve.borrow_mut() = links;
        } else {
            // SAFETY: closed regular segments hold a well-formed descriptor
            // chain; migrators do not touch the source segment beyond the
            // object being moved.
            unsafe {
                self.for_each_live(seg, |odesc, obj, size| {
                    let dst = match self.alloc_small(pool, *odesc, size, odesc.alignment()) {
                        Ok(dst) => dst,
                        Err(_) => lsa_abort("allocation failure during segment compaction"),
                    };
                    self.sanitizer.on_migrate(obj, size, dst);
                    odesc.migrator().migrate(obj, dst, size);
                });
            }
        }

        self.free_segment_desc(pool, seg, desc);
        pool.on_segment_compaction(seg_occupancy.used_space());
    }

    /// Compact the closed segment most worth compacting.
    pub(crate) fn compact(&self, pool: &SegmentPool) {
        let _lock = CompactionLock::new(self);
        let idx = match self.segment_descs.borrow_mut().pop_one_of_largest(pool.descriptors()) {
            Some(idx) => idx,
            None => return,
        };
        let desc = pool.descriptor_at(idx);
        self.closed_occupancy.set(self.closed_occupancy.get() - desc.occupancy());
        let seg = pool.segment_from(desc);
        self.compact_segment_locked(pool, seg, desc);
    }

    /// Compact everything. Mainly for testing; invalidates references.
    pub(crate) fn full_compaction(&self, pool: &SegmentPool) -> Result<()> {
        let _lock = CompactionLock::new(self);
        debug!(target: "lsa", "full compaction, {}", self.occupancy(pool));
        self.close_and_open(pool)?;
        self.close_buf_active(pool);
        let mut all = SegmentHist::new();
        std::mem::swap(&mut *self.segment_descs.borrow_mut(), &mut all);
        self.closed_occupancy.set(OccupancyStats::default());
        while let Some(idx) = all.pop_one_of_largest(pool.descriptors()) {
            let desc = pool.descriptor_at(idx);
            self.compact_segment_locked(pool, pool.segment_from(desc), desc);
        }
        debug!(target: "lsa", "done, {}", self.occupancy(pool));
        Ok(())
    }

    /// Compact one specific segment on behalf of the pool's address-ordered
    /// reclaim. Closes the segment first if it is an active one.
    pub(crate) fn compact_one_segment(
        &self,
        pool: &SegmentPool,
        seg: Segment,
        desc: &SegmentDescriptor,
    ) {
        let _lock = CompactionLock::new(self);
        if self.active.get() == Some(seg) {
            self.close_active(pool);
        } else if self.buf_active.get() == Some(seg) {
            self.close_buf_active(pool);
        }
        self.segment_descs.borrow_mut().erase(pool.descriptors(), desc.index());
        self.closed_occupancy.set(self.closed_occupancy.get() - desc.occupancy());
        self.compact_segment_locked(pool, seg, desc);
    }

    pub(crate) fn occupancy(&self, pool: &SegmentPool) -> OccupancyStats {
        let mut total = self.non_lsa_occupancy.get() + self.closed_occupancy.get();
        if let Some(seg) = self.active.get() {
            total += pool.descriptor(seg).occupancy();
        }
        if let Some(seg) = self.buf_active.get() {
            total += pool.descriptor(seg).occupancy();
        }
        total
    }

    pub(crate) fn compactible_occupancy(&self) -> OccupancyStats {
        self.closed_occupancy.get()
    }

    pub(crate) fn evictable_occupancy(&self) -> OccupancyStats {
        OccupancyStats::new(0, self.evictable_space.get() & self.evictable_space_mask.get())
    }

    pub(crate) fn ground_evictable_occupancy(&self) {
        self.evictable_space_mask.set(0);
        if let Some(listener) = self.listener() {
            listener.decrease_evictable_usage();
        }
    }

    /// Occupancy of the sparsest closed segment.
    pub(crate) fn min_occupancy(&self, pool: &SegmentPool) -> OccupancyStats {
        match self.segment_descs.borrow().one_of_largest() {
            None => OccupancyStats::default(),
            Some(idx) => pool.descriptor_at(idx).occupancy(),
        }
    }

    /// True when `compact()` makes forward progress, so that
    /// `while is_compactible() { compact() }` terminates. Two segments per
    /// allocation segregation group (small objects, buffers) are held back
    /// to guarantee progress during compaction.
    pub(crate) fn is_compactible(&self) -> bool {
        self.reclaiming_enabled.get()
            && self.closed_occupancy.get().free_space() >= 4 * SEGMENT_SIZE
            && self.segment_descs.borrow().contains_above_min()
    }

    pub(crate) fn is_idle_compactible(&self) -> bool {
        self.is_compactible()
    }

    pub(crate) fn is_evictable(&self) -> bool {
        self.evictable.get() && self.reclaiming_enabled.get()
    }

    pub(crate) fn evict_some(&self, pool: &SegmentPool) -> ReclaimResult {
        self.invalidate_references();
        let freed_before = pool.statistics().memory_freed;
        let mut eviction_fn = self.eviction_fn.borrow_mut();
        let result = match eviction_fn.as_mut() {
            Some(evict) => evict(),
            None => return ReclaimResult::ReclaimedNothing,
        };
        drop(eviction_fn);
        pool.on_memory_eviction((pool.statistics().memory_freed - freed_before) as usize);
        result
    }

    pub(crate) fn make_evictable(&self, evict: EvictionFn) {
        self.evictable.set(true);
        *self.eviction_fn.borrow_mut() = Some(evict);
    }

    pub(crate) fn make_not_evictable(&self) {
        self.evictable.set(false);
        *self.eviction_fn.borrow_mut() = None;
    }

    /// Move all of `other`'s segments into `self`, leaving `other` a valid,
    /// empty region. Does not invalidate references to allocated objects and
    /// allocates no new segment.
    fn merge_from(
        &self,
        pool: &SegmentPool,
        other: &RegionImpl,
        self_region: &Region,
        other_region: &Region,
    ) {
        let _lock1 = CompactionLock::new(self);
        let _lock2 = CompactionLock::new(other);

        // Unlisten around the transfer; del/add reconcile the listeners'
        // usage accounting from occupancy.
        let self_listener = self.listener();
        if let Some(listener) = &self_listener {
            listener.del(self_region);
        }
        let other_listener = other.listener();
        if let Some(listener) = &other_listener {
            listener.del(other_region);
        }

        if let Some(active) = self.active.get() {
            if pool.descriptor(active).is_empty() {
                pool.free_segment(active);
                self.active.set(None);
            }
        }
        if self.active.get().is_none() {
            self.active.set(other.active.replace(None));
            self.active_offset.set(other.active_offset.get());
            if let Some(active) = self.active.get() {
                pool.descriptor(active).set_region(self as *const RegionImpl);
            }
        } else {
            other.close_active(pool);
        }
        other.close_buf_active(pool);

        {
            let mut ours = self.segment_descs.borrow_mut();
            let mut theirs = other.segment_descs.borrow_mut();
            theirs.for_each(|idx| pool.descriptor_at(idx).set_region(self as *const RegionImpl));
            ours.merge(pool.descriptors(), &mut theirs);
        }

        self.closed_occupancy
            .set(self.closed_occupancy.get() + other.closed_occupancy.replace(OccupancyStats::default()));
        self.non_lsa_occupancy
            .set(self.non_lsa_occupancy.get() + other.non_lsa_occupancy.replace(OccupancyStats::default()));
        self.evictable_space
            .set(self.evictable_space.get() + other.evictable_space.replace(0));

        // Make sure both regions notice future reclaim-counter increments.
        let counter = self.invalidate_counter.get().max(other.invalidate_counter.get());
        self.invalidate_counter.set(counter);
        other.invalidate_counter.set(counter);

        self.sanitizer.merge(&other.sanitizer);

        if let Some(listener) = &self_listener {
            listener.add(self_region);
        }
        if let Some(listener) = &other_listener {
            listener.add(other_region);
        }
    }
}

impl AllocationStrategy for RegionImpl {
    unsafe fn alloc(
        &self,
        migrator: MigratorId,
        size: usize,
        alignment: usize,
    ) -> Result<NonNull<u8>> {
        with_pool(|pool| self.do_alloc(pool, migrator, size, alignment))
    }

    unsafe fn free(&self, obj: *mut u8) {
        with_pool(|pool| self.do_free(pool, obj));
    }

    unsafe fn free_sized(&self, obj: *mut u8, size: usize) {
        with_pool(|pool| self.do_free_sized(pool, obj, size));
    }

    unsafe fn object_memory_size(&self, obj: *const u8) -> usize {
        with_pool(|pool| self.do_object_memory_size(pool, obj))
    }
}

impl Drop for RegionImpl {
    fn drop(&mut self) {
        self.sanitizer.on_region_destruction();
        tracker::unregister_region(self.id);

        with_pool(|pool| {
            loop {
                let idx = self.segment_descs.borrow_mut().pop_one_of_largest(pool.descriptors());
                let Some(idx) = idx else { break };
                let desc = pool.descriptor_at(idx);
                // Destroying a region that still owns objects is a contract
                // violation: report it in debug builds, UB otherwise.
                #[cfg(debug_assertions)]
                if !desc.is_empty() {
                    lsa_abort("region destroyed while owning live objects");
                }
                self.free_segment_desc(pool, pool.segment_from(desc), desc);
            }
            self.closed_occupancy.set(OccupancyStats::default());
            if let Some(seg) = self.active.replace(None) {
                #[cfg(debug_assertions)]
                if !pool.descriptor(seg).is_empty() {
                    lsa_abort("region destroyed while owning live objects");
                }
                self.free_segment_desc(pool, seg, pool.descriptor(seg));
            }
            if let Some(seg) = self.buf_active.replace(None) {
                #[cfg(debug_assertions)]
                if !pool.descriptor(seg).is_empty() {
                    lsa_abort("region destroyed while owning live buffers");
                }
                self.free_segment_desc(pool, seg, pool.descriptor(seg));
            }
        });
    }
}

/// A log-structured allocation domain with exclusive ownership of a set of
/// segments. Registered with the shard tracker on construction, unregistered
/// on destruction; must be empty by then.
pub struct Region {
    inner: Rc<RegionImpl>,
}

impl Region {
    pub fn new() -> Region {
        Region {
            inner: RegionImpl::create(),
        }
    }

    /// Attach a listener observing this region's lifecycle and usage.
    pub fn listen(&self, listener: Rc<dyn RegionListener>) {
        *self.inner.listener.borrow_mut() = Some(Rc::clone(&listener));
        listener.add(self);
    }

    pub fn unlisten(&self) {
        if let Some(listener) = self.inner.listener.borrow_mut().take() {
            listener.del(self);
        }
    }

    pub fn occupancy(&self) -> OccupancyStats {
        with_pool(|pool| self.inner.occupancy(pool))
    }

    /// Occupancy of the closed segments, the part compaction can reach.
    pub fn compactible_occupancy(&self) -> OccupancyStats {
        self.inner.compactible_occupancy()
    }

    /// The small-object allocation interface of this region.
    pub fn allocator(&self) -> &dyn AllocationStrategy {
        &*self.inner
    }

    /// Allocate a buffer of `size` bytes, aligned to 4 KiB. Sizes that are
    /// not a multiple of the alignment waste the remainder of the page.
    pub fn alloc_buf(&self, size: usize) -> Result<LsaBuffer> {
        with_pool(|pool| self.inner.alloc_buf(pool, size))
    }

    /// Merge `other` into this region. All segments change ownership;
    /// `other` stays a valid, empty region. References to allocated objects
    /// remain valid.
    pub fn merge(&self, other: &Region) {
        if !Rc::ptr_eq(&self.inner, &other.inner) {
            with_pool(|pool| self.inner.merge_from(pool, &other.inner, self, other));
        }
    }

    /// Compact the single closed segment most worth compacting.
    /// Invalidates references. `while r.is_compactible() { r.compact() }`
    /// terminates.
    pub fn compact(&self) {
        with_pool(|pool| self.inner.compact(pool));
    }

    /// Compact every closed segment. Invalidates references.
    pub fn full_compaction(&self) -> Result<()> {
        with_pool(|pool| self.inner.full_compaction(pool))
    }

    /// Run the eviction function once. Mainly for testing.
    pub fn evict_some(&self) -> ReclaimResult {
        if self.inner.is_evictable() {
            with_pool(|pool| self.inner.evict_some(pool))
        } else {
            ReclaimResult::ReclaimedNothing
        }
    }

    /// Make this region evictable: `evict` is called when the allocator
    /// decides to reclaim space from it, and should free some objects.
    pub fn make_evictable(&self, evict: impl FnMut() -> ReclaimResult + 'static) {
        self.inner.make_evictable(Box::new(evict));
    }

    pub fn make_not_evictable(&self) {
        self.inner.make_not_evictable();
    }

    /// When disabled, the region is skipped by tracker reclaim and keeps its
    /// objects in place. Enabled by default.
    pub fn set_reclaiming_enabled(&self, enabled: bool) {
        self.inner.set_reclaiming_enabled(enabled);
    }

    pub fn reclaiming_enabled(&self) -> bool {
        self.inner.reclaiming_enabled()
    }

    /// Monotonic value bumped whenever this region is compacted or evicted
    /// from, which invalidates raw references into it. While the value is
    /// unchanged, references remain valid.
    pub fn reclaim_counter(&self) -> u64 {
        self.inner.invalidate_counter()
    }

    /// Subsequent `evictable_occupancy()` calls report empty occupancy.
    pub fn ground_evictable_occupancy(&self) {
        self.inner.ground_evictable_occupancy();
    }

    /// This region's usage as tracked in its parent group. Coarser than
    /// `occupancy()`; zero after `ground_evictable_occupancy()`.
    pub fn evictable_occupancy(&self) -> OccupancyStats {
        self.inner.evictable_occupancy()
    }

    /// Whether compaction of this region can currently make progress.
    pub fn is_compactible(&self) -> bool {
        self.inner.is_compactible()
    }

    pub fn id(&self) -> u64 {
        self.inner.id()
    }

    /// Another handle to an existing region, for callers handed one by a
    /// group query. Handles share the region; it is destroyed with the last
    /// one.
    pub(crate) fn from_rc(inner: Rc<RegionImpl>) -> Region {
        Region { inner }
    }

    pub(crate) fn impl_ptr(&self) -> *const RegionImpl {
        Rc::as_ptr(&self.inner)
    }

    pub(crate) fn inner(&self) -> &Rc<RegionImpl> {
        &self.inner
    }
}

impl Default for Region {
    fn default() -> Self {
        Region::new()
    }
}

/// Forces references into the region to stay valid for the guard's lifetime
/// by disabling compaction and eviction. Can be nested.
pub struct ReclaimLock<'a> {
    region: &'a Region,
    prev: bool,
}

impl<'a> ReclaimLock<'a> {
    pub fn new(region: &'a Region) -> Self {
        let prev = region.reclaiming_enabled();
        region.set_reclaiming_enabled(false);
        ReclaimLock { region, prev }
    }
}

impl Drop for ReclaimLock<'_> {
    fn drop(&mut self) {
        self.region.set_reclaiming_enabled(self.prev);
    }
}
