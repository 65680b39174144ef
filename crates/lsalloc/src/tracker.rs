//! Controller for all LSA regions. There is one per shard.
//!
//! The tracker drives the three-stage reclaim pipeline: return already-free
//! segments to the system allocator, compact the sparsest segments and evict
//! from evictable regions, then return what that freed. It is entered from
//! the low-memory hook of the system allocator, from the background
//! reclaimer, and from the segment pool when a segment allocation cannot be
//! satisfied.

use std::cell::{Cell, RefCell};
use std::cmp::Ordering as CmpOrdering;
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use crate::background::BackgroundReclaimer;
use crate::memory::{self, ReclaimResult};
use crate::occupancy::OccupancyStats;
use crate::pool::{with_pool, PoolStats, ReservationGoal, SegmentPool};
use crate::region::RegionImpl;
use crate::runtime::{need_preempt, IdleCpuHandlerResult, Preempt, SchedulingGroup};
use crate::sanitizer;
use crate::segment::{
    MAX_USED_SPACE_RATIO_FOR_COMPACTION_PERCENT, SEGMENT_SIZE, SEGMENT_SIZE_SHIFT,
};
use crate::util::align_up;

/// Tracker configuration, applied through [`configure`].
pub struct Config {
    /// Compact the sparsest segments whenever the CPU would otherwise idle.
    pub defragment_on_idle: bool,
    /// Abort the process instead of surfacing LSA allocation failure.
    pub abort_on_lsa_bad_alloc: bool,
    /// Record allocation backtraces for sanitizer reports. Debug builds
    /// only; slower.
    pub sanitizer_report_backtrace: bool,
    /// Minimum number of segments reclaimed per reclamation cycle.
    pub lsa_reclamation_step: usize,
    /// Scheduling group for the background reclaimer; None disables it.
    pub background_reclaim_sched_group: Option<SchedulingGroup>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            defragment_on_idle: false,
            abort_on_lsa_bad_alloc: false,
            sanitizer_report_backtrace: false,
            lsa_reclamation_step: 1,
            background_reclaim_sched_group: None,
        }
    }
}

struct TrackerImpl {
    regions: RefCell<Vec<(u64, Weak<RegionImpl>)>>,
    reclaiming_enabled: Cell<bool>,
    reclamation_step: Cell<usize>,
    abort_on_bad_alloc: Cell<bool>,
    defragment_on_idle: Cell<bool>,
    background: RefCell<Option<Rc<BackgroundReclaimer>>>,
}

thread_local! {
    static TRACKER: TrackerImpl = TrackerImpl {
        regions: RefCell::new(Vec::new()),
        reclaiming_enabled: Cell::new(true),
        reclamation_step: Cell::new(1),
        abort_on_bad_alloc: Cell::new(false),
        defragment_on_idle: Cell::new(false),
        background: RefCell::new(None),
    };
}

fn with_tracker<R>(f: impl FnOnce(&TrackerImpl) -> R) -> R {
    TRACKER.with(f)
}

/// Prevents the tracker from being re-entered while one of its methods runs;
/// the allocator's reclaim hook may fire synchronously with allocation.
struct ReclaimingLock<'a> {
    tracker: &'a TrackerImpl,
    prev: bool,
}

impl<'a> ReclaimingLock<'a> {
    fn new(tracker: &'a TrackerImpl) -> Self {
        let prev = tracker.reclaiming_enabled.replace(false);
        ReclaimingLock { tracker, prev }
    }
}

impl Drop for ReclaimingLock<'_> {
    fn drop(&mut self) {
        self.tracker.reclaiming_enabled.set(self.prev);
    }
}

/// Scoped tracker-wide reclaim disable, used while the pool talks to the
/// system allocator.
pub(crate) struct TrackerReclaimerLock {
    prev: bool,
}

impl TrackerReclaimerLock {
    pub(crate) fn new() -> Self {
        TrackerReclaimerLock {
            prev: with_tracker(|t| t.reclaiming_enabled.replace(false)),
        }
    }
}

impl Drop for TrackerReclaimerLock {
    fn drop(&mut self) {
        let prev = self.prev;
        let _ = TRACKER.try_with(|t| t.reclaiming_enabled.set(prev));
    }
}

impl TrackerImpl {
    fn snapshot_regions(&self) -> Vec<Rc<RegionImpl>> {
        self.regions
            .borrow()
            .iter()
            .filter_map(|(_, weak)| weak.upgrade())
            .collect()
    }

    fn region_occupancy(&self, pool: &SegmentPool) -> OccupancyStats {
        let _lock = ReclaimingLock::new(self);
        let mut total = OccupancyStats::default();
        for region in self.snapshot_regions() {
            total += region.occupancy(pool);
        }
        total
    }

    fn occupancy(&self, pool: &SegmentPool) -> OccupancyStats {
        let _lock = ReclaimingLock::new(self);
        let free = pool.total_free_memory();
        self.region_occupancy(pool) + OccupancyStats::new(free, free)
    }

    fn non_lsa_used_space(&self, pool: &SegmentPool) -> usize {
        let lsa_total = self.region_occupancy(pool).total_space();
        memory::allocated_memory()
            .saturating_sub(lsa_total)
            .saturating_sub(pool.total_free_memory())
    }

    fn reclaim(&self, pool: &SegmentPool, memory_to_release: usize, preempt: Preempt) -> usize {
        if !self.reclaiming_enabled.get() {
            return 0;
        }
        let _lock = ReclaimingLock::new(self);
        let timer = ReclaimTimer::start("reclaim", preempt, memory_to_release);
        let released = self.reclaim_locked(pool, memory_to_release, preempt);
        timer.finish(released);
        released
    }

    fn reclaim_locked(
        &self,
        pool: &SegmentPool,
        memory_to_release: usize,
        preempt: Preempt,
    ) -> usize {
        debug!(target: "lsa", "reclaim_locked({}, preempt={:?})", memory_to_release, preempt);
        // 1. Release free segments from the pool and emergency reserve.
        // 2. Compact used segments and/or evict data.
        const MAX_BYTES: usize = usize::MAX - SEGMENT_SIZE;
        let segments_to_release =
            align_up(memory_to_release.min(MAX_BYTES), SEGMENT_SIZE) >> SEGMENT_SIZE_SHIFT;
        let nr_released = pool.reclaim_segments(segments_to_release, preempt);
        let mut mem_released = nr_released * SEGMENT_SIZE;
        if mem_released >= memory_to_release {
            return memory_to_release;
        }
        if preempt.is_yes() && need_preempt() {
            return mem_released;
        }

        let compacted = self.compact_and_evict_locked(
            pool,
            pool.current_emergency_reserve_goal(),
            memory_to_release - mem_released,
            preempt,
        );
        if compacted == 0 {
            return mem_released;
        }

        // Compaction does not by itself shrink the pool; return the newly
        // freed segments to the system allocator.
        let nr_released = pool.reclaim_segments(compacted / SEGMENT_SIZE, preempt);
        mem_released += nr_released * SEGMENT_SIZE;
        mem_released
    }

    fn compact_and_evict(
        &self,
        pool: &SegmentPool,
        reserve_segments: usize,
        memory_to_release: usize,
        preempt: Preempt,
    ) -> usize {
        if !self.reclaiming_enabled.get() {
            return 0;
        }
        let _lock = ReclaimingLock::new(self);
        self.compact_and_evict_locked(pool, reserve_segments, memory_to_release, preempt)
    }

    fn compact_and_evict_locked(
        &self,
        pool: &SegmentPool,
        reserve_segments: usize,
        mut memory_to_release: usize,
        preempt: Preempt,
    ) -> usize {
        // Regions with the sparsest segments are picked first;
        // non-compactible regions sink to the bottom. Each iteration tries
        // to release one whole segment from the best candidate, until enough
        // was released or nothing can be compacted. When compaction is not
        // sufficient, data is evicted from evictable regions.
        let mem_in_use = pool.total_memory_in_use();
        let missing_reserve = reserve_segments - reserve_segments.min(pool.free_segments());
        memory_to_release =
            memory_to_release.saturating_add(missing_reserve.saturating_mul(SEGMENT_SIZE));
        let target_mem = mem_in_use - mem_in_use.min(memory_to_release);

        debug!(
            target: "lsa",
            "compacting, requested {} bytes, {} bytes in use, target is {}",
            memory_to_release, mem_in_use, target_mem
        );

        // Allow dipping into reserves while compacting.
        let _goal = ReservationGoal::new(pool, 0);

        let regions = self.snapshot_regions();
        {
            let timer = ReclaimTimer::start("compact", preempt, memory_to_release);
            while pool.total_memory_in_use() > target_mem {
                let candidate = best_candidate(pool, &regions, RegionImpl::is_compactible);
                let Some(region) = candidate else { break };
                if !region.is_compactible() {
                    trace!(target: "lsa", "unable to release segments, no compactible pools");
                    break;
                }

                // Prefer eviction when the average fill is above the
                // compaction threshold: in workloads where allocation order
                // matches eviction order, whole segments come back without
                // paying for migration.
                let occupancy = region.occupancy(pool);
                if region.is_evictable()
                    && occupancy.used_space() * 100
                        >= MAX_USED_SPACE_RATIO_FOR_COMPACTION_PERCENT * occupancy.total_space()
                {
                    reclaim_from_evictable(pool, region, target_mem, preempt);
                } else {
                    region.compact(pool);
                }

                if preempt.is_yes() && need_preempt() {
                    break;
                }
            }
            timer.finish(mem_in_use.saturating_sub(pool.total_memory_in_use()));
        }

        let released_during_compaction =
            mem_in_use.saturating_sub(pool.total_memory_in_use());

        if pool.total_memory_in_use() > target_mem {
            debug!(target: "lsa", "considering evictable regions");
            for region in &regions {
                if preempt.is_yes() && need_preempt() {
                    break;
                }
                if region.is_evictable() {
                    reclaim_from_evictable(pool, region, target_mem, preempt);
                    if pool.total_memory_in_use() <= target_mem {
                        break;
                    }
                }
            }
        }

        let mem_released = mem_in_use.saturating_sub(pool.total_memory_in_use());
        debug!(
            target: "lsa",
            "released {} bytes (wanted {}), {} during compaction",
            mem_released, memory_to_release, released_during_compaction
        );
        mem_released
    }

    fn full_compaction(&self, pool: &SegmentPool) -> crate::Result<()> {
        let _lock = ReclaimingLock::new(self);
        debug!(target: "lsa", "full compaction on all regions, {}", self.region_occupancy(pool));
        for region in self.snapshot_regions() {
            if region.reclaiming_enabled() {
                region.full_compaction(pool)?;
            }
        }
        debug!(target: "lsa", "compaction done, {}", self.region_occupancy(pool));
        Ok(())
    }

    fn compact_on_idle(
        &self,
        pool: &SegmentPool,
        mut check_for_work: impl FnMut() -> bool,
    ) -> IdleCpuHandlerResult {
        if !self.reclaiming_enabled.get() {
            return IdleCpuHandlerResult::NoMoreWork;
        }
        let _lock = ReclaimingLock::new(self);
        let regions = self.snapshot_regions();
        if regions.is_empty() {
            return IdleCpuHandlerResult::NoMoreWork;
        }
        let _goal = ReservationGoal::new(pool, 0);
        while !check_for_work() {
            let candidate = best_candidate(pool, &regions, RegionImpl::is_idle_compactible);
            match candidate {
                Some(region) if region.is_idle_compactible() => region.compact(pool),
                _ => return IdleCpuHandlerResult::NoMoreWork,
            }
        }
        IdleCpuHandlerResult::InterruptedByHigherPriorityTask
    }
}

/// Pick the region with the sparsest closed segment, preferring ones the
/// predicate admits.
fn best_candidate<'a>(
    pool: &SegmentPool,
    regions: &'a [Rc<RegionImpl>],
    admissible: impl Fn(&RegionImpl) -> bool,
) -> Option<&'a Rc<RegionImpl>> {
    regions.iter().max_by(|a, b| {
        match (admissible(a.as_ref()), admissible(b.as_ref())) {
            (true, false) => CmpOrdering::Greater,
            (false, true) => CmpOrdering::Less,
            _ => {
                // Sparser minimum occupancy wins.
                let a_min = a.min_occupancy(pool).used_fraction();
                let b_min = b.min_occupancy(pool).used_fraction();
                b_min.partial_cmp(&a_min).unwrap_or(CmpOrdering::Equal)
            }
        }
    })
}

fn reclaim_from_evictable(
    pool: &SegmentPool,
    region: &Rc<RegionImpl>,
    target_mem_in_use: usize,
    preempt: Preempt,
) {
    debug!(
        target: "lsa",
        "reclaim_from_evictable: total_memory_in_use={} target={}",
        pool.total_memory_in_use(), target_mem_in_use
    );

    // Before attempting segment compaction, evict at least the deficit plus
    // one segment, so that workloads whose eviction order matches allocation
    // order reclaim whole segments without expensive compaction.
    let deficit = pool.total_memory_in_use().saturating_sub(target_mem_in_use);
    let used = region.occupancy(pool).used_space();
    let used_target = used - used.min(deficit.saturating_add(SEGMENT_SIZE));

    while pool.total_memory_in_use() > target_mem_in_use {
        let used = region.occupancy(pool).used_space();
        if used > used_target {
            debug!(
                target: "lsa",
                "evicting {} bytes from region {} in advance",
                used - used_target, region.id()
            );
        } else {
            debug!(
                target: "lsa",
                "evicting from region {} until it's compactible", region.id()
            );
        }
        while region.occupancy(pool).used_space() > used_target || !region.is_compactible() {
            if region.evict_some(pool) == ReclaimResult::ReclaimedNothing {
                if region.is_compactible() {
                    // Forward progress when there is nothing to evict.
                    break;
                }
                debug!(
                    target: "lsa",
                    "unable to evict more, evicted {} bytes",
                    used - region.occupancy(pool).used_space()
                );
                return;
            }
            if pool.total_memory_in_use() <= target_mem_in_use {
                debug!(
                    target: "lsa",
                    "target met after evicting {} bytes",
                    used - region.occupancy(pool).used_space()
                );
                return;
            }
            if preempt.is_yes() && need_preempt() {
                return;
            }
        }
        // A preemptible pass may exit here without real progress; that is
        // fine — if the system stays overwhelmed, reclaim will eventually be
        // invoked synchronously without preemption.
        if preempt.is_yes() && need_preempt() {
            return;
        }
        debug!(
            target: "lsa",
            "compacting after evicting {} bytes",
            used - region.occupancy(pool).used_space()
        );
        region.compact(pool);
    }
}

// --------------------------------------------------------------------------
// Public shard-level interface
// --------------------------------------------------------------------------

/// Apply configuration and install the low-memory hook.
pub fn configure(cfg: &Config) {
    with_tracker(|t| {
        t.reclamation_step.set(cfg.lsa_reclamation_step);
        if cfg.abort_on_lsa_bad_alloc {
            t.abort_on_bad_alloc.set(true);
        }
        t.defragment_on_idle.set(cfg.defragment_on_idle);
        sanitizer::set_report_backtrace(cfg.sanitizer_report_backtrace);
        if let Some(group) = &cfg.background_reclaim_sched_group {
            *t.background.borrow_mut() = Some(Rc::new(BackgroundReclaimer::new(group.clone())));
        }
    });
    memory::set_reclaim_hook(Box::new(|bytes| {
        let wanted = bytes.max(reclamation_step() * SEGMENT_SIZE);
        if reclaim(wanted) > 0 {
            ReclaimResult::ReclaimedSomething
        } else {
            ReclaimResult::ReclaimedNothing
        }
    }));
}

/// Stop the background reclaimer, if one was configured.
pub fn stop() {
    with_tracker(|t| {
        if let Some(background) = t.background.borrow_mut().take() {
            background.stop();
        }
    });
}

/// Try to reclaim `bytes` using all compactible and evictable regions.
/// Returns the number of bytes actually reclaimed, which may be smaller when
/// evictable pools are empty and compactible pools cannot compact any more.
/// Invalidates references into all compactible and evictable regions.
pub fn reclaim(bytes: usize) -> usize {
    with_tracker(|t| with_pool(|pool| t.reclaim(pool, bytes, Preempt::No)))
}

pub(crate) fn reclaim_internal(bytes: usize, preempt: Preempt) -> usize {
    with_tracker(|t| with_pool(|pool| t.reclaim(pool, bytes, preempt)))
}

pub(crate) fn compact_and_evict(
    reserve_segments: usize,
    memory_to_release: usize,
    preempt: Preempt,
) -> usize {
    with_tracker(|t| {
        with_pool(|pool| t.compact_and_evict(pool, reserve_segments, memory_to_release, preempt))
    })
}

/// Compact as much as possible. Very expensive, mainly for testing.
/// Invalidates references into all reclaimable regions.
pub fn full_compaction() -> crate::Result<()> {
    with_tracker(|t| with_pool(|pool| t.full_compaction(pool)))
}

/// Return every free owned segment to the system allocator.
pub fn reclaim_all_free_segments() {
    debug!(target: "lsa", "reclaiming all free segments");
    with_pool(|pool| pool.reclaim_all_free_segments());
}

/// Compact one segment at a time, sparsest first, until `check_for_work`
/// reports that the runtime has something better to do.
pub fn compact_on_idle(check_for_work: impl FnMut() -> bool) -> IdleCpuHandlerResult {
    with_tracker(|t| with_pool(|pool| t.compact_on_idle(pool, check_for_work)))
}

/// Aggregate occupancy of all regions.
pub fn region_occupancy() -> OccupancyStats {
    with_tracker(|t| with_pool(|pool| t.region_occupancy(pool)))
}

/// Occupancy of all segments allocated by LSA on this shard.
pub fn occupancy() -> OccupancyStats {
    with_tracker(|t| with_pool(|pool| t.occupancy(pool)))
}

/// Amount of allocated memory not managed by LSA.
pub fn non_lsa_used_space() -> usize {
    with_tracker(|t| with_pool(|pool| t.non_lsa_used_space(pool)))
}

/// Minimum number of segments reclaimed during a single reclamation cycle.
pub fn reclamation_step() -> usize {
    with_tracker(|t| t.reclamation_step.get())
}

pub fn should_abort_on_bad_alloc() -> bool {
    with_tracker(|t| t.abort_on_bad_alloc.get())
}

pub fn defragment_on_idle_enabled() -> bool {
    with_tracker(|t| t.defragment_on_idle.get())
}

/// Drive one iteration of the background reclaimer; returns true when it did
/// work. The host runtime calls this from the reclaimer's scheduling group.
pub fn background_tick() -> bool {
    let background = with_tracker(|t| t.background.borrow().clone());
    match background {
        Some(background) => background.run_once(),
        None => false,
    }
}

/// Recompute the background reclaimer's scheduling shares from current
/// memory pressure. The host calls this periodically.
pub fn adjust_background_shares() {
    if let Some(background) = with_tracker(|t| t.background.borrow().clone()) {
        background.adjust_shares();
    }
}

pub(crate) fn register_region(region: &Rc<RegionImpl>) {
    with_tracker(|t| {
        let _lock = ReclaimingLock::new(t);
        t.regions.borrow_mut().push((region.id(), Rc::downgrade(region)));
        debug!(target: "lsa", "registered region with id={}", region.id());
    });
}

pub(crate) fn unregister_region(id: u64) {
    let _ = TRACKER.try_with(|t| {
        let _lock = ReclaimingLock::new(t);
        debug!(target: "lsa", "unregistering region, id={}", id);
        t.regions.borrow_mut().retain(|(region_id, _)| *region_id != id);
    });
}

// --------------------------------------------------------------------------
// Metrics
// --------------------------------------------------------------------------

/// Snapshot of every gauge and counter the allocator exports.
#[derive(Clone, Copy, Debug)]
pub struct Metrics {
    /// Current size of allocated LSA memory in bytes.
    pub total_space: usize,
    /// Currently used LSA memory in bytes.
    pub used_space: usize,
    /// Size of the small-objects region in bytes.
    pub small_objects_total_space: usize,
    /// Used bytes in the small-objects region.
    pub small_objects_used_space: usize,
    /// Allocated non-LSA memory owned by regions.
    pub large_objects_total_space: usize,
    /// Used non-LSA memory on the shard.
    pub non_lsa_used_space: usize,
    /// Free memory under LSA control, excluding the emergency reserve.
    pub free_space: usize,
    /// Used portion of region memory, in percent.
    pub occupancy_percent: f64,
    pub segments_in_use: usize,
    pub free_segments: usize,
    pub total_memory_in_use: usize,
    pub pool: PoolStats,
}

pub fn metrics() -> Metrics {
    with_tracker(|t| {
        with_pool(|pool| {
            let region_occupancy = t.region_occupancy(pool);
            let non_lsa = pool.non_lsa_memory_in_use();
            Metrics {
                total_space: region_occupancy.total_space(),
                used_space: region_occupancy.used_space(),
                small_objects_total_space: region_occupancy.total_space() - non_lsa,
                small_objects_used_space: region_occupancy.used_space() - non_lsa,
                large_objects_total_space: non_lsa,
                non_lsa_used_space: t.non_lsa_used_space(pool),
                free_space: pool.unreserved_free_segments() * SEGMENT_SIZE,
                occupancy_percent: region_occupancy.used_fraction() * 100.0,
                segments_in_use: pool.segments_in_use(),
                free_segments: pool.free_segments(),
                total_memory_in_use: pool.total_memory_in_use(),
                pool: pool.statistics(),
            }
        })
    })
}

// --------------------------------------------------------------------------
// Reclaim timing
// --------------------------------------------------------------------------

thread_local! {
    static ACTIVE_TIMER: Cell<bool> = const { Cell::new(false) };
}

const STALL_THRESHOLD: Duration = Duration::from_millis(100);

/// Times one reclaim phase and reports duration, rate and counter deltas.
/// Nested phases piggyback on the outermost timer.
pub(crate) struct ReclaimTimer {
    name: &'static str,
    preempt: Preempt,
    memory_to_release: usize,
    start: Instant,
    start_stats: PoolStats,
    primary: bool,
}

impl ReclaimTimer {
    pub(crate) fn start(name: &'static str, preempt: Preempt, memory_to_release: usize) -> Self {
        let primary = ACTIVE_TIMER.with(|active| !active.replace(true));
        ReclaimTimer {
            name,
            preempt,
            memory_to_release,
            start: Instant::now(),
            start_stats: with_pool(|pool| pool.statistics()),
            primary,
        }
    }

    pub(crate) fn finish(self, memory_released: usize) {
        if !self.primary {
            return;
        }
        let duration = self.start.elapsed();
        let stalled = duration >= STALL_THRESHOLD;
        if !stalled && !tracing::enabled!(target: "lsa_timing", tracing::Level::DEBUG) {
            return;
        }
        let end_stats = with_pool(|pool| pool.statistics());
        const MIB: f64 = (1024 * 1024) as f64;
        let rate = if memory_released > 0 && duration.as_secs_f64() > 0.0 {
            memory_released as f64 / MIB / duration.as_secs_f64()
        } else {
            0.0
        };
        let evicted = end_stats.memory_evicted - self.start_stats.memory_evicted;
        let compacted_segments =
            end_stats.segments_compacted - self.start_stats.segments_compacted;
        let compacted = end_stats.memory_compacted - self.start_stats.memory_compacted;
        if stalled {
            warn!(
                target: "lsa_timing",
                "{} took {} us, trying to release {:.3} MiB {}preemptibly, \
                 released {:.3} MiB ({:.3} MiB/s), evicted {:.3} MiB, \
                 compacted {} segments / {:.3} MiB",
                self.name,
                duration.as_micros(),
                self.memory_to_release as f64 / MIB,
                if self.preempt.is_yes() { "" } else { "non-" },
                memory_released as f64 / MIB,
                rate,
                evicted as f64 / MIB,
                compacted_segments,
                compacted as f64 / MIB,
            );
        } else {
            debug!(
                target: "lsa_timing",
                "{} took {} us, released {:.3} MiB of {:.3} MiB requested",
                self.name,
                duration.as_micros(),
                memory_released as f64 / MIB,
                self.memory_to_release as f64 / MIB,
            );
        }
    }
}

impl Drop for ReclaimTimer {
    fn drop(&mut self) {
        if self.primary {
            ACTIVE_TIMER.with(|active| active.set(false));
        }
    }
}
