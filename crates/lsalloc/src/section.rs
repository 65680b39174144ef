//! Allocating sections.
//!
//! Utility for running critical sections which need to lock a region and
//! also allocate LSA memory. The section reserves standard-allocator and LSA
//! headroom up front, runs the closure with the region's reclaim disabled,
//! and on allocation failure grows the failed reserve and retries — with the
//! region lock off, so reclamation can make room. The object learns from
//! failures how much to reserve so later runs do not fail mid-way.
//!
//! This is the pointer-stability boundary: inside the closure and before any
//! allocation, raw pointers into the region are stable. Re-entry after a
//! failure invalidates them, observable through the region's reclaim
//! counter.

use tracing::debug;

use crate::memory;
use crate::pool::{with_pool, SegmentPool};
use crate::region::{ReclaimLock, Region};
use crate::tracker;
use crate::util::lsa_abort;
use crate::{Error, Result};

// Do not decay below these minimal values.
const MIN_LSA_RESERVE: usize = 1; // segments
const MIN_STD_RESERVE: usize = 1024; // bytes
const BYTES_PER_DECAY: i64 = 10_000_000_000;
const SEGMENTS_PER_DECAY: i64 = 100_000;

/// Saves and restores the pool's emergency reserve maximum around a section.
struct Guard {
    prev: usize,
}

impl Guard {
    fn new() -> Self {
        Guard {
            prev: with_pool(SegmentPool::emergency_reserve_max),
        }
    }
}

impl Drop for Guard {
    fn drop(&mut self) {
        let prev = self.prev;
        let _ = crate::pool::try_with_pool(|pool| pool.set_emergency_reserve_max(prev));
    }
}

pub struct AllocatingSection {
    lsa_reserve: usize, // in segments
    std_reserve: usize, // in bytes
    minimum_lsa_emergency_reserve: usize,
    remaining_std_bytes_until_decay: i64,
    remaining_lsa_segments_until_decay: i64,
}

impl Default for AllocatingSection {
    fn default() -> Self {
        AllocatingSection::new()
    }
}

impl AllocatingSection {
    pub fn new() -> Self {
        AllocatingSection {
            lsa_reserve: MIN_LSA_RESERVE,
            std_reserve: MIN_STD_RESERVE,
            minimum_lsa_emergency_reserve: 0,
            remaining_std_bytes_until_decay: BYTES_PER_DECAY,
            remaining_lsa_segments_until_decay: SEGMENTS_PER_DECAY,
        }
    }

    pub fn set_lsa_reserve(&mut self, reserve: usize) {
        self.lsa_reserve = reserve;
    }

    pub fn set_std_reserve(&mut self, reserve: usize) {
        self.std_reserve = reserve;
    }

    pub fn lsa_reserve(&self) -> usize {
        self.lsa_reserve
    }

    pub fn std_reserve(&self) -> usize {
        self.std_reserve
    }

    fn maybe_decay_reserve(&mut self) {
        // The decay rate is inversely proportional to the reserve (one decay
        // every SEGMENTS_PER_DECAY / lsa_reserve runs). A high reserve may
        // force a lot of eviction to maintain, more than an occasional
        // allocation failure costs, so it decays quickly; a low reserve is
        // cheap to keep and decays slowly.
        self.remaining_lsa_segments_until_decay -= self.lsa_reserve as i64;
        if self.remaining_lsa_segments_until_decay < 0 {
            self.remaining_lsa_segments_until_decay = SEGMENTS_PER_DECAY;
            self.lsa_reserve = MIN_LSA_RESERVE.max(self.lsa_reserve / 2);
            debug!(target: "lsa", "decaying LSA reserve to {} segments", self.lsa_reserve);
        }

        self.remaining_std_bytes_until_decay -= self.std_reserve as i64;
        if self.remaining_std_bytes_until_decay < 0 {
            self.remaining_std_bytes_until_decay = BYTES_PER_DECAY;
            self.std_reserve = MIN_STD_RESERVE.max(self.std_reserve / 2);
            debug!(target: "lsa", "decaying standard head-room to {} [B]", self.std_reserve);
        }
    }

    fn try_reserve(&mut self) -> Result<()> {
        with_pool(|pool| {
            pool.set_emergency_reserve_max(self.lsa_reserve.max(self.minimum_lsa_emergency_reserve));
            pool.refill_emergency_reserve()
        })?;

        loop {
            let free = memory::free_memory();
            if free >= self.std_reserve {
                break;
            }
            if tracker::reclaim(self.std_reserve - free) == 0 {
                return Err(Error::BadAlloc);
            }
        }

        with_pool(SegmentPool::clear_allocation_failure_flag);
        Ok(())
    }

    fn reserve(&mut self) -> Result<()> {
        let result = self.try_reserve();
        if result.is_err() && tracker::should_abort_on_bad_alloc() {
            lsa_abort("aborting due to allocation failure");
        }
        result
    }

    fn on_alloc_failure(&mut self, region: &Region) -> Result<()> {
        region.inner().invalidate_references();
        if with_pool(SegmentPool::allocation_failure_flag) {
            self.lsa_reserve *= 2;
            debug!(
                target: "lsa",
                "LSA allocation failure, increasing reserve to {} segments", self.lsa_reserve
            );
        } else {
            self.std_reserve *= 2;
            debug!(
                target: "lsa",
                "standard allocator failure, increasing head-room to {} [B]", self.std_reserve
            );
        }
        self.reserve()
    }

    /// Reserve standard-allocator and LSA memory for operations that must
    /// run with memory reclamation disabled. Reserves are rolled back when
    /// they cannot be raised enough, so a pathological request does not pin
    /// future ones.
    pub fn with_reserve<T>(&mut self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let prev_lsa_reserve = self.lsa_reserve;
        let prev_std_reserve = self.std_reserve;
        let guard = Guard::new();
        self.minimum_lsa_emergency_reserve = guard.prev;
        let result = self.reserve().and_then(|()| f());
        if result.is_err() {
            self.lsa_reserve = prev_lsa_reserve;
            self.std_reserve = prev_std_reserve;
        }
        result
    }

    /// Invoke `f` under a reclaim lock on `region`. When an LSA allocation
    /// fails inside `f`, the reserve is grown — with the region lock off, so
    /// reclamation can proceed — and `f` retried. References into the region
    /// are invalidated whenever the section is re-entered this way.
    pub fn with_reclaiming_disabled<T>(
        &mut self,
        region: &Region,
        mut f: impl FnMut() -> Result<T>,
    ) -> Result<T> {
        debug_assert!(region.reclaiming_enabled());
        self.maybe_decay_reserve();
        loop {
            {
                let _lock = ReclaimLock::new(region);
                match f() {
                    Ok(value) => return Ok(value),
                    Err(Error::BadAlloc) => {}
                    Err(other) => return Err(other),
                }
            }
            self.on_alloc_failure(region)?;
        }
    }

    /// The composed protocol: reserve headroom, then run `f` with reclaim
    /// disabled on `region`, retrying with grown reserves on allocation
    /// failure.
    pub fn run<T>(&mut self, region: &Region, f: impl FnMut() -> Result<T>) -> Result<T> {
        let prev_lsa_reserve = self.lsa_reserve;
        let prev_std_reserve = self.std_reserve;
        let guard = Guard::new();
        self.minimum_lsa_emergency_reserve = guard.prev;
        let result = self
            .reserve()
            .and_then(|()| self.with_reclaiming_disabled(region, f));
        if result.is_err() {
            self.lsa_reserve = prev_lsa_reserve;
            self.std_reserve = prev_std_reserve;
        }
        result
    }
}
