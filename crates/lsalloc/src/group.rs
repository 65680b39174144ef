//! Region listeners and region groups.
//!
//! A group tracks the aggregate usage of its member regions (and child
//! groups) against soft and hard thresholds, and answers "which member is
//! the worst offender" queries for evict-from-largest policies.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use crate::occupancy::OccupancyStats;
use crate::region::{Region, RegionImpl};

/// Listens for events from a region.
pub trait RegionListener {
    /// The region began listening.
    fn add(&self, region: &Region);
    /// The region stopped listening.
    fn del(&self, region: &Region);
    /// A listening region took `delta` more bytes from the system.
    fn increase_usage(&self, delta: usize);
    /// A listening region returned `delta` bytes to the system.
    fn decrease_usage(&self, delta: usize);
    /// A listening region grounded its evictable occupancy.
    fn decrease_evictable_usage(&self);
}

/// Reclaim thresholds of a group. `usize::MAX` disables a threshold.
#[derive(Clone, Copy, Debug)]
pub struct GroupLimits {
    pub soft_limit: usize,
    pub throttle_threshold: usize,
}

impl Default for GroupLimits {
    fn default() -> Self {
        GroupLimits {
            soft_limit: usize::MAX,
            throttle_threshold: usize::MAX,
        }
    }
}

/// A node in a tree of regions with reclaim-threshold accounting. Usage
/// deltas propagate to every ancestor; each node keeps pressure flags the
/// host consults before admitting more work.
pub struct RegionGroup {
    name: String,
    parent: RefCell<Option<Weak<RegionGroup>>>,
    subgroups: RefCell<Vec<Weak<RegionGroup>>>,
    regions: RefCell<Vec<Weak<RegionImpl>>>,
    total_memory: Cell<usize>,
    limits: GroupLimits,
    under_pressure: Cell<bool>,
    under_soft_pressure: Cell<bool>,
}

impl RegionGroup {
    pub fn new(name: impl Into<String>, limits: GroupLimits) -> Rc<RegionGroup> {
        Rc::new(RegionGroup {
            name: name.into(),
            parent: RefCell::new(None),
            subgroups: RefCell::new(Vec::new()),
            regions: RefCell::new(Vec::new()),
            total_memory: Cell::new(0),
            limits,
            under_pressure: Cell::new(false),
            under_soft_pressure: Cell::new(false),
        })
    }

    pub fn with_parent(
        name: impl Into<String>,
        limits: GroupLimits,
        parent: &Rc<RegionGroup>,
    ) -> Rc<RegionGroup> {
        let group = RegionGroup::new(name, limits);
        *group.parent.borrow_mut() = Some(Rc::downgrade(parent));
        parent.subgroups.borrow_mut().push(Rc::downgrade(&group));
        group
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn total_memory(&self) -> usize {
        self.total_memory.get()
    }

    pub fn under_pressure(&self) -> bool {
        self.under_pressure.get()
    }

    pub fn under_soft_pressure(&self) -> bool {
        self.under_soft_pressure.get()
    }

    /// True when no group on the path to the root is under pressure.
    pub fn execution_permitted(&self) -> bool {
        if self.under_pressure.get() {
            return false;
        }
        let mut parent = self.parent.borrow().as_ref().and_then(Weak::upgrade);
        while let Some(group) = parent {
            if group.under_pressure.get() {
                return false;
            }
            parent = group.parent.borrow().as_ref().and_then(Weak::upgrade);
        }
        true
    }

    fn update(&self, delta: isize) {
        let total = (self.total_memory.get() as isize + delta).max(0) as usize;
        self.total_memory.set(total);
        self.under_soft_pressure.set(total >= self.limits.soft_limit);
        self.under_pressure.set(total > self.limits.throttle_threshold);
        if let Some(parent) = self.parent.borrow().as_ref().and_then(Weak::upgrade) {
            parent.update(delta);
        }
    }

    /// Evictable occupancy of the largest member region, in bytes.
    pub fn top_region_evictable_space(&self) -> usize {
        self.largest_region_impl()
            .map(|r| r.evictable_occupancy().total_space())
            .unwrap_or(0)
    }

    /// Evictable occupancy of the member region (of this group or any
    /// subgroup) with the largest evictable occupancy.
    pub fn largest_region_evictable_occupancy(&self) -> OccupancyStats {
        self.largest_region_impl()
            .map(|r| r.evictable_occupancy())
            .unwrap_or_default()
    }

    /// The worst-offender region itself: the member (of this group or any
    /// subgroup) with the largest evictable occupancy, as a handle the
    /// caller can evict from directly.
    pub fn get_largest_region(&self) -> Option<Region> {
        self.largest_region_impl().map(Region::from_rc)
    }

    fn largest_region_impl(&self) -> Option<Rc<RegionImpl>> {
        let mut regions = self.regions.borrow_mut();
        regions.retain(|weak| weak.strong_count() > 0);
        let mut best: Option<Rc<RegionImpl>> = None;
        for region in regions.iter().filter_map(Weak::upgrade) {
            let space = region.evictable_occupancy().total_space();
            if best
                .as_ref()
                .map(|b| space > b.evictable_occupancy().total_space())
                .unwrap_or(true)
            {
                best = Some(region);
            }
        }
        drop(regions);
        let mut subgroups = self.subgroups.borrow_mut();
        subgroups.retain(|weak| weak.strong_count() > 0);
        for group in subgroups.iter().filter_map(Weak::upgrade) {
            if let Some(candidate) = group.largest_region_impl() {
                let space = candidate.evictable_occupancy().total_space();
                if best
                    .as_ref()
                    .map(|b| space > b.evictable_occupancy().total_space())
                    .unwrap_or(true)
                {
                    best = Some(candidate);
                }
            }
        }
        best
    }
}

impl RegionListener for RegionGroup {
    fn add(&self, region: &Region) {
        self.regions.borrow_mut().push(Rc::downgrade(region.inner()));
        self.update(region.occupancy().total_space() as isize);
    }

    fn del(&self, region: &Region) {
        let target = region.impl_ptr();
        self.regions
            .borrow_mut()
            .retain(|weak| weak.as_ptr() != target);
        self.update(-(region.occupancy().total_space() as isize));
    }

    fn increase_usage(&self, delta: usize) {
        self.update(delta as isize);
    }

    fn decrease_usage(&self, delta: usize) {
        self.update(-(delta as isize));
    }

    fn decrease_evictable_usage(&self) {}
}
