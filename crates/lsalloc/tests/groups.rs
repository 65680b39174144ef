//! Region groups: usage accounting, pressure thresholds, worst-offender
//! queries.

mod common;

use common::TrackedHeap;
use lsalloc::{GroupLimits, Region, RegionGroup, SEGMENT_SIZE};

#[test]
fn group_tracks_usage_and_pressure() {
    common::init_logging();
    let group = RegionGroup::new(
        "cache",
        GroupLimits {
            soft_limit: SEGMENT_SIZE * 8,
            throttle_threshold: SEGMENT_SIZE * 32,
        },
    );
    let region = Region::new();
    region.listen(group.clone());
    let heap = TrackedHeap::new(128, 8);

    assert!(!group.under_soft_pressure());
    assert!(group.execution_permitted());

    // Cross the soft limit.
    let mut objects = Vec::new();
    while group.total_memory() <= SEGMENT_SIZE * 8 {
        objects.push(heap.alloc(&region));
    }
    assert!(group.under_soft_pressure());
    assert!(!group.under_pressure());
    assert!(group.execution_permitted());

    // Cross the throttle threshold.
    while group.total_memory() <= SEGMENT_SIZE * 32 {
        objects.push(heap.alloc(&region));
    }
    assert!(group.under_pressure());
    assert!(!group.execution_permitted());

    assert_eq!(
        group.top_region_evictable_space(),
        region.evictable_occupancy().total_space()
    );

    // Releasing the memory relieves the pressure.
    heap.free_all(&region);
    drop(objects);
    assert!(!group.under_pressure());

    region.unlisten();
    assert_eq!(group.total_memory(), 0);
}

#[test]
fn child_group_usage_propagates_to_parent() {
    common::init_logging();
    let parent = RegionGroup::new("parent", GroupLimits::default());
    let child = RegionGroup::with_parent("child", GroupLimits::default(), &parent);
    let region = Region::new();
    region.listen(child.clone());
    let heap = TrackedHeap::new(256, 8);

    let objects: Vec<_> = (0..2048).map(|_| heap.alloc(&region)).collect();
    assert!(child.total_memory() > 0);
    assert_eq!(parent.total_memory(), child.total_memory());
    assert_eq!(
        parent.top_region_evictable_space(),
        region.evictable_occupancy().total_space()
    );

    for idx in objects {
        heap.free(&region, idx);
    }
    region.unlisten();
    assert_eq!(parent.total_memory(), 0);
}

#[test]
fn get_largest_region_returns_the_worst_offender() {
    common::init_logging();
    let group = RegionGroup::new("offenders", GroupLimits::default());
    assert!(group.get_largest_region().is_none());

    let small = Region::new();
    let large = Region::new();
    small.listen(group.clone());
    large.listen(group.clone());
    let heap = TrackedHeap::new(128, 8);

    let small_objects: Vec<_> = (0..500).map(|_| heap.alloc(&small)).collect();
    let large_objects: Vec<_> = (0..20_000).map(|_| heap.alloc(&large)).collect();

    let worst = group.get_largest_region().expect("group has members");
    assert_eq!(worst.id(), large.id());
    assert_eq!(
        worst.evictable_occupancy().total_space(),
        group.top_region_evictable_space()
    );
    // The handle is usable for acting on the offender directly.
    assert!(worst.occupancy().used_space() > small.occupancy().used_space());
    drop(worst);

    for idx in small_objects {
        heap.free(&small, idx);
    }
    for idx in large_objects {
        heap.free(&large, idx);
    }
    small.unlisten();
    large.unlisten();
}

#[test]
fn grounding_hides_evictable_occupancy() {
    common::init_logging();
    let group = RegionGroup::new("grounded", GroupLimits::default());
    let region = Region::new();
    region.listen(group.clone());
    let heap = TrackedHeap::new(64, 8);

    let objects: Vec<_> = (0..4096).map(|_| heap.alloc(&region)).collect();
    assert!(region.evictable_occupancy().total_space() > 0);

    region.ground_evictable_occupancy();
    assert_eq!(region.evictable_occupancy().total_space(), 0);
    assert_eq!(group.top_region_evictable_space(), 0);

    for idx in objects {
        heap.free(&region, idx);
    }
}
