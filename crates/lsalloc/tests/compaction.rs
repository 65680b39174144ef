//! Fragmentation, compaction and forward-progress behavior.

mod common;

use common::TrackedHeap;
use lsalloc::runtime::IdleCpuHandlerResult;
use lsalloc::{tracker, Region};

/// Allocate a lot of small objects, punch holes, and verify the region
/// compacts back to a dense layout.
#[test]
fn fragmentation_then_compaction() {
    common::init_logging();
    let region = Region::new();
    let heap = TrackedHeap::new(96, 8);

    let objects: Vec<_> = (0..20_000).map(|_| heap.alloc(&region)).collect();
    for idx in objects.iter().step_by(2) {
        heap.free(&region, *idx);
    }

    assert!(region.is_compactible());
    let counter_before = region.reclaim_counter();
    let compacted_before = tracker::metrics().pool.segments_compacted;

    tracker::full_compaction().expect("full compaction failed");

    assert!(tracker::metrics().pool.segments_compacted > compacted_before);
    assert!(region.reclaim_counter() > counter_before);
    assert!(region.compactible_occupancy().used_fraction() >= 0.98);

    // The survivors moved but kept their contents.
    for idx in objects.iter().skip(1).step_by(2) {
        heap.verify(*idx);
    }

    heap.free_all(&region);
    drop(region);
    assert_eq!(tracker::metrics().segments_in_use, 0);
}

/// A bounded number of compaction steps drives is_compactible() to false.
#[test]
fn compaction_makes_forward_progress() {
    common::init_logging();
    let region = Region::new();
    let heap = TrackedHeap::new(128, 8);

    let objects: Vec<_> = (0..15_000).map(|_| heap.alloc(&region)).collect();
    for idx in objects.iter().step_by(2) {
        heap.free(&region, *idx);
    }

    let mut steps = 0;
    while region.is_compactible() {
        region.compact();
        steps += 1;
        assert!(steps < 1000, "compaction failed to converge");
    }
    assert!(steps > 0);
    assert!(!region.is_compactible());

    heap.free_all(&region);
}

/// The reclaim counter never decreases, and moves on every compaction.
#[test]
fn reclaim_counter_is_monotonic() {
    common::init_logging();
    let region = Region::new();
    let heap = TrackedHeap::new(64, 8);

    let mut last = region.reclaim_counter();
    for _ in 0..3 {
        let objects: Vec<_> = (0..10_000).map(|_| heap.alloc(&region)).collect();
        for idx in objects.iter().step_by(2) {
            heap.free(&region, *idx);
        }
        region.full_compaction().expect("full compaction failed");
        let counter = region.reclaim_counter();
        assert!(counter > last);
        last = counter;
        heap.free_all(&region);
    }
}

#[test]
fn compact_on_idle_runs_until_no_more_work() {
    common::init_logging();
    let region = Region::new();
    let heap = TrackedHeap::new(96, 8);

    let objects: Vec<_> = (0..20_000).map(|_| heap.alloc(&region)).collect();
    for idx in objects.iter().step_by(2) {
        heap.free(&region, *idx);
    }
    assert!(region.is_compactible());

    // A busy runtime interrupts immediately.
    assert_eq!(
        tracker::compact_on_idle(|| true),
        IdleCpuHandlerResult::InterruptedByHigherPriorityTask
    );
    assert!(region.is_compactible());

    // An idle one compacts until nothing is left to do.
    assert_eq!(
        tracker::compact_on_idle(|| false),
        IdleCpuHandlerResult::NoMoreWork
    );
    assert!(!region.is_compactible());

    heap.free_all(&region);
}
