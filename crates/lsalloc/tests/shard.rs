//! Shard-level behavior: pool priming, configuration, metrics and the
//! background reclaimer.

mod common;

use common::TrackedHeap;
use lsalloc::{memory, tracker, Config, Region, SchedulingGroup, SEGMENT_SIZE};

#[test]
fn priming_fills_high_addresses_and_leaves_headroom() {
    common::init_logging();
    memory::configure_total_memory(64 * 1024 * 1024);
    lsalloc::prime_segment_pool(64 * 1024 * 1024, 1024 * 1024);

    // The pool owns most of memory as free segments, but left the requested
    // non-LSA headroom plus the gap.
    assert!(tracker::metrics().free_segments > 0);
    assert!(memory::free_memory() >= 1024 * 1024);

    // Allocation is served from the primed pool, not the system.
    let allocated_before = memory::allocated_memory();
    let region = Region::new();
    let heap = TrackedHeap::new(96, 8);
    let objects: Vec<_> = (0..1000).map(|_| heap.alloc(&region)).collect();
    assert_eq!(memory::allocated_memory(), allocated_before);

    for idx in objects {
        heap.free(&region, idx);
    }
    drop(region);
    tracker::reclaim_all_free_segments();
    assert!(tracker::metrics().free_segments <= 1);
}

#[test]
fn configuration_is_applied() {
    common::init_logging();
    tracker::configure(&Config {
        lsa_reclamation_step: 4,
        defragment_on_idle: true,
        ..Default::default()
    });
    assert_eq!(tracker::reclamation_step(), 4);
    assert!(tracker::defragment_on_idle_enabled());
    assert!(!tracker::should_abort_on_bad_alloc());
}

#[test]
fn background_reclaimer_reacts_to_pressure() {
    common::init_logging();
    // A small shard keeps free memory permanently below the reclaimer's
    // threshold, so every tick has work.
    memory::configure_total_memory(32 * 1024 * 1024);
    let group = SchedulingGroup::new("background_reclaim", 1);
    tracker::configure(&Config {
        background_reclaim_sched_group: Some(group.clone()),
        ..Default::default()
    });

    let region = Region::new();
    let heap = TrackedHeap::new(96, 8);
    let objects: Vec<_> = (0..10_000).map(|_| heap.alloc(&region)).collect();
    for idx in objects.iter().step_by(2) {
        heap.free(&region, *idx);
    }

    tracker::adjust_background_shares();
    assert!(group.shares() > 1);

    assert!(tracker::background_tick());

    tracker::stop();
    assert!(!tracker::background_tick());

    heap.free_all(&region);
}

#[test]
fn metrics_snapshot_is_coherent() {
    common::init_logging();
    let region = Region::new();
    let heap = TrackedHeap::new(128, 8);
    let objects: Vec<_> = (0..5000).map(|_| heap.alloc(&region)).collect();

    let metrics = tracker::metrics();
    assert!(metrics.total_space >= metrics.used_space);
    assert_eq!(
        metrics.small_objects_total_space,
        metrics.total_space - metrics.large_objects_total_space
    );
    assert!(metrics.used_space >= 5000 * 128);
    assert_eq!(
        metrics.total_memory_in_use,
        metrics.segments_in_use * SEGMENT_SIZE + metrics.large_objects_total_space
    );
    assert!(metrics.occupancy_percent > 0.0);
    assert!(metrics.pool.memory_allocated >= (5000 * 128) as u64);

    for idx in objects {
        heap.free(&region, idx);
    }
    assert!(lsalloc::memory_freed() >= (5000 * 128) as u64);
}
