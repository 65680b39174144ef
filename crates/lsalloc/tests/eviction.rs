//! Eviction under memory pressure and reclaim interaction with pinned
//! regions.

mod common;

use std::cell::Cell;
use std::rc::Rc;

use common::TrackedHeap;
use lsalloc::{tracker, memory, ReclaimLock, ReclaimResult, Region, SEGMENT_SIZE};
use rand::Rng;

#[test]
fn eviction_under_pressure() {
    common::init_logging();
    let evictable = Region::new();
    let bystander = Region::new();
    let heap = Rc::new(TrackedHeap::new(96, 8));
    let bystander_heap = TrackedHeap::new(96, 8);

    // The eviction callback drops the oldest 100 live objects per call.
    let evictable_ptr: *const Region = &evictable;
    let eviction_calls = Rc::new(Cell::new(0u64));
    evictable.make_evictable({
        let heap = Rc::clone(&heap);
        let eviction_calls = Rc::clone(&eviction_calls);
        let cursor = Cell::new(0usize);
        move || {
            eviction_calls.set(eviction_calls.get() + 1);
            // SAFETY: the region outlives its own eviction callback and is
            // never moved while evictable.
            let region = unsafe { &*evictable_ptr };
            let total = heap.handles.borrow().len();
            let mut freed = 0;
            let mut i = cursor.get();
            while freed < 100 && i < total {
                if !heap.get(i).is_null() {
                    heap.free(region, i);
                    freed += 1;
                }
                i += 1;
            }
            cursor.set(i);
            if freed > 0 {
                ReclaimResult::ReclaimedSomething
            } else {
                ReclaimResult::ReclaimedNothing
            }
        }
    });

    let bystander_objects: Vec<_> = (0..100).map(|_| bystander_heap.alloc(&bystander)).collect();
    let bystander_counter = bystander.reclaim_counter();

    let target = 6 * 1024 * 1024;
    for _ in 0..(target / 96 + 2000) {
        heap.alloc(&evictable);
    }
    assert!(tracker::metrics().total_memory_in_use > target);

    let evicted_before = lsalloc::memory_evicted();
    let reclaimed = tracker::reclaim(target / 4);

    assert!(eviction_calls.get() > 0, "eviction callback never ran");
    assert!(reclaimed > 0);
    assert!(lsalloc::memory_evicted() - evicted_before >= (target / 4) as u64);

    // The bystander region was not disturbed.
    assert_eq!(bystander.reclaim_counter(), bystander_counter);
    for idx in &bystander_objects {
        bystander_heap.verify(*idx);
    }

    evictable.make_not_evictable();
    heap.free_all(&evictable);
    for idx in bystander_objects {
        bystander_heap.free(&bystander, idx);
    }
}

#[test]
fn reclaim_respects_pinned_region() {
    common::init_logging();
    let pinned = Region::new();
    let other = Region::new();
    let pinned_heap = TrackedHeap::new(96, 8);
    let other_heap = TrackedHeap::new(96, 8);

    let pinned_objects: Vec<_> = (0..5_000).map(|_| pinned_heap.alloc(&pinned)).collect();
    let other_objects: Vec<_> = (0..20_000).map(|_| other_heap.alloc(&other)).collect();
    for idx in other_objects.iter().step_by(2) {
        other_heap.free(&other, *idx);
    }
    assert!(other.is_compactible());

    let pinned_counter = pinned.reclaim_counter();
    let pinned_pointers: Vec<_> = pinned_objects.iter().map(|i| pinned_heap.get(*i)).collect();

    {
        let _lock = ReclaimLock::new(&pinned);
        let reclaimed = tracker::reclaim(64 * SEGMENT_SIZE);
        // The other region was fragmented enough to give something back.
        assert!(reclaimed > 0);
    }

    // Nothing in the pinned region moved.
    assert_eq!(pinned.reclaim_counter(), pinned_counter);
    for (idx, ptr) in pinned_objects.iter().zip(&pinned_pointers) {
        assert_eq!(pinned_heap.get(*idx), *ptr);
        pinned_heap.verify(*idx);
    }

    pinned_heap.free_all(&pinned);
    other_heap.free_all(&other);
}

/// Allocate/free churn with reclaim injected at random points must not
/// accumulate segments.
#[test]
fn no_leak_under_pressure() {
    common::init_logging();
    let region = Region::new();
    let heap = TrackedHeap::new(128, 8);
    let mut rng = rand::thread_rng();

    let batch_bytes = 1024 * 1024;
    let batch = batch_bytes / 128;
    for _ in 0..30 {
        let objects: Vec<_> = (0..batch).map(|_| heap.alloc(&region)).collect();
        if rng.gen_bool(0.4) {
            tracker::reclaim(rng.gen_range(1..batch_bytes));
        }
        for idx in objects {
            heap.free(&region, idx);
        }
        let in_use = tracker::metrics().segments_in_use;
        assert!(
            in_use <= batch_bytes / SEGMENT_SIZE + 2,
            "segments accumulating: {in_use}"
        );
    }

    drop(region);
    assert_eq!(tracker::metrics().segments_in_use, 0);
    // Everything the shard took from the system allocator went back to the
    // free list or the system.
    assert!(memory::allocated_memory() <= 64 * SEGMENT_SIZE);
}
