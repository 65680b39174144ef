//! Allocation round-trip behavior: small objects, oversize objects, the
//! size-less free path, and region merging.

mod common;

use common::TrackedHeap;
use lsalloc::{tracker, AllocationStrategy, Region};

#[test]
fn roundtrip_leaves_pool_empty() {
    common::init_logging();
    let region = Region::new();
    let heaps = [
        TrackedHeap::new(16, 8),
        TrackedHeap::new(48, 8),
        TrackedHeap::new(96, 16),
        TrackedHeap::new(1000, 8),
    ];

    let mut allocated = Vec::new();
    for round in 0..500 {
        let heap = &heaps[round % heaps.len()];
        allocated.push((round % heaps.len(), heap.alloc(&region)));
    }
    assert!(region.occupancy().used_space() > 0);
    for (heap_idx, idx) in &allocated {
        heaps[*heap_idx].verify(*idx);
    }

    for (heap_idx, idx) in allocated {
        heaps[heap_idx].free(&region, idx);
    }
    assert_eq!(region.occupancy().used_space(), 0);

    drop(region);
    assert_eq!(tracker::metrics().segments_in_use, 0);
}

#[test]
fn free_without_size_decodes_the_descriptor() {
    common::init_logging();
    let region = Region::new();
    let heap = TrackedHeap::new(72, 8);

    let indexes: Vec<_> = (0..100).map(|_| heap.alloc(&region)).collect();
    for idx in indexes {
        heap.free_unsized(&region, idx);
    }
    assert_eq!(region.occupancy().used_space(), 0);
}

#[test]
fn oversize_objects_take_the_standard_path() {
    common::init_logging();
    let region = Region::new();
    // Larger than the maximum managed object size, so the object must live
    // outside the segments.
    let heap = TrackedHeap::new(lsalloc::MAX_MANAGED_OBJECT_SIZE + 1000, 16);

    let before = tracker::metrics().large_objects_total_space;
    let idx = heap.alloc(&region);
    heap.verify(idx);
    assert!(tracker::metrics().large_objects_total_space > before);
    // Oversize objects occupy no segment.
    assert_eq!(tracker::metrics().segments_in_use, 0);

    heap.free(&region, idx);
    assert_eq!(tracker::metrics().large_objects_total_space, before);
    assert_eq!(region.occupancy().used_space(), 0);
}

#[test]
fn object_memory_size_covers_the_descriptor() {
    common::init_logging();
    let region = Region::new();
    let heap = TrackedHeap::new(64, 8);
    let idx = heap.alloc(&region);
    let in_allocator = unsafe { region.allocator().object_memory_size(heap.get(idx)) };
    assert!(in_allocator >= 64);
    assert!(in_allocator <= 64 + 8);
    heap.free(&region, idx);
}

#[test]
fn merge_transfers_ownership_without_new_segments() {
    common::init_logging();
    let a = Region::new();
    let b = Region::new();
    let heap = TrackedHeap::new(8, 8);
    let payload_heap = TrackedHeap::new(64, 8);

    let a_objects: Vec<_> = (0..1000).map(|_| heap.alloc(&a)).collect();
    let b_objects: Vec<_> = (0..1000).map(|_| heap.alloc(&b)).collect();
    let b_payloads: Vec<_> = (0..100).map(|_| payload_heap.alloc(&b)).collect();

    let occupancy_a = a.occupancy().used_space();
    let occupancy_b = b.occupancy().used_space();
    let allocated_before = lsalloc::memory::allocated_memory();
    let b_pointers: Vec<_> = b_payloads.iter().map(|idx| payload_heap.get(*idx)).collect();

    a.merge(&b);

    // Merging moves segments; it must not ask the system for new ones.
    assert_eq!(lsalloc::memory::allocated_memory(), allocated_before);
    assert_eq!(a.occupancy().used_space(), occupancy_a + occupancy_b);
    assert_eq!(b.occupancy().used_space(), 0);

    // Content is untouched and the old pointers now belong to A.
    for (idx, ptr) in b_payloads.iter().zip(&b_pointers) {
        assert_eq!(payload_heap.get(*idx), *ptr);
        payload_heap.verify(*idx);
    }

    for idx in a_objects.into_iter().chain(b_objects) {
        heap.free(&a, idx);
    }
    for idx in b_payloads {
        payload_heap.free(&a, idx);
    }
    assert_eq!(a.occupancy().used_space(), 0);

    drop(a);
    drop(b);
    assert_eq!(tracker::metrics().segments_in_use, 0);
}
