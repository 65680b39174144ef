//! Allocating-section behavior: reserve growth on failure, decay when
//! unused, and rollback when reserves cannot be raised.

mod common;

use common::TrackedHeap;
use lsalloc::{memory, AllocatingSection, Error, Region};

#[test]
fn section_runs_allocations_with_reserve() {
    common::init_logging();
    let region = Region::new();
    let heap = TrackedHeap::new(64, 8);
    let mut section = AllocatingSection::new();

    let idx = section
        .run(&region, || Ok(heap.alloc(&region)))
        .expect("section failed");
    heap.verify(idx);
    heap.free(&region, idx);
}

/// An unused raised reserve decays back to the minimum.
#[test]
fn unused_reserve_decays_to_minimum() {
    common::init_logging();
    let region = Region::new();
    let heap = TrackedHeap::new(32, 8);
    let mut section = AllocatingSection::new();
    section.set_lsa_reserve(64);

    for _ in 0..200_000 {
        let idx = section
            .run(&region, || Ok(heap.alloc(&region)))
            .expect("section failed");
        heap.free(&region, idx);
    }

    assert_eq!(section.lsa_reserve(), 1);
}

/// Allocation failures inside the section grow the reserves and retry.
#[test]
fn section_grows_reserves_on_failure_and_retries() {
    common::init_logging();
    let region = Region::new();
    let heap = TrackedHeap::new(64, 8);
    let mut section = AllocatingSection::new();

    let std_reserve_before = section.std_reserve();
    let mut failures_left = 2;
    let idx = section
        .run(&region, || {
            if failures_left > 0 {
                failures_left -= 1;
                return Err(Error::BadAlloc);
            }
            Ok(heap.alloc(&region))
        })
        .expect("section failed");

    assert_eq!(failures_left, 0);
    assert!(section.std_reserve() > std_reserve_before);
    heap.free(&region, idx);
}

/// When reserves cannot be raised far enough, the failure surfaces and the
/// reserves roll back so one pathological request does not pin memory.
#[test]
fn failed_section_rolls_back_reserves() {
    common::init_logging();
    // Small shard so the doubling reserve exhausts it quickly.
    memory::configure_total_memory(16 * 1024 * 1024);
    let region = Region::new();
    let mut section = AllocatingSection::new();

    let lsa_before = section.lsa_reserve();
    let std_before = section.std_reserve();

    let result: Result<(), _> = section.run(&region, || Err(Error::BadAlloc));
    assert_eq!(result.unwrap_err(), Error::BadAlloc);

    assert_eq!(section.lsa_reserve(), lsa_before);
    assert_eq!(section.std_reserve(), std_before);
}

/// Inside the section, pointers are stable as long as nothing fails: the
/// reclaim counter cannot move while the region lock is held.
#[test]
fn reclaim_counter_is_stable_inside_section() {
    common::init_logging();
    let region = Region::new();
    let heap = TrackedHeap::new(64, 8);
    let mut section = AllocatingSection::new();

    section
        .run(&region, || {
            let before = region.reclaim_counter();
            let a = heap.alloc(&region);
            let b = heap.alloc(&region);
            assert_eq!(region.reclaim_counter(), before);
            heap.free(&region, a);
            heap.free(&region, b);
            Ok(())
        })
        .expect("section failed");
}
