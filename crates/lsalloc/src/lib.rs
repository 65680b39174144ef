//! Log-structured memory allocator.
//!
//! A relocating allocator for long-lived, allocation-heavy in-memory data:
//! objects live in fixed-size segments owned by regions, and the allocator
//! moves live objects to reclaim fragmented space instead of letting
//! fragmentation grow without bound. One instance per shard; nothing here is
//! safe to share across threads.

pub mod background;
mod bitset;
mod buffer;
mod descriptor;
pub mod group;
mod hist;
pub mod memory;
mod migrate;
mod occupancy;
mod pool;
mod region;
pub mod runtime;
mod sanitizer;
pub mod section;
mod segment;
pub mod strategy;
pub mod tracker;
mod util;
mod vle;

use thiserror::Error;

pub use buffer::LsaBuffer;
pub use group::{GroupLimits, RegionGroup, RegionListener};
pub use memory::ReclaimResult;
pub use migrate::{register_migrator, unregister_migrator, Migrator, MigratorId};
pub use occupancy::OccupancyStats;
pub use pool::PoolStats;
pub use region::{EvictionFn, ReclaimLock, Region};
pub use runtime::{IdleCpuHandlerResult, Preempt, SchedulingGroup};
pub use section::AllocatingSection;
pub use segment::{MAX_MANAGED_OBJECT_SIZE, SEGMENT_SIZE};
pub use strategy::{standard_allocator, AllocationStrategy, StandardAllocationStrategy};
pub use tracker::{Config, Metrics};

/// Allocator errors surfaced to callers.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The pool could not produce memory even after reclaim and eviction.
    #[error("failed to reserve memory for allocation")]
    BadAlloc,
    /// `alloc_buf` was asked for more than one segment's worth of bytes.
    #[error("buffer size {size} exceeds the segment size")]
    BufferTooLarge { size: usize },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Pre-allocate the shard's segment pool so LSA occupies the top of the
/// memory range, then release enough low segments for general use.
pub fn prime_segment_pool(available_memory: usize, min_free_memory: usize) {
    pool::with_pool(|p| p.prime(available_memory, min_free_memory));
}

/// Cumulative bytes requested from LSA allocations.
pub fn memory_allocated() -> u64 {
    pool::with_pool(|p| p.statistics().memory_allocated)
}

/// Cumulative bytes requested to be freed in LSA.
pub fn memory_freed() -> u64 {
    pool::with_pool(|p| p.statistics().memory_freed)
}

/// Cumulative bytes copied as part of segment compaction.
pub fn memory_compacted() -> u64 {
    pool::with_pool(|p| p.statistics().memory_compacted)
}

/// Cumulative bytes evicted from evictable regions.
pub fn memory_evicted() -> u64 {
    pool::with_pool(|p| p.statistics().memory_evicted)
}

/// Free vs in-use memory across the whole shard's pool.
pub fn lsa_global_occupancy_stats() -> OccupancyStats {
    pool::with_pool(|p| OccupancyStats::new(p.total_free_memory(), p.total_memory_in_use()))
}
