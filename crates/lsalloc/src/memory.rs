//! Shard memory accounting on top of the process allocator.
//!
//! The contract consumed here is minimal: aligned blocks are either returned
//! or the allocation fails. Each shard runs against a byte budget (default
//! 1 GiB) so that memory pressure is observable and reproducible; hosts call
//! [`configure_total_memory`] before the first allocation to size the shard.
//!
//! A low-memory hook may be registered; it runs once when an allocation would
//! exceed the budget, giving the reclaimer a chance to release segments
//! before the allocation is failed.

use std::alloc::Layout;
use std::cell::{Cell, RefCell};

/// Outcome of asking a reclaim source to release memory.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ReclaimResult {
    ReclaimedSomething,
    ReclaimedNothing,
}

const DEFAULT_TOTAL_MEMORY: usize = 1 << 30;

type ReclaimHook = Box<dyn Fn(usize) -> ReclaimResult>;

struct ShardMemory {
    total: Cell<usize>,
    allocated: Cell<usize>,
    reclaim_hook: RefCell<Option<ReclaimHook>>,
    in_reclaim_hook: Cell<bool>,
}

thread_local! {
    static SHARD_MEMORY: ShardMemory = ShardMemory {
        total: Cell::new(DEFAULT_TOTAL_MEMORY),
        allocated: Cell::new(0),
        reclaim_hook: RefCell::new(None),
        in_reclaim_hook: Cell::new(false),
    };
}

/// Set the shard's memory budget. Must be called before the segment pool is
/// first touched; the pool sizes its descriptor table from this value.
pub fn configure_total_memory(bytes: usize) {
    SHARD_MEMORY.with(|m| m.total.set(bytes));
}

pub fn total_memory() -> usize {
    SHARD_MEMORY.with(|m| m.total.get())
}

pub fn allocated_memory() -> usize {
    SHARD_MEMORY.with(|m| m.allocated.get())
}

pub fn free_memory() -> usize {
    SHARD_MEMORY.with(|m| m.total.get().saturating_sub(m.allocated.get()))
}

/// Install the hook invoked when an allocation would exceed the budget.
/// The tracker registers itself here.
pub(crate) fn set_reclaim_hook(hook: ReclaimHook) {
    SHARD_MEMORY.with(|m| *m.reclaim_hook.borrow_mut() = Some(hook));
}

fn try_reclaim(deficit: usize) -> ReclaimResult {
    SHARD_MEMORY.with(|m| {
        if m.in_reclaim_hook.get() {
            return ReclaimResult::ReclaimedNothing;
        }
        let hook = m.reclaim_hook.borrow();
        match hook.as_ref() {
            Some(hook) => {
                m.in_reclaim_hook.set(true);
                let res = hook(deficit);
                m.in_reclaim_hook.set(false);
                res
            }
            None => ReclaimResult::ReclaimedNothing,
        }
    })
}

/// Allocate `layout` against the shard budget. Returns null when the budget
/// cannot be met even after running the reclaim hook, or when the process
/// allocator fails.
pub(crate) fn alloc(layout: Layout) -> *mut u8 {
    let size = layout.size();
    let over_budget = SHARD_MEMORY.with(|m| m.allocated.get() + size > m.total.get());
    if over_budget {
        let deficit =
            SHARD_MEMORY.with(|m| (m.allocated.get() + size).saturating_sub(m.total.get()));
        if try_reclaim(deficit) == ReclaimResult::ReclaimedNothing {
            return std::ptr::null_mut();
        }
        let still_over = SHARD_MEMORY.with(|m| m.allocated.get() + size > m.total.get());
        if still_over {
            return std::ptr::null_mut();
        }
    }
    // SAFETY: layout has non-zero size; all callers allocate at least a header.
    let ptr = unsafe { std::alloc::alloc(layout) };
    if !ptr.is_null() {
        SHARD_MEMORY.with(|m| m.allocated.set(m.allocated.get() + size));
    }
    ptr
}

/// Release a block previously obtained from [`alloc`] with the same layout.
///
/// # Safety
/// `ptr` must have been returned by [`alloc`] with exactly `layout`.
pub(crate) unsafe fn dealloc(ptr: *mut u8, layout: Layout) {
    std::alloc::dealloc(ptr, layout);
    SHARD_MEMORY.with(|m| m.allocated.set(m.allocated.get() - layout.size()));
}
