//! Contracts of the cooperative task runtime hosting the shard.
//!
//! The allocator itself never suspends; preemptible reclaim loops poll
//! [`need_preempt`] after each segment and return partial progress when the
//! runtime wants the CPU back. The host (or a test) raises the flag with
//! [`request_preempt`].

use std::cell::Cell;
use std::rc::Rc;

/// Whether a reclaim loop may be interrupted at a yield point.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Preempt {
    No,
    Yes,
}

impl Preempt {
    #[inline]
    pub fn is_yes(self) -> bool {
        self == Preempt::Yes
    }
}

thread_local! {
    static PREEMPT_REQUESTED: Cell<bool> = const { Cell::new(false) };
}

/// True when the runtime has higher-priority work waiting.
#[inline]
pub fn need_preempt() -> bool {
    PREEMPT_REQUESTED.with(|p| p.get())
}

/// Raise the preemption flag. Cleared by [`clear_preempt`].
pub fn request_preempt() {
    PREEMPT_REQUESTED.with(|p| p.set(true));
}

pub fn clear_preempt() {
    PREEMPT_REQUESTED.with(|p| p.set(false));
}

/// Result of an idle-CPU handler invocation.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum IdleCpuHandlerResult {
    NoMoreWork,
    InterruptedByHigherPriorityTask,
}

struct SchedulingGroupInner {
    name: &'static str,
    shares: Cell<u32>,
}

/// Handle to a scheduling group of the host runtime. The allocator only ever
/// adjusts shares; actual scheduling is the runtime's business.
#[derive(Clone)]
pub struct SchedulingGroup {
    inner: Rc<SchedulingGroupInner>,
}

impl SchedulingGroup {
    pub fn new(name: &'static str, shares: u32) -> Self {
        SchedulingGroup {
            inner: Rc::new(SchedulingGroupInner {
                name,
                shares: Cell::new(shares),
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.inner.name
    }

    pub fn shares(&self) -> u32 {
        self.inner.shares.get()
    }

    pub fn set_shares(&self, shares: u32) {
        self.inner.shares.set(shares);
    }
}

impl Default for SchedulingGroup {
    fn default() -> Self {
        SchedulingGroup::new("main", 1000)
    }
}
