//! Background memory reclaimer.
//!
//! A cooperative task living in a dedicated, normally low-priority
//! scheduling group. The host runtime drives it: `run_once` performs one
//! preemptible reclaim iteration when free memory has dropped below the
//! threshold, and `adjust_shares` (called periodically) raises the group's
//! shares in proportion to the deficit so that under heavy pressure the
//! reclaimer preempts less-critical work.

use std::cell::Cell;

use tracing::{debug, trace};

use crate::memory;
use crate::runtime::{Preempt, SchedulingGroup};
use crate::tracker;

const FREE_MEMORY_THRESHOLD: usize = 60_000_000;

pub struct BackgroundReclaimer {
    group: SchedulingGroup,
    stopping: Cell<bool>,
}

impl BackgroundReclaimer {
    pub(crate) fn new(group: SchedulingGroup) -> Self {
        debug!(target: "lsa", "background reclaimer starting in group {}", group.name());
        BackgroundReclaimer {
            group,
            stopping: Cell::new(false),
        }
    }

    fn have_work(&self) -> bool {
        memory::free_memory() < FREE_MEMORY_THRESHOLD
    }

    /// One loop iteration: reclaim the deficit preemptibly, then yield back
    /// to the runtime. Returns true when work was done; false means the task
    /// should sleep until woken by memory pressure.
    pub fn run_once(&self) -> bool {
        if self.stopping.get() || !self.have_work() {
            trace!(target: "lsa", "background reclaimer: sleep");
            return false;
        }
        let deficit = FREE_MEMORY_THRESHOLD - memory::free_memory();
        tracker::reclaim_internal(deficit, Preempt::Yes);
        true
    }

    /// Scale the scheduling-group shares with how far below the threshold
    /// free memory has fallen: 1 share when idle, up to ~1000 under full
    /// pressure.
    pub fn adjust_shares(&self) {
        if self.have_work() {
            let deficit = FREE_MEMORY_THRESHOLD - memory::free_memory();
            let shares = 1 + (1000 * deficit / FREE_MEMORY_THRESHOLD) as u32;
            self.group.set_shares(shares);
            trace!(target: "lsa", "background reclaimer shares: {}", shares);
        }
    }

    pub fn stop(&self) {
        self.stopping.set(true);
        debug!(target: "lsa", "background reclaimer stopped");
    }
}
