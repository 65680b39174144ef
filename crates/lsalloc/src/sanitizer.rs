//! Debug-build allocation sanitizer for regions.
//!
//! Tracks every live small object of a region so that double frees, frees of
//! unknown pointers, size mismatches, bad migrations and region-teardown
//! leaks are detected immediately. Compiled to a no-op in release builds.

use std::cell::Cell;

thread_local! {
    static REPORT_BACKTRACE: Cell<bool> = const { Cell::new(false) };
}

/// Record allocation backtraces for richer sanitizer reports. Slower.
pub(crate) fn set_report_backtrace(enabled: bool) {
    REPORT_BACKTRACE.with(|b| b.set(enabled));
}

#[cfg(debug_assertions)]
mod imp {
    use std::backtrace::Backtrace;
    use std::cell::RefCell;

    use hashbrown::HashMap;

    use crate::util::lsa_abort;

    struct Allocation {
        size: usize,
        backtrace: Option<Backtrace>,
    }

    #[derive(Default)]
    pub(crate) struct RegionSanitizer {
        allocations: RefCell<HashMap<usize, Allocation>>,
    }

    fn capture() -> Option<Backtrace> {
        if super::REPORT_BACKTRACE.with(|b| b.get()) {
            Some(Backtrace::force_capture())
        } else {
            None
        }
    }

    impl RegionSanitizer {
        pub(crate) fn on_allocation(&self, ptr: *const u8, size: usize) {
            let prev = self.allocations.borrow_mut().insert(
                ptr as usize,
                Allocation {
                    size,
                    backtrace: capture(),
                },
            );
            if let Some(prev) = prev {
                tracing::error!(
                    target: "lsa",
                    "allocating a {} byte object at already occupied address {:?} \
                     (previous allocation: {} bytes)",
                    size, ptr, prev.size
                );
                lsa_abort("allocation at an occupied address");
            }
        }

        pub(crate) fn on_free(&self, ptr: *const u8, size: usize) {
            match self.allocations.borrow_mut().remove(&(ptr as usize)) {
                None => {
                    tracing::error!(
                        target: "lsa",
                        "freeing an object at {ptr:?} (size {size}) that does not exist"
                    );
                    lsa_abort("free of an unknown object");
                }
                Some(alloc) if alloc.size != size => {
                    tracing::error!(
                        target: "lsa",
                        "allocation/deallocation size mismatch at {:?}: {} vs {}{}",
                        ptr,
                        alloc.size,
                        size,
                        alloc
                            .backtrace
                            .map(|b| format!("\nallocated at:\n{b}"))
                            .unwrap_or_default()
                    );
                    lsa_abort("free-size mismatch");
                }
                Some(_) => {}
            }
        }

        pub(crate) fn on_migrate(&self, src: *const u8, size: usize, dst: *const u8) {
            let mut allocations = self.allocations.borrow_mut();
            let alloc = match allocations.remove(&(src as usize)) {
                Some(a) => a,
                None => {
                    tracing::error!(
                        target: "lsa",
                        "migrating an object at {src:?} (size {size}) that does not exist"
                    );
                    lsa_abort("migration of an unknown object");
                }
            };
            if alloc.size != size {
                lsa_abort("allocation/migration size mismatch");
            }
            if allocations.insert(dst as usize, alloc).is_some() {
                lsa_abort("migration to an occupied address");
            }
        }

        pub(crate) fn on_region_destruction(&self) {
            let allocations = self.allocations.borrow();
            if allocations.is_empty() {
                return;
            }
            for (ptr, alloc) in allocations.iter() {
                tracing::error!(
                    target: "lsa",
                    "leaked {} byte object at {:#x}{}",
                    alloc.size,
                    ptr,
                    alloc
                        .backtrace
                        .as_ref()
                        .map(|b| format!("\nallocated at:\n{b}"))
                        .unwrap_or_default()
                );
            }
            lsa_abort("region destroyed with live objects");
        }

        pub(crate) fn merge(&self, other: &RegionSanitizer) {
            let mut ours = self.allocations.borrow_mut();
            for (ptr, alloc) in other.allocations.borrow_mut().drain() {
                if ours.insert(ptr, alloc).is_some() {
                    lsa_abort("conflicting allocations in merged regions");
                }
            }
        }
    }
}

#[cfg(not(debug_assertions))]
mod imp {
    #[derive(Default)]
    pub(crate) struct RegionSanitizer;

    impl RegionSanitizer {
        #[inline(always)]
        pub(crate) fn on_allocation(&self, _ptr: *const u8, _size: usize) {}
        #[inline(always)]
        pub(crate) fn on_free(&self, _ptr: *const u8, _size: usize) {}
        #[inline(always)]
        pub(crate) fn on_migrate(&self, _src: *const u8, _size: usize, _dst: *const u8) {}
        #[inline(always)]
        pub(crate) fn on_region_destruction(&self) {}
        #[inline(always)]
        pub(crate) fn merge(&self, _other: &RegionSanitizer) {}
    }
}

pub(crate) use imp::RegionSanitizer;
