//! Shared helpers for the integration tests.
#![allow(dead_code)]

use std::cell::RefCell;
use std::rc::Rc;

use lsalloc::{register_migrator, AllocationStrategy, Migrator, MigratorId, Region};

pub fn init_logging() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Fixed-size objects that carry their handle index in the first 8 bytes, so
/// the migrator can update the handle table whenever compaction moves them.
/// This is the usual shape of LSA clients: the move hook rewrites whatever
/// external reference points at the object.
pub struct TrackedHeap {
    pub handles: Rc<RefCell<Vec<*mut u8>>>,
    pub migrator: MigratorId,
    pub size: usize,
}

struct TrackedMigrator {
    handles: Rc<RefCell<Vec<*mut u8>>>,
    size: usize,
    align: usize,
}

impl Migrator for TrackedMigrator {
    fn align(&self) -> usize {
        self.align
    }

    unsafe fn size(&self, _obj: *const u8) -> usize {
        self.size
    }

    unsafe fn migrate(&self, src: *mut u8, dst: *mut u8, size: usize) {
        std::ptr::copy_nonoverlapping(src, dst, size);
        let idx = (dst as *const u64).read_unaligned() as usize;
        self.handles.borrow_mut()[idx] = dst;
    }
}

impl TrackedHeap {
    pub fn new(size: usize, align: usize) -> TrackedHeap {
        assert!(size >= 8);
        let handles = Rc::new(RefCell::new(Vec::new()));
        let migrator = register_migrator(Rc::new(TrackedMigrator {
            handles: Rc::clone(&handles),
            size,
            align,
        }));
        TrackedHeap {
            handles,
            migrator,
            size,
        }
    }

    /// Allocate one object in `region`; returns its handle index.
    pub fn alloc(&self, region: &Region) -> usize {
        let ptr = unsafe {
            region
                .allocator()
                .alloc(self.migrator, self.size, 8)
                .expect("allocation failed")
                .as_ptr()
        };
        let mut handles = self.handles.borrow_mut();
        let idx = handles.len();
        unsafe {
            (ptr as *mut u64).write_unaligned(idx as u64);
            for i in 8..self.size {
                ptr.add(i).write((idx as u8).wrapping_add(i as u8));
            }
        }
        handles.push(ptr);
        idx
    }

    pub fn get(&self, idx: usize) -> *mut u8 {
        self.handles.borrow()[idx]
    }

    pub fn free(&self, region: &Region, idx: usize) {
        let ptr = self.get(idx);
        assert!(!ptr.is_null(), "double free of handle {idx}");
        unsafe { region.allocator().free_sized(ptr, self.size) };
        self.handles.borrow_mut()[idx] = std::ptr::null_mut();
    }

    /// Free through the size-less path, exercising backward descriptor
    /// decoding.
    pub fn free_unsized(&self, region: &Region, idx: usize) {
        let ptr = self.get(idx);
        assert!(!ptr.is_null());
        unsafe { region.allocator().free(ptr) };
        self.handles.borrow_mut()[idx] = std::ptr::null_mut();
    }

    /// Check the payload bytes of a live object.
    pub fn verify(&self, idx: usize) {
        let ptr = self.get(idx);
        assert!(!ptr.is_null());
        unsafe {
            for i in 8..self.size {
                assert_eq!(
                    ptr.add(i).read(),
                    (idx as u8).wrapping_add(i as u8),
                    "payload corrupted at handle {idx} offset {i}"
                );
            }
        }
    }

    pub fn live_count(&self) -> usize {
        self.handles.borrow().iter().filter(|p| !p.is_null()).count()
    }

    pub fn free_all(&self, region: &Region) {
        let count = self.handles.borrow().len();
        for idx in 0..count {
            if !self.get(idx).is_null() {
                self.free(region, idx);
            }
        }
    }
}
