#![no_main]

use std::cell::RefCell;
use std::rc::Rc;

use libfuzzer_sys::fuzz_target;
use lsalloc::{register_migrator, AllocationStrategy, Migrator, MigratorId, Region};

/// Stresses size/alignment combinations: every pair of bytes becomes one
/// allocation whose size and alignment derive from the pair. All objects are
/// freed at the end through the size-less path, exercising backward
/// descriptor decoding for every record shape.
struct SelfSized;

impl Migrator for SelfSized {
    fn align(&self) -> usize {
        8
    }

    unsafe fn size(&self, obj: *const u8) -> usize {
        (obj as *const u64).read_unaligned() as usize
    }

    unsafe fn migrate(&self, src: *mut u8, dst: *mut u8, size: usize) {
        std::ptr::copy_nonoverlapping(src, dst, size);
    }
}

thread_local! {
    static MIGRATOR: MigratorId = register_migrator(Rc::new(SelfSized));
    static PTRS: RefCell<Vec<*mut u8>> = const { RefCell::new(Vec::new()) };
}

fuzz_target!(|data: &[u8]| {
    MIGRATOR.with(|migrator| {
        let region = Region::new();
        PTRS.with(|ptrs| {
            let mut ptrs = ptrs.borrow_mut();
            ptrs.clear();

            for pair in data.chunks_exact(2) {
                let size = 8 + pair[0] as usize * 16;
                let align = (1usize << (pair[1] % 7)).max(8); // 8 to 64
                let ptr = unsafe {
                    region
                        .allocator()
                        .alloc(*migrator, size, align)
                        .expect("allocation failed")
                        .as_ptr()
                };
                unsafe { (ptr as *mut u64).write_unaligned(size as u64) };
                assert_eq!(ptr as usize % align, 0);
                let footprint = unsafe { region.allocator().object_memory_size(ptr) };
                assert!(footprint >= size);
                ptrs.push(ptr);
            }

            for ptr in ptrs.drain(..) {
                unsafe { region.allocator().free(ptr) };
            }
        });
    });
});
