#![no_main]

use std::cell::RefCell;
use std::rc::Rc;

use libfuzzer_sys::fuzz_target;
use lsalloc::{
    register_migrator, tracker, AllocationStrategy, LsaBuffer, Migrator, MigratorId, Region,
};

/// Fuzz target that interprets a byte slice as a sequence of allocator
/// operations.
///
/// Each operation is encoded as:
///   byte 0: opcode (0=alloc, 1=free, 2=alloc_buf, 3=drop_buf, 4=compact,
///           5=reclaim)
///   byte 1-2: size seed (little-endian u16)
///   byte 3: slot index (which tracked object/buffer to operate on)
///
/// Objects carry their slot index and size in a 16-byte header so the
/// migrator can report sizes and update the slot table when compaction moves
/// them.
const MAX_SLOTS: usize = 64;

struct FuzzMigrator {
    slots: Rc<RefCell<Vec<*mut u8>>>,
}

impl Migrator for FuzzMigrator {
    fn align(&self) -> usize {
        8
    }

    unsafe fn size(&self, obj: *const u8) -> usize {
        (obj as *const u64).add(1).read_unaligned() as usize
    }

    unsafe fn migrate(&self, src: *mut u8, dst: *mut u8, size: usize) {
        std::ptr::copy_nonoverlapping(src, dst, size);
        let slot = (dst as *const u64).read_unaligned() as usize;
        self.slots.borrow_mut()[slot] = dst;
    }
}

thread_local! {
    static HEAP: (MigratorId, Rc<RefCell<Vec<*mut u8>>>) = {
        let slots = Rc::new(RefCell::new(vec![std::ptr::null_mut(); MAX_SLOTS]));
        let migrator = register_migrator(Rc::new(FuzzMigrator {
            slots: Rc::clone(&slots),
        }));
        (migrator, slots)
    };
}

fuzz_target!(|data: &[u8]| {
    HEAP.with(|(migrator, slots)| {
        let region = Region::new();
        let mut sizes = [0usize; MAX_SLOTS];
        let mut buffers: Vec<Option<LsaBuffer>> = (0..MAX_SLOTS).map(|_| None).collect();

        let mut i = 0;
        while i + 4 <= data.len() {
            let opcode = data[i] % 6;
            let seed = u16::from_le_bytes([data[i + 1], data[i + 2]]) as usize;
            let slot = (data[i + 3] as usize) % MAX_SLOTS;
            i += 4;

            match opcode {
                0 => {
                    let old = slots.borrow()[slot];
                    if !old.is_null() {
                        unsafe { region.allocator().free_sized(old, sizes[slot]) };
                        slots.borrow_mut()[slot] = std::ptr::null_mut();
                    }
                    let size = 16 + seed % 2048;
                    let ptr = unsafe {
                        region
                            .allocator()
                            .alloc(*migrator, size, 8)
                            .expect("allocation failed")
                            .as_ptr()
                    };
                    unsafe {
                        (ptr as *mut u64).write_unaligned(slot as u64);
                        (ptr as *mut u64).add(1).write_unaligned(size as u64);
                    }
                    slots.borrow_mut()[slot] = ptr;
                    sizes[slot] = size;
                }
                1 => {
                    let ptr = slots.borrow()[slot];
                    if !ptr.is_null() {
                        unsafe { region.allocator().free_sized(ptr, sizes[slot]) };
                        slots.borrow_mut()[slot] = std::ptr::null_mut();
                    }
                }
                2 => {
                    // Oversize requests exercise the invalid-argument path.
                    if let Ok(buf) = region.alloc_buf(seed * 4) {
                        buffers[slot] = Some(buf);
                    }
                }
                3 => {
                    buffers[slot] = None;
                }
                4 => {
                    region.compact();
                }
                _ => {
                    tracker::reclaim(seed * 1024);
                }
            }
        }

        for slot in 0..MAX_SLOTS {
            let ptr = slots.borrow()[slot];
            if !ptr.is_null() {
                unsafe { region.allocator().free_sized(ptr, sizes[slot]) };
                slots.borrow_mut()[slot] = std::ptr::null_mut();
            }
        }
        buffers.clear();
    });
});
