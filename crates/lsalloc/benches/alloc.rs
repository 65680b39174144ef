//! Microbenchmarks for the allocator hot paths.

use std::cell::RefCell;
use std::rc::Rc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use lsalloc::{register_migrator, AllocationStrategy, Migrator, MigratorId, Region};

/// Objects store their slot index up front; the migrator keeps the slot
/// table current when compaction moves them.
struct SlotMigrator {
    slots: Rc<RefCell<Vec<*mut u8>>>,
    size: usize,
}

impl Migrator for SlotMigrator {
    fn align(&self) -> usize {
        8
    }

    unsafe fn size(&self, _obj: *const u8) -> usize {
        self.size
    }

    unsafe fn migrate(&self, src: *mut u8, dst: *mut u8, size: usize) {
        std::ptr::copy_nonoverlapping(src, dst, size);
        let slot = (dst as *const u64).read_unaligned() as usize;
        self.slots.borrow_mut()[slot] = dst;
    }
}

fn register(size: usize) -> (MigratorId, Rc<RefCell<Vec<*mut u8>>>) {
    let slots = Rc::new(RefCell::new(Vec::new()));
    let migrator = register_migrator(Rc::new(SlotMigrator {
        slots: Rc::clone(&slots),
        size,
    }));
    (migrator, slots)
}

fn bench_alloc_free(c: &mut Criterion) {
    let mut group = c.benchmark_group("alloc_free");
    for size in [16usize, 64, 256, 1024] {
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            let region = Region::new();
            let (migrator, _slots) = register(size);
            b.iter(|| unsafe {
                let ptr = region
                    .allocator()
                    .alloc(migrator, black_box(size), 8)
                    .expect("allocation failed");
                region.allocator().free_sized(ptr.as_ptr(), size);
            });
        });
    }
    group.finish();
}

fn bench_fragmented_compaction(c: &mut Criterion) {
    c.bench_function("compact_sparse_region", |b| {
        let (migrator, slots) = register(96);
        b.iter_with_setup(
            || {
                let region = Region::new();
                slots.borrow_mut().clear();
                for i in 0..20_000u64 {
                    let ptr = unsafe {
                        region
                            .allocator()
                            .alloc(migrator, 96, 8)
                            .expect("allocation failed")
                            .as_ptr()
                    };
                    unsafe { (ptr as *mut u64).write_unaligned(i) };
                    slots.borrow_mut().push(ptr);
                }
                for i in (1..20_000).step_by(2) {
                    let ptr = slots.borrow()[i];
                    unsafe { region.allocator().free_sized(ptr, 96) };
                }
                region
            },
            |region| {
                while region.is_compactible() {
                    region.compact();
                }
                for i in (0..20_000).step_by(2) {
                    let ptr = slots.borrow()[i];
                    unsafe { region.allocator().free_sized(black_box(ptr), 96) };
                }
            },
        );
    });
}

fn bench_buffers(c: &mut Criterion) {
    c.bench_function("alloc_buf_16k", |b| {
        let region = Region::new();
        b.iter(|| {
            let buf = region.alloc_buf(black_box(16384)).expect("alloc_buf failed");
            black_box(buf.get());
        });
    });
}

criterion_group!(
    benches,
    bench_alloc_free,
    bench_fragmented_compaction,
    bench_buffers
);
criterion_main!(benches);
