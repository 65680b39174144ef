//! Allocation strategy seam.
//!
//! Data structures allocate through a strategy so the same code can live in a
//! compacting region or in plain standard-allocator memory. Oversize objects
//! inside a region also delegate here.

use std::alloc::Layout;
use std::ptr::NonNull;

use crate::migrate::MigratorId;
use crate::util::align_up;
use crate::{memory, Error, Result};

/// Object allocation interface shared by regions and the standard allocator.
pub trait AllocationStrategy {
    /// Allocate `size` bytes for an object of the type described by
    /// `migrator`, aligned to `align`.
    ///
    /// # Safety
    /// `migrator` must be registered; `align` must be a power of two no
    /// larger than 4096.
    unsafe fn alloc(&self, migrator: MigratorId, size: usize, align: usize)
        -> Result<NonNull<u8>>;

    /// Free an object previously returned by [`AllocationStrategy::alloc`].
    ///
    /// # Safety
    /// `obj` must be live and owned by this strategy.
    unsafe fn free(&self, obj: *mut u8);

    /// Free with the caller-known object size. The size must agree with what
    /// the allocator recovers from its own metadata.
    ///
    /// # Safety
    /// Same as [`AllocationStrategy::free`], and `size` must be the size the
    /// object was allocated with.
    unsafe fn free_sized(&self, obj: *mut u8, size: usize);

    /// Bytes this object occupies inside the allocator, metadata included.
    ///
    /// # Safety
    /// `obj` must be live and owned by this strategy.
    unsafe fn object_memory_size(&self, obj: *const u8) -> usize;
}

// Block layout: [header gap][size: usize][align: usize][object bytes].
// The header sits immediately before the object so free() can recover the
// layout from the bare pointer.
const HEADER_BYTES: usize = 2 * std::mem::size_of::<usize>();

fn block_layout(size: usize, align: usize) -> Result<(Layout, usize)> {
    let align = align.max(HEADER_BYTES);
    let offset = align_up(HEADER_BYTES, align);
    let layout = Layout::from_size_align(offset + size, align).map_err(|_| Error::BadAlloc)?;
    Ok((layout, offset))
}

/// Standard allocation strategy: objects come straight from the process
/// allocator and never move. Migrators are accepted for interface parity and
/// ignored.
pub struct StandardAllocationStrategy;

static STANDARD_ALLOCATION_STRATEGY: StandardAllocationStrategy = StandardAllocationStrategy;

pub fn standard_allocator() -> &'static StandardAllocationStrategy {
    &STANDARD_ALLOCATION_STRATEGY
}

impl StandardAllocationStrategy {
    /// Exact usable size of the object at `obj`.
    ///
    /// # Safety
    /// `obj` must be a live allocation of this strategy.
    pub unsafe fn usable_size(&self, obj: *const u8) -> usize {
        (obj as *const usize).sub(2).read()
    }
}

impl AllocationStrategy for StandardAllocationStrategy {
    unsafe fn alloc(
        &self,
        _migrator: MigratorId,
        size: usize,
        align: usize,
    ) -> Result<NonNull<u8>> {
        let (layout, offset) = block_layout(size, align)?;
        let base = memory::alloc(layout);
        if base.is_null() {
            return Err(Error::BadAlloc);
        }
        let obj = base.add(offset);
        (obj as *mut usize).sub(2).write(size);
        (obj as *mut usize).sub(1).write(align);
        Ok(NonNull::new_unchecked(obj))
    }

    unsafe fn free(&self, obj: *mut u8) {
        let size = (obj as *const usize).sub(2).read();
        let align = (obj as *const usize).sub(1).read();
        let (layout, offset) = match block_layout(size, align) {
            Ok(v) => v,
            Err(_) => crate::util::lsa_abort("corrupt standard-allocation header"),
        };
        memory::dealloc(obj.sub(offset), layout);
    }

    unsafe fn free_sized(&self, obj: *mut u8, size: usize) {
        debug_assert_eq!(size, self.usable_size(obj));
        self.free(obj);
    }

    unsafe fn object_memory_size(&self, obj: *const u8) -> usize {
        self.usable_size(obj)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate::MigratorId;

    #[test]
    fn standard_roundtrip_preserves_alignment() {
        let a = standard_allocator();
        for align in [16usize, 64, 512, 4096] {
            unsafe {
                let p = a.alloc(MigratorId(0), 100, align).unwrap();
                assert_eq!(p.as_ptr() as usize % align, 0);
                assert_eq!(a.usable_size(p.as_ptr()), 100);
                p.as_ptr().write_bytes(0xab, 100);
                a.free_sized(p.as_ptr(), 100);
            }
        }
    }
}
