//! Buffer handles entangled with their owning segment.
//!
//! An [`LsaBuffer`] owns one page-aligned buffer inside a *bufs* segment.
//! Handle and segment descriptor share one heap-pinned link: the descriptor
//! keeps a weak reference per live buffer, the handle the strong one. When
//! compaction moves the buffer it rewrites the link in place, so the handle
//! object itself never goes stale — only the address returned by `get()`
//! changes. Dropping the handle frees the buffer and disengages the link.

use std::cell::Cell;
use std::rc::Rc;

pub(crate) const LINK_DISENGAGED: u32 = u32::MAX;

/// Shared state of one buffer, pinned on the heap so both endpoints survive
/// moves of the handle.
pub(crate) struct BufLink {
    pub(crate) buf: Cell<*mut u8>,
    pub(crate) size: Cell<usize>,
    /// Index of the owning segment; [`LINK_DISENGAGED`] when disengaged.
    pub(crate) seg_index: Cell<u32>,
    /// Slot of this link in the owning descriptor's pointer vector.
    pub(crate) slot: Cell<u32>,
}

impl BufLink {
    pub(crate) fn new(buf: *mut u8, size: usize, seg_index: u32, slot: u32) -> Rc<BufLink> {
        Rc::new(BufLink {
            buf: Cell::new(buf),
            size: Cell::new(size),
            seg_index: Cell::new(seg_index),
            slot: Cell::new(slot),
        })
    }

    pub(crate) fn is_engaged(&self) -> bool {
        self.seg_index.get() != LINK_DISENGAGED
    }

    pub(crate) fn disengage(&self) {
        self.seg_index.set(LINK_DISENGAGED);
        self.buf.set(std::ptr::null_mut());
    }
}

/// An owning handle to a buffer allocated inside a region.
///
/// The handle is never invalidated: the buffer may be moved by compaction,
/// in which case `get()` starts returning the new address, but the bytes are
/// preserved. The buffer is freed when the handle is dropped or overwritten.
/// Must not outlive its region.
#[derive(Default)]
pub struct LsaBuffer {
    pub(crate) link: Option<Rc<BufLink>>,
}

impl std::fmt::Debug for LsaBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LsaBuffer")
            .field("ptr", &self.get())
            .finish()
    }
}

impl LsaBuffer {
    pub(crate) fn engage(link: Rc<BufLink>) -> LsaBuffer {
        LsaBuffer { link: Some(link) }
    }

    /// Pointer to the first byte of the buffer, valid at the time of the
    /// call. Null when disengaged. Any allocation in the owning region may
    /// relocate the buffer and invalidate previously returned pointers.
    pub fn get(&self) -> *mut u8 {
        match &self.link {
            Some(link) => link.buf.get(),
            None => std::ptr::null_mut(),
        }
    }

    /// Number of bytes in the buffer.
    pub fn size(&self) -> usize {
        match &self.link {
            Some(link) => link.size.get(),
            None => 0,
        }
    }

    /// True iff the handle currently owns a buffer.
    pub fn is_engaged(&self) -> bool {
        self.link.as_ref().is_some_and(|l| l.is_engaged())
    }
}

impl Drop for LsaBuffer {
    fn drop(&mut self) {
        if let Some(link) = self.link.take() {
            if link.is_engaged() {
                crate::pool::with_pool(|pool| {
                    let desc = pool.descriptor_at(link.seg_index.get());
                    let region = desc.region();
                    debug_assert!(!region.is_null());
                    // SAFETY: a live buffer pins its owning region; the
                    // descriptor's region pointer is valid until the region
                    // is destroyed, which the contract forbids while buffers
                    // are live.
                    unsafe { (*region).free_buf(pool, &link) };
                });
            }
        }
    }
}
