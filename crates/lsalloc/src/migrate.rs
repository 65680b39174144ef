//! Per-type migrators and their shard-wide registry.
//!
//! A migrator teaches the allocator how to relocate objects of one type:
//! alignment, size recovery from a live object, and the move itself. The
//! registry assigns each migrator a small index; object descriptors store the
//! index, never a pointer, so descriptors stay within a few bytes.

use std::cell::RefCell;
use std::rc::Rc;

use crate::vle;

/// Relocation protocol for one allocated type.
pub trait Migrator {
    /// Alignment of objects of this type.
    fn align(&self) -> usize;

    /// Size in bytes of the live object at `obj`.
    ///
    /// # Safety
    /// `obj` must point at a live object previously allocated with this
    /// migrator.
    unsafe fn size(&self, obj: *const u8) -> usize;

    /// Move the object from `src` to `dst` and update any external references
    /// to it. `src` is dead once this returns.
    ///
    /// # Safety
    /// `src` must be a live object of `size` bytes allocated with this
    /// migrator; `dst` must be valid for `size` bytes at the required
    /// alignment. The ranges do not overlap.
    unsafe fn migrate(&self, src: *mut u8, dst: *mut u8, size: usize);
}

/// Registry handle for a migrator. Copyable; the index is what descriptors
/// encode.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct MigratorId(pub(crate) u32);

impl MigratorId {
    pub(crate) fn index(self) -> u32 {
        self.0
    }
}

#[derive(Default)]
struct Migrators {
    table: Vec<Option<Rc<dyn Migrator>>>,
    unused_ids: Vec<u32>,
}

impl Migrators {
    fn add(&mut self, m: Rc<dyn Migrator>) -> u32 {
        if let Some(idx) = self.unused_ids.pop() {
            self.table[idx as usize] = Some(m);
            return idx;
        }
        self.table.push(Some(m));
        (self.table.len() - 1) as u32
    }

    fn remove(&mut self, idx: u32) {
        self.table[idx as usize] = None;
        self.unused_ids.push(idx);
    }

    fn get(&self, idx: u32) -> Rc<dyn Migrator> {
        match &self.table[idx as usize] {
            Some(m) => Rc::clone(m),
            None => crate::util::lsa_abort("use of a deregistered migrator"),
        }
    }
}

thread_local! {
    static MIGRATORS: RefCell<Migrators> = RefCell::new(Migrators::default());
}

/// Register a migrator, returning its id. The id stays valid until
/// [`unregister_migrator`]; ids of removed migrators are reused.
pub fn register_migrator(m: Rc<dyn Migrator>) -> MigratorId {
    MIGRATORS.with(|migrators| {
        let idx = migrators.borrow_mut().add(m);
        // Object descriptors encode 2 * index + 1.
        assert!(idx * 2 + 1 < vle::EXPRESS_LIMIT);
        MigratorId(idx)
    })
}

/// Remove a migrator from the registry. The caller guarantees no live object
/// still references the id.
pub fn unregister_migrator(id: MigratorId) {
    MIGRATORS.with(|migrators| migrators.borrow_mut().remove(id.0));
}

/// Look up a migrator by index. The returned handle keeps the migrator alive
/// across the call even if it is deregistered concurrently by a callback.
pub(crate) fn migrator(idx: u32) -> Rc<dyn Migrator> {
    MIGRATORS.with(|migrators| migrators.borrow().get(idx))
}
