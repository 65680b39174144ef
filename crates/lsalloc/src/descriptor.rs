//! Inline object descriptors.
//!
//! Every small object in a regular segment is preceded by a descriptor
//! holding a single varint `n`:
//!   odd  `n`: live object, migrator index `n / 2`
//!   even `n`: dead record, length `n / 2` including the descriptor
//!
//! The varint (see [`crate::vle`]) decodes forwards for segment walks and
//! backwards for `free(ptr)`, and a padded encoding lets one descriptor
//! cover the gap introduced by object alignment, preserving the invariant
//! that the descriptor immediately precedes the object.

use std::rc::Rc;

use crate::migrate::{migrator, Migrator, MigratorId};
use crate::vle;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct ObjectDescriptor {
    n: u32,
}

impl ObjectDescriptor {
    pub(crate) fn live(migrator: MigratorId) -> Self {
        ObjectDescriptor {
            n: migrator.index() * 2 + 1,
        }
    }

    pub(crate) fn make_dead(size: usize) -> Self {
        debug_assert!(size > 0);
        ObjectDescriptor {
            n: (size * 2) as u32,
        }
    }

    pub(crate) fn is_live(&self) -> bool {
        self.n & 1 == 1
    }

    pub(crate) fn migrator(&self) -> Rc<dyn Migrator> {
        debug_assert!(self.is_live());
        migrator(self.n / 2)
    }

    pub(crate) fn alignment(&self) -> usize {
        self.migrator().align()
    }

    /// Size of the live object at `obj`, excluding the descriptor.
    ///
    /// # Safety
    /// `obj` must point at the live object this descriptor precedes.
    pub(crate) unsafe fn live_size(&self, obj: *const u8) -> usize {
        self.migrator().size(obj)
    }

    /// Length of a dead record, including the descriptor.
    pub(crate) fn dead_size(&self) -> usize {
        debug_assert!(!self.is_live());
        (self.n / 2) as usize
    }

    pub(crate) fn encoded_size(&self) -> usize {
        vle::encoded_size(self.n)
    }

    /// # Safety
    /// See [`vle::encode`].
    pub(crate) unsafe fn encode(&self, pos: *mut u8) -> *mut u8 {
        vle::encode(pos, self.n)
    }

    /// Non-canonical encoding spanning `len` bytes, for alignment padding.
    ///
    /// # Safety
    /// See [`vle::encode_padded`].
    pub(crate) unsafe fn encode_padded(&self, pos: *mut u8, len: usize) -> *mut u8 {
        vle::encode_padded(pos, self.n, len)
    }

    /// # Safety
    /// See [`vle::decode_forward`].
    pub(crate) unsafe fn decode_forward(pos: *const u8) -> (Self, *const u8) {
        let (n, next) = vle::decode_forward(pos);
        (ObjectDescriptor { n }, next)
    }

    /// # Safety
    /// See [`vle::decode_backward`].
    pub(crate) unsafe fn decode_backward(pos: *const u8) -> (Self, *const u8) {
        let (n, start) = vle::decode_backward(pos);
        (ObjectDescriptor { n }, start)
    }
}
