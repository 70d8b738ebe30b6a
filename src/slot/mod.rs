//! The manager's active-handle slot.
//!
//! A slot holds one [`SlotWord`]: the published handle pointer together with
//! the number of leases granted against it while it was published. Both
//! halves change together, so a lease can only ever be counted against the
//! handle that is active at the instant of the increment.
//!
//! Two interchangeable implementations exist. [`atomic::AtomicSlot`] packs the
//! word into a 128-bit atomic and is lock-free wherever the target has a
//! double-width CAS. [`locked::LockedSlot`] serialises the same operations
//! behind a spin mutex and is selected with the `mutex-slot` feature.

#[cfg_attr(feature = "mutex-slot", allow(dead_code))]
pub(crate) mod atomic;
#[cfg_attr(not(feature = "mutex-slot"), allow(dead_code))]
pub(crate) mod locked;

use core::fmt;
use core::ptr;

#[cfg(not(feature = "mutex-slot"))]
pub(crate) type ActiveSlot<H> = atomic::AtomicSlot<H>;
#[cfg(feature = "mutex-slot")]
pub(crate) type ActiveSlot<H> = locked::LockedSlot<H>;

/// Snapshot of a slot: the published handle and its granted-lease count.
pub(crate) struct SlotWord<H> {
    pub(crate) handle: *mut H,
    pub(crate) acquired: u64,
}

impl<H> SlotWord<H> {
    pub(crate) const fn new(handle: *mut H, acquired: u64) -> Self {
        Self { handle, acquired }
    }

    pub(crate) const fn empty() -> Self {
        Self::new(ptr::null_mut(), 0)
    }

    /// The same handle with one more lease granted.
    ///
    /// # Panics
    ///
    /// If the lease counter would wrap.
    pub(crate) fn leased(self) -> Self {
        match self.acquired.checked_add(1) {
            Some(acquired) => Self::new(self.handle, acquired),
            None => panic!("lease counter overflow on the active resource handle"),
        }
    }
}

// Manual impls: deriving would needlessly require `H: Copy` and friends.
impl<H> Clone for SlotWord<H> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<H> Copy for SlotWord<H> {}

impl<H> PartialEq for SlotWord<H> {
    fn eq(&self, other: &Self) -> bool {
        ptr::eq(self.handle, other.handle) && self.acquired == other.acquired
    }
}

impl<H> Eq for SlotWord<H> {}

impl<H> fmt::Debug for SlotWord<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotWord")
            .field("handle", &self.handle)
            .field("acquired", &self.acquired)
            .finish()
    }
}
