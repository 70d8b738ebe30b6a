//! Resource handles and the leases that keep them alive.
//!
//! A handle owns one generation of a managed resource. Leases are granted
//! through the manager's slot, which counts them in the same atomic word as
//! the handle pointer. Releases are counted on the handle itself, in a signed
//! `settled` counter that goes negative while the handle is still published.
//!
//! When a replace supersedes a handle it adds the slot's final lease count to
//! `settled`. From then on `settled` is exactly the number of outstanding
//! leases, and whichever release (or settlement) takes it to zero retires the
//! handle: it swaps the handle's identity to a retired sentinel, calls the
//! free function and deallocates the handle.

use alloc::alloc::{alloc, dealloc, Layout};
use alloc::sync::Arc;
use core::fmt;
use core::marker::PhantomData;
use core::num::NonZeroU64;
use core::ops::Deref;
use core::ptr::{self, NonNull};
use portable_atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};

use crate::error::{Rejected, ResourceError};
use crate::stats::StatsCounters;

/// Destroys a resource once it is superseded and its last lease is released.
pub type FreeFn<T> = fn(T);

/// The default [`FreeFn`], which simply drops the resource.
pub fn drop_resource<T>(resource: T) {
    drop(resource);
}

/// Identity value of a handle that has been retired.
const RETIRED: usize = 0;

static NEXT_MANAGER_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier of a [`ResourceManager`](crate::ResourceManager).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ManagerId(NonZeroU64);

impl ManagerId {
    pub(crate) fn next() -> Self {
        match NonZeroU64::new(NEXT_MANAGER_ID.fetch_add(1, Ordering::Relaxed)) {
            Some(id) => Self(id),
            None => panic!("manager id space exhausted"),
        }
    }

    pub fn get(self) -> u64 {
        self.0.get()
    }
}

/// Identifies one generation of a manager's resource.
///
/// Generations are unique within a manager and assigned in allocation order;
/// concurrent replaces may publish them out of that order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HandleId {
    manager: ManagerId,
    generation: u64,
}

impl HandleId {
    pub(crate) fn new(manager: ManagerId, generation: u64) -> Self {
        Self { manager, generation }
    }

    pub fn manager(self) -> ManagerId {
        self.manager
    }

    pub fn generation(self) -> u64 {
        self.generation
    }
}

/// Where a leased handle is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HandleState {
    /// Still returned to new lease requests
    Active = 0,
    /// Replaced; freed once its last lease is released
    Superseded = 1,
}

/// State shared between a manager and every handle it created.
///
/// Handles keep it alive so releases and frees that happen after teardown are
/// still attributed to the right manager.
pub(crate) struct ManagerShared {
    pub(crate) id: ManagerId,
    pub(crate) name: &'static str,
    pub(crate) stats: StatsCounters,
}

pub(crate) struct HandleInner<T> {
    /// Releases (negative) plus, once superseded, the slot's final lease count.
    settled: AtomicI64,
    /// The handle's own address until it is retired.
    identity: AtomicUsize,
    superseded: AtomicBool,
    generation: u64,
    free: FreeFn<T>,
    shared: Arc<ManagerShared>,
    resource: T,
}

impl<T> HandleInner<T> {
    /// Allocates a handle with no leases.
    ///
    /// A failed allocation hands the resource back untouched.
    pub(crate) fn allocate(
        resource: T,
        free: FreeFn<T>,
        generation: u64,
        shared: &Arc<ManagerShared>,
    ) -> Result<NonNull<Self>, Rejected<T>> {
        let layout = Layout::new::<Self>();
        let raw = if allocation_fault() {
            ptr::null_mut()
        } else {
            // SAFETY: `Self` always contains atomics, so the layout is non-zero sized.
            unsafe { alloc(layout) }.cast::<Self>()
        };

        let Some(handle) = NonNull::new(raw) else {
            let error = ResourceError::HandleAllocation {
                size: layout.size(),
                align: layout.align(),
            };
            return Err(Rejected::new(resource, error));
        };

        // SAFETY: freshly allocated with the layout of `Self`.
        unsafe {
            raw.write(Self {
                settled: AtomicI64::new(0),
                identity: AtomicUsize::new(raw as usize),
                superseded: AtomicBool::new(false),
                generation,
                free,
                shared: Arc::clone(shared),
                resource,
            });
        }

        Ok(handle)
    }

    pub(crate) fn id(&self) -> HandleId {
        HandleId::new(self.shared.id, self.generation)
    }

    pub(crate) fn free_fn(&self) -> FreeFn<T> {
        self.free
    }

    pub(crate) fn is_superseded(&self) -> bool {
        self.superseded.load(Ordering::Acquire)
    }

    pub(crate) fn settled(&self) -> i64 {
        self.settled.load(Ordering::Acquire)
    }

    /// Folds the leases granted through the slot into the handle's own count
    /// after it has been swapped out of the slot.
    ///
    /// # Safety
    ///
    /// `handle` must be live, no longer published, and leased by the caller,
    /// so settlement cannot be the step that reaches zero.
    pub(crate) unsafe fn settle(handle: NonNull<Self>, acquired: u64) {
        let inner = unsafe { handle.as_ref() };
        let Ok(acquired) = i64::try_from(acquired) else {
            panic!("lease count {acquired} does not fit the settled counter");
        };

        let outstanding = inner.settled.fetch_add(acquired, Ordering::AcqRel) + acquired;
        inner.superseded.store(true, Ordering::Release);

        debug_assert!(
            outstanding > 0,
            "settled generation {} without holding a lease on it",
            inner.generation
        );
    }

    /// Gives back one lease, retiring the handle if it was the last one on a
    /// superseded handle.
    ///
    /// # Safety
    ///
    /// The caller must own one counted lease on `handle` and must not touch
    /// the handle afterwards.
    pub(crate) unsafe fn release(handle: NonNull<Self>) {
        let previous = unsafe { handle.as_ref() }
            .settled
            .fetch_sub(1, Ordering::AcqRel);

        if previous == 1 {
            unsafe { Self::retire(handle) };
        }
    }

    /// # Safety
    ///
    /// The handle is superseded and its outstanding count just reached zero.
    unsafe fn retire(handle: NonNull<Self>) {
        let raw = handle.as_ptr();

        // Only one caller may win the retirement; losing means the handle was
        // already freed.
        let won = unsafe { &(*raw).identity }
            .compare_exchange(raw as usize, RETIRED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if !won {
            panic!("resource handle retired twice");
        }

        // SAFETY: the identity swap makes this the only reference; the value is
        // moved out before the storage is returned.
        let inner = unsafe { ptr::read(raw) };
        unsafe { dealloc(raw.cast(), Layout::new::<Self>()) };

        let HandleInner {
            generation,
            free,
            shared,
            resource,
            ..
        } = inner;

        free(resource);
        shared.stats.record_free();
        tracing::trace!(
            manager = shared.id.get(),
            name = shared.name,
            generation,
            "freed superseded resource"
        );
    }
}

#[cfg(test)]
std::thread_local! {
    static FAIL_NEXT_ALLOCATION: core::cell::Cell<bool> = const { core::cell::Cell::new(false) };
}

/// Makes the next handle allocation on this thread fail.
#[cfg(test)]
pub(crate) fn fail_next_allocation() {
    FAIL_NEXT_ALLOCATION.with(|fail| fail.set(true));
}

#[cfg(test)]
fn allocation_fault() -> bool {
    FAIL_NEXT_ALLOCATION.with(|fail| fail.replace(false))
}

#[cfg(not(test))]
#[inline(always)]
fn allocation_fault() -> bool {
    false
}

/// A usage lease on one generation of a managed resource.
///
/// The resource stays valid for as long as the lease exists, even if the
/// manager replaces it or is torn down in the meantime. Dropping the lease
/// releases it; the last release of a superseded generation frees it.
pub struct Lease<T> {
    handle: NonNull<HandleInner<T>>,
    _owns: PhantomData<HandleInner<T>>,
}

// SAFETY: a lease hands out `&T` (needs `Sync`) and its drop may free `T` on
// any thread (needs `Send`).
unsafe impl<T: Send + Sync> Send for Lease<T> {}
unsafe impl<T: Send + Sync> Sync for Lease<T> {}

impl<T> Lease<T> {
    /// # Safety
    ///
    /// Ownership of one counted lease on `handle` moves into the new value.
    pub(crate) unsafe fn from_counted(handle: NonNull<HandleInner<T>>) -> Self {
        Self {
            handle,
            _owns: PhantomData,
        }
    }

    pub(crate) fn handle(&self) -> NonNull<HandleInner<T>> {
        self.handle
    }

    fn inner(&self) -> &HandleInner<T> {
        // SAFETY: the lease keeps the handle from being retired.
        unsafe { self.handle.as_ref() }
    }

    pub fn id(&self) -> HandleId {
        self.inner().id()
    }

    pub fn generation(&self) -> u64 {
        self.inner().generation
    }

    pub fn manager_id(&self) -> ManagerId {
        self.inner().shared.id
    }

    /// Snapshot of the handle's state. A replace marks the handle superseded
    /// only after swapping it out, so this may still read `Active` while that
    /// replace is finishing.
    pub fn state(&self) -> HandleState {
        if self.inner().is_superseded() {
            HandleState::Superseded
        } else {
            HandleState::Active
        }
    }

    pub fn resource(&self) -> &T {
        &self.inner().resource
    }

    /// Releases the lease. Equivalent to dropping it.
    pub fn release(self) {
        drop(self);
    }
}

impl<T> Deref for Lease<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.resource()
    }
}

impl<T> Drop for Lease<T> {
    fn drop(&mut self) {
        self.inner().shared.stats.record_release();
        // SAFETY: this lease was counted when it was created and is consumed here.
        unsafe { HandleInner::release(self.handle) };
    }
}

impl<T: fmt::Debug> fmt::Debug for Lease<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("id", &self.id())
            .field("state", &self.state())
            .field("resource", self.resource())
            .finish()
    }
}
