//! The resource manager: one active handle, leased and replaced without locks.

use alloc::sync::Arc;
use core::fmt;
use core::marker::PhantomData;
use core::ptr::{self, NonNull};
use portable_atomic::{AtomicU64, Ordering};

use crate::backoff::Backoff;
use crate::config::ManagerConfig;
use crate::error::{Rejected, ResourceError, ResourceResult};
use crate::handle::{drop_resource, FreeFn, HandleId, HandleInner, Lease, ManagerId, ManagerShared};
use crate::slot::{ActiveSlot, SlotWord};
use crate::stats::{ManagerStats, StatsCounters};

/// Owns the active generation of a shared resource.
///
/// Readers call [`acquire`](Self::acquire) for a [`Lease`] and use the
/// resource through it. A reload calls [`replace`](Self::replace), which
/// publishes the new resource immediately; the previous generation is freed
/// by whoever releases its last lease. Dropping the manager hands the active
/// generation off the same way, so teardown never waits for readers.
///
/// # Example
///
/// ```
/// use resource_handle::ResourceManager;
///
/// let manager = ResourceManager::new(String::from("v1")).unwrap();
///
/// let reader = manager.acquire();
/// manager.replace(String::from("v2")).unwrap();
///
/// assert_eq!(reader.as_str(), "v1");
/// assert_eq!(manager.acquire().as_str(), "v2");
/// ```
pub struct ResourceManager<T> {
    slot: ActiveSlot<HandleInner<T>>,
    next_generation: AtomicU64,
    shared: Arc<ManagerShared>,
    config: ManagerConfig,
    _owns: PhantomData<HandleInner<T>>,
}

// SAFETY: the slot only ever holds handles owned by this manager. Sharing the
// manager hands out `&T` across threads and lets any thread free a `T`.
unsafe impl<T: Send + Sync> Send for ResourceManager<T> {}
unsafe impl<T: Send + Sync> Sync for ResourceManager<T> {}

impl<T> ResourceManager<T> {
    /// Creates a manager whose resources are freed by dropping them.
    pub fn new(resource: T) -> Result<Self, Rejected<T>> {
        Self::with_free_fn(resource, drop_resource::<T>)
    }

    /// Creates a manager whose resources are freed by `free`.
    ///
    /// The free function is carried from each generation to the next.
    pub fn with_free_fn(resource: T, free: FreeFn<T>) -> Result<Self, Rejected<T>> {
        Self::with_config(resource, free, ManagerConfig::default())
    }

    pub fn with_config(
        resource: T,
        free: FreeFn<T>,
        config: ManagerConfig,
    ) -> Result<Self, Rejected<T>> {
        if let Err(error) = config.validate() {
            return Err(Rejected::new(resource, error));
        }

        let shared = Arc::new(ManagerShared {
            id: ManagerId::next(),
            name: config.name,
            stats: StatsCounters::new(config.collect_stats),
        });
        let handle = HandleInner::allocate(resource, free, 0, &shared)?;

        tracing::debug!(
            manager = shared.id.get(),
            name = shared.name,
            lock_free = Self::is_lock_free(),
            "resource manager initialised"
        );

        Ok(Self {
            slot: ActiveSlot::new(SlotWord::new(handle.as_ptr(), 0)),
            next_generation: AtomicU64::new(1),
            shared,
            config,
            _owns: PhantomData,
        })
    }

    /// Whether leases and replaces run without any lock on this target.
    pub fn is_lock_free() -> bool {
        ActiveSlot::<HandleInner<T>>::is_lock_free()
    }

    pub fn id(&self) -> ManagerId {
        self.shared.id
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn stats(&self) -> ManagerStats {
        self.shared.stats.snapshot()
    }

    /// Leases the active resource.
    ///
    /// The lease may belong to a generation that a concurrent replace has
    /// already superseded; it stays valid until it is released.
    pub fn acquire(&self) -> Lease<T> {
        let (handle, _) = self.lease_active();
        self.shared.stats.record_acquire();
        // SAFETY: `lease_active` counted one lease for us.
        unsafe { Lease::from_counted(handle) }
    }

    /// Runs `f` against the active resource, releasing the lease on every
    /// exit path.
    pub fn with_lease<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        let lease = self.acquire();
        f(&*lease)
    }

    /// Publishes `resource` as the active generation.
    ///
    /// The superseded generation is freed once its last lease is released, or
    /// right away if nobody holds it. On failure the resource is handed back
    /// and the active generation is untouched.
    pub fn replace(&self, resource: T) -> Result<HandleId, Rejected<T>> {
        self.install(resource, 0).map(|(id, _)| id)
    }

    /// Publishes `resource` and returns a lease on it, counted at the instant
    /// of publication.
    pub fn replace_and_acquire(&self, resource: T) -> Result<Lease<T>, Rejected<T>> {
        let (_, handle) = self.install(resource, 1)?;
        self.shared.stats.record_acquire();
        // SAFETY: the handle was published with one lease already counted.
        Ok(unsafe { Lease::from_counted(handle) })
    }

    pub fn active_id(&self) -> HandleId {
        let (handle, _) = self.lease_active();
        // SAFETY: leased above, released below.
        let id = unsafe { handle.as_ref() }.id();
        unsafe { HandleInner::release(handle) };
        id
    }

    /// Number of leases outstanding on the active generation.
    pub fn in_use(&self) -> u64 {
        let (handle, _) = self.lease_active();
        let outstanding = self.outstanding(handle);
        // SAFETY: leased above; the probe lease is not part of the answer.
        unsafe { HandleInner::release(handle) };
        outstanding - 1
    }

    /// Number of leases outstanding on the generation `lease` belongs to,
    /// including `lease` itself.
    pub fn in_use_of(&self, lease: &Lease<T>) -> ResourceResult<u64> {
        if lease.manager_id() != self.id() {
            return Err(ResourceError::ForeignLease {
                lease: lease.id(),
                manager: self.id(),
            });
        }
        Ok(self.outstanding(lease.handle()))
    }

    /// Tears the manager down. Equivalent to dropping it.
    pub fn teardown(self) {
        drop(self);
    }

    fn backoff(&self) -> Backoff {
        Backoff::new(self.config.max_backoff_spins)
    }

    /// Counts one lease against the published handle and returns it together
    /// with the slot word that now holds the lease.
    fn lease_active(&self) -> (NonNull<HandleInner<T>>, SlotWord<HandleInner<T>>) {
        let mut backoff = self.backoff();
        let mut current = self.slot.load();

        loop {
            let Some(handle) = NonNull::new(current.handle) else {
                panic!("resource manager has no active handle");
            };

            let leased = current.leased();
            match self.slot.compare_exchange(current, leased) {
                Ok(_) => return (handle, leased),
                Err(actual) => {
                    current = actual;
                    self.shared.stats.record_retry();
                    backoff.spin();
                }
            }
        }
    }

    /// Allocates a handle for `resource` and publishes it with
    /// `initial_leases` already counted.
    fn install(
        &self,
        resource: T,
        initial_leases: u64,
    ) -> Result<(HandleId, NonNull<HandleInner<T>>), Rejected<T>> {
        // The outgoing handle is leased before its free function is read and
        // stays leased until it has been swapped out and settled.
        let (outgoing, _) = self.lease_active();
        // SAFETY: `outgoing` is leased by `lease_active` above.
        let free = unsafe { outgoing.as_ref() }.free_fn();
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);

        let fresh = match HandleInner::allocate(resource, free, generation, &self.shared) {
            Ok(fresh) => fresh,
            Err(rejected) => {
                // SAFETY: gives back the lease taken above; nothing was published.
                unsafe { HandleInner::release(outgoing) };
                tracing::debug!(
                    manager = self.shared.id.get(),
                    name = self.shared.name,
                    error = %rejected.error(),
                    "replacement rejected"
                );
                return Err(rejected);
            }
        };

        self.publish(outgoing, SlotWord::new(fresh.as_ptr(), initial_leases));
        self.shared.stats.record_replacement();

        tracing::debug!(
            manager = self.shared.id.get(),
            name = self.shared.name,
            generation,
            "published replacement resource"
        );

        Ok((HandleId::new(self.shared.id, generation), fresh))
    }

    /// Swaps `next` into the slot, then settles and releases the handle it
    /// displaced.
    ///
    /// `outgoing` must carry a lease owned by the caller; it is consumed. If a
    /// concurrent replace publishes first, the lease moves to that handle and
    /// the swap is retried against it.
    fn publish(&self, mut outgoing: NonNull<HandleInner<T>>, next: SlotWord<HandleInner<T>>) {
        let mut backoff = self.backoff();
        let mut current = self.slot.load();

        loop {
            if !ptr::eq(current.handle, outgoing.as_ptr()) {
                // SAFETY: the caller's lease on `outgoing` is handed back here.
                unsafe { HandleInner::release(outgoing) };
                (outgoing, current) = self.lease_active();
                continue;
            }

            match self.slot.compare_exchange(current, next) {
                Ok(_) => break,
                Err(actual) => {
                    current = actual;
                    self.shared.stats.record_retry();
                    backoff.spin();
                }
            }
        }

        // SAFETY: `outgoing` is no longer published and we still hold its lease.
        unsafe {
            HandleInner::settle(outgoing, current.acquired);
            HandleInner::release(outgoing);
        }
    }

    /// Outstanding leases on `handle`, which the caller keeps leased.
    fn outstanding(&self, handle: NonNull<HandleInner<T>>) -> u64 {
        // SAFETY: the caller holds a lease on `handle`.
        let inner = unsafe { handle.as_ref() };
        let mut backoff = self.backoff();

        loop {
            if inner.is_superseded() {
                return inner.settled().unsigned_abs();
            }

            // Releases counted in `settled` were all granted before the slot
            // is read, so the sum cannot undercount.
            let settled = inner.settled();
            let word = self.slot.load();
            if ptr::eq(word.handle, handle.as_ptr()) {
                return word.acquired.saturating_add_signed(settled);
            }

            // Swapped out but not settled yet.
            backoff.spin();
        }
    }
}

impl<T> Drop for ResourceManager<T> {
    fn drop(&mut self) {
        let (outgoing, _) = self.lease_active();
        // SAFETY: `outgoing` is leased by `lease_active` above.
        let generation = unsafe { outgoing.as_ref() }.id().generation();

        self.publish(outgoing, SlotWord::empty());

        tracing::debug!(
            manager = self.shared.id.get(),
            name = self.shared.name,
            generation,
            "resource manager torn down"
        );
    }
}

impl<T> fmt::Debug for ResourceManager<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceManager")
            .field("id", &self.shared.id)
            .field("name", &self.shared.name)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::{fail_next_allocation, HandleState};
    use std::panic::{self, AssertUnwindSafe};
    use std::sync::atomic::AtomicUsize as StdAtomicUsize;
    use std::sync::Arc as StdArc;

    struct Tracked {
        frees: StdArc<StdAtomicUsize>,
    }

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.frees.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn tracked(frees: &StdArc<StdAtomicUsize>) -> Tracked {
        Tracked {
            frees: frees.clone(),
        }
    }

    #[test]
    fn test_init_starts_unleased() {
        let manager = ResourceManager::new(1u32).unwrap();

        assert_eq!(manager.in_use(), 0);
        assert_eq!(manager.active_id().generation(), 0);

        // Probes are not caller leases.
        let stats = manager.stats();
        assert_eq!((stats.acquires, stats.releases, stats.frees), (0, 0, 0));
    }

    #[test]
    fn test_init_allocation_failure_returns_resource() {
        let frees = StdArc::new(StdAtomicUsize::new(0));
        fail_next_allocation();

        let rejected = ResourceManager::new(tracked(&frees)).unwrap_err();
        assert!(matches!(rejected.error(), ResourceError::HandleAllocation { .. }));
        assert_eq!(frees.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_replace_allocation_failure_leaves_active_untouched() {
        let frees = StdArc::new(StdAtomicUsize::new(0));
        let manager = ResourceManager::new(tracked(&frees)).unwrap();
        let lease = manager.acquire();

        fail_next_allocation();
        let rejected = manager.replace(tracked(&frees)).unwrap_err();
        assert!(matches!(rejected.error(), ResourceError::HandleAllocation { .. }));
        assert_eq!(frees.load(Ordering::SeqCst), 0);

        assert_eq!(manager.active_id(), lease.id());
        assert_eq!(manager.in_use(), 1);
        assert_eq!(lease.state(), HandleState::Active);
        assert_eq!(manager.stats().replacements, 0);

        drop(rejected.into_resource());
        assert_eq!(frees.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = ManagerConfig::default().with_max_backoff_spins(3);
        let rejected = ResourceManager::with_config(7u8, drop_resource, config).unwrap_err();

        assert!(matches!(rejected.error(), ResourceError::InvalidConfig(_)));
        assert_eq!(rejected.into_resource(), 7);
    }

    #[test]
    fn test_replace_without_leases_frees_immediately() {
        let frees = StdArc::new(StdAtomicUsize::new(0));
        let manager = ResourceManager::new(tracked(&frees)).unwrap();

        let id = manager.replace(tracked(&frees)).unwrap();
        assert_eq!(frees.load(Ordering::SeqCst), 1);
        assert_eq!(manager.active_id(), id);
        assert_eq!(id.generation(), 1);
    }

    #[test]
    fn test_in_use_tracks_superseded_generation() {
        let manager = ResourceManager::new(10u32).unwrap();
        let first = manager.acquire();
        let second = manager.acquire();

        assert_eq!(manager.in_use(), 2);
        assert_eq!(manager.in_use_of(&first), Ok(2));

        manager.replace(20).unwrap();
        assert_eq!(first.state(), HandleState::Superseded);
        assert_eq!(manager.in_use(), 0);
        assert_eq!(manager.in_use_of(&second), Ok(2));

        drop(first);
        assert_eq!(manager.in_use_of(&second), Ok(1));
    }

    #[test]
    fn test_in_use_of_rejects_foreign_lease() {
        let a = ResourceManager::new(1u8).unwrap();
        let b = ResourceManager::new(2u8).unwrap();
        let lease = b.acquire();

        assert_eq!(
            a.in_use_of(&lease),
            Err(ResourceError::ForeignLease {
                lease: lease.id(),
                manager: a.id(),
            })
        );
    }

    #[test]
    fn test_replace_and_acquire_holds_new_generation() {
        let frees = StdArc::new(StdAtomicUsize::new(0));
        let manager = ResourceManager::new(tracked(&frees)).unwrap();

        let lease = manager.replace_and_acquire(tracked(&frees)).unwrap();
        assert_eq!(lease.id(), manager.active_id());
        assert_eq!(manager.in_use(), 1);

        manager.replace(tracked(&frees)).unwrap();
        assert_eq!(frees.load(Ordering::SeqCst), 1);

        drop(lease);
        assert_eq!(frees.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_with_lease_releases_on_panic() {
        let manager = ResourceManager::new(5u32).unwrap();

        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            manager.with_lease(|value| {
                assert_eq!(*value, 5);
                panic!("reader failed");
            })
        }));

        assert!(result.is_err());
        assert_eq!(manager.in_use(), 0);
        assert_eq!(manager.stats().outstanding(), 0);
    }

    #[test]
    fn test_teardown_defers_free_until_last_release() {
        let frees = StdArc::new(StdAtomicUsize::new(0));
        let manager = ResourceManager::new(tracked(&frees)).unwrap();
        let lease = manager.acquire();

        manager.teardown();
        assert_eq!(frees.load(Ordering::SeqCst), 0);
        assert_eq!(lease.state(), HandleState::Superseded);

        lease.release();
        assert_eq!(frees.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_stats_can_be_disabled() {
        let config = ManagerConfig::default().with_stats(false);
        let manager = ResourceManager::with_config(0u64, drop_resource, config).unwrap();

        drop(manager.acquire());
        manager.replace(1).unwrap();

        assert_eq!(manager.stats(), ManagerStats::default());
    }

    #[test]
    fn test_custom_free_fn_is_carried_forward() {
        static FREED: StdAtomicUsize = StdAtomicUsize::new(0);

        fn record(value: u32) {
            FREED.fetch_add(value as usize, Ordering::SeqCst);
        }

        let manager = ResourceManager::with_free_fn(1u32, record).unwrap();
        manager.replace(10).unwrap();
        manager.replace(100).unwrap();
        assert_eq!(FREED.load(Ordering::SeqCst), 11);

        drop(manager);
        assert_eq!(FREED.load(Ordering::SeqCst), 111);
    }
}
