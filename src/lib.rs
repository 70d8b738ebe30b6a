//! Lock-free leased access to a hot-swappable shared resource.
//!
//! A [`ResourceManager`] owns the active generation of some large,
//! rarely-updated resource (a memory-mapped dataset, a compiled rule set).
//! Any number of threads lease it concurrently; a reload publishes a new
//! generation without blocking them, and each superseded generation is freed
//! exactly once, by whichever thread releases its last lease.
//!
//! The active slot pairs the handle pointer with its lease count in one
//! double-width atomic word. Targets without a native 128-bit CAS go through
//! portable-atomic's fallback, or a spin mutex with the `mutex-slot` feature.

#![no_std]

extern crate alloc;

#[cfg(test)]
extern crate std;

mod backoff;
pub mod config;
pub mod error;
pub mod handle;
pub mod manager;
mod slot;
pub mod stats;

pub use config::ManagerConfig;
pub use error::{Rejected, ResourceError, ResourceResult};
pub use handle::{drop_resource, FreeFn, HandleId, HandleState, Lease, ManagerId};
pub use manager::ResourceManager;
pub use stats::ManagerStats;
