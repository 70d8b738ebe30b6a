use core::fmt;

use thiserror::Error;

use crate::handle::{HandleId, ManagerId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ResourceError {
    #[error("failed to allocate a resource handle ({size} bytes, align {align})")]
    HandleAllocation { size: usize, align: usize },
    #[error("invalid manager configuration: {0}")]
    InvalidConfig(&'static str),
    #[error("lease {lease:?} does not belong to manager {manager:?}")]
    ForeignLease { lease: HandleId, manager: ManagerId },
}

impl ResourceError {
    pub fn as_str(self) -> &'static str {
        match self {
            ResourceError::HandleAllocation { .. } => "Resource handle allocation failed",
            ResourceError::InvalidConfig(_) => "Invalid manager configuration",
            ResourceError::ForeignLease { .. } => "Lease belongs to a different manager",
        }
    }
}

pub type ResourceResult<T> = Result<T, ResourceError>;

/// A resource that could not be installed, handed back to the caller together
/// with the reason.
///
/// Init and replace never consume the resource on failure, and the manager's
/// active handle is left untouched.
pub struct Rejected<T> {
    resource: T,
    error: ResourceError,
}

impl<T> Rejected<T> {
    pub(crate) fn new(resource: T, error: ResourceError) -> Self {
        Self { resource, error }
    }

    pub fn error(&self) -> ResourceError {
        self.error
    }

    /// Takes back ownership of the resource that was not installed.
    pub fn into_resource(self) -> T {
        self.resource
    }

    pub fn into_parts(self) -> (T, ResourceError) {
        (self.resource, self.error)
    }
}

impl<T> fmt::Debug for Rejected<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rejected")
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

impl<T> fmt::Display for Rejected<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "resource rejected: {}", self.error)
    }
}

impl<T> core::error::Error for Rejected<T> {
    fn source(&self) -> Option<&(dyn core::error::Error + 'static)> {
        Some(&self.error)
    }
}

impl<T> From<Rejected<T>> for ResourceError {
    fn from(rejected: Rejected<T>) -> Self {
        rejected.error
    }
}
