//! Manager configuration.

use crate::error::{ResourceError, ResourceResult};

/// Tuning knobs for a [`ResourceManager`](crate::ResourceManager).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerConfig {
    /// Label attached to every log event emitted by the manager
    pub name: &'static str,
    /// Upper bound on spin iterations between CAS retries (power of two)
    pub max_backoff_spins: u32,
    /// Maintain the usage counters returned by `stats()`
    pub collect_stats: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            name: "resource",
            max_backoff_spins: 1024,
            collect_stats: true,
        }
    }
}

impl ManagerConfig {
    pub fn with_name(mut self, name: &'static str) -> Self {
        self.name = name;
        self
    }

    pub fn with_max_backoff_spins(mut self, spins: u32) -> Self {
        self.max_backoff_spins = spins;
        self
    }

    pub fn with_stats(mut self, enabled: bool) -> Self {
        self.collect_stats = enabled;
        self
    }

    pub fn validate(&self) -> ResourceResult<()> {
        if self.name.is_empty() {
            return Err(ResourceError::InvalidConfig("name must not be empty"));
        }
        if !self.max_backoff_spins.is_power_of_two() {
            return Err(ResourceError::InvalidConfig(
                "max_backoff_spins must be a non-zero power of two",
            ));
        }
        Ok(())
    }
}
