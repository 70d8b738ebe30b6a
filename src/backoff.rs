//! Bounded exponential spinning for CAS retry loops.

/// Spins for 1, 2, 4, ... iterations per failed attempt, capped at `limit`.
pub(crate) struct Backoff {
    spins: u32,
    limit: u32,
}

impl Backoff {
    pub(crate) const fn new(limit: u32) -> Self {
        Self { spins: 1, limit }
    }

    pub(crate) fn spin(&mut self) {
        for _ in 0..self.spins {
            core::hint::spin_loop();
        }
        self.spins = self.spins.saturating_mul(2).min(self.limit);
    }

    #[cfg(test)]
    fn current(&self) -> u32 {
        self.spins
    }
}
