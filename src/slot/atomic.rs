//! Lock-free slot backed by a double-width compare-and-swap.

use core::marker::PhantomData;
use portable_atomic::{AtomicU128, Ordering};

use super::SlotWord;

const HANDLE_SHIFT: u32 = 64;

/// A [`SlotWord`] packed as `handle << 64 | acquired`.
pub(crate) struct AtomicSlot<H> {
    word: AtomicU128,
    _handle: PhantomData<*mut H>,
}

impl<H> AtomicSlot<H> {
    pub(crate) fn new(word: SlotWord<H>) -> Self {
        Self {
            word: AtomicU128::new(encode(word)),
            _handle: PhantomData,
        }
    }

    /// Whether this target performs the CAS natively rather than through
    /// portable-atomic's lock-based fallback.
    pub(crate) fn is_lock_free() -> bool {
        AtomicU128::is_lock_free()
    }

    pub(crate) fn load(&self) -> SlotWord<H> {
        decode(self.word.load(Ordering::Acquire))
    }

    pub(crate) fn compare_exchange(
        &self,
        current: SlotWord<H>,
        new: SlotWord<H>,
    ) -> Result<SlotWord<H>, SlotWord<H>> {
        self.word
            .compare_exchange_weak(encode(current), encode(new), Ordering::AcqRel, Ordering::Acquire)
            .map(decode)
            .map_err(decode)
    }
}

fn encode<H>(word: SlotWord<H>) -> u128 {
    ((word.handle as usize as u128) << HANDLE_SHIFT) | u128::from(word.acquired)
}

fn decode<H>(raw: u128) -> SlotWord<H> {
    SlotWord::new((raw >> HANDLE_SHIFT) as usize as *mut H, raw as u64)
}
