//! Spin-mutex slot for targets without a usable double-width atomic.
//!
//! Every lease and replace serialises on the lock; the external contract is
//! identical to [`super::atomic::AtomicSlot`].

use spin::Mutex;

use super::SlotWord;

pub(crate) struct LockedSlot<H> {
    word: Mutex<SlotWord<H>>,
}

impl<H> LockedSlot<H> {
    pub(crate) fn new(word: SlotWord<H>) -> Self {
        Self {
            word: Mutex::new(word),
        }
    }

    pub(crate) fn is_lock_free() -> bool {
        false
    }

    pub(crate) fn load(&self) -> SlotWord<H> {
        *self.word.lock()
    }

    pub(crate) fn compare_exchange(
        &self,
        current: SlotWord<H>,
        new: SlotWord<H>,
    ) -> Result<SlotWord<H>, SlotWord<H>> {
        let mut word = self.word.lock();
        if *word == current {
            *word = new;
            Ok(current)
        } else {
            Err(*word)
        }
    }
}
