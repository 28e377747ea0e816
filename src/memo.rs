//! At-most-once execution per key.

use std::sync::Arc;

use crate::key::{ErasedKey, ErasedValue};
use crate::runtime::Rules;
use crate::storage::{MemoSlots, Slot, SlotClaim};
use crate::task::{Step, Task};

/// Memoise `rules`: at most one execution per key per slot map.
///
/// The first fetch of a key installs its slot and runs the inner rule;
/// concurrent and later fetches block on the slot and share the value. A
/// rule that unwinds poisons its slot, so waiters re-raise instead of
/// blocking forever.
///
/// Keys whose rules reach themselves (directly or through a cycle) deadlock
/// on their own slot; the engine does not detect cycles.
pub fn memoise(slots: Arc<MemoSlots>, rules: Arc<dyn Rules>) -> Memoise {
    Memoise { slots, rules }
}

/// See [`memoise`].
pub struct Memoise {
    slots: Arc<MemoSlots>,
    rules: Arc<dyn Rules>,
}

impl Rules for Memoise {
    fn build(&self, key: &ErasedKey) -> Task<ErasedValue> {
        let slots = self.slots.clone();
        let rules = self.rules.clone();
        let key = key.clone();
        Task::new(move || match slots.claim(&key) {
            SlotClaim::Waiter(slot) => Step::Done(slot.read()),
            SlotClaim::Owner(slot) => {
                let mut guard = FillGuard {
                    slot,
                    filled: false,
                };
                rules
                    .build(&key)
                    .map(move |value| {
                        guard.fill(value.clone());
                        value
                    })
                    .step()
            }
        })
    }
}

/// Poisons the slot if the owning rule is abandoned before filling it.
///
/// The guard travels through the rule task's continuation; if the driver
/// unwinds mid-task, the continuation (and with it the guard) is dropped
/// without running.
struct FillGuard {
    slot: Arc<Slot>,
    filled: bool,
}

impl FillGuard {
    fn fill(&mut self, value: ErasedValue) {
        self.filled = true;
        self.slot.fill(value);
    }
}

impl Drop for FillGuard {
    fn drop(&mut self) {
        if !self.filled {
            self.slot.poison();
        }
    }
}
