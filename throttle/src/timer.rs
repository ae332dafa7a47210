//! Timer driver: one logical `pending_timer` per service queue, backed by
//! a min-heap rather than a fixed-slot wheel (Design Notes §9's suggested
//! fallback), grounded on the same collect-under-lock /
//! dispatch-outside-lock shape as the host kernel's network timer wheel
//! (§4.7).
//!
//! Unlike that wheel this driver carries no typed timer kind — every
//! entry means "re-run dispatch on this service queue" — so firing yields
//! plain [`SqId`]s for the caller to drive through `dispatch::select_dispatch`.

use alloc::collections::BinaryHeap;
use alloc::vec::Vec;
use core::cmp::Reverse;

use crate::squeue::SqId;

/// Bounds how much a single `fire_due` call will drain, the same role as
/// the wheel's `MAX_TIMERS_PER_TICK`: a storm of simultaneously-expiring
/// timers must not monopolise the caller's time slice.
const MAX_FIRED_PER_CALL: usize = 32;

#[derive(Default)]
pub struct TimerDriver {
    heap: BinaryHeap<Reverse<(u64, SqId)>>,
}

impl TimerDriver {
    pub const fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
        }
    }

    /// Arm (or re-arm) `sq`'s timer for `disptime`. Re-arming does not
    /// remove a previously pushed, now-stale entry for the same SQ; it is
    /// discarded lazily by `fire_due` via `is_current`.
    pub fn arm(&mut self, sq: SqId, disptime: u64) {
        self.heap.push(Reverse((disptime, sq)));
    }

    /// Pop every entry due at or before `now`, up to `MAX_FIRED_PER_CALL`.
    /// `is_current(sq, disptime)` lets the caller reject a stale re-armed
    /// entry (the SQ's `first_pending_disptime` has since moved) without
    /// the driver needing to track cancellation itself.
    pub fn fire_due(
        &mut self,
        now: u64,
        mut is_current: impl FnMut(SqId, u64) -> bool,
    ) -> Vec<SqId> {
        let mut fired = Vec::new();
        while fired.len() < MAX_FIRED_PER_CALL {
            match self.heap.peek() {
                Some(Reverse((disptime, _))) if *disptime <= now => {
                    let Reverse((disptime, sq)) = self.heap.pop().expect("just peeked");
                    if is_current(sq, disptime) {
                        fired.push(sq);
                    }
                }
                _ => break,
            }
        }
        fired
    }

    pub fn pending_count(&self) -> usize {
        self.heap.len()
    }

    pub fn next_deadline(&self) -> Option<u64> {
        self.heap.peek().map(|Reverse((disptime, _))| *disptime)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::Arena;
    use crate::squeue::ServiceQueue;

    fn two_sq_ids() -> (SqId, SqId) {
        let mut arena: Arena<ServiceQueue> = Arena::new();
        let a = arena.insert(ServiceQueue::new(None, None));
        let b = arena.insert(ServiceQueue::new(None, None));
        (a, b)
    }

    #[test]
    fn fires_only_entries_due_by_now() {
        let (a, b) = two_sq_ids();
        let mut driver = TimerDriver::new();
        driver.arm(a, 100);
        driver.arm(b, 300);
        let fired = driver.fire_due(150, |_, _| true);
        assert_eq!(fired, alloc::vec![a]);
        assert_eq!(driver.pending_count(), 1);
    }

    #[test]
    fn stale_rearmed_entry_is_discarded() {
        let (a, _b) = two_sq_ids();
        let mut driver = TimerDriver::new();
        driver.arm(a, 100);
        driver.arm(a, 50); // re-armed earlier; the 100 entry is now stale
        let current_deadline = 50u64;
        let fired = driver.fire_due(200, |_, disptime| disptime == current_deadline);
        assert_eq!(fired, alloc::vec![a]);
    }

    #[test]
    fn bounded_per_call() {
        let mut arena: Arena<ServiceQueue> = Arena::new();
        let mut driver = TimerDriver::new();
        for _ in 0..40 {
            let sq = arena.insert(ServiceQueue::new(None, None));
            driver.arm(sq, 0);
        }
        let fired = driver.fire_due(1000, |_, _| true);
        assert_eq!(fired.len(), MAX_FIRED_PER_CALL);
        assert_eq!(driver.pending_count(), 8);
    }
}
