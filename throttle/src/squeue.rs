//! Service queue: one dispatch stage. Holds the round-robin FIFOs feeding
//! it and a pending tree of child throttle groups ordered by `disptime`
//! (§4.4).
//!
//! The pending tree is a `BTreeMap` keyed by `(disptime, insertion_seq)`
//! rather than the augmented red-black tree the kernel's own
//! `throtl_rb_root` uses — a safe ordered map gives the same leftmost-is-
//! next-deadline semantics without raw back-pointers (Design Notes §9).

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use crate::arena::Id;
use crate::bio::{Bio, BioDirection};
use crate::group::TgId;
use crate::qnode::QueuedList;

pub type SqId = Id<ServiceQueue>;

/// A queued bio paired with the gates it still must clear, in order,
/// before it's ready for submission. An empty list means this is the last
/// gate — once dispatched from here the bio is ready. A bio with an FD
/// overlay can carry more than one remaining gate, one per FD owned by
/// its group that covers this device (§4.6 step 2).
pub type Ticket = (Bio, Vec<TgId>);

pub struct ServiceQueue {
    queued: [QueuedList<Ticket>; 2],
    pending_tree: BTreeMap<(u64, u64), TgId>,
    tg_keys: BTreeMap<TgId, (u64, u64)>,
    next_seq: u64,
    nr_queued: [usize; 2],
    /// The TG this SQ belongs to, if any. `None` for a device-root SQ.
    pub owner_tg: Option<TgId>,
    /// The SQ this one reports up to for dispatch propagation. `None` for
    /// a device-root SQ.
    pub parent_sq: Option<SqId>,
}

impl ServiceQueue {
    pub fn new(owner_tg: Option<TgId>, parent_sq: Option<SqId>) -> Self {
        Self {
            queued: [QueuedList::new(), QueuedList::new()],
            pending_tree: BTreeMap::new(),
            tg_keys: BTreeMap::new(),
            next_seq: 0,
            nr_queued: [0, 0],
            owner_tg,
            parent_sq,
        }
    }

    pub fn is_device_root(&self) -> bool {
        self.parent_sq.is_none()
    }

    pub fn nr_pending(&self) -> usize {
        self.pending_tree.len()
    }

    pub fn nr_queued(&self, direction: BioDirection) -> usize {
        self.nr_queued[dir_index(direction)]
    }

    pub fn has_queued(&self, direction: BioDirection, tg: TgId) -> bool {
        self.queued[dir_index(direction)].has_owner(tg)
    }

    pub fn is_pending(&self, tg: TgId) -> bool {
        self.tg_keys.contains_key(&tg)
    }

    pub fn first_pending_disptime(&self) -> Option<u64> {
        self.pending_tree.keys().next().map(|(disptime, _)| *disptime)
    }

    /// Insert or move `tg` in the pending tree at `disptime`. Idempotent:
    /// re-enqueuing an already-pending TG relocates it.
    pub fn enqueue_tg(&mut self, tg: TgId, disptime: u64) {
        if let Some(old_key) = self.tg_keys.remove(&tg) {
            self.pending_tree.remove(&old_key);
        }
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        let key = (disptime, seq);
        self.pending_tree.insert(key, tg);
        self.tg_keys.insert(tg, key);
    }

    pub fn dequeue_tg(&mut self, tg: TgId) -> bool {
        if let Some(key) = self.tg_keys.remove(&tg) {
            self.pending_tree.remove(&key);
            true
        } else {
            false
        }
    }

    /// Pop the earliest-disptime TG if it is due by `now`.
    pub fn pop_ready(&mut self, now: u64) -> Option<TgId> {
        let (&key, &tg) = self.pending_tree.iter().next()?;
        if key.0 > now {
            return None;
        }
        self.pending_tree.remove(&key);
        self.tg_keys.remove(&tg);
        Some(tg)
    }

    pub fn add_ticket(&mut self, direction: BioDirection, owner: TgId, ticket: Ticket) -> bool {
        let index = dir_index(direction);
        let new_link = self.queued[index].add(owner, ticket);
        self.nr_queued[index] += 1;
        new_link
    }

    pub fn peek_ticket(&self, direction: BioDirection, owner: TgId) -> Option<&Ticket> {
        self.queued[dir_index(direction)].peek_from(owner)
    }

    pub fn pop_ticket(&mut self, direction: BioDirection, owner: TgId) -> Option<(Ticket, bool)> {
        let index = dir_index(direction);
        let popped = self.queued[index].pop_from(owner);
        if popped.is_some() {
            self.nr_queued[index] -= 1;
        }
        popped
    }

    /// Unconditionally drain every queued ticket, ignoring owners, limits,
    /// and the pending tree. Used for device teardown (§5 `drain`).
    pub fn drain_all(&mut self) -> Vec<Ticket> {
        let mut all = Vec::new();
        for list in &mut self.queued {
            all.extend(list.drain_all());
        }
        self.nr_queued = [0, 0];
        self.pending_tree.clear();
        self.tg_keys.clear();
        all
    }
}

fn dir_index(direction: BioDirection) -> usize {
    match direction {
        BioDirection::Read => 0,
        BioDirection::Write => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::Arena;
    use crate::bio::BioDirection;
    use crate::group::ThrottleGroup;

    fn two_tg_ids() -> (Arena<ThrottleGroup>, TgId, TgId) {
        let mut sq_arena: Arena<ServiceQueue> = Arena::new();
        let root = sq_arena.insert(ServiceQueue::new(None, None));
        let mut tg_arena: Arena<ThrottleGroup> = Arena::new();
        let a = tg_arena.insert(ThrottleGroup::new(1, 1, root, root));
        let b = tg_arena.insert(ThrottleGroup::new(2, 1, root, root));
        (tg_arena, a, b)
    }

    #[test]
    fn pending_tree_orders_by_disptime_then_insertion() {
        let (_arena, a, b) = two_tg_ids();
        let mut sq = ServiceQueue::new(None, None);
        sq.enqueue_tg(a, 100);
        sq.enqueue_tg(b, 50);
        assert_eq!(sq.first_pending_disptime(), Some(50));
        assert_eq!(sq.pop_ready(200), Some(b));
        assert_eq!(sq.first_pending_disptime(), Some(100));
        assert_eq!(sq.pop_ready(200), Some(a));
        assert_eq!(sq.nr_pending(), 0);
    }

    #[test]
    fn pop_ready_respects_the_deadline() {
        let (_arena, a, _b) = two_tg_ids();
        let mut sq = ServiceQueue::new(None, None);
        sq.enqueue_tg(a, 500);
        assert_eq!(sq.pop_ready(100), None);
        assert_eq!(sq.pop_ready(500), Some(a));
    }

    #[test]
    fn re_enqueue_relocates_rather_than_duplicates() {
        let (_arena, a, _b) = two_tg_ids();
        let mut sq = ServiceQueue::new(None, None);
        sq.enqueue_tg(a, 500);
        sq.enqueue_tg(a, 10);
        assert_eq!(sq.nr_pending(), 1);
        assert_eq!(sq.first_pending_disptime(), Some(10));
    }

    #[test]
    fn tickets_round_trip_through_queued_list() {
        use crate::bio::Bio;
        let (_arena, a, _b) = two_tg_ids();
        let mut sq = ServiceQueue::new(None, None);
        let bio = Bio::new(1, 1, BioDirection::Read, 4096);
        sq.add_ticket(BioDirection::Read, a, (bio, Vec::new()));
        assert_eq!(sq.nr_queued(BioDirection::Read), 1);
        let ((popped, gates), drained) = sq.pop_ticket(BioDirection::Read, a).unwrap();
        assert_eq!(popped.size, 4096);
        assert!(gates.is_empty());
        assert!(drained);
        assert_eq!(sq.nr_queued(BioDirection::Read), 0);
    }
}
