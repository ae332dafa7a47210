//! Qnode: a FIFO belonging to one source throttle group, linked into a
//! service queue's round-robin list while non-empty (§4.2).
//!
//! Generic over the queued payload so a service queue can store whatever
//! unit of work it dispatches — plain bios, or (as the fake-device overlay
//! needs) a bio paired with the next gate it must still clear.

use alloc::vec::Vec;
use alloc::collections::VecDeque;

use crate::group::TgId;

/// A FIFO of items queued by one throttle group, plus the id of that
/// group so a round-robin pop can credit/release it.
pub struct QNode<T> {
    owner: TgId,
    items: VecDeque<T>,
}

impl<T> QNode<T> {
    pub fn new(owner: TgId) -> Self {
        Self {
            owner,
            items: VecDeque::new(),
        }
    }

    pub fn owner(&self) -> TgId {
        self.owner
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn push(&mut self, item: T) {
        self.items.push_back(item);
    }

    pub fn peek(&self) -> Option<&T> {
        self.items.front()
    }

    pub fn pop(&mut self) -> Option<T> {
        self.items.pop_front()
    }
}

/// An ordered, round-robin list of qnodes contributing to one direction of
/// one service queue.
pub struct QueuedList<T> {
    qnodes: Vec<QNode<T>>,
}

impl<T> QueuedList<T> {
    pub const fn new() -> Self {
        Self { qnodes: Vec::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.qnodes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.qnodes.len()
    }

    fn position_of(&self, owner: TgId) -> Option<usize> {
        self.qnodes.iter().position(|qn| qn.owner() == owner)
    }

    pub fn has_owner(&self, owner: TgId) -> bool {
        self.position_of(owner).is_some()
    }

    /// Append `item` to `owner`'s qnode, creating and linking a fresh
    /// qnode at the tail if `owner` was not already linked. Returns `true`
    /// if a new qnode was linked (caller should acquire a TG reference).
    pub fn add(&mut self, owner: TgId, item: T) -> bool {
        if let Some(index) = self.position_of(owner) {
            self.qnodes[index].push(item);
            false
        } else {
            let mut qn = QNode::new(owner);
            qn.push(item);
            self.qnodes.push(qn);
            true
        }
    }

    /// Peek the head item of `owner`'s qnode specifically, without
    /// disturbing round-robin order.
    pub fn peek_from(&self, owner: TgId) -> Option<&T> {
        let index = self.position_of(owner)?;
        self.qnodes[index].peek()
    }

    /// Pop the head item of `owner`'s qnode specifically. If that qnode
    /// drains, it is unlinked and the caller is told to release its TG
    /// reference.
    pub fn pop_from(&mut self, owner: TgId) -> Option<(T, bool)> {
        let index = self.position_of(owner)?;
        let item = self.qnodes[index].pop()?;
        let drained = self.qnodes[index].is_empty();
        if drained {
            self.qnodes.remove(index);
        }
        Some((item, drained))
    }

    /// Peek the head item of the head qnode (generic round-robin order),
    /// for callers that service whichever source is due next rather than
    /// a specific one.
    pub fn peek(&self) -> Option<(TgId, &T)> {
        let qn = self.qnodes.first()?;
        qn.peek().map(|item| (qn.owner(), item))
    }

    /// Drain every item from every qnode, in qnode order, discarding
    /// owner/round-robin bookkeeping entirely. Used for unconditional
    /// teardown where fairness no longer matters.
    pub fn drain_all(&mut self) -> Vec<T> {
        let mut out = Vec::new();
        for mut qn in self.qnodes.drain(..) {
            while let Some(item) = qn.pop() {
                out.push(item);
            }
        }
        out
    }

    /// Pop the head item of the head qnode. If that qnode drains, it is
    /// unlinked; otherwise it moves to the tail (round-robin).
    pub fn pop(&mut self) -> Option<(T, Option<TgId>)> {
        let qn = self.qnodes.first_mut()?;
        let item = qn.pop()?;
        if qn.is_empty() {
            let owner = qn.owner();
            self.qnodes.remove(0);
            Some((item, Some(owner)))
        } else {
            let qn = self.qnodes.remove(0);
            self.qnodes.push(qn);
            Some((item, None))
        }
    }
}

impl<T> Default for QueuedList<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::Arena;
    use crate::group::ThrottleGroup;
    use crate::squeue::ServiceQueue;

    fn two_tg_ids() -> (Arena<ThrottleGroup>, TgId, TgId) {
        let mut sq_arena: Arena<ServiceQueue> = Arena::new();
        let root = sq_arena.insert(ServiceQueue::new(None, None));
        let mut tg_arena: Arena<ThrottleGroup> = Arena::new();
        let a = tg_arena.insert(ThrottleGroup::new(1, 1, root, root));
        let b = tg_arena.insert(ThrottleGroup::new(2, 1, root, root));
        (tg_arena, a, b)
    }

    #[test]
    fn round_robins_between_two_sources() {
        let (_arena, a, b) = two_tg_ids();
        let mut list: QueuedList<u32> = QueuedList::new();
        list.add(a, 10);
        list.add(b, 20);
        list.add(a, 11);

        let (first, released) = list.pop().unwrap();
        assert_eq!(first, 10);
        assert!(released.is_none()); // a still has 11 queued, moves to tail
        let (second, _) = list.pop().unwrap();
        assert_eq!(second, 20);
    }

    #[test]
    fn fifo_within_one_source() {
        let (_arena, a, _b) = two_tg_ids();
        let mut list: QueuedList<u32> = QueuedList::new();
        list.add(a, 100);
        list.add(a, 200);
        let (first, _) = list.pop().unwrap();
        let (second, released) = list.pop().unwrap();
        assert_eq!(first, 100);
        assert_eq!(second, 200);
        assert!(released.is_some());
    }

    #[test]
    fn pop_from_targets_a_specific_source() {
        let (_arena, a, b) = two_tg_ids();
        let mut list: QueuedList<u32> = QueuedList::new();
        list.add(a, 1);
        list.add(b, 2);
        let (item, drained) = list.pop_from(b).unwrap();
        assert_eq!(item, 2);
        assert!(drained);
        assert!(list.has_owner(a));
        assert!(!list.has_owner(b));
    }
}
