//! Throttle group (TG): the throttled unit. Owns a token bucket per
//! direction, a slot in its parent service queue's pending tree, and an
//! optional sub-service-queue for nested child groups (§4.3).

use bitflags::bitflags;

use crate::arena::Id;
use crate::bio::{BioDirection, Dir, DeviceId, GroupId, NUM_DIRS};
use crate::bucket::{Limit, TokenBucket};
use crate::fake_device::FdHandle;
use crate::squeue::SqId;

pub type TgId = Id<ThrottleGroup>;

bitflags! {
    /// TG dispatch-state flags (§4.5 state machine).
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct TgFlags: u8 {
        /// Linked into the parent SQ's pending tree.
        const PENDING   = 1 << 0;
        /// Set when a bio arrives at a TG that was empty; forces a
        /// disptime recompute and timer re-arm on the next update.
        const WAS_EMPTY = 1 << 1;
    }
}

/// Marks a TG as a fake-device member, carrying the FD it accounts into.
#[derive(Clone, Copy, Debug)]
pub struct FakeMembership {
    pub fd: FdHandle,
}

/// Cumulative, never-reset counters backing `throttle.io_service_bytes`
/// and `throttle.io_serviced` (§10.3) — distinct from a bucket's
/// slice-scoped `bytes_disp`/`io_disp`, which `trim_slice` and
/// `renew_or_extend` reclaim every slice.
#[derive(Clone, Copy, Debug, Default)]
pub struct CumulativeStats {
    pub bytes_total: u64,
    pub io_total: u64,
    pub bytes_throttled: u64,
    pub io_throttled: u64,
}

pub struct ThrottleGroup {
    pub group: GroupId,
    pub device: DeviceId,
    buckets: [TokenBucket; NUM_DIRS],
    has_rules: [bool; NUM_DIRS],
    stats: [CumulativeStats; NUM_DIRS],
    /// The SQ this TG is linked into as a pending-tree member.
    pub parent_sq: SqId,
    /// The SQ this TG provides for its own children, if the hierarchy
    /// nests groups under groups. Flat deployments never enqueue anything
    /// here.
    pub own_sq: SqId,
    pub disptime: u64,
    pub flags: TgFlags,
    pub fake: Option<FakeMembership>,
}

impl ThrottleGroup {
    pub fn new(group: GroupId, device: DeviceId, own_sq: SqId, parent_sq: SqId) -> Self {
        Self {
            group,
            device,
            buckets: [TokenBucket::new(); NUM_DIRS],
            has_rules: [false; NUM_DIRS],
            stats: [CumulativeStats::default(); NUM_DIRS],
            parent_sq,
            own_sq,
            disptime: 0,
            flags: TgFlags::empty(),
            fake: None,
        }
    }

    pub fn stats(&self, dir: Dir) -> CumulativeStats {
        self.stats[dir.index()]
    }

    /// Record that a bio queued instead of dispatching immediately — it
    /// was throttled, whatever it ends up costing once it actually
    /// dispatches (§10.3).
    pub fn record_throttled(&mut self, direction: BioDirection, size: u64) {
        self.stats[direction.as_dir().index()].bytes_throttled += size;
        self.stats[direction.as_dir().index()].io_throttled += 1;
        self.stats[Dir::RANDW.index()].bytes_throttled += size;
        self.stats[Dir::RANDW.index()].io_throttled += 1;
    }

    pub fn bucket(&self, dir: Dir) -> &TokenBucket {
        &self.buckets[dir.index()]
    }

    pub fn bucket_mut(&mut self, dir: Dir) -> &mut TokenBucket {
        &mut self.buckets[dir.index()]
    }

    /// This TG's own `has_rules[dir]`, ignoring ancestors. Callers that
    /// need the full hierarchy-aware answer (§3 invariant) combine this
    /// with an ancestor walk in `engine`.
    pub fn has_own_rules(&self, dir: Dir) -> bool {
        self.has_rules[dir.index()]
    }

    pub fn set_limit(&mut self, dir: Dir, limit: Limit, now: u64, slice_ticks: u64) {
        self.buckets[dir.index()].set_limit(limit, now, slice_ticks);
        self.has_rules[dir.index()] = !limit.is_unlimited();
    }

    /// Copy this TG's limits onto `other` and restart its slices — used to
    /// propagate a fake-device header's limit onto every member (§4.6).
    pub fn copy_limits_into(&self, other: &mut ThrottleGroup, now: u64, slice_ticks: u64) {
        for dir in Dir::ALL {
            let limit = self.buckets[dir.index()].limit;
            other.set_limit(dir, limit, now, slice_ticks);
        }
    }

    /// Bypass fast path (§4.1 step 1): true if every direction, including
    /// RANDW, is unlimited on this TG alone.
    pub fn self_unlimited(&self) -> bool {
        self.buckets.iter().all(|bucket| bucket.limit.is_unlimited())
    }

    /// Decide whether `size` bytes in `direction` may dispatch now,
    /// composing the per-direction and RANDW buckets as max-wait (§4.1
    /// step 4). Does not charge; see [`ThrottleGroup::charge`].
    pub fn may_dispatch(
        &mut self,
        direction: BioDirection,
        size: u64,
        now: u64,
        slice_ticks: u64,
    ) -> (bool, u64) {
        if self.self_unlimited() {
            return (true, 0);
        }
        let (ok_rw, wait_rw) =
            self.buckets[direction.as_dir().index()].may_dispatch(now, size, slice_ticks);
        let (ok_randw, wait_randw) =
            self.buckets[Dir::RANDW.index()].may_dispatch(now, size, slice_ticks);
        (ok_rw && ok_randw, wait_rw.max(wait_randw))
    }

    /// Charge a dispatched bio against both its own direction and the
    /// combined RANDW bucket (§4.1 Charging).
    pub fn charge(&mut self, direction: BioDirection, size: u64) {
        self.buckets[direction.as_dir().index()].charge(size);
        self.buckets[Dir::RANDW.index()].charge(size);
        self.stats[direction.as_dir().index()].bytes_total += size;
        self.stats[direction.as_dir().index()].io_total += 1;
        self.stats[Dir::RANDW.index()].bytes_total += size;
        self.stats[Dir::RANDW.index()].io_total += 1;
    }

    pub fn trim_slices(&mut self, now: u64, slice_ticks: u64) {
        for bucket in &mut self.buckets {
            bucket.trim_slice(now, slice_ticks);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::squeue::ServiceQueue;

    fn dummy_sq_id() -> SqId {
        let mut arena: crate::arena::Arena<ServiceQueue> = crate::arena::Arena::new();
        arena.insert(ServiceQueue::new(None, None))
    }

    #[test]
    fn randw_limit_gates_both_directions() {
        let sq = dummy_sq_id();
        let mut tg = ThrottleGroup::new(1, 1, sq, sq);
        tg.set_limit(
            Dir::RANDW,
            Limit {
                bps: Some(1_048_576),
                iops: None,
            },
            0,
            crate::bucket::DEFAULT_SLICE_TICKS,
        );
        let (ok, _) = tg.may_dispatch(BioDirection::Read, 512 * 1024, 0, crate::bucket::DEFAULT_SLICE_TICKS);
        assert!(ok);
        tg.charge(BioDirection::Read, 512 * 1024);
        let (ok, _) = tg.may_dispatch(BioDirection::Write, 512 * 1024, 0, crate::bucket::DEFAULT_SLICE_TICKS);
        assert!(ok);
        tg.charge(BioDirection::Write, 512 * 1024);
        let (ok, wait) = tg.may_dispatch(BioDirection::Read, 1, 0, crate::bucket::DEFAULT_SLICE_TICKS);
        assert!(!ok);
        assert!(wait > 0);
    }

    #[test]
    fn cumulative_stats_survive_a_slice_reset() {
        let sq = dummy_sq_id();
        let mut tg = ThrottleGroup::new(1, 1, sq, sq);
        tg.set_limit(
            Dir::READ,
            Limit {
                bps: Some(1_048_576),
                iops: None,
            },
            0,
            crate::bucket::DEFAULT_SLICE_TICKS,
        );
        for _ in 0..16 {
            tg.charge(BioDirection::Read, 64 * 1024);
        }
        tg.record_throttled(BioDirection::Read, 64 * 1024);
        tg.trim_slices(crate::bucket::DEFAULT_SLICE_TICKS * 3, crate::bucket::DEFAULT_SLICE_TICKS);

        assert_eq!(tg.bucket(Dir::READ).bytes_dispatched(), 0);
        let stats = tg.stats(Dir::READ);
        assert_eq!(stats.bytes_total, 16 * 64 * 1024);
        assert_eq!(stats.io_total, 16);
        assert_eq!(stats.bytes_throttled, 64 * 1024);
        assert_eq!(stats.io_throttled, 1);
    }

    #[test]
    fn has_rules_reflects_any_finite_direction() {
        let sq = dummy_sq_id();
        let mut tg = ThrottleGroup::new(1, 1, sq, sq);
        assert!(!tg.has_own_rules(Dir::READ));
        tg.set_limit(
            Dir::READ,
            Limit {
                bps: Some(1),
                iops: None,
            },
            0,
            crate::bucket::DEFAULT_SLICE_TICKS,
        );
        assert!(tg.has_own_rules(Dir::READ));
        assert!(!tg.has_own_rules(Dir::WRITE));
    }
}
