//! The dispatch engine: per-TG round-robin dispatch and per-SQ ordered
//! draining of the pending tree (§4.5), plus the fake-device "second
//! gate" a bio may need to clear after its physical TG (§4.6).
//!
//! Everything here operates on an explicit [`Context`] — the arenas
//! holding every throttle group, service queue, and fake device — rather
//! than on global state, so the engine itself stays free of any locking
//! concern; `engine` is the only module that wraps a `Context` in a lock.

use alloc::vec::Vec;

use crate::arena::{Arena, Id};
use crate::bio::{Bio, BioDirection, Dir, DeviceId, GroupId};
use crate::fake_device::FakeDevice;
use crate::group::{TgFlags, ThrottleGroup, TgId};
use crate::squeue::{ServiceQueue, SqId, Ticket};

/// Bios dispatched from one TG per round, split 75%/25% read/write
/// (§4.5, §2 glossary).
pub const GRP_READ_QUANTUM: u32 = 6;
pub const GRP_WRITE_QUANTUM: u32 = 2;
/// Total bios drained by one `select_dispatch` invocation across all due
/// TGs in a service queue.
pub const SQ_QUANTUM: u32 = 32;

/// The arenas backing every throttle group, service queue, and fake
/// device in the engine. Cross-references between them are ids, never
/// pointers (Design Notes §9).
pub struct Context {
    pub tgs: Arena<ThrottleGroup>,
    pub sqs: Arena<ServiceQueue>,
    pub fds: Arena<FakeDevice>,
    pub slice_ticks: u64,
}

impl Context {
    pub fn new(slice_ticks: u64) -> Self {
        Self {
            tgs: Arena::new(),
            sqs: Arena::new(),
            fds: Arena::new(),
            slice_ticks,
        }
    }

    pub fn create_root_sq(&mut self) -> SqId {
        self.sqs.insert(ServiceQueue::new(None, None))
    }

    /// Create a flat-mode TG: its own sub-queue exists (for structural
    /// generality toward nested groups, §4.3) but is never populated
    /// unless a caller later builds on top of this crate to nest groups;
    /// its parent is the device root SQ directly.
    pub fn create_tg(&mut self, group: GroupId, device: DeviceId, root_sq: SqId) -> TgId {
        let own_sq = self.sqs.insert(ServiceQueue::new(None, Some(root_sq)));
        let tg = self.tgs.insert(ThrottleGroup::new(group, device, own_sq, root_sq));
        if let Some(own) = self.sqs.get_mut(own_sq) {
            own.owner_tg = Some(tg);
        }
        tg
    }

    pub fn create_fake_device(
        &mut self,
        group: GroupId,
        fd_id: crate::bio::FakeDeviceId,
        root_sq: SqId,
    ) -> Id<FakeDevice> {
        let header = self.create_tg(group, 0, root_sq);
        self.fds.insert(FakeDevice::new(group, fd_id, header))
    }
}

/// `has_rules[dir]` is true iff this TG or some ancestor (reached by
/// walking up through the SQ that owns each TG) has a finite limit on
/// `dir` (§3 invariant).
pub fn has_rules(ctx: &Context, tg: TgId, dir: Dir) -> bool {
    let mut current = Some(tg);
    while let Some(id) = current {
        let Some(group) = ctx.tgs.get(id) else {
            return false;
        };
        if group.has_own_rules(dir) {
            return true;
        }
        current = ctx
            .sqs
            .get(group.parent_sq)
            .and_then(|sq| sq.owner_tg);
    }
    false
}

/// Charge a dispatched bio to `tg` and, if `tg` is a fake-device member,
/// to the FD header and every sibling member too (§4.6
/// `throtl_charge_bio_recursively`).
pub fn charge_recursive(ctx: &mut Context, tg: TgId, direction: BioDirection, size: u64, now: u64) {
    let fake = ctx.tgs.get(tg).and_then(|group| group.fake);

    if let Some(group) = ctx.tgs.get_mut(tg) {
        group.charge(direction, size);
        group.trim_slices(now, ctx.slice_ticks);
    }

    let Some(membership) = fake else {
        return;
    };
    let Some(fd) = ctx.fds.get(membership.fd) else {
        return;
    };
    let header = fd.header;
    let siblings: Vec<TgId> = fd
        .members()
        .iter()
        .map(|(_, member_tg)| *member_tg)
        .filter(|member_tg| *member_tg != tg)
        .collect();

    if let Some(header_tg) = ctx.tgs.get_mut(header) {
        header_tg.charge(direction, size);
        header_tg.trim_slices(now, ctx.slice_ticks);
    }
    for sibling in siblings {
        if let Some(sibling_tg) = ctx.tgs.get_mut(sibling) {
            sibling_tg.charge(direction, size);
            sibling_tg.trim_slices(now, ctx.slice_ticks);
        }
    }
}

/// Would `tg` admit `size` bytes in `direction` right now, with no other
/// bio of this TG already ahead of it in its parent SQ? If so, charge it
/// immediately and return `true` — the bio bypasses queueing entirely.
pub fn try_dispatch_now(
    ctx: &mut Context,
    tg: TgId,
    direction: BioDirection,
    size: u64,
    now: u64,
) -> bool {
    let Some(group) = ctx.tgs.get(tg) else {
        return false;
    };
    let parent_sq = group.parent_sq;
    if ctx
        .sqs
        .get(parent_sq)
        .map(|sq| sq.has_queued(direction, tg))
        .unwrap_or(true)
    {
        // Something of this TG's is already waiting; preserve FIFO order
        // rather than letting a fresh bio jump ahead.
        return false;
    }

    // Bypass fast path (§3 invariant): if neither this TG nor any ancestor
    // has a finite limit on this direction or RANDW, skip the bucket math
    // entirely rather than walking a hierarchy that has nothing to say.
    let bypass = !has_rules(ctx, tg, direction.as_dir()) && !has_rules(ctx, tg, Dir::RANDW);
    let ok = if bypass {
        true
    } else {
        match ctx.tgs.get_mut(tg) {
            Some(group) => group.may_dispatch(direction, size, now, ctx.slice_ticks).0,
            None => false,
        }
    };
    if ok {
        charge_recursive(ctx, tg, direction, size, now);
    }
    ok
}

/// Recompute `tg.disptime` from the earlier of its two directions' queued
/// head bios and (re-)link it into its parent SQ's pending tree. Clears
/// `WAS_EMPTY`.
pub fn tg_update_disptime(ctx: &mut Context, tg: TgId, now: u64) {
    let Some(group) = ctx.tgs.get(tg) else {
        return;
    };
    let parent_sq = group.parent_sq;

    let mut disptime: Option<u64> = None;
    for direction in [BioDirection::Read, BioDirection::Write] {
        let Some(sq) = ctx.sqs.get(parent_sq) else {
            continue;
        };
        let Some((bio, _gate)) = sq.peek_ticket(direction, tg) else {
            continue;
        };
        let size = bio.size;
        let wait = ctx
            .tgs
            .get_mut(tg)
            .map(|group| group.may_dispatch(direction, size, now, ctx.slice_ticks).1)
            .unwrap_or(0);
        let candidate = now + wait;
        disptime = Some(disptime.map_or(candidate, |current| current.min(candidate)));
    }

    let Some(disptime) = disptime else {
        return;
    };

    if let Some(group) = ctx.tgs.get_mut(tg) {
        group.disptime = disptime;
        group.flags.remove(TgFlags::WAS_EMPTY);
        group.flags.insert(TgFlags::PENDING);
    }
    if let Some(sq) = ctx.sqs.get_mut(parent_sq) {
        sq.enqueue_tg(tg, disptime);
    }
}

/// Enqueue `ticket` on `tg`'s side of its parent SQ and schedule it.
pub fn enqueue_ticket(
    ctx: &mut Context,
    tg: TgId,
    direction: BioDirection,
    ticket: Ticket,
    now: u64,
) {
    let Some(group) = ctx.tgs.get(tg) else {
        return;
    };
    let parent_sq = group.parent_sq;
    let was_empty = ctx
        .sqs
        .get(parent_sq)
        .map(|sq| !sq.has_queued(BioDirection::Read, tg) && !sq.has_queued(BioDirection::Write, tg))
        .unwrap_or(true);

    if let Some(group) = ctx.tgs.get_mut(tg) {
        group.record_throttled(direction, ticket.0.size);
    }
    if let Some(sq) = ctx.sqs.get_mut(parent_sq) {
        sq.add_ticket(direction, tg, ticket);
    }
    if was_empty {
        if let Some(group) = ctx.tgs.get_mut(tg) {
            group.flags.insert(TgFlags::WAS_EMPTY);
        }
    }
    tg_update_disptime(ctx, tg, now);
}

/// Try to clear every gate in `gates`, in order, charging each as it
/// passes. The first gate that can't yet admit `bio` gets it queued with
/// the remaining gates as its ticket's continuation; everything already
/// cleared before that point has already been charged and stays charged.
/// Returns `Some(bio)` once every gate has cleared.
fn try_clear_gates(
    ctx: &mut Context,
    gates: &[TgId],
    direction: BioDirection,
    bio: Bio,
    now: u64,
) -> Option<Bio> {
    for (i, &gate) in gates.iter().enumerate() {
        if !try_dispatch_now(ctx, gate, direction, bio.size, now) {
            let remaining = gates[i + 1..].to_vec();
            enqueue_ticket(ctx, gate, direction, (bio, remaining), now);
            return None;
        }
    }
    Some(bio)
}

/// Submit a fresh bio against `physical`, then gated a second time by
/// every entry in `fd_gates` (one per FD owned by the bio's group that
/// covers this device) per §4.6 step 2. Returns `Some(bio)` ready for
/// immediate submission, or `None` if it was queued.
pub fn submit_bio(
    ctx: &mut Context,
    physical: TgId,
    fd_gates: &[TgId],
    direction: BioDirection,
    bio: Bio,
    now: u64,
) -> Option<Bio> {
    if !try_dispatch_now(ctx, physical, direction, bio.size, now) {
        enqueue_ticket(ctx, physical, direction, (bio, fd_gates.to_vec()), now);
        return None;
    }
    try_clear_gates(ctx, fd_gates, direction, bio, now)
}

fn requeue_if_nonempty(ctx: &mut Context, tg: TgId, now: u64) {
    let still_has_work = ctx
        .tgs
        .get(tg)
        .map(|group| group.parent_sq)
        .and_then(|parent_sq| ctx.sqs.get(parent_sq))
        .map(|sq| sq.has_queued(BioDirection::Read, tg) || sq.has_queued(BioDirection::Write, tg))
        .unwrap_or(false);
    if still_has_work {
        tg_update_disptime(ctx, tg, now);
    } else if let Some(group) = ctx.tgs.get_mut(tg) {
        group.flags.remove(TgFlags::PENDING);
    }
}

/// Dispatch up to a round's quota of bios out of `tg`'s queued tickets.
/// Returns the bios that cleared every gate and are ready for submission.
pub fn dispatch_tg(ctx: &mut Context, tg: TgId, now: u64) -> Vec<Bio> {
    let mut ready = Vec::new();
    let Some(group) = ctx.tgs.get(tg) else {
        return ready;
    };
    let parent_sq = group.parent_sq;

    for (direction, mut budget) in [
        (BioDirection::Read, GRP_READ_QUANTUM),
        (BioDirection::Write, GRP_WRITE_QUANTUM),
    ] {
        while budget > 0 {
            let Some(sq) = ctx.sqs.get(parent_sq) else {
                break;
            };
            let Some((head, _gate)) = sq.peek_ticket(direction, tg) else {
                break;
            };
            let size = head.size;
            let ok = ctx
                .tgs
                .get_mut(tg)
                .map(|group| group.may_dispatch(direction, size, now, ctx.slice_ticks).0)
                .unwrap_or(false);
            if !ok {
                break;
            }

            let Some(sq) = ctx.sqs.get_mut(parent_sq) else {
                break;
            };
            let Some(((bio, gates), _drained)) = sq.pop_ticket(direction, tg) else {
                break;
            };
            charge_recursive(ctx, tg, direction, bio.size, now);
            budget -= 1;

            if let Some(bio) = try_clear_gates(ctx, &gates, direction, bio, now) {
                ready.push(bio);
            }
        }
    }

    requeue_if_nonempty(ctx, tg, now);
    ready
}

/// A decision about the parent SQ's timer: whether to (re-)arm it, and
/// whether the caller should keep dispatching synchronously or stop
/// (§4.4 `schedule_next_dispatch`).
pub struct ScheduleDecision {
    pub arm_at: Option<u64>,
    pub done: bool,
}

pub fn schedule_next_dispatch(sq: &ServiceQueue, now: u64, force: bool) -> ScheduleDecision {
    match sq.first_pending_disptime() {
        None => ScheduleDecision {
            arm_at: None,
            done: true,
        },
        Some(first) => ScheduleDecision {
            arm_at: Some(first),
            done: force || first > now,
        },
    }
}

/// Drain every TG due by `now` out of `sq_id`, up to `SQ_QUANTUM` bios
/// total, returning the bios ready for submission (§4.5 `select_dispatch`).
pub fn select_dispatch(ctx: &mut Context, sq_id: SqId, now: u64) -> Vec<Bio> {
    let mut ready = Vec::new();
    let mut total = 0u32;
    while total < SQ_QUANTUM {
        let Some(sq) = ctx.sqs.get_mut(sq_id) else {
            break;
        };
        let Some(tg) = sq.pop_ready(now) else {
            break;
        };
        let dispatched = dispatch_tg(ctx, tg, now);
        total += dispatched.len() as u32;
        let progressed = !dispatched.is_empty();
        ready.extend(dispatched);
        if !progressed {
            // Defensive: a TG popped as "due" that still dispatched
            // nothing would otherwise spin this loop forever.
            break;
        }
    }
    ready
}

/// Force every queued bio at `sq_id` out immediately, ignoring limits and
/// any remaining gate, for device teardown (§5 `drain`).
pub fn drain_sq(ctx: &mut Context, sq_id: SqId) -> Vec<Bio> {
    match ctx.sqs.get_mut(sq_id) {
        Some(sq) => sq.drain_all().into_iter().map(|(bio, _gate)| bio).collect(),
        None => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket::{Limit, DEFAULT_SLICE_TICKS};

    fn setup() -> (Context, SqId) {
        let mut ctx = Context::new(DEFAULT_SLICE_TICKS);
        let root = ctx.create_root_sq();
        (ctx, root)
    }

    #[test]
    fn unlimited_tg_dispatches_immediately() {
        let (mut ctx, root) = setup();
        let tg = ctx.create_tg(1, 8, root);
        let bio = Bio::new(1, 8, BioDirection::Read, 4096);
        let result = submit_bio(&mut ctx, tg, &[], BioDirection::Read, bio, 0);
        assert!(result.is_some());
    }

    #[test]
    fn bps_capped_tg_queues_once_saturated() {
        let (mut ctx, root) = setup();
        let tg = ctx.create_tg(1, 8, root);
        ctx.tgs.get_mut(tg).unwrap().set_limit(
            Dir::READ,
            Limit {
                bps: Some(1_048_576),
                iops: None,
            },
            0,
            ctx.slice_ticks,
        );
        let mut dispatched_immediately = 0;
        let mut queued = 0;
        for _ in 0..32 {
            let bio = Bio::new(1, 8, BioDirection::Read, 64 * 1024);
            match submit_bio(&mut ctx, tg, &[], BioDirection::Read, bio, 0) {
                Some(_) => dispatched_immediately += 1,
                None => queued += 1,
            }
        }
        assert_eq!(dispatched_immediately, 16);
        assert_eq!(queued, 16);

        // The slice fully renews at t = DEFAULT_SLICE_TICKS; the queued 16
        // then clear across a few GRP_READ_QUANTUM-sized rounds within the
        // same `select_dispatch` call.
        let ready = select_dispatch(&mut ctx, root, DEFAULT_SLICE_TICKS);
        assert_eq!(ready.len(), 16);
    }

    #[test]
    fn has_rules_walks_up_to_an_ancestor_with_a_limit() {
        let (mut ctx, root) = setup();
        let parent = ctx.create_tg(1, 8, root);
        let parent_own_sq = ctx.tgs.get(parent).unwrap().own_sq;
        let child = ctx.create_tg(1, 8, parent_own_sq);

        assert!(!has_rules(&ctx, child, Dir::READ));

        ctx.tgs.get_mut(parent).unwrap().set_limit(
            Dir::READ,
            Limit {
                bps: Some(1_048_576),
                iops: None,
            },
            0,
            ctx.slice_ticks,
        );
        assert!(has_rules(&ctx, child, Dir::READ));
        assert!(!has_rules(&ctx, child, Dir::WRITE));
    }

    #[test]
    fn fake_device_member_charges_every_sibling() {
        let (mut ctx, root) = setup();
        let fd = ctx.create_fake_device(1, 7, root);
        let member_a = ctx.create_tg(1, 10, root);
        let member_b = ctx.create_tg(1, 11, root);
        ctx.fds.get_mut(fd).unwrap().add_member(10, member_a);
        ctx.fds.get_mut(fd).unwrap().add_member(11, member_b);
        // Registering a member also marks the member TG itself, so charging
        // it cascades to its siblings (what an engine-level "add member"
        // operation would do alongside `FakeDevice::add_member`). Both
        // members are left unlimited here so the bio clears its fake-device
        // gate immediately and the cascade is the only thing under test.
        ctx.tgs.get_mut(member_a).unwrap().fake = Some(crate::group::FakeMembership { fd });
        ctx.tgs.get_mut(member_b).unwrap().fake = Some(crate::group::FakeMembership { fd });

        let physical_a = ctx.create_tg(1, 10, root);
        let bio = Bio::new(1, 10, BioDirection::Read, 512 * 1024);
        submit_bio(&mut ctx, physical_a, &[member_a], BioDirection::Read, bio, 0);

        assert_eq!(
            ctx.tgs.get(member_b).unwrap().bucket(Dir::READ).bytes_dispatched(),
            512 * 1024
        );
    }
}
