//! Fake-device overlay: a group-owned logical device aggregating a chosen
//! set of physical queues under one limit (§4.6).
//!
//! The header TG carries the user-configured limit; each member is a
//! (physical device, TG) pair whose TG's limits are kept in lockstep with
//! the header's on every configuration write.

use alloc::vec::Vec;

use crate::arena::Id;
use crate::bio::{BioDirection, DeviceId, FakeDeviceId, GroupId};
use crate::group::TgId;

pub type FdHandle = Id<FakeDevice>;

pub struct FakeDevice {
    pub group: GroupId,
    pub fd_id: FakeDeviceId,
    /// Accounting-only TG: never itself a dispatch stage (Design Notes §9 —
    /// member TGs parent directly to their device root, not to this TG).
    pub header: TgId,
    members: Vec<(DeviceId, TgId)>,
    nr_queued: [u64; 2],
}

impl FakeDevice {
    pub fn new(group: GroupId, fd_id: FakeDeviceId, header: TgId) -> Self {
        Self {
            group,
            fd_id,
            header,
            members: Vec::new(),
            nr_queued: [0, 0],
        }
    }

    pub fn members(&self) -> &[(DeviceId, TgId)] {
        &self.members
    }

    pub fn member_for(&self, device: DeviceId) -> Option<TgId> {
        self.members
            .iter()
            .find(|(d, _)| *d == device)
            .map(|(_, tg)| *tg)
    }

    pub fn add_member(&mut self, device: DeviceId, tg: TgId) {
        if self.member_for(device).is_none() {
            self.members.push((device, tg));
        }
    }

    pub fn queued(&self, direction: BioDirection) -> u64 {
        self.nr_queued[dir_index(direction)]
    }

    /// Recompute the header's aggregate queued-count. Only ever clamps
    /// downward, tolerating a concurrent dispatcher that has already
    /// removed bios the caller's snapshot still counted
    /// (`update_fd_queuenr`, §4.6).
    pub fn update_queuenr(&mut self, direction: BioDirection, member_sum: u64) {
        let index = dir_index(direction);
        if member_sum < self.nr_queued[index] {
            self.nr_queued[index] = member_sum;
        }
    }

    /// Set the aggregate directly — used the first time a member is added
    /// or a limit is configured, before any clamp-only update applies.
    pub fn set_queued(&mut self, direction: BioDirection, value: u64) {
        self.nr_queued[dir_index(direction)] = value;
    }
}

fn dir_index(direction: BioDirection) -> usize {
    match direction {
        BioDirection::Read => 0,
        BioDirection::Write => 1,
    }
}
