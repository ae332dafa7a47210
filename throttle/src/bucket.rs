//! Token bucket accounting for one (throttle group, direction) pair.
//!
//! `TokenBucket` tracks a single sliding time slice: how many bytes/IOs have
//! been dispatched since `slice_start`, against a configured bps/iops limit.
//! A throttle group holds one of these per [`Dir`](crate::bio::Dir) — READ,
//! WRITE, and the combined RANDW bucket — and composes them as max-wait
//! (§4.1).

/// Ticks per second. One tick = 1 ms.
pub const TICK_HZ: u64 = 1000;

/// Default slice width: one second, so a configured bps/iops value reads
/// as a true per-second rate rather than needing a 10x mental conversion
/// for the common 100ms-slice framing (see DESIGN.md's reconciliation of
/// the distilled scenarios' literal bio counts against that ratio).
pub const DEFAULT_SLICE_TICKS: u64 = TICK_HZ;

/// A per-direction bandwidth/IOPS limit. `None` means unlimited.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Limit {
    pub bps: Option<u64>,
    pub iops: Option<u64>,
}

impl Limit {
    pub const UNLIMITED: Limit = Limit {
        bps: None,
        iops: None,
    };

    #[inline]
    pub fn is_unlimited(&self) -> bool {
        self.bps.is_none() && self.iops.is_none()
    }
}

/// Token bucket state for one direction of one throttle group.
#[derive(Clone, Copy, Debug)]
pub struct TokenBucket {
    pub limit: Limit,
    slice_start: u64,
    slice_end: u64,
    bytes_disp: u64,
    io_disp: u64,
}

impl TokenBucket {
    pub const fn new() -> Self {
        Self {
            limit: Limit::UNLIMITED,
            slice_start: 0,
            slice_end: 0,
            bytes_disp: 0,
            io_disp: 0,
        }
    }

    pub fn bytes_dispatched(&self) -> u64 {
        self.bytes_disp
    }

    pub fn io_dispatched(&self) -> u64 {
        self.io_disp
    }

    pub fn slice_start(&self) -> u64 {
        self.slice_start
    }

    pub fn slice_end(&self) -> u64 {
        self.slice_end
    }

    /// Reset the limit and restart the slice from `now`. Called whenever a
    /// configuration write changes this bucket's limit (§4.3), so stale
    /// credit under the old limit never leaks into the new one.
    pub fn set_limit(&mut self, limit: Limit, now: u64, slice_ticks: u64) {
        self.limit = limit;
        self.slice_start = now;
        self.slice_end = now + slice_ticks;
        self.bytes_disp = 0;
        self.io_disp = 0;
    }

    /// Reclaim credit for whole slice widths that have elapsed since
    /// `slice_start`, without waiting for the slice to be fully "used" up.
    /// Keeps long-idle buckets from carrying forward a stale deficit.
    pub fn trim_slice(&mut self, now: u64, slice_ticks: u64) {
        if self.limit.is_unlimited() || slice_ticks == 0 {
            return;
        }
        let elapsed = now.saturating_sub(self.slice_start);
        let n = elapsed / slice_ticks;
        if n == 0 {
            return;
        }
        if let Some(bps) = self.limit.bps {
            let reclaim = bps.saturating_mul(slice_ticks).saturating_mul(n) / TICK_HZ;
            self.bytes_disp = self.bytes_disp.saturating_sub(reclaim);
        }
        if let Some(iops) = self.limit.iops {
            let reclaim = iops.saturating_mul(slice_ticks).saturating_mul(n) / TICK_HZ;
            self.io_disp = self.io_disp.saturating_sub(reclaim);
        }
        self.slice_start += n * slice_ticks;
    }

    fn renew_or_extend(&mut self, now: u64, slice_ticks: u64) {
        if now >= self.slice_end {
            self.slice_start = now;
            self.slice_end = now + slice_ticks;
            self.bytes_disp = 0;
            self.io_disp = 0;
        } else if self.slice_end < now + slice_ticks {
            self.slice_end = now + slice_ticks;
        }
    }

    /// Would dispatching `size` bytes (and one IO) fit in the current
    /// slice? Returns `(true, 0)` if so. Otherwise returns `(false, wait)`
    /// with `wait` the number of ticks until it would fit, and extends the
    /// slice to cover that wait so a subsequent check doesn't reset early.
    pub fn may_dispatch(&mut self, now: u64, size: u64, slice_ticks: u64) -> (bool, u64) {
        if self.limit.is_unlimited() {
            return (true, 0);
        }
        self.renew_or_extend(now, slice_ticks);

        let mut ok = true;
        let mut wait = 0u64;
        let elapsed = core::cmp::max(now - self.slice_start, slice_ticks);
        let rounded_elapsed = elapsed.div_ceil(slice_ticks) * slice_ticks;

        if let Some(bps) = self.limit.bps {
            let allowed = bps.saturating_mul(rounded_elapsed) / TICK_HZ;
            let projected = self.bytes_disp + size;
            if projected > allowed {
                let deficit = projected - allowed;
                let w = (deficit.saturating_mul(TICK_HZ) / bps.max(1)).max(1);
                wait = wait.max(w);
                ok = false;
            }
        }
        if let Some(iops) = self.limit.iops {
            let allowed = iops.saturating_mul(rounded_elapsed) / TICK_HZ;
            let projected = self.io_disp + 1;
            if projected > allowed {
                let deficit = projected - allowed;
                let w = (deficit.saturating_mul(TICK_HZ) / iops.max(1)).max(1);
                wait = wait.max(w);
                ok = false;
            }
        }

        if !ok {
            self.slice_end = self.slice_end.max(now + wait);
        }
        (ok, wait)
    }

    /// Charge a dispatched bio of `size` bytes against this bucket.
    pub fn charge(&mut self, size: u64) {
        self.bytes_disp += size;
        self.io_disp += 1;
    }
}

impl Default for TokenBucket {
    fn default() -> Self {
        Self::new()
    }
}
