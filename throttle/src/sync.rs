//! `queue_lock` / `cg_lock` primitives for the throttle engine.
//!
//! Same ticket-lock and writer-preferring-rwlock algorithms as the host
//! kernel's own locks, minus the IRQ-disable/preemption-guard integration:
//! these locks guard dispatch-engine bookkeeping only and are never held
//! across the embedding kernel's interrupt boundary (see DESIGN.md).

use core::cell::UnsafeCell;
use core::hint::spin_loop;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicI32, AtomicU16, AtomicU32, Ordering};

/// FIFO ticket-lock mutex. Backs the per-device `queue_lock` (§5).
pub struct TicketLock<T> {
    next_ticket: AtomicU16,
    now_serving: AtomicU16,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for TicketLock<T> {}
unsafe impl<T: Send> Sync for TicketLock<T> {}

pub struct TicketLockGuard<'a, T> {
    lock: &'a TicketLock<T>,
}

impl<T> TicketLock<T> {
    #[inline]
    pub const fn new(data: T) -> Self {
        Self {
            next_ticket: AtomicU16::new(0),
            now_serving: AtomicU16::new(0),
            data: UnsafeCell::new(data),
        }
    }

    #[inline]
    pub fn is_locked(&self) -> bool {
        self.next_ticket.load(Ordering::Relaxed) != self.now_serving.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn lock(&self) -> TicketLockGuard<'_, T> {
        let my_ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        loop {
            let serving = self.now_serving.load(Ordering::Acquire);
            if serving == my_ticket {
                break;
            }
            let distance = my_ticket.wrapping_sub(serving) as u32;
            for _ in 0..distance.min(64) {
                spin_loop();
            }
        }
        TicketLockGuard { lock: self }
    }

    #[inline]
    pub fn try_lock(&self) -> Option<TicketLockGuard<'_, T>> {
        let current = self.now_serving.load(Ordering::Relaxed);
        if self
            .next_ticket
            .compare_exchange(
                current,
                current.wrapping_add(1),
                Ordering::Acquire,
                Ordering::Relaxed,
            )
            .is_ok()
        {
            Some(TicketLockGuard { lock: self })
        } else {
            None
        }
    }
}

impl<'a, T> Deref for TicketLockGuard<'a, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<'a, T> DerefMut for TicketLockGuard<'a, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<'a, T> Drop for TicketLockGuard<'a, T> {
    #[inline]
    fn drop(&mut self) {
        self.lock.now_serving.fetch_add(1, Ordering::Release);
    }
}

/// Writer-preferring reader-writer lock. Backs the group index (`cg_lock`, §5).
pub struct TicketRwLock<T> {
    state: AtomicI32,
    writer_waiting: AtomicU32,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for TicketRwLock<T> {}
unsafe impl<T: Send + Sync> Sync for TicketRwLock<T> {}

pub struct TicketRwLockReadGuard<'a, T> {
    lock: &'a TicketRwLock<T>,
}

pub struct TicketRwLockWriteGuard<'a, T> {
    lock: &'a TicketRwLock<T>,
}

impl<T> TicketRwLock<T> {
    #[inline]
    pub const fn new(data: T) -> Self {
        Self {
            state: AtomicI32::new(0),
            writer_waiting: AtomicU32::new(0),
            data: UnsafeCell::new(data),
        }
    }

    #[inline]
    pub fn read(&self) -> TicketRwLockReadGuard<'_, T> {
        loop {
            let state = self.state.load(Ordering::Relaxed);
            if state >= 0 && self.writer_waiting.load(Ordering::Relaxed) == 0 {
                if self
                    .state
                    .compare_exchange_weak(state, state + 1, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
                {
                    return TicketRwLockReadGuard { lock: self };
                }
            }
            spin_loop();
        }
    }

    #[inline]
    pub fn write(&self) -> TicketRwLockWriteGuard<'_, T> {
        self.writer_waiting.fetch_add(1, Ordering::Relaxed);
        loop {
            if self
                .state
                .compare_exchange_weak(0, -1, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                self.writer_waiting.fetch_sub(1, Ordering::Relaxed);
                return TicketRwLockWriteGuard { lock: self };
            }
            spin_loop();
        }
    }
}

impl<'a, T> Deref for TicketRwLockReadGuard<'a, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<'a, T> Drop for TicketRwLockReadGuard<'a, T> {
    #[inline]
    fn drop(&mut self) {
        self.lock.state.fetch_sub(1, Ordering::Release);
    }
}

impl<'a, T> Deref for TicketRwLockWriteGuard<'a, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<'a, T> DerefMut for TicketRwLockWriteGuard<'a, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<'a, T> Drop for TicketRwLockWriteGuard<'a, T> {
    #[inline]
    fn drop(&mut self) {
        self.lock.state.store(0, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mutex_excludes_reentrant_alias() {
        let lock = TicketLock::new(0u32);
        {
            let mut g = lock.lock();
            *g += 1;
        }
        assert!(lock.try_lock().is_some());
        assert_eq!(*lock.lock(), 1);
    }

    #[test]
    fn mutex_try_lock_fails_while_held() {
        let lock = TicketLock::new(0u32);
        let _g = lock.lock();
        assert!(lock.try_lock().is_none());
    }

    #[test]
    fn rwlock_allows_multiple_readers() {
        let lock = TicketRwLock::new(5i32);
        let r1 = lock.read();
        let r2 = lock.read();
        assert_eq!(*r1, 5);
        assert_eq!(*r2, 5);
    }

    #[test]
    fn rwlock_write_is_exclusive_after_readers_drop() {
        let lock = TicketRwLock::new(5i32);
        {
            let r = lock.read();
            assert_eq!(*r, 5);
        }
        let mut w = lock.write();
        *w = 9;
        drop(w);
        assert_eq!(*lock.read(), 9);
    }
}
