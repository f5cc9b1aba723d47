//! Virtual clock backing `embassy_time::Instant::now()`.
//!
//! Time never advances on its own: the MAC event loop moves it forward to the
//! next pending deadline (see `MacLow::advance_until`). The clock is kept per
//! thread so that independent simulations (and parallel tests) never observe
//! each other's timeline.

use core::task::Waker;
use embassy_time::{Duration, Instant};
use embassy_time_driver::{Driver, time_driver_impl};
use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;

thread_local! {
    // Current virtual time in embassy ticks
    static NOW_TICKS: Cell<u64> = const { Cell::new(0) };
    // Map of virtual-timestamp -> list of wakers
    static WAKE_QUEUE: RefCell<BTreeMap<u64, Vec<Waker>>> = const { RefCell::new(BTreeMap::new()) };
}

struct VirtualDriver;

impl Driver for VirtualDriver {
    fn now(&self) -> u64 {
        NOW_TICKS.with(|now| now.get())
    }

    fn schedule_wake(&self, at: u64, waker: &Waker) {
        if at <= self.now() {
            waker.wake_by_ref();
            return;
        }
        WAKE_QUEUE.with(|queue| queue.borrow_mut().entry(at).or_default().push(waker.clone()));
    }
}

// Register as the global time driver for embassy-time
time_driver_impl!(static DRIVER: VirtualDriver = VirtualDriver);

/// Current virtual time of the calling thread.
pub fn now() -> Instant {
    Instant::now()
}

/// Move the clock forward to `at` and wake every waker whose deadline has passed.
///
/// Requests to move backwards are ignored: virtual time is monotonic.
pub fn advance_to(at: Instant) {
    let target = at.as_ticks();
    let current = NOW_TICKS.with(|now| now.get());
    if target < current {
        log::trace!("ignoring clock rewind from {} to {} ticks", current, target);
        return;
    }
    NOW_TICKS.with(|now| now.set(target));

    // Drain due wakers before waking them so a woken task may re-register
    let ready: Vec<Waker> = WAKE_QUEUE.with(|queue| {
        let mut queue = queue.borrow_mut();
        let pending = queue.split_off(&(target + 1));
        let due = std::mem::replace(&mut *queue, pending);
        due.into_values().flatten().collect()
    });
    for waker in ready {
        waker.wake();
    }
}

/// Move the clock forward by `delta`.
pub fn advance_by(delta: Duration) {
    advance_to(now() + delta);
}

/// Rewind the calling thread's clock to zero and forget pending wakers.
///
/// Intended for starting a fresh simulation on a thread that already ran one.
pub fn reset() {
    NOW_TICKS.with(|now| now.set(0));
    WAKE_QUEUE.with(|queue| queue.borrow_mut().clear());
}

/// Number of wakers still waiting for a future deadline.
pub fn pending_wakers() -> usize {
    WAKE_QUEUE.with(|queue| queue.borrow().values().map(Vec::len).sum())
}
