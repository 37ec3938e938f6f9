//! Weighted FIFO semaphore with dynamic resize (spec §4.2).
//!
//! Not `tokio::sync::Semaphore`: that type has no FIFO-safe `resize` that
//! shrinks without cancelling existing holders, and no guarantee that a
//! later, smaller acquire can never barge ahead of an earlier, larger one.
//! The engine's correctness (invariant 2 in spec §8) depends on
//! no-skipping, so this is hand-rolled.
//!
//! Interior state is guarded by a plain `std::sync::Mutex` held only across
//! short, synchronous critical sections — never across an `.await` — so
//! `acquire` can genuinely suspend one caller without blocking others, which
//! is what `MemoryManager` (spec §4.3) needs at its one real suspension
//! point (spec §5).

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::oneshot;

struct Waiter {
    weight: u64,
    notify: oneshot::Sender<()>,
}

#[derive(Default)]
struct Inner {
    available: u64,
    max: u64,
    waiters: VecDeque<Waiter>,
}

impl Inner {
    /// Wakes as many front-of-queue waiters as current capacity allows,
    /// stopping at the first waiter whose weight cannot yet be satisfied
    /// (no skipping).
    fn try_wake_front(&mut self) {
        while let Some(front) = self.waiters.front() {
            if front.weight > self.available {
                break;
            }
            let waiter = self.waiters.pop_front().expect("front just peeked");
            self.available -= waiter.weight;
            let _ = waiter.notify.send(());
        }
    }
}

pub struct Semaphore {
    inner: Mutex<Inner>,
}

impl Semaphore {
    pub fn new(max: u64) -> Self {
        let max = max.max(1);
        Semaphore { inner: Mutex::new(Inner { available: max, max, waiters: VecDeque::new() }) }
    }

    pub fn available(&self) -> u64 {
        self.inner.lock().unwrap().available
    }

    pub fn max(&self) -> u64 {
        self.inner.lock().unwrap().max
    }

    /// Non-mutating check mirroring `try_acquire`'s admission condition.
    pub fn has_capacity(&self, weight: u64) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.waiters.is_empty() && inner.available >= weight
    }

    /// Non-blocking acquire. Returns `true` and subtracts `weight` iff no
    /// waiter is queued ahead (FIFO: a queued waiter always goes first)
    /// and enough capacity is available.
    pub fn try_acquire(&self, weight: u64) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.waiters.is_empty() && inner.available >= weight {
            inner.available -= weight;
            true
        } else {
            false
        }
    }

    /// Suspends until `weight` permits are available, honoring FIFO order:
    /// a waiter requesting more than is currently available blocks every
    /// waiter queued after it. Never holds the internal lock across the
    /// suspension.
    pub async fn acquire(&self, weight: u64) {
        let rx = {
            let mut inner = self.inner.lock().unwrap();
            if inner.waiters.is_empty() && inner.available >= weight {
                inner.available -= weight;
                None
            } else {
                let (tx, rx) = oneshot::channel();
                inner.waiters.push_back(Waiter { weight, notify: tx });
                Some(rx)
            }
        };
        if let Some(rx) = rx {
            let _ = rx.await;
        }
    }

    pub fn release(&self, weight: u64) {
        let mut inner = self.inner.lock().unwrap();
        inner.available = (inner.available + weight).min(inner.max);
        inner.try_wake_front();
    }

    /// `new_max < current max` drains `available` down to 0 at most; it
    /// never cancels permits already held by callers (spec §8 boundary
    /// behavior).
    pub fn resize(&self, new_max: u64) {
        let new_max = new_max.max(1);
        let mut inner = self.inner.lock().unwrap();
        if new_max > inner.max {
            let delta = new_max - inner.max;
            inner.max = new_max;
            inner.available += delta;
            inner.try_wake_front();
        } else {
            let delta = inner.max - new_max;
            inner.max = new_max;
            inner.available = inner.available.saturating_sub(delta);
        }
    }
}
