//! Fixed wall-clock-aligned window counter (spec §4.1).

use std::time::{SystemTime, UNIX_EPOCH};

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_millis() as u64
}

fn window_start_for(now_ms: u64, window_ms: u64) -> u64 {
    (now_ms / window_ms) * window_ms
}

/// A single window-scoped receipt kept inside a `ReservationContext` so a
/// later `commit`/`release` can be guarded against a boundary crossing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowReceipt {
    pub amount: u64,
    pub window_start: u64,
}

#[derive(Debug, Clone)]
pub struct TimeWindowCounter {
    count: u64,
    limit: u64,
    window_ms: u64,
    window_start: u64,
}

impl TimeWindowCounter {
    pub fn new(limit: u64, window_ms: u64) -> Self {
        let start = window_start_for(now_ms(), window_ms);
        TimeWindowCounter { count: 0, limit, window_ms, window_start: start }
    }

    /// Advances `window_start`/`count` if the wall clock has crossed into a
    /// new window since the last observation. Idempotent within a window.
    fn roll_window(&mut self) {
        let current_start = window_start_for(now_ms(), self.window_ms);
        if current_start > self.window_start {
            self.window_start = current_start;
            self.count = 0;
        }
    }

    pub fn has_capacity_for(&mut self, amount: u64) -> bool {
        self.roll_window();
        self.count + amount <= self.limit
    }

    pub fn reserve(&mut self, amount: u64) -> Option<WindowReceipt> {
        if self.has_capacity_for(amount) {
            self.count += amount;
            Some(WindowReceipt { amount, window_start: self.window_start })
        } else {
            None
        }
    }

    /// Books `max(0, actual - reserved)` into the counter, but only if the
    /// window hasn't advanced since the reservation was taken (spec §4.1,
    /// §9 Open Question: overshoot across a boundary is discarded, never
    /// rebooked into the new window).
    pub fn commit(&mut self, receipt: WindowReceipt, actual: u64) {
        self.roll_window();
        if receipt.window_start != self.window_start {
            return;
        }
        if actual > receipt.amount {
            self.count += actual - receipt.amount;
        }
    }

    /// Releases a held reservation, guarded the same way as `commit`.
    pub fn release(&mut self, receipt: WindowReceipt) {
        self.roll_window();
        if receipt.window_start != self.window_start {
            return;
        }
        self.count = self.count.saturating_sub(receipt.amount);
    }

    pub fn set_limit(&mut self, new_limit: u64) {
        self.limit = new_limit;
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn count(&mut self) -> u64 {
        self.roll_window();
        self.count
    }

    pub fn remaining(&mut self) -> u64 {
        self.roll_window();
        self.limit.saturating_sub(self.count)
    }

    pub fn window_start(&mut self) -> u64 {
        self.roll_window();
        self.window_start
    }

    pub fn time_to_reset(&mut self) -> u64 {
        self.roll_window();
        let now = now_ms();
        let reset_at = self.window_start + self.window_ms;
        reset_at.saturating_sub(now)
    }
}
