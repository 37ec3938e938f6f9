//! Derived availability snapshot and change notifier (spec §4.5).

use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::instrument;

/// Reasons are a closed enum; priority order (spec §4.5) is
/// tokensMinute > tokensDay > requestsMinute > requestsDay >
/// concurrentRequests > memory, plus two caller-driven kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AvailabilityReason {
    TokensMinute,
    TokensDay,
    RequestsMinute,
    RequestsDay,
    ConcurrentRequests,
    Memory,
    Distributed,
    Adjustment,
}

impl AvailabilityReason {
    fn priority(self) -> u8 {
        match self {
            AvailabilityReason::TokensMinute => 0,
            AvailabilityReason::TokensDay => 1,
            AvailabilityReason::RequestsMinute => 2,
            AvailabilityReason::RequestsDay => 3,
            AvailabilityReason::ConcurrentRequests => 4,
            AvailabilityReason::Memory => 5,
            // distributed/adjustment are only ever accepted verbatim from
            // the caller (spec §4.5), never chosen by priority comparison.
            AvailabilityReason::Distributed => 6,
            AvailabilityReason::Adjustment => 7,
        }
    }
}

fn higher_priority(a: AvailabilityReason, b: AvailabilityReason) -> AvailabilityReason {
    if a.priority() <= b.priority() { a } else { b }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Availability {
    /// `floor` of the minimum admission slots across configured dimensions;
    /// `u64::MAX` stands in for "infinity" (no dimensions configured).
    pub slots: u64,
    pub tpm: Option<u64>,
    pub tpd: Option<u64>,
    pub rpm: Option<u64>,
    pub rpd: Option<u64>,
    pub concurrent: Option<u64>,
    pub memory_kb: Option<u64>,
}

impl Availability {
    pub const INFINITE_SLOTS: u64 = u64::MAX;
}

struct State {
    last_emitted: Option<Availability>,
    /// Set of dimensions that changed since the last emission, collapsed
    /// down to one reason by priority when the mutation is finally
    /// observed by `notify_mutation`/`observe`.
    pending_reason: Option<AvailabilityReason>,
}

/// Computes `Availability` after every mutating operation and diff-emits a
/// single coalesced event through `on_change` (spec §4.5). The callback
/// runs synchronously on the mutating actor, matching spec §5's ordering
/// guarantee ("at most one in-flight emit").
pub struct AvailabilityTracker {
    state: Mutex<State>,
}

impl Default for AvailabilityTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl AvailabilityTracker {
    pub fn new() -> Self {
        AvailabilityTracker { state: Mutex::new(State { last_emitted: None, pending_reason: None }) }
    }

    /// Records that some dimension changed for `reason`; the reason with
    /// the highest priority observed since the last `observe()` wins.
    pub fn notify_mutation(&self, reason: AvailabilityReason) {
        let mut state = self.state.lock().unwrap();
        state.pending_reason = Some(match state.pending_reason {
            Some(existing) => higher_priority(existing, reason),
            None => reason,
        });
    }

    /// Compares `current` to the last-emitted snapshot; if unchanged, no-op.
    /// Otherwise calls `on_change` with the coalesced reason and updates
    /// the snapshot. `caller_reason` is used verbatim for the first
    /// emission and for `distributed`/`adjustment` mutations (spec §4.5).
    #[instrument(level = "debug", skip(self, current, on_change))]
    pub fn observe(
        &self,
        current: Availability,
        caller_reason: Option<AvailabilityReason>,
        on_change: impl FnOnce(Availability, AvailabilityReason),
    ) {
        let mut state = self.state.lock().unwrap();
        if state.last_emitted == Some(current) {
            state.pending_reason = None;
            return;
        }

        let reason = caller_reason
            .or(state.pending_reason)
            .unwrap_or(AvailabilityReason::ConcurrentRequests);

        state.last_emitted = Some(current);
        state.pending_reason = None;
        drop(state);

        on_change(current, reason);
    }

    pub fn last_emitted(&self) -> Option<Availability> {
        self.state.lock().unwrap().last_emitted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn availability(slots: u64) -> Availability {
        Availability { slots, tpm: None, tpd: None, rpm: None, rpd: None, concurrent: None, memory_kb: None }
    }

    #[test]
    fn first_emission_uses_caller_reason() {
        let tracker = AvailabilityTracker::new();
        let calls = AtomicUsize::new(0);
        tracker.observe(availability(10), Some(AvailabilityReason::Memory), |_, reason| {
            assert_eq!(reason, AvailabilityReason::Memory);
            calls.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unchanged_availability_is_a_noop() {
        let tracker = AvailabilityTracker::new();
        tracker.observe(availability(10), Some(AvailabilityReason::Memory), |_, _| {});
        let calls = AtomicUsize::new(0);
        tracker.observe(availability(10), Some(AvailabilityReason::TokensMinute), |_, _| {
            calls.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn priority_picks_highest_ranked_pending_reason() {
        let tracker = AvailabilityTracker::new();
        tracker.observe(availability(10), Some(AvailabilityReason::Memory), |_, _| {});
        tracker.notify_mutation(AvailabilityReason::ConcurrentRequests);
        tracker.notify_mutation(AvailabilityReason::TokensMinute);
        tracker.notify_mutation(AvailabilityReason::RequestsDay);

        let mut seen = None;
        tracker.observe(availability(5), None, |_, reason| seen = Some(reason));
        assert_eq!(seen, Some(AvailabilityReason::TokensMinute));
    }

    #[test]
    fn distributed_reason_passes_through_verbatim() {
        let tracker = AvailabilityTracker::new();
        tracker.observe(availability(10), Some(AvailabilityReason::Memory), |_, _| {});
        tracker.notify_mutation(AvailabilityReason::TokensMinute);

        let mut seen = None;
        tracker.observe(availability(5), Some(AvailabilityReason::Distributed), |_, reason| seen = Some(reason));
        assert_eq!(seen, Some(AvailabilityReason::Distributed));
    }
}
