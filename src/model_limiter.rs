//! Per-model multi-dimensional reservation engine (spec §4.4).

use tracing::instrument;

use crate::config::ModelConfig;
use crate::ids::ModelId;
use crate::semaphore::Semaphore;
use crate::time_window::{TimeWindowCounter, WindowReceipt};

#[derive(Debug, Clone, Copy, Default)]
pub struct ResourceUsage {
    pub requests: u64,
    pub tokens: u64,
}

/// One dimension's receipt inside a `ReservationContext`. Kept as a small
/// enum rather than six optional fields so `commit`/`release` can iterate
/// uniformly over "whatever this model actually has configured".
#[derive(Debug, Clone, Copy)]
enum DimensionReceipt {
    Rpm(WindowReceipt),
    Rpd(WindowReceipt),
    Tpm(WindowReceipt),
    Tpd(WindowReceipt),
    Concurrency,
}

/// Opaque, affine reservation handle: `commit_reservation`/
/// `release_reservation` take it by value, so the borrow checker enforces
/// "at most once" (spec §3 "At-most-once consumption").
#[derive(Debug)]
pub struct ReservationContext {
    model: ModelId,
    receipts: Vec<DimensionReceipt>,
}

impl ReservationContext {
    pub fn model(&self) -> &ModelId {
        &self.model
    }
}

pub struct ModelLimiter {
    model_id: ModelId,
    rpm: Option<TimeWindowCounter>,
    rpd: Option<TimeWindowCounter>,
    tpm: Option<TimeWindowCounter>,
    tpd: Option<TimeWindowCounter>,
    concurrency: Option<Semaphore>,
}

impl ModelLimiter {
    pub fn new(model_id: ModelId, config: &ModelConfig) -> Self {
        ModelLimiter {
            model_id,
            rpm: config.requests_per_minute.map(|l| TimeWindowCounter::new(l, 60_000)),
            rpd: config.requests_per_day.map(|l| TimeWindowCounter::new(l, 86_400_000)),
            tpm: config.tokens_per_minute.map(|l| TimeWindowCounter::new(l, 60_000)),
            tpd: config.tokens_per_day.map(|l| TimeWindowCounter::new(l, 86_400_000)),
            concurrency: config.max_concurrent_requests.map(Semaphore::new),
        }
    }

    pub fn model_id(&self) -> &ModelId {
        &self.model_id
    }

    /// Atomically reserves `estimate` across every configured dimension, or
    /// reserves nothing at all (spec §4.4 steps 1-5).
    #[instrument(level = "debug", skip(self), fields(model = %self.model_id))]
    pub fn try_reserve(&mut self, estimate: ResourceUsage) -> Option<ReservationContext> {
        // Step 2: check every dimension without mutating.
        if let Some(c) = self.rpm.as_mut() {
            if !c.has_capacity_for(estimate.requests) {
                return None;
            }
        }
        if let Some(c) = self.rpd.as_mut() {
            if !c.has_capacity_for(estimate.requests) {
                return None;
            }
        }
        if let Some(c) = self.tpm.as_mut() {
            if !c.has_capacity_for(estimate.tokens) {
                return None;
            }
        }
        if let Some(c) = self.tpd.as_mut() {
            if !c.has_capacity_for(estimate.tokens) {
                return None;
            }
        }
        if let Some(sem) = self.concurrency.as_ref() {
            if !sem.has_capacity(1) {
                return None;
            }
        }

        // Step 4: mutate in fixed order RPM -> RPD -> TPM -> TPD -> concurrency.
        let mut receipts = Vec::with_capacity(5);
        if let Some(c) = self.rpm.as_mut() {
            receipts.push(DimensionReceipt::Rpm(c.reserve(estimate.requests).expect("checked above")));
        }
        if let Some(c) = self.rpd.as_mut() {
            receipts.push(DimensionReceipt::Rpd(c.reserve(estimate.requests).expect("checked above")));
        }
        if let Some(c) = self.tpm.as_mut() {
            receipts.push(DimensionReceipt::Tpm(c.reserve(estimate.tokens).expect("checked above")));
        }
        if let Some(c) = self.tpd.as_mut() {
            receipts.push(DimensionReceipt::Tpd(c.reserve(estimate.tokens).expect("checked above")));
        }
        if let Some(sem) = self.concurrency.as_ref() {
            let acquired = sem.try_acquire(1);
            debug_assert!(acquired, "concurrency capacity re-checked above");
            receipts.push(DimensionReceipt::Concurrency);
        }

        Some(ReservationContext { model: self.model_id.clone(), receipts })
    }

    /// Books actual usage (overshoot-only, per counter semantics) and
    /// releases the concurrency permit.
    #[instrument(level = "debug", skip(self, ctx), fields(model = %self.model_id))]
    pub fn commit_reservation(&mut self, ctx: ReservationContext, actual: ResourceUsage) {
        debug_assert_eq!(&ctx.model, &self.model_id);
        for receipt in ctx.receipts {
            match receipt {
                DimensionReceipt::Rpm(r) => {
                    if let Some(c) = self.rpm.as_mut() {
                        c.commit(r, actual.requests);
                    }
                }
                DimensionReceipt::Rpd(r) => {
                    if let Some(c) = self.rpd.as_mut() {
                        c.commit(r, actual.requests);
                    }
                }
                DimensionReceipt::Tpm(r) => {
                    if let Some(c) = self.tpm.as_mut() {
                        c.commit(r, actual.tokens);
                    }
                }
                DimensionReceipt::Tpd(r) => {
                    if let Some(c) = self.tpd.as_mut() {
                        c.commit(r, actual.tokens);
                    }
                }
                DimensionReceipt::Concurrency => {
                    if let Some(sem) = self.concurrency.as_ref() {
                        sem.release(1);
                    }
                }
            }
        }
    }

    #[instrument(level = "debug", skip(self, ctx), fields(model = %self.model_id))]
    pub fn release_reservation(&mut self, ctx: ReservationContext) {
        debug_assert_eq!(&ctx.model, &self.model_id);
        for receipt in ctx.receipts {
            match receipt {
                DimensionReceipt::Rpm(r) => {
                    if let Some(c) = self.rpm.as_mut() {
                        c.release(r);
                    }
                }
                DimensionReceipt::Rpd(r) => {
                    if let Some(c) = self.rpd.as_mut() {
                        c.release(r);
                    }
                }
                DimensionReceipt::Tpm(r) => {
                    if let Some(c) = self.tpm.as_mut() {
                        c.release(r);
                    }
                }
                DimensionReceipt::Tpd(r) => {
                    if let Some(c) = self.tpd.as_mut() {
                        c.release(r);
                    }
                }
                DimensionReceipt::Concurrency => {
                    if let Some(sem) = self.concurrency.as_ref() {
                        sem.release(1);
                    }
                }
            }
        }
    }

    /// Smallest nonzero `time_to_reset` across configured counters, used by
    /// the caller to bound the adaptive polling delay in
    /// `wait_for_capacity_with_custom_reserve`.
    pub fn min_nonzero_time_to_reset(&mut self) -> Option<u64> {
        [self.rpm.as_mut(), self.rpd.as_mut(), self.tpm.as_mut(), self.tpd.as_mut()]
            .into_iter()
            .flatten()
            .map(|c| c.time_to_reset())
            .filter(|&ms| ms > 0)
            .min()
    }

    pub fn set_rate_limits(&mut self, rpm: Option<u64>, rpd: Option<u64>, tpm: Option<u64>, tpd: Option<u64>) {
        if let (Some(limit), Some(c)) = (rpm, self.rpm.as_mut()) {
            c.set_limit(limit);
        }
        if let (Some(limit), Some(c)) = (rpd, self.rpd.as_mut()) {
            c.set_limit(limit);
        }
        if let (Some(limit), Some(c)) = (tpm, self.tpm.as_mut()) {
            c.set_limit(limit);
        }
        if let (Some(limit), Some(c)) = (tpd, self.tpd.as_mut()) {
            c.set_limit(limit);
        }
    }

    pub fn set_concurrency_limit(&mut self, n: u64) {
        if let Some(sem) = self.concurrency.as_ref() {
            sem.resize(n);
        }
    }

    pub fn tpm_remaining(&mut self) -> Option<u64> {
        self.tpm.as_mut().map(|c| c.remaining())
    }
    pub fn tpd_remaining(&mut self) -> Option<u64> {
        self.tpd.as_mut().map(|c| c.remaining())
    }
    pub fn rpm_remaining(&mut self) -> Option<u64> {
        self.rpm.as_mut().map(|c| c.remaining())
    }
    pub fn rpd_remaining(&mut self) -> Option<u64> {
        self.rpd.as_mut().map(|c| c.remaining())
    }
    pub fn concurrency_available(&self) -> Option<u64> {
        self.concurrency.as_ref().map(|s| s.available())
    }
    pub fn concurrency_max(&self) -> Option<u64> {
        self.concurrency.as_ref().map(|s| s.max())
    }

    pub fn rpm_limit(&self) -> Option<u64> {
        self.rpm.as_ref().map(|c| c.limit())
    }
    pub fn rpd_limit(&self) -> Option<u64> {
        self.rpd.as_ref().map(|c| c.limit())
    }
    pub fn tpm_limit(&self) -> Option<u64> {
        self.tpm.as_ref().map(|c| c.limit())
    }
    pub fn tpd_limit(&self) -> Option<u64> {
        self.tpd.as_ref().map(|c| c.limit())
    }
}
