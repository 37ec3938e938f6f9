//! The single serializing executor behind one `RateLimiter` instance
//! (spec §5). Every admission-state mutation — composed reserve, commit,
//! release, distributed allocation application, dynamic limit updates —
//! passes through this actor's mailbox, which processes messages strictly
//! one at a time. That ordering is what gives `composed_try_reserve` its
//! atomicity without an explicit lock (spec §9).
//!
//! Anything that suspends (`memory.acquire`, `backend.acquire`, the user's
//! `job_fn`) deliberately happens *outside* this actor, in
//! `delegation::run_job`, so the mailbox is never blocked waiting on I/O.

use std::collections::HashMap;

use actix::prelude::*;
use tracing::instrument;

use crate::availability::{Availability, AvailabilityReason, AvailabilityTracker};
use crate::backend::{Allocation, is_stale};
use crate::config::{Configuration, ResourceEstimate};
use crate::ids::{JobTypeId, ModelId};
use crate::job_type::{JobTypeKnobs, JobTypeManager};
use crate::memory::MemoryManager;
use crate::model_limiter::{ModelLimiter, ReservationContext, ResourceUsage};

pub type AvailabilityCallback = std::sync::Arc<dyn Fn(Availability, AvailabilityReason) + Send + Sync>;

#[derive(Debug, Clone, Default)]
pub struct ModelStatsSnapshot {
    pub rpm_remaining: Option<u64>,
    pub rpd_remaining: Option<u64>,
    pub tpm_remaining: Option<u64>,
    pub tpd_remaining: Option<u64>,
    pub concurrency_available: Option<u64>,
    pub concurrency_max: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct JobTypeSnapshot {
    pub current_ratio: f64,
    pub in_flight: u64,
    pub allocated_slots: u64,
}

pub struct SchedulerActor {
    limiters: HashMap<ModelId, ModelLimiter>,
    job_types: HashMap<ModelId, JobTypeManager>,
    estimates: HashMap<String, ResourceEstimate>,
    escalation_order: Vec<ModelId>,
    memory: std::sync::Arc<MemoryManager>,
    availability: AvailabilityTracker,
    on_available_slots_change: Option<AvailabilityCallback>,
    observed_instance_count: u64,
}

impl SchedulerActor {
    pub fn new(
        config: &Configuration,
        memory: std::sync::Arc<MemoryManager>,
        on_available_slots_change: Option<AvailabilityCallback>,
    ) -> Self {
        let mut limiters = HashMap::new();
        let mut job_types = HashMap::new();
        let knobs = JobTypeKnobs {
            releases_per_adjustment: config.releases_per_adjustment.unwrap_or(10),
            adjustment_interval: std::time::Duration::from_millis(config.adjustment_interval_ms.unwrap_or(5000)),
            ..JobTypeKnobs::default()
        };

        for (model_id, model_config) in &config.models {
            limiters.insert(model_id.clone(), ModelLimiter::new(model_id.clone(), model_config));
            let per_model_estimates: HashMap<String, ResourceEstimate> =
                config.resource_estimations_per_job.clone();
            if !per_model_estimates.is_empty() {
                job_types.insert(model_id.clone(), JobTypeManager::new(&per_model_estimates, knobs));
            }
        }

        for (model_id, limiter) in limiters.iter_mut() {
            if let Some(jtm) = job_types.get_mut(model_id) {
                jtm.recompute_allocated_slots(limiter);
            }
        }

        SchedulerActor {
            limiters,
            job_types,
            estimates: config.resource_estimations_per_job.clone(),
            escalation_order: config.effective_escalation_order(),
            memory,
            availability: AvailabilityTracker::new(),
            on_available_slots_change,
            observed_instance_count: 1,
        }
    }

    fn max_job_cost(&self, selector: impl Fn(&ResourceEstimate) -> u64) -> u64 {
        self.estimates.values().map(selector).max().unwrap_or(0)
    }

    /// Aggregate minimum-remaining snapshot across every configured model
    /// plus the shared memory pool (spec §4.5).
    fn compute_availability(&mut self) -> Availability {
        let mut tpm_min: Option<u64> = None;
        let mut tpd_min: Option<u64> = None;
        let mut rpm_min: Option<u64> = None;
        let mut rpd_min: Option<u64> = None;
        let mut conc_min: Option<u64> = None;

        for limiter in self.limiters.values_mut() {
            if let Some(v) = limiter.tpm_remaining() {
                tpm_min = Some(tpm_min.map_or(v, |m| m.min(v)));
            }
            if let Some(v) = limiter.tpd_remaining() {
                tpd_min = Some(tpd_min.map_or(v, |m| m.min(v)));
            }
            if let Some(v) = limiter.rpm_remaining() {
                rpm_min = Some(rpm_min.map_or(v, |m| m.min(v)));
            }
            if let Some(v) = limiter.rpd_remaining() {
                rpd_min = Some(rpd_min.map_or(v, |m| m.min(v)));
            }
            if let Some(v) = limiter.concurrency_available() {
                conc_min = Some(conc_min.map_or(v, |m| m.min(v)));
            }
        }

        let memory_kb = Some(self.memory.available_kb());
        let tokens_cost = self.max_job_cost(|e| e.estimated_used_tokens).max(1);
        let requests_cost = self.max_job_cost(|e| e.estimated_number_of_requests).max(1);
        let memory_cost = self.estimates.values().filter_map(|e| e.estimated_used_memory_kb).max();

        let mut candidates = Vec::with_capacity(6);
        if let Some(v) = tpm_min {
            candidates.push(v / tokens_cost);
        }
        if let Some(v) = tpd_min {
            candidates.push(v / tokens_cost);
        }
        if let Some(v) = rpm_min {
            candidates.push(v / requests_cost);
        }
        if let Some(v) = rpd_min {
            candidates.push(v / requests_cost);
        }
        if let Some(v) = conc_min {
            candidates.push(v);
        }
        if let (Some(v), Some(cost)) = (memory_kb, memory_cost) {
            if cost > 0 {
                candidates.push(v / cost);
            }
        }

        let slots = candidates.into_iter().min().unwrap_or(Availability::INFINITE_SLOTS);
        Availability { slots, tpm: tpm_min, tpd: tpd_min, rpm: rpm_min, rpd: rpd_min, concurrent: conc_min, memory_kb }
    }

    fn refresh_availability(&mut self, caller_reason: Option<AvailabilityReason>) {
        let current = self.compute_availability();
        let callback = self.on_available_slots_change.clone();
        self.availability.observe(current, caller_reason, |availability, reason| {
            if let Some(cb) = callback {
                cb(availability, reason);
            }
        });
    }

    fn maybe_rebalance(&mut self, model: &ModelId, due: bool) {
        if !due {
            return;
        }
        if let (Some(jtm), Some(limiter)) = (self.job_types.get_mut(model), self.limiters.get_mut(model)) {
            jtm.adjust_ratios();
            jtm.recompute_allocated_slots(limiter);
        }
    }
}

impl Actor for SchedulerActor {
    type Context = Context<Self>;
}

pub struct ComposedTryReserve {
    pub model: ModelId,
    pub job_type: JobTypeId,
}
impl Message for ComposedTryReserve {
    type Result = Option<ReservationContext>;
}

impl Handler<ComposedTryReserve> for SchedulerActor {
    type Result = Option<ReservationContext>;

    #[instrument(level = "debug", skip(self, _ctx), fields(model = %msg.model, job_type = %msg.job_type))]
    fn handle(&mut self, msg: ComposedTryReserve, _ctx: &mut Self::Context) -> Self::Result {
        let estimate = self.estimates.get(msg.job_type.as_str())?;
        let usage = ResourceUsage { requests: estimate.estimated_number_of_requests, tokens: estimate.estimated_used_tokens };
        let limiter = self.limiters.get_mut(&msg.model)?;
        let ctx = limiter.try_reserve(usage)?;

        if let Some(jtm) = self.job_types.get_mut(&msg.model) {
            if !jtm.has_capacity_for_model(&msg.job_type) {
                self.limiters.get_mut(&msg.model).unwrap().release_reservation(ctx);
                self.refresh_availability(None);
                return None;
            }
            jtm.acquire_for_model(&msg.job_type);
        }

        self.refresh_availability(None);
        Some(ctx)
    }
}

pub struct CommitReservation {
    pub model: ModelId,
    pub job_type: JobTypeId,
    pub ctx: ReservationContext,
    pub actual: ResourceUsage,
}
impl Message for CommitReservation {
    type Result = ();
}

impl Handler<CommitReservation> for SchedulerActor {
    type Result = ();

    fn handle(&mut self, msg: CommitReservation, _ctx: &mut Self::Context) -> Self::Result {
        if let Some(limiter) = self.limiters.get_mut(&msg.model) {
            limiter.commit_reservation(msg.ctx, msg.actual);
        }
        let due = self.job_types.get_mut(&msg.model).map(|jtm| jtm.release_for_model(&msg.job_type)).unwrap_or(false);
        self.maybe_rebalance(&msg.model, due);
        self.refresh_availability(Some(AvailabilityReason::TokensMinute));
    }
}

pub struct ReleaseReservation {
    pub model: ModelId,
    pub job_type: JobTypeId,
    pub ctx: ReservationContext,
}
impl Message for ReleaseReservation {
    type Result = ();
}

impl Handler<ReleaseReservation> for SchedulerActor {
    type Result = ();

    fn handle(&mut self, msg: ReleaseReservation, _ctx: &mut Self::Context) -> Self::Result {
        if let Some(limiter) = self.limiters.get_mut(&msg.model) {
            limiter.release_reservation(msg.ctx);
        }
        let due = self.job_types.get_mut(&msg.model).map(|jtm| jtm.release_for_model(&msg.job_type)).unwrap_or(false);
        self.maybe_rebalance(&msg.model, due);
        self.refresh_availability(None);
    }
}

pub struct MinNonzeroTimeToReset {
    pub model: ModelId,
}
impl Message for MinNonzeroTimeToReset {
    type Result = Option<u64>;
}

impl Handler<MinNonzeroTimeToReset> for SchedulerActor {
    type Result = Option<u64>;

    fn handle(&mut self, msg: MinNonzeroTimeToReset, _ctx: &mut Self::Context) -> Self::Result {
        self.limiters.get_mut(&msg.model).and_then(|l| l.min_nonzero_time_to_reset())
    }
}

pub struct SetRateLimits {
    pub model: ModelId,
    pub rpm: Option<u64>,
    pub rpd: Option<u64>,
    pub tpm: Option<u64>,
    pub tpd: Option<u64>,
}
impl Message for SetRateLimits {
    type Result = ();
}

impl Handler<SetRateLimits> for SchedulerActor {
    type Result = ();

    fn handle(&mut self, msg: SetRateLimits, _ctx: &mut Self::Context) -> Self::Result {
        if let Some(limiter) = self.limiters.get_mut(&msg.model) {
            limiter.set_rate_limits(msg.rpm, msg.rpd, msg.tpm, msg.tpd);
        }
        if let Some(jtm) = self.job_types.get_mut(&msg.model) {
            if let Some(limiter) = self.limiters.get_mut(&msg.model) {
                jtm.recompute_allocated_slots(limiter);
            }
        }
    }
}

pub struct SetConcurrencyLimit {
    pub model: ModelId,
    pub n: u64,
}
impl Message for SetConcurrencyLimit {
    type Result = ();
}

impl Handler<SetConcurrencyLimit> for SchedulerActor {
    type Result = ();

    fn handle(&mut self, msg: SetConcurrencyLimit, _ctx: &mut Self::Context) -> Self::Result {
        if let Some(limiter) = self.limiters.get_mut(&msg.model) {
            limiter.set_concurrency_limit(msg.n);
        }
        if let Some(jtm) = self.job_types.get_mut(&msg.model) {
            if let Some(limiter) = self.limiters.get_mut(&msg.model) {
                jtm.recompute_allocated_slots(limiter);
            }
        }
    }
}

/// Applies an `Allocation` published by a `DistributedBackend` (or pushed
/// directly by a caller via `RateLimiter::set_distributed_availability`).
/// Guards against the "no-shrinking-on-stale" hazard (spec §4.8).
pub struct ApplyAllocation(pub Allocation);
impl Message for ApplyAllocation {
    type Result = ();
}

impl Handler<ApplyAllocation> for SchedulerActor {
    type Result = ();

    #[instrument(level = "debug", skip(self, _ctx, msg))]
    fn handle(&mut self, msg: ApplyAllocation, _ctx: &mut Self::Context) -> Self::Result {
        if is_stale(&msg.0, self.observed_instance_count) {
            tracing::debug!("discarding stale allocation");
            return;
        }
        self.observed_instance_count = msg.0.instance_count;

        for (model_id, limits) in &msg.0.dynamic_limits {
            if let Some(limiter) = self.limiters.get_mut(model_id) {
                limiter.set_rate_limits(
                    limits.requests_per_minute,
                    limits.requests_per_day,
                    limits.tokens_per_minute,
                    limits.tokens_per_day,
                );
                if let Some(n) = limits.max_concurrent_requests {
                    limiter.set_concurrency_limit(n);
                }
            }
            if let (Some(jtm), Some(limiter)) = (self.job_types.get_mut(model_id), self.limiters.get_mut(model_id)) {
                jtm.recompute_allocated_slots(limiter);
            }
        }

        self.refresh_availability(Some(AvailabilityReason::Distributed));
    }
}

/// Periodic tick driving `MemoryConfig::recalculation_interval_ms` (spec
/// §4.3). Routed through the mailbox, like every other mutation, rather
/// than called directly off a timer task, so a resize can never race a
/// concurrent reservation.
pub struct RecalculateMemory;
impl Message for RecalculateMemory {
    type Result = ();
}

impl Handler<RecalculateMemory> for SchedulerActor {
    type Result = ();

    fn handle(&mut self, _msg: RecalculateMemory, _ctx: &mut Self::Context) -> Self::Result {
        self.memory.recalculate(&self.availability);
        self.refresh_availability(None);
    }
}

pub struct GetAvailability;
impl Message for GetAvailability {
    type Result = Availability;
}

impl Handler<GetAvailability> for SchedulerActor {
    type Result = Availability;

    fn handle(&mut self, _msg: GetAvailability, _ctx: &mut Self::Context) -> Self::Result {
        self.compute_availability()
    }
}

pub struct GetModelStats {
    pub model: ModelId,
}
impl Message for GetModelStats {
    type Result = Option<ModelStatsSnapshot>;
}

impl Handler<GetModelStats> for SchedulerActor {
    type Result = Option<ModelStatsSnapshot>;

    fn handle(&mut self, msg: GetModelStats, _ctx: &mut Self::Context) -> Self::Result {
        let limiter = self.limiters.get_mut(&msg.model)?;
        Some(ModelStatsSnapshot {
            rpm_remaining: limiter.rpm_remaining(),
            rpd_remaining: limiter.rpd_remaining(),
            tpm_remaining: limiter.tpm_remaining(),
            tpd_remaining: limiter.tpd_remaining(),
            concurrency_available: limiter.concurrency_available(),
            concurrency_max: limiter.concurrency_max(),
        })
    }
}

pub struct GetJobTypeStats {
    pub model: ModelId,
}
impl Message for GetJobTypeStats {
    type Result = Option<HashMap<JobTypeId, JobTypeSnapshot>>;
}

impl Handler<GetJobTypeStats> for SchedulerActor {
    type Result = Option<HashMap<JobTypeId, JobTypeSnapshot>>;

    fn handle(&mut self, msg: GetJobTypeStats, _ctx: &mut Self::Context) -> Self::Result {
        let jtm = self.job_types.get(&msg.model)?;
        let snapshot = self
            .estimates
            .keys()
            .filter_map(|name| {
                let id = JobTypeId::new(name.clone());
                jtm.state(&id).map(|s| {
                    (
                        id,
                        JobTypeSnapshot {
                            current_ratio: s.current_ratio,
                            in_flight: s.in_flight,
                            allocated_slots: s.allocated_slots,
                        },
                    )
                })
            })
            .collect();
        Some(snapshot)
    }
}

pub struct HasCapacityForModel {
    pub model: ModelId,
    pub job_type: JobTypeId,
}
impl Message for HasCapacityForModel {
    type Result = bool;
}

impl Handler<HasCapacityForModel> for SchedulerActor {
    type Result = bool;

    fn handle(&mut self, msg: HasCapacityForModel, _ctx: &mut Self::Context) -> Self::Result {
        let Some(estimate) = self.estimates.get(msg.job_type.as_str()) else { return false };
        let usage = ResourceUsage { requests: estimate.estimated_number_of_requests, tokens: estimate.estimated_used_tokens };
        let Some(limiter) = self.limiters.get_mut(&msg.model) else { return false };
        let model_ok = limiter.tpm_remaining().map_or(true, |r| r >= usage.tokens)
            && limiter.tpd_remaining().map_or(true, |r| r >= usage.tokens)
            && limiter.rpm_remaining().map_or(true, |r| r >= usage.requests)
            && limiter.rpd_remaining().map_or(true, |r| r >= usage.requests)
            && limiter.concurrency_available().map_or(true, |r| r >= 1);
        model_ok && self.job_types.get(&msg.model).map_or(true, |jtm| jtm.has_capacity_for_model(&msg.job_type))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ModelConfig, RatioConfig};

    fn test_config() -> Configuration {
        let mut models = HashMap::new();
        models.insert(
            ModelId::new("fast"),
            ModelConfig { requests_per_minute: Some(10), tokens_per_minute: Some(1000), max_concurrent_requests: Some(2), ..Default::default() },
        );
        let mut estimates = HashMap::new();
        estimates.insert(
            "chat".to_string(),
            ResourceEstimate {
                estimated_number_of_requests: 1,
                estimated_used_tokens: 50,
                estimated_used_memory_kb: None,
                ratio: RatioConfig { initial_value: Some(1.0), flexible: false },
                max_wait_ms_per_model: HashMap::new(),
            },
        );
        Configuration {
            models,
            escalation_order: vec![ModelId::new("fast")],
            resource_estimations_per_job: estimates,
            memory: None,
            releases_per_adjustment: None,
            adjustment_interval_ms: None,
        }
    }

    fn memory_manager() -> std::sync::Arc<MemoryManager> {
        std::sync::Arc::new(crate::memory::MemoryManager::new(crate::memory::default_memory_probe(), 1.0, 1, 1_000_000))
    }

    #[actix::test]
    async fn composed_reserve_then_release_round_trips() {
        let actor = SchedulerActor::new(&test_config(), memory_manager(), None).start();
        let model = ModelId::new("fast");
        let job_type = JobTypeId::new("chat");

        let ctx = actor
            .send(ComposedTryReserve { model: model.clone(), job_type: job_type.clone() })
            .await
            .unwrap()
            .expect("capacity available");

        let stats = actor.send(GetModelStats { model: model.clone() }).await.unwrap().unwrap();
        assert_eq!(stats.concurrency_available, Some(1));

        actor
            .send(ReleaseReservation { model: model.clone(), job_type, ctx })
            .await
            .unwrap();

        let stats = actor.send(GetModelStats { model }).await.unwrap().unwrap();
        assert_eq!(stats.concurrency_available, Some(2));
    }

    #[actix::test]
    async fn stale_allocation_is_discarded() {
        let actor = SchedulerActor::new(&test_config(), memory_manager(), None).start();
        let model = ModelId::new("fast");

        actor
            .send(ApplyAllocation(Allocation {
                instance_count: 3,
                dynamic_limits: HashMap::new(),
            }))
            .await
            .unwrap();

        actor
            .send(ApplyAllocation(Allocation {
                instance_count: 2,
                dynamic_limits: {
                    let mut m = HashMap::new();
                    m.insert(model.clone(), crate::backend::DynamicLimits { requests_per_minute: Some(1), ..Default::default() });
                    m
                },
            }))
            .await
            .unwrap();

        let stats = actor.send(GetModelStats { model }).await.unwrap().unwrap();
        // stale allocation (2 < observed 3) must not have shrunk rpm
        assert_eq!(stats.rpm_remaining, Some(10));
    }
}
