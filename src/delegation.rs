//! Admission/fallback state machine (spec §4.7): `run_job` drives a single
//! job through `selecting → reserved → memory_acquiring → backend_acquiring
//! → executing → resolved/delegating/rejected`, composing
//! `SchedulerActor` messages for the synchronous state transitions with the
//! handful of genuine suspension points (spec §5): `memory.acquire`,
//! `backend.acquire`, and the user's own future.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use actix::Addr;
use tracing::{info, instrument, warn};

use crate::backend::{AcquireContext, ActualUsage, DistributedBackend};
use crate::config::{ModelConfig, ResourceEstimate};
use crate::error::{LlmAdmissionError, Result};
use crate::ids::{InstanceId, JobId, JobTypeId, ModelId};
use crate::memory::MemoryManager;
use crate::model_limiter::{ReservationContext, ResourceUsage};
use crate::scheduler_actor::{CommitReservation, ComposedTryReserve, MinNonzeroTimeToReset, ReleaseReservation, SchedulerActor};

/// What the user's job function reported it consumed. Requests/tokens fold
/// into `ResourceUsage` for the counters; the input/cached/output split is
/// kept only for cost attribution.
#[derive(Debug, Clone, Copy, Default)]
pub struct Usage {
    pub request_count: u64,
    pub input_tokens: u64,
    pub cached_tokens: u64,
    pub output_tokens: u64,
}

impl Usage {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.cached_tokens + self.output_tokens
    }

    fn as_resource_usage(&self) -> ResourceUsage {
        ResourceUsage { requests: self.request_count, tokens: self.total_tokens() }
    }

    /// Pure reducer, per SPEC_FULL §1: no tiering, no rounding rules, just
    /// a three-term multiply-sum against the model's configured prices.
    fn cost(&self, model_config: Option<&ModelConfig>) -> f64 {
        let Some(pricing) = model_config.and_then(|m| m.pricing.as_ref()) else { return 0.0 };
        self.input_tokens as f64 * pricing.input
            + self.cached_tokens as f64 * pricing.cached
            + self.output_tokens as f64 * pricing.output
    }
}

/// What the user's job function returns: exactly one of these per call,
/// mirroring the `resolve`/`reject` contract in spec.md §4.7.
pub enum JobOutcome<T> {
    Resolved { usage: Usage, value: T },
    Delegate { usage: Usage },
    Rejected { usage: Usage, reason: String },
}

#[derive(Debug, Clone)]
pub struct JobContext {
    pub model_id: ModelId,
    pub job_id: JobId,
    pub job_type: JobTypeId,
}

pub struct LlmJobResult<T> {
    pub value: T,
    pub model_used: ModelId,
    pub total_cost: f64,
    pub usage_entries: Vec<(ModelId, Usage)>,
}

/// Everything `run_job` needs that lives outside the actor: the config
/// slices it reads (never mutates), the shared memory pool, and the
/// optional distributed backend.
pub struct DelegationContext<'a> {
    pub scheduler: &'a Addr<SchedulerActor>,
    pub memory: &'a Arc<MemoryManager>,
    pub backend: Option<&'a Arc<dyn DistributedBackend>>,
    pub instance_id: &'a InstanceId,
    pub models: &'a HashMap<ModelId, ModelConfig>,
    pub estimates: &'a HashMap<String, ResourceEstimate>,
    pub escalation_order: &'a [ModelId],
    /// Flipped to `false` by `RateLimiter::stop()`; checked between
    /// escalation attempts so pending jobs surface `Stopped` instead of
    /// spinning against a façade that will never admit them again.
    pub running: &'a AtomicBool,
}

/// The single suspension point named in spec.md §4.4/§5: polls
/// `ComposedTryReserve` with an adaptive delay (starting at 5 ms, capped by
/// the smaller of the nearest window reset and `max_wait_ms/8`) until
/// either a reservation succeeds or the deadline elapses.
async fn wait_for_capacity_with_custom_reserve(
    scheduler: &Addr<SchedulerActor>,
    model: &ModelId,
    job_type: &JobTypeId,
    max_wait_ms: Option<u64>,
) -> Option<ReservationContext> {
    let deadline = max_wait_ms.map(|ms| tokio::time::Instant::now() + Duration::from_millis(ms));
    let mut delay_ms: u64 = 5;

    loop {
        if let Ok(Some(ctx)) = scheduler.send(ComposedTryReserve { model: model.clone(), job_type: job_type.clone() }).await {
            return Some(ctx);
        }
        if let Some(deadline) = deadline {
            if tokio::time::Instant::now() >= deadline {
                return None;
            }
        }

        let time_to_reset = scheduler.send(MinNonzeroTimeToReset { model: model.clone() }).await.ok().flatten();
        let eighth_of_budget = max_wait_ms.map(|ms| (ms / 8).max(1));
        let cap = match (time_to_reset, eighth_of_budget) {
            (Some(a), Some(b)) => a.min(b),
            (Some(a), None) => a,
            (None, Some(b)) => b,
            (None, None) => 1000,
        }
        .max(1);
        delay_ms = delay_ms.min(cap);

        let mut sleep_for = Duration::from_millis(delay_ms);
        if let Some(deadline) = deadline {
            sleep_for = sleep_for.min(deadline.saturating_duration_since(tokio::time::Instant::now()));
        }
        tokio::time::sleep(sleep_for).await;
        delay_ms = (delay_ms * 2).min(cap);
    }
}

/// Drives one job through the full escalation/delegation loop (spec.md
/// §4.7). `job_fn` may be invoked more than once: once per model attempt.
#[instrument(level = "info", skip(ctx, job_fn), fields(job_id = %job_id, job_type = %job_type_name))]
pub async fn run_job<F, Fut, T>(
    ctx: &DelegationContext<'_>,
    job_id: JobId,
    job_type_name: String,
    job_fn: F,
) -> Result<LlmJobResult<T>>
where
    F: Fn(JobContext) -> Fut,
    Fut: Future<Output = JobOutcome<T>>,
{
    let job_type = JobTypeId::new(job_type_name.clone());
    let estimate = ctx
        .estimates
        .get(&job_type_name)
        .ok_or_else(|| LlmAdmissionError::UnknownJobType(job_type_name.clone()))?;
    let memory_estimate = estimate.estimated_used_memory_kb.unwrap_or(0);

    let mut tried: HashSet<ModelId> = HashSet::new();
    let mut usage_entries = Vec::new();
    let mut total_cost = 0.0;

    loop {
        let mut any_reserved_this_pass = false;

        for model in ctx.escalation_order {
            if !ctx.running.load(Ordering::Relaxed) {
                return Err(LlmAdmissionError::Stopped { job_id });
            }
            if tried.contains(model) {
                continue;
            }

            let immediate = ctx
                .scheduler
                .send(ComposedTryReserve { model: model.clone(), job_type: job_type.clone() })
                .await
                .ok()
                .flatten();

            let reservation = match immediate {
                Some(r) => r,
                None => {
                    let max_wait_ms = estimate.max_wait_ms_for(model);
                    match wait_for_capacity_with_custom_reserve(ctx.scheduler, model, &job_type, max_wait_ms).await {
                        Some(r) => r,
                        None => continue,
                    }
                }
            };
            any_reserved_this_pass = true;

            if memory_estimate > ctx.memory.max_kb() {
                let _ = ctx
                    .scheduler
                    .send(ReleaseReservation { model: model.clone(), job_type: job_type.clone(), ctx: reservation })
                    .await;
                return Err(LlmAdmissionError::MemoryAcquireFailed {
                    job_id,
                    reason: format!(
                        "job type {job_type_name} needs {memory_estimate} KB but the memory pool's ceiling is {} KB",
                        ctx.memory.max_kb()
                    ),
                });
            }
            ctx.memory.acquire(memory_estimate).await;

            let acquire_ctx = AcquireContext {
                instance_id: ctx.instance_id.clone(),
                model_id: model.clone(),
                job_id: job_id.clone(),
                job_type: job_type.clone(),
                estimated_requests: estimate.estimated_number_of_requests,
                estimated_tokens: estimate.estimated_used_tokens,
            };

            if let Some(backend) = ctx.backend {
                if !backend.acquire(&acquire_ctx).await {
                    ctx.memory.release(memory_estimate);
                    let _ = ctx
                        .scheduler
                        .send(ReleaseReservation { model: model.clone(), job_type: job_type.clone(), ctx: reservation })
                        .await;
                    tried.insert(model.clone());
                    if tried.len() == ctx.escalation_order.len() {
                        return Err(LlmAdmissionError::AllModelsRejectedByBackend { job_id });
                    }
                    continue;
                }
            }

            let job_ctx = JobContext { model_id: model.clone(), job_id: job_id.clone(), job_type: job_type.clone() };
            let outcome = job_fn(job_ctx).await;
            let (usage, resolved_value, reject_reason) = match outcome {
                JobOutcome::Resolved { usage, value } => (usage, Some(value), None),
                JobOutcome::Delegate { usage } => (usage, None, None),
                JobOutcome::Rejected { usage, reason } => (usage, None, Some(reason)),
            };

            let _ = ctx
                .scheduler
                .send(CommitReservation {
                    model: model.clone(),
                    job_type: job_type.clone(),
                    ctx: reservation,
                    actual: usage.as_resource_usage(),
                })
                .await;
            ctx.memory.release(memory_estimate);
            if let Some(backend) = ctx.backend {
                let actual = ActualUsage { requests: usage.request_count, tokens: usage.total_tokens() };
                backend.release(&acquire_ctx, &actual).await;
            }

            total_cost += usage.cost(ctx.models.get(model));
            usage_entries.push((model.clone(), usage));

            if let Some(value) = resolved_value {
                info!(model = %model, "job resolved");
                return Ok(LlmJobResult { value, model_used: model.clone(), total_cost, usage_entries });
            }
            if let Some(reason) = reject_reason {
                warn!(model = %model, reason = %reason, "job rejected without delegation");
                return Err(LlmAdmissionError::JobRejectedWithoutDelegation { job_id, reason, accumulated_cost: total_cost });
            }

            // Delegate: this model is done with the job; try the next one.
            tried.insert(model.clone());
        }

        if !any_reserved_this_pass {
            return Err(LlmAdmissionError::AllModelsExhausted { job_id });
        }
        if tried.len() >= ctx.escalation_order.len() {
            tried.clear();
        }
    }
}

/// `queue_job_for_model`: bypass selection entirely (spec.md §4.9). No
/// delegation, no retry, no backend veto, no escalation.
#[instrument(level = "info", skip(ctx, job_fn), fields(job_id = %job_id, model = %model))]
pub async fn run_job_for_model<F, Fut, T>(
    ctx: &DelegationContext<'_>,
    model: ModelId,
    job_id: JobId,
    job_type_name: String,
    job_fn: F,
) -> Result<LlmJobResult<T>>
where
    F: FnOnce(JobContext) -> Fut,
    Fut: Future<Output = JobOutcome<T>>,
{
    let job_type = JobTypeId::new(job_type_name.clone());
    let estimate = ctx
        .estimates
        .get(&job_type_name)
        .ok_or_else(|| LlmAdmissionError::UnknownJobType(job_type_name.clone()))?;
    let memory_estimate = estimate.estimated_used_memory_kb.unwrap_or(0);

    if !ctx.running.load(Ordering::Relaxed) {
        return Err(LlmAdmissionError::Stopped { job_id });
    }

    let max_wait_ms = estimate.max_wait_ms_for(&model);
    let reservation = match ctx.scheduler.send(ComposedTryReserve { model: model.clone(), job_type: job_type.clone() }).await {
        Ok(Some(r)) => r,
        _ => wait_for_capacity_with_custom_reserve(ctx.scheduler, &model, &job_type, max_wait_ms)
            .await
            .ok_or(LlmAdmissionError::AllModelsExhausted { job_id: job_id.clone() })?,
    };

    if memory_estimate > ctx.memory.max_kb() {
        let _ = ctx
            .scheduler
            .send(ReleaseReservation { model: model.clone(), job_type, ctx: reservation })
            .await;
        return Err(LlmAdmissionError::MemoryAcquireFailed {
            job_id,
            reason: format!(
                "job type {job_type_name} needs {memory_estimate} KB but the memory pool's ceiling is {} KB",
                ctx.memory.max_kb()
            ),
        });
    }
    ctx.memory.acquire(memory_estimate).await;

    let job_ctx = JobContext { model_id: model.clone(), job_id: job_id.clone(), job_type: job_type.clone() };
    let outcome = job_fn(job_ctx).await;
    let (usage, resolved_value, reject_reason) = match outcome {
        JobOutcome::Resolved { usage, value } => (usage, Some(value), None),
        JobOutcome::Delegate { usage } => (usage, None, None),
        JobOutcome::Rejected { usage, reason } => (usage, None, Some(reason)),
    };

    let _ = ctx
        .scheduler
        .send(CommitReservation { model: model.clone(), job_type, ctx: reservation, actual: usage.as_resource_usage() })
        .await;
    ctx.memory.release(memory_estimate);

    let total_cost = usage.cost(ctx.models.get(&model));
    match resolved_value {
        Some(value) => Ok(LlmJobResult { value, model_used: model.clone(), total_cost, usage_entries: vec![(model, usage)] }),
        None => Err(LlmAdmissionError::JobRejectedWithoutDelegation {
            job_id,
            reason: reject_reason.unwrap_or_else(|| "delegated with no fallback available".to_string()),
            accumulated_cost: total_cost,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Configuration, PricingConfig, RatioConfig};
    use crate::ids::JobTypeId;
    use crate::memory::default_memory_probe;
    use crate::scheduler_actor::HasCapacityForModel;
    use actix::Actor;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn two_model_config() -> Configuration {
        let mut models = HashMap::new();
        models.insert(
            ModelId::new("primary"),
            ModelConfig {
                requests_per_minute: Some(1),
                tokens_per_minute: Some(1000),
                max_concurrent_requests: Some(1),
                pricing: Some(PricingConfig { input: 0.01, cached: 0.001, output: 0.03 }),
                ..Default::default()
            },
        );
        models.insert(
            ModelId::new("fallback"),
            ModelConfig { requests_per_minute: Some(10), tokens_per_minute: Some(1000), max_concurrent_requests: Some(5), ..Default::default() },
        );
        let mut estimates = HashMap::new();
        estimates.insert(
            "chat".to_string(),
            ResourceEstimate {
                estimated_number_of_requests: 1,
                estimated_used_tokens: 50,
                estimated_used_memory_kb: None,
                ratio: RatioConfig { initial_value: Some(1.0), flexible: false },
                max_wait_ms_per_model: {
                    let mut m = HashMap::new();
                    m.insert(ModelId::new("primary"), 20);
                    m.insert(ModelId::new("fallback"), 20);
                    m
                },
            },
        );
        Configuration {
            models,
            escalation_order: vec![ModelId::new("primary"), ModelId::new("fallback")],
            resource_estimations_per_job: estimates,
            memory: None,
            releases_per_adjustment: None,
            adjustment_interval_ms: None,
        }
    }

    #[actix::test]
    async fn single_model_job_resolves_and_prices_usage() {
        let config = two_model_config();
        let memory = Arc::new(MemoryManager::new(default_memory_probe(), 1.0, 1, 1_000_000));
        let scheduler = SchedulerActor::new(&config, memory.clone(), None).start();
        let escalation_order = config.effective_escalation_order();
        let running = AtomicBool::new(true);

        let ctx = DelegationContext {
            scheduler: &scheduler,
            memory: &memory,
            backend: None,
            instance_id: &InstanceId::new("instance-a"),
            models: &config.models,
            estimates: &config.resource_estimations_per_job,
            escalation_order: &escalation_order,
            running: &running,
        };

        let result = run_job(&ctx, JobId::new("job-1"), "chat".to_string(), |job_ctx| async move {
            assert_eq!(job_ctx.model_id, ModelId::new("primary"));
            JobOutcome::Resolved {
                usage: Usage { request_count: 1, input_tokens: 10, cached_tokens: 0, output_tokens: 20 },
                value: 42,
            }
        })
        .await
        .unwrap();

        assert_eq!(result.value, 42);
        assert_eq!(result.model_used, ModelId::new("primary"));
        assert!((result.total_cost - (10.0 * 0.01 + 20.0 * 0.03)).abs() < 1e-9);
    }

    #[actix::test]
    async fn delegate_falls_through_to_next_model_in_escalation_order() {
        let config = two_model_config();
        let memory = Arc::new(MemoryManager::new(default_memory_probe(), 1.0, 1, 1_000_000));
        let scheduler = SchedulerActor::new(&config, memory.clone(), None).start();
        let escalation_order = config.effective_escalation_order();
        let running = AtomicBool::new(true);

        let ctx = DelegationContext {
            scheduler: &scheduler,
            memory: &memory,
            backend: None,
            instance_id: &InstanceId::new("instance-a"),
            models: &config.models,
            estimates: &config.resource_estimations_per_job,
            escalation_order: &escalation_order,
            running: &running,
        };

        let calls = Arc::new(AtomicU32::new(0));
        let calls_inner = calls.clone();
        let result = run_job(&ctx, JobId::new("job-2"), "chat".to_string(), move |job_ctx| {
            let calls = calls_inner.clone();
            async move {
                let attempt = calls.fetch_add(1, Ordering::SeqCst);
                if job_ctx.model_id == ModelId::new("primary") {
                    assert_eq!(attempt, 0);
                    JobOutcome::Delegate { usage: Usage { request_count: 1, input_tokens: 5, cached_tokens: 0, output_tokens: 5 } }
                } else {
                    JobOutcome::Resolved {
                        usage: Usage { request_count: 1, input_tokens: 1, cached_tokens: 0, output_tokens: 1 },
                        value: "done",
                    }
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(result.model_used, ModelId::new("fallback"));
        assert_eq!(result.value, "done");
        assert_eq!(result.usage_entries.len(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[actix::test]
    async fn rejection_without_delegation_surfaces_accumulated_cost() {
        let config = two_model_config();
        let memory = Arc::new(MemoryManager::new(default_memory_probe(), 1.0, 1, 1_000_000));
        let scheduler = SchedulerActor::new(&config, memory.clone(), None).start();
        let escalation_order = config.effective_escalation_order();
        let running = AtomicBool::new(true);

        let ctx = DelegationContext {
            scheduler: &scheduler,
            memory: &memory,
            backend: None,
            instance_id: &InstanceId::new("instance-a"),
            models: &config.models,
            estimates: &config.resource_estimations_per_job,
            escalation_order: &escalation_order,
            running: &running,
        };

        let err = run_job(&ctx, JobId::new("job-3"), "chat".to_string(), |_job_ctx| async move {
            JobOutcome::<()>::Rejected {
                usage: Usage { request_count: 1, input_tokens: 10, cached_tokens: 0, output_tokens: 0 },
                reason: "caller validation failed".to_string(),
            }
        })
        .await
        .unwrap_err();

        match err {
            LlmAdmissionError::JobRejectedWithoutDelegation { reason, accumulated_cost, .. } => {
                assert_eq!(reason, "caller validation failed");
                assert!(accumulated_cost > 0.0);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[actix::test]
    async fn unknown_job_type_is_rejected_before_any_reservation() {
        let config = two_model_config();
        let memory = Arc::new(MemoryManager::new(default_memory_probe(), 1.0, 1, 1_000_000));
        let scheduler = SchedulerActor::new(&config, memory.clone(), None).start();
        let escalation_order = config.effective_escalation_order();
        let running = AtomicBool::new(true);

        let ctx = DelegationContext {
            scheduler: &scheduler,
            memory: &memory,
            backend: None,
            instance_id: &InstanceId::new("instance-a"),
            models: &config.models,
            estimates: &config.resource_estimations_per_job,
            escalation_order: &escalation_order,
            running: &running,
        };

        let err = run_job(&ctx, JobId::new("job-4"), "nonexistent".to_string(), |_| async move {
            JobOutcome::<()>::Resolved { usage: Usage::default(), value: () }
        })
        .await
        .unwrap_err();

        assert!(matches!(err, LlmAdmissionError::UnknownJobType(_)));
    }

    #[actix::test]
    async fn oversized_memory_estimate_is_rejected_and_releases_reservation() {
        let mut models = HashMap::new();
        models.insert(
            ModelId::new("solo"),
            ModelConfig { max_concurrent_requests: Some(5), requests_per_minute: Some(100), ..Default::default() },
        );
        let mut estimates = HashMap::new();
        estimates.insert(
            "bigjob".to_string(),
            ResourceEstimate {
                estimated_number_of_requests: 1,
                estimated_used_tokens: 10,
                estimated_used_memory_kb: Some(1_000),
                ratio: RatioConfig { initial_value: Some(1.0), flexible: false },
                max_wait_ms_per_model: HashMap::new(),
            },
        );
        let config = Configuration {
            models,
            escalation_order: vec![ModelId::new("solo")],
            resource_estimations_per_job: estimates,
            memory: None,
            releases_per_adjustment: None,
            adjustment_interval_ms: None,
        };

        // min_capacity == max_capacity pins the pool at 100 KB regardless of
        // the probe's reading, well under the job type's 1000 KB estimate.
        let memory = Arc::new(MemoryManager::new(default_memory_probe(), 1.0, 100, 100));
        let scheduler = SchedulerActor::new(&config, memory.clone(), None).start();
        let escalation_order = config.effective_escalation_order();
        let running = AtomicBool::new(true);

        let ctx = DelegationContext {
            scheduler: &scheduler,
            memory: &memory,
            backend: None,
            instance_id: &InstanceId::new("instance-a"),
            models: &config.models,
            estimates: &config.resource_estimations_per_job,
            escalation_order: &escalation_order,
            running: &running,
        };

        let err = run_job(&ctx, JobId::new("job-5"), "bigjob".to_string(), |_| async move {
            JobOutcome::<()>::Resolved { usage: Usage::default(), value: () }
        })
        .await
        .unwrap_err();

        assert!(matches!(err, LlmAdmissionError::MemoryAcquireFailed { .. }));

        let restored = scheduler
            .send(HasCapacityForModel { model: ModelId::new("solo"), job_type: JobTypeId::new("bigjob") })
            .await
            .unwrap();
        assert!(restored, "reservation must be released back when the memory ceiling rejects the job");
    }
}
