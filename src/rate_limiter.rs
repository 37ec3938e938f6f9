//! Public façade (spec §4.9). `RateLimiter` is the only type most embedding
//! applications touch: it owns the `SchedulerActor` address, the shared
//! `MemoryManager`, the optional `DistributedBackend`, and the bookkeeping
//! (`active_jobs`, the memory-recalculation task, the backend subscription)
//! that `delegation::run_job` itself stays oblivious to.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use actix::Actor;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::availability::Availability;
use crate::backend::{Allocation, DistributedBackend};
use crate::config::{Configuration, ModelConfig, ResourceEstimate};
use crate::delegation::{self, DelegationContext, JobContext, JobOutcome, LlmJobResult};
use crate::error::{LlmAdmissionError, Result};
use crate::ids::{InstanceId, JobId, JobTypeId, ModelId};
use crate::memory::{default_memory_probe, MemoryManager};
use crate::scheduler_actor::{
    ApplyAllocation, AvailabilityCallback, GetAvailability, GetJobTypeStats, GetModelStats, HasCapacityForModel,
    JobTypeSnapshot, ModelStatsSnapshot, RecalculateMemory, SchedulerActor,
};

/// Fire-and-forget structured log callback (spec §6 `on_log(message, data?)`).
pub type LogCallback = Arc<dyn Fn(&str, Option<serde_json::Value>) + Send + Sync>;

/// Observability hooks (spec.md §3 row 1, §9 "callbacks instead of
/// subclassing"). Kept separate from `Configuration` because the latter is
/// a plain `serde` struct and function values cannot round-trip through it.
#[derive(Clone, Default)]
pub struct Callbacks {
    pub on_log: Option<LogCallback>,
    pub on_available_slots_change: Option<AvailabilityCallback>,
}

/// One entry of the snapshot returned by `get_active_jobs()`.
#[derive(Debug, Clone)]
pub struct ActiveJob {
    pub job_id: JobId,
    pub job_type: JobTypeId,
    pub model_id: Option<ModelId>,
}

struct Inner {
    scheduler: actix::Addr<SchedulerActor>,
    memory: Arc<MemoryManager>,
    backend: Option<Arc<dyn DistributedBackend>>,
    instance_id: InstanceId,
    models: HashMap<ModelId, ModelConfig>,
    estimates: HashMap<String, ResourceEstimate>,
    escalation_order: Vec<ModelId>,
    callbacks: Callbacks,
    active_jobs: RwLock<HashMap<JobId, ActiveJob>>,
    recalculation_handle: Mutex<Option<JoinHandle<()>>>,
    memory_recalculation_interval_ms: u64,
    running: AtomicBool,
    #[cfg(feature = "csv-export")]
    stats: Mutex<Option<crate::stats::StatsRecorder>>,
}

impl Inner {
    fn fire_log(&self, message: &str, data: Option<serde_json::Value>) {
        let Some(cb) = self.callbacks.on_log.clone() else { return };
        let message = message.to_string();
        // spec §7: callback throws are swallowed, never propagated to the caller.
        if std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| cb(&message, data))).is_err() {
            warn!("on_log callback panicked");
        }
    }
}

/// Thin async wrapper around a single `SchedulerActor` (spec §4.9).
pub struct RateLimiter {
    inner: Arc<Inner>,
}

impl RateLimiter {
    /// Validates `config`, starts the actor, and registers with `backend`
    /// if one is supplied. Does not yet spawn the memory-recalculation loop
    /// or subscribe to backend allocations — call `start()` for that.
    #[instrument(level = "info", skip(config, backend, callbacks))]
    pub fn new(config: Configuration, backend: Option<Arc<dyn DistributedBackend>>, callbacks: Callbacks) -> Result<Self> {
        config.validate()?;

        let memory_cfg = config.memory.clone().unwrap_or_default();
        let memory = Arc::new(MemoryManager::new(
            default_memory_probe(),
            memory_cfg.free_memory_ratio,
            memory_cfg.min_capacity,
            memory_cfg.max_capacity,
        ));

        let scheduler = SchedulerActor::new(&config, memory.clone(), callbacks.on_available_slots_change.clone()).start();
        let instance_id = InstanceId::new(Uuid::new_v4().to_string());

        let inner = Inner {
            scheduler,
            memory,
            backend,
            instance_id,
            models: config.models.clone(),
            estimates: config.resource_estimations_per_job.clone(),
            escalation_order: config.effective_escalation_order(),
            callbacks,
            active_jobs: RwLock::new(HashMap::new()),
            recalculation_handle: Mutex::new(None),
            memory_recalculation_interval_ms: memory_cfg.recalculation_interval_ms,
            running: AtomicBool::new(true),
            #[cfg(feature = "csv-export")]
            stats: Mutex::new(None),
        };

        Ok(RateLimiter { inner: Arc::new(inner) })
    }

    /// Registers with the distributed backend (if any), subscribes to its
    /// allocation stream, and spawns the periodic memory recalculation.
    /// Idempotent in the sense that calling it twice just restarts the
    /// recalculation loop; it does not re-register with the backend twice
    /// and leak a subscription, since callers are expected to call it once.
    #[instrument(level = "info", skip(self))]
    pub async fn start(&self) {
        self.inner.running.store(true, Ordering::Relaxed);

        if let Some(backend) = &self.inner.backend {
            let allocation = backend.register(&self.inner.instance_id).await;
            self.apply_allocation(allocation).await;

            let scheduler = self.inner.scheduler.clone();
            backend
                .subscribe(
                    &self.inner.instance_id,
                    Box::new(move |allocation: Allocation| {
                        let scheduler = scheduler.clone();
                        actix_rt::spawn(async move {
                            let _ = scheduler.send(ApplyAllocation(allocation)).await;
                        });
                    }),
                )
                .await;
        }

        let interval_ms = self.inner.memory_recalculation_interval_ms;
        let scheduler = self.inner.scheduler.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_millis(interval_ms.max(1)));
            loop {
                ticker.tick().await;
                if scheduler.send(RecalculateMemory).await.is_err() {
                    break;
                }
            }
        });
        *self.inner.recalculation_handle.lock().unwrap() = Some(handle);

        self.inner.fire_log("rate limiter started", None);
        info!(instance_id = %self.inner.instance_id, "rate limiter started");
    }

    /// Stops admitting new jobs, aborts the recalculation loop, and makes a
    /// best-effort attempt to unregister from the distributed backend (spec
    /// §7: backend `unregister` failures are swallowed). Jobs already past
    /// admission keep running to completion; jobs still polling for
    /// capacity surface `LlmAdmissionError::Stopped`.
    #[instrument(level = "info", skip(self))]
    pub async fn stop(&self) {
        self.inner.running.store(false, Ordering::Relaxed);

        if let Some(handle) = self.inner.recalculation_handle.lock().unwrap().take() {
            handle.abort();
        }

        if let Some(backend) = &self.inner.backend {
            backend.unregister(&self.inner.instance_id).await;
        }

        self.inner.fire_log("rate limiter stopped", None);
        info!("rate limiter stopped");
    }

    async fn apply_allocation(&self, allocation: Allocation) {
        let _ = self.inner.scheduler.send(ApplyAllocation(allocation)).await;
    }

    /// Caller-driven override (spec §4.9): pushes an allocation directly,
    /// bypassing the backend entirely. Emits reason `distributed`.
    #[instrument(level = "debug", skip(self, allocation))]
    pub async fn set_distributed_availability(&self, allocation: Allocation) {
        self.apply_allocation(allocation).await;
    }

    /// Starts the CSV writer thread and directs every subsequent admission
    /// event through it (feature `csv-export`). Safe to call at any point;
    /// events recorded before this call are lost, matching the teacher's
    /// "writer thread joins late, earlier events are simply absent" stance.
    #[cfg(feature = "csv-export")]
    pub fn enable_csv_export(&self, path: impl Into<std::path::PathBuf>) -> std::io::Result<()> {
        let recorder = crate::stats::StatsRecorder::spawn(path)?;
        *self.inner.stats.lock().unwrap() = Some(recorder);
        Ok(())
    }

    #[cfg(feature = "csv-export")]
    fn record_stat(&self, record: crate::stats::StatRecord) {
        if let Some(recorder) = self.inner.stats.lock().unwrap().as_ref() {
            recorder.record(record);
        }
    }

    #[cfg(feature = "csv-export")]
    fn record_outcome<T>(&self, job_id: &JobId, job_type: &str, result: &Result<LlmJobResult<T>>) {
        use crate::stats::{StatEvent, StatRecord};
        let instance = self.inner.instance_id.as_str();
        let record = match result {
            Ok(job_result) => StatRecord::new(instance, StatEvent::Resolved)
                .model(job_result.model_used.as_str())
                .job(job_type, job_id.as_str())
                .cost(job_result.total_cost),
            Err(LlmAdmissionError::AllModelsExhausted { .. }) => {
                StatRecord::new(instance, StatEvent::AllModelsExhausted).job(job_type, job_id.as_str())
            }
            Err(LlmAdmissionError::AllModelsRejectedByBackend { .. }) => {
                StatRecord::new(instance, StatEvent::RejectedByBackend).job(job_type, job_id.as_str())
            }
            Err(LlmAdmissionError::JobRejectedWithoutDelegation { reason, .. }) => {
                StatRecord::new(instance, StatEvent::RejectedWithoutDelegation).job(job_type, job_id.as_str()).reason(reason.clone())
            }
            Err(other) => StatRecord::new(instance, StatEvent::RejectedWithoutDelegation)
                .job(job_type, job_id.as_str())
                .reason(other.to_string()),
        };
        self.record_stat(record);
    }

    fn delegation_context(&self) -> DelegationContext<'_> {
        DelegationContext {
            scheduler: &self.inner.scheduler,
            memory: &self.inner.memory,
            backend: self.inner.backend.as_ref(),
            instance_id: &self.inner.instance_id,
            models: &self.inner.models,
            estimates: &self.inner.estimates,
            escalation_order: &self.inner.escalation_order,
            running: &self.inner.running,
        }
    }

    /// Runs `job_fn` through the full escalation/delegation loop (spec §4.7,
    /// §4.9). `job_type` must be a key of `resource_estimations_per_job`.
    #[instrument(level = "info", skip(self, job_fn), fields(job_id = %job_id, job_type = %job_type))]
    pub async fn queue_job<F, Fut, T>(&self, job_id: JobId, job_type: String, job_fn: F) -> Result<LlmJobResult<T>>
    where
        F: Fn(JobContext) -> Fut,
        Fut: Future<Output = JobOutcome<T>>,
    {
        self.track_job(job_id.clone(), JobTypeId::new(job_type.clone()), None).await;
        let ctx = self.delegation_context();
        let result = delegation::run_job(&ctx, job_id.clone(), job_type.clone(), job_fn).await;
        self.untrack_job(&job_id).await;
        #[cfg(feature = "csv-export")]
        self.record_outcome(&job_id, &job_type, &result);
        result
    }

    /// Bypasses model selection entirely (spec §4.9): reserves on `model`
    /// only, with no delegation and no retry across models.
    #[instrument(level = "info", skip(self, job_fn), fields(job_id = %job_id, model = %model, job_type = %job_type))]
    pub async fn queue_job_for_model<F, Fut, T>(
        &self,
        model: ModelId,
        job_id: JobId,
        job_type: String,
        job_fn: F,
    ) -> Result<LlmJobResult<T>>
    where
        F: FnOnce(JobContext) -> Fut,
        Fut: Future<Output = JobOutcome<T>>,
    {
        self.track_job(job_id.clone(), JobTypeId::new(job_type.clone()), Some(model.clone())).await;
        let ctx = self.delegation_context();
        let result = delegation::run_job_for_model(&ctx, model, job_id.clone(), job_type.clone(), job_fn).await;
        self.untrack_job(&job_id).await;
        #[cfg(feature = "csv-export")]
        self.record_outcome(&job_id, &job_type, &result);
        result
    }

    async fn track_job(&self, job_id: JobId, job_type: JobTypeId, model_id: Option<ModelId>) {
        self.inner.active_jobs.write().await.insert(job_id.clone(), ActiveJob { job_id, job_type, model_id });
    }

    async fn untrack_job(&self, job_id: &JobId) {
        self.inner.active_jobs.write().await.remove(job_id);
    }

    pub async fn has_capacity(&self) -> bool {
        self.inner.scheduler.send(GetAvailability).await.map(|a| a.slots > 0).unwrap_or(false)
    }

    pub async fn has_capacity_for_model(&self, model: &ModelId, job_type: &str) -> bool {
        self.inner
            .scheduler
            .send(HasCapacityForModel { model: model.clone(), job_type: JobTypeId::new(job_type.to_string()) })
            .await
            .unwrap_or(false)
    }

    pub async fn get_stats(&self) -> Availability {
        self.inner.scheduler.send(GetAvailability).await.unwrap_or(Availability {
            slots: 0,
            tpm: None,
            tpd: None,
            rpm: None,
            rpd: None,
            concurrent: None,
            memory_kb: None,
        })
    }

    pub async fn get_model_stats(&self, model: &ModelId) -> Option<ModelStatsSnapshot> {
        self.inner.scheduler.send(GetModelStats { model: model.clone() }).await.ok().flatten()
    }

    pub async fn get_job_type_stats(&self, model: &ModelId) -> Option<HashMap<JobTypeId, JobTypeSnapshot>> {
        self.inner.scheduler.send(GetJobTypeStats { model: model.clone() }).await.ok().flatten()
    }

    pub async fn get_active_jobs(&self) -> Vec<ActiveJob> {
        self.inner.active_jobs.read().await.values().cloned().collect()
    }

    pub fn get_instance_id(&self) -> &InstanceId {
        &self.inner.instance_id
    }
}

impl Clone for RateLimiter {
    fn clone(&self) -> Self {
        RateLimiter { inner: self.inner.clone() }
    }
}
