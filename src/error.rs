use thiserror::Error;

use crate::ids::{JobId, ModelId};

/// Closed error taxonomy for the admission engine (spec §7).
///
/// Every public fallible operation returns `Result<T, LlmAdmissionError>`.
/// Callback failures (Backend `release`/`unregister`, `on_log`,
/// `on_available_slots_change`) are never surfaced through this type — they
/// are swallowed and reported via `on_log` per the propagation policy.
#[derive(Debug, Error)]
pub enum LlmAdmissionError {
    #[error("unknown model: {0}")]
    UnknownModel(ModelId),

    #[error("unknown job type: {0}")]
    UnknownJobType(String),

    #[error("no model admitted job {job_id} within its configured max_wait_ms")]
    AllModelsExhausted { job_id: JobId },

    #[error("every model rejected job {job_id} via the distributed backend")]
    AllModelsRejectedByBackend { job_id: JobId },

    #[error("memory reservation for job {job_id} could never be satisfied: {reason}")]
    MemoryAcquireFailed { job_id: JobId, reason: String },

    #[error("job {job_id} was rejected without delegation: {reason}")]
    JobRejectedWithoutDelegation {
        job_id: JobId,
        reason: String,
        accumulated_cost: f64,
    },

    #[error("the rate limiter was stopped while job {job_id} was pending")]
    Stopped { job_id: JobId },

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("the user job function failed: {0}")]
    JobFailed(String),
}

/// Configuration-time validation failures (spec §3 invariants).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("escalation_order references unknown model {0}")]
    EscalationOrderUnknownModel(ModelId),

    #[error("escalation_order is required once more than one model is configured")]
    EscalationOrderRequired,

    #[error("model {0} does not bound capacity on any dimension")]
    ModelHasNoCapacityBound(ModelId),

    #[error("job type {0} is not present in resource_estimations_per_job")]
    UnknownJobTypeEstimate(String),

    #[error("memory is configured globally but no job type declares estimated_used_memory_kb")]
    MemoryConfiguredWithoutEstimate,

    #[error("models map must not be empty")]
    NoModelsConfigured,
}

pub type Result<T> = std::result::Result<T, LlmAdmissionError>;
