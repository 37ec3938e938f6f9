//! Distributed allocation protocol (spec §4.8).

pub mod memory;
#[cfg(feature = "redis-backend")]
pub mod redis_backend;

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::ids::{InstanceId, JobId, JobTypeId, ModelId};

/// Per-model dynamic limits a pool owner may push down to an instance
/// (spec §6 `allocations[id]`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DynamicLimits {
    pub tokens_per_minute: Option<u64>,
    pub tokens_per_day: Option<u64>,
    pub requests_per_minute: Option<u64>,
    pub requests_per_day: Option<u64>,
    pub max_concurrent_requests: Option<u64>,
}

/// The per-instance share of the global pool (spec §3 `InstanceAllocation`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Allocation {
    pub instance_count: u64,
    pub dynamic_limits: HashMap<ModelId, DynamicLimits>,
}

/// Context passed to `acquire`/`release` (spec §4.8).
#[derive(Debug, Clone)]
pub struct AcquireContext {
    pub instance_id: InstanceId,
    pub model_id: ModelId,
    pub job_id: JobId,
    pub job_type: JobTypeId,
    pub estimated_requests: u64,
    pub estimated_tokens: u64,
}

#[derive(Debug, Clone, Default)]
pub struct ActualUsage {
    pub requests: u64,
    pub tokens: u64,
}

/// External pool coordinator contract (spec §4.8). Implementations must
/// swallow errors from `release`/`unregister` — those are best-effort per
/// spec §7.
#[async_trait]
pub trait DistributedBackend: Send + Sync {
    async fn register(&self, instance_id: &InstanceId) -> Allocation;

    async fn unregister(&self, instance_id: &InstanceId);

    /// Subscribes to allocation changes; `callback` is invoked on every
    /// published update (spec §4.8 ordering: subscribers see allocations
    /// in publish order).
    async fn subscribe(&self, instance_id: &InstanceId, callback: Box<dyn Fn(Allocation) + Send + Sync>);

    /// Optional admission veto; may block briefly.
    async fn acquire(&self, ctx: &AcquireContext) -> bool;

    async fn release(&self, ctx: &AcquireContext, actual: &ActualUsage);
}

/// `allocation.instance_count < observed_instance_count` is the "no
/// shrinking on stale" guard (spec §4.8, §8 invariant 7).
pub fn is_stale(allocation: &Allocation, observed_instance_count: u64) -> bool {
    allocation.instance_count == 0 || allocation.instance_count < observed_instance_count
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_allocation_detected() {
        assert!(is_stale(&Allocation { instance_count: 2, dynamic_limits: HashMap::new() }, 3));
        assert!(!is_stale(&Allocation { instance_count: 3, dynamic_limits: HashMap::new() }, 3));
        assert!(!is_stale(&Allocation { instance_count: 4, dynamic_limits: HashMap::new() }, 3));
    }

    #[test]
    fn zero_instance_count_is_always_stale() {
        assert!(is_stale(&Allocation { instance_count: 0, dynamic_limits: HashMap::new() }, 0));
    }
}
