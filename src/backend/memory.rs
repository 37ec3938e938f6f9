//! In-process reference `DistributedBackend` (spec §4.8).
//!
//! Dependency-free stand-in for a shared K/V store: a single process hosts
//! several `RateLimiter` instances (e.g. in tests, or a single binary
//! fronting several logical workers) and this type plays the role the spec
//! assigns to Redis — heartbeat-based liveness, reap-and-reallocate, and
//! pub/sub fan-out — entirely in memory via a `tokio::sync::broadcast`
//! channel.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::{info, instrument};

use super::{AcquireContext, ActualUsage, Allocation, DistributedBackend, DynamicLimits};
use crate::ids::{InstanceId, ModelId};

fn now_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).expect("clock before epoch").as_millis() as u64
}

#[derive(Debug, Clone, Default)]
pub struct GlobalModelCapacity {
    pub tokens_per_minute: Option<u64>,
    pub tokens_per_day: Option<u64>,
    pub requests_per_minute: Option<u64>,
    pub requests_per_day: Option<u64>,
    pub max_concurrent_requests: Option<u64>,
}

struct Shared {
    instances: HashMap<InstanceId, u64>,
    global_capacities: HashMap<ModelId, GlobalModelCapacity>,
}

pub struct InMemoryBackend {
    shared: Mutex<Shared>,
    tx: broadcast::Sender<Allocation>,
    heartbeat_interval: Duration,
    instance_timeout: Duration,
}

impl InMemoryBackend {
    pub fn new(global_capacities: HashMap<ModelId, GlobalModelCapacity>) -> Self {
        let (tx, _rx) = broadcast::channel(64);
        InMemoryBackend {
            shared: Mutex::new(Shared { instances: HashMap::new(), global_capacities }),
            tx,
            heartbeat_interval: Duration::from_millis(5000),
            instance_timeout: Duration::from_millis(30_000),
        }
    }

    pub fn with_timeouts(mut self, heartbeat_interval: Duration, instance_timeout: Duration) -> Self {
        self.heartbeat_interval = heartbeat_interval;
        self.instance_timeout = instance_timeout;
        self
    }

    pub fn heartbeat(&self, instance_id: &InstanceId) {
        self.shared.lock().unwrap().instances.insert(instance_id.clone(), now_ms());
    }

    /// The atomic reap-and-reallocate script (spec §6): deletes stale
    /// instances, divides every configured model dimension by the live
    /// count, and publishes the result.
    #[instrument(level = "debug", skip(self))]
    pub fn reap_and_reallocate(&self) {
        let allocation = {
            let mut shared = self.shared.lock().unwrap();
            let now = now_ms();
            let timeout_ms = self.instance_timeout.as_millis() as u64;
            shared.instances.retain(|_, last_beat| now.saturating_sub(*last_beat) <= timeout_ms);
            let live_count = shared.instances.len().max(1) as u64;

            let mut dynamic_limits = HashMap::new();
            for (model_id, cap) in &shared.global_capacities {
                dynamic_limits.insert(
                    model_id.clone(),
                    DynamicLimits {
                        tokens_per_minute: cap.tokens_per_minute.map(|v| v / live_count),
                        tokens_per_day: cap.tokens_per_day.map(|v| v / live_count),
                        requests_per_minute: cap.requests_per_minute.map(|v| v / live_count),
                        requests_per_day: cap.requests_per_day.map(|v| v / live_count),
                        max_concurrent_requests: cap.max_concurrent_requests.map(|v| v / live_count),
                    },
                );
            }

            Allocation { instance_count: live_count, dynamic_limits }
        };

        info!(instance_count = allocation.instance_count, "publishing allocation");
        let _ = self.tx.send(allocation);
    }

    pub fn spawn_reaper(self: &std::sync::Arc<Self>) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        let interval = self.heartbeat_interval.max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                this.reap_and_reallocate();
            }
        })
    }
}

#[async_trait]
impl DistributedBackend for InMemoryBackend {
    async fn register(&self, instance_id: &InstanceId) -> Allocation {
        self.heartbeat(instance_id);
        self.reap_and_reallocate();
        let instance_count = self.shared.lock().unwrap().instances.len().max(1) as u64;
        let dynamic_limits = self
            .shared
            .lock()
            .unwrap()
            .global_capacities
            .iter()
            .map(|(id, cap)| {
                (
                    id.clone(),
                    DynamicLimits {
                        tokens_per_minute: cap.tokens_per_minute.map(|v| v / instance_count),
                        tokens_per_day: cap.tokens_per_day.map(|v| v / instance_count),
                        requests_per_minute: cap.requests_per_minute.map(|v| v / instance_count),
                        requests_per_day: cap.requests_per_day.map(|v| v / instance_count),
                        max_concurrent_requests: cap.max_concurrent_requests.map(|v| v / instance_count),
                    },
                )
            })
            .collect();
        Allocation { instance_count, dynamic_limits }
    }

    async fn unregister(&self, instance_id: &InstanceId) {
        self.shared.lock().unwrap().instances.remove(instance_id);
        self.reap_and_reallocate();
    }

    async fn subscribe(&self, _instance_id: &InstanceId, callback: Box<dyn Fn(Allocation) + Send + Sync>) {
        let mut rx = self.tx.subscribe();
        tokio::spawn(async move {
            while let Ok(allocation) = rx.recv().await {
                callback(allocation);
            }
        });
    }

    /// Pool division happens purely via `dynamic_limits`; this reference
    /// backend does not additionally veto individual acquires (spec §4.8:
    /// "may also be a no-op").
    async fn acquire(&self, _ctx: &AcquireContext) -> bool {
        true
    }

    async fn release(&self, _ctx: &AcquireContext, _actual: &ActualUsage) {}
}
