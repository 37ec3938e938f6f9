//! Redis-backed `DistributedBackend` (spec §4.8, §6), behind the
//! `redis-backend` feature.
//!
//! Liveness and reallocation are driven by three Lua scripts evaluated
//! server-side so that a whole instance-set-and-reallocate round trips
//! atomically even with multiple instances hitting Redis concurrently. The
//! scripts themselves live next to this module as plain `.lua` text so they
//! can be read by operators without digging through Rust string literals.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{instrument, warn};

use super::{AcquireContext, ActualUsage, Allocation, DistributedBackend, DynamicLimits};
use crate::ids::{InstanceId, ModelId};

const REAP_AND_REALLOCATE: &str = include_str!("scripts/reap_and_reallocate.lua");
const ACQUIRE_JOB_TYPE: &str = include_str!("scripts/acquire_job_type.lua");
const RELEASE_JOB_TYPE: &str = include_str!("scripts/release_job_type.lua");

/// Per-model capacity as configured on the shared pool, keyed by model id in
/// Redis under `pool:{pool_key}:capacity:{model_id}`.
#[derive(Debug, Clone, Default)]
pub struct GlobalModelCapacity {
    pub tokens_per_minute: Option<u64>,
    pub tokens_per_day: Option<u64>,
    pub requests_per_minute: Option<u64>,
    pub requests_per_day: Option<u64>,
    pub max_concurrent_requests: Option<u64>,
}

pub struct RedisBackend {
    pool_key: String,
    conn: AsyncMutex<ConnectionManager>,
    pubsub_client: Client,
    reap_script: Script,
    acquire_script: Script,
    release_script: Script,
    instance_ttl_secs: u64,
}

impl RedisBackend {
    pub async fn connect(redis_url: &str, pool_key: impl Into<String>) -> redis::RedisResult<Self> {
        let client = Client::open(redis_url)?;
        let conn = ConnectionManager::new(client.clone()).await?;
        Ok(RedisBackend {
            pool_key: pool_key.into(),
            conn: AsyncMutex::new(conn),
            pubsub_client: client,
            reap_script: Script::new(REAP_AND_REALLOCATE),
            acquire_script: Script::new(ACQUIRE_JOB_TYPE),
            release_script: Script::new(RELEASE_JOB_TYPE),
            instance_ttl_secs: 30,
        })
    }

    pub fn with_instance_ttl_secs(mut self, ttl: u64) -> Self {
        self.instance_ttl_secs = ttl;
        self
    }

    fn channel(&self) -> String {
        format!("pool:{}:allocations", self.pool_key)
    }

    pub async fn set_global_capacity(&self, model_id: &ModelId, cap: &GlobalModelCapacity) -> redis::RedisResult<()> {
        let key = format!("pool:{}:capacity:{}", self.pool_key, model_id.as_str());
        let payload = serde_json::to_string(cap).unwrap_or_default();
        let mut conn = self.conn.lock().await;
        conn.set::<_, _, ()>(key, payload).await
    }
}

impl serde::Serialize for GlobalModelCapacity {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;
        let mut st = s.serialize_struct("GlobalModelCapacity", 5)?;
        st.serialize_field("tokens_per_minute", &self.tokens_per_minute)?;
        st.serialize_field("tokens_per_day", &self.tokens_per_day)?;
        st.serialize_field("requests_per_minute", &self.requests_per_minute)?;
        st.serialize_field("requests_per_day", &self.requests_per_day)?;
        st.serialize_field("max_concurrent_requests", &self.max_concurrent_requests)?;
        st.end()
    }
}

#[async_trait]
impl DistributedBackend for RedisBackend {
    /// Runs `reap_and_reallocate.lua`: registers `instance_id` with a
    /// refreshed TTL, expires anything past its heartbeat window, and
    /// divides every configured model's capacity by the resulting live
    /// count (spec §6).
    #[instrument(level = "debug", skip(self))]
    async fn register(&self, instance_id: &InstanceId) -> Allocation {
        let mut conn = self.conn.lock().await;
        let raw: String = match self
            .reap_script
            .key(format!("pool:{}", self.pool_key))
            .arg(instance_id.as_str())
            .arg(self.instance_ttl_secs)
            .invoke_async(&mut *conn)
            .await
        {
            Ok(v) => v,
            Err(err) => {
                warn!(error = %err, "reap_and_reallocate failed, falling back to single-instance allocation");
                return Allocation { instance_count: 1, dynamic_limits: HashMap::new() };
            }
        };
        serde_json::from_str(&raw).unwrap_or_default()
    }

    #[instrument(level = "debug", skip(self))]
    async fn unregister(&self, instance_id: &InstanceId) {
        let mut conn = self.conn.lock().await;
        let key = format!("pool:{}:instances", self.pool_key);
        let _: redis::RedisResult<()> = conn.hdel(key, instance_id.as_str()).await;
    }

    async fn subscribe(&self, _instance_id: &InstanceId, callback: Box<dyn Fn(Allocation) + Send + Sync>) {
        let channel = self.channel();
        let client = self.pubsub_client.clone();
        tokio::spawn(async move {
            let Ok(mut pubsub) = client.get_async_pubsub().await else {
                warn!("failed to open redis pub/sub connection");
                return;
            };
            if pubsub.subscribe(&channel).await.is_err() {
                warn!(channel = %channel, "failed to subscribe to allocation channel");
                return;
            }
            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                if let Ok(payload) = msg.get_payload::<String>() {
                    if let Ok(allocation) = serde_json::from_str::<Allocation>(&payload) {
                        callback(allocation);
                    }
                }
            }
        });
    }

    /// Runs `acquire_job_type.lua`: a cheap server-side veto so a
    /// pool-wide job-type cap can be enforced even though each instance
    /// locally only sees its own share.
    async fn acquire(&self, ctx: &AcquireContext) -> bool {
        let mut conn = self.conn.lock().await;
        self.acquire_script
            .key(format!("pool:{}:jobtype:{}", self.pool_key, ctx.job_type.as_str()))
            .arg(ctx.instance_id.as_str())
            .arg(ctx.job_id.as_str())
            .invoke_async(&mut *conn)
            .await
            .unwrap_or(true)
    }

    async fn release(&self, ctx: &AcquireContext, actual: &ActualUsage) {
        let mut conn = self.conn.lock().await;
        let _: redis::RedisResult<()> = self
            .release_script
            .key(format!("pool:{}:jobtype:{}", self.pool_key, ctx.job_type.as_str()))
            .arg(ctx.instance_id.as_str())
            .arg(ctx.job_id.as_str())
            .arg(actual.requests)
            .arg(actual.tokens)
            .invoke_async(&mut *conn)
            .await;
    }
}

#[allow(dead_code)]
fn _type_assertions(_: Arc<RedisBackend>) {}
