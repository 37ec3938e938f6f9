//! Minimal demo binary: configures a two-model escalation chain, queues a
//! handful of jobs, and prints the resulting admission stats. Exercises the
//! façade the way an embedding application would; not part of the library's
//! public contract.

use std::collections::HashMap;
use std::sync::Arc;

use llm_admission_core::config::{Configuration, ModelConfig, PricingConfig, RatioConfig, ResourceEstimate};
use llm_admission_core::delegation::{JobOutcome, Usage};
use llm_admission_core::ids::{JobId, ModelId};
use llm_admission_core::{Callbacks, RateLimiter};

fn demo_config() -> Configuration {
    let mut models = HashMap::new();
    models.insert(
        ModelId::new("primary"),
        ModelConfig {
            requests_per_minute: Some(60),
            tokens_per_minute: Some(50_000),
            max_concurrent_requests: Some(4),
            pricing: Some(PricingConfig { input: 0.000_003, cached: 0.000_000_3, output: 0.000_015 }),
            ..Default::default()
        },
    );
    models.insert(
        ModelId::new("fallback"),
        ModelConfig {
            requests_per_minute: Some(120),
            tokens_per_minute: Some(100_000),
            max_concurrent_requests: Some(8),
            pricing: Some(PricingConfig { input: 0.000_001, cached: 0.000_000_1, output: 0.000_005 }),
            ..Default::default()
        },
    );

    let mut estimates = HashMap::new();
    estimates.insert(
        "chat".to_string(),
        ResourceEstimate {
            estimated_number_of_requests: 1,
            estimated_used_tokens: 500,
            estimated_used_memory_kb: None,
            ratio: RatioConfig { initial_value: Some(1.0), flexible: true },
            max_wait_ms_per_model: HashMap::new(),
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

#[actix::main]
async fn main() {
    llm_admission_core::logger::init();

    let limiter = Arc::new(RateLimiter::new(demo_config(), None, Callbacks::default()).expect("valid configuration"));
    limiter.start().await;

    for i in 0..5 {
        let limiter = limiter.clone();
        let job_id = JobId::new(format!("demo-job-{i}"));
        let result = limiter
            .queue_job(job_id, "chat".to_string(), |job_ctx| async move {
                tracing::info!(model = %job_ctx.model_id, "executing demo job");
                JobOutcome::Resolved {
                    usage: Usage { request_count: 1, input_tokens: 100, cached_tokens: 0, output_tokens: 200 },
                    value: (),
                }
            })
            .await;

        match result {
            Ok(r) => tracing::info!(model_used = %r.model_used, cost = r.total_cost, "job resolved"),
            Err(err) => tracing::warn!(error = %err, "job failed"),
        }
    }

    let stats = limiter.get_stats().await;
    tracing::info!(slots = stats.slots, "final availability snapshot");

    limiter.stop().await;
}
