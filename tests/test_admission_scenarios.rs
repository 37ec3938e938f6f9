//! End-to-end admission scenarios driven through the public `RateLimiter`
//! façade, grounded in spec.md §8's S1/S3 scenarios.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use llm_admission_core::config::{Configuration, ModelConfig, RatioConfig, ResourceEstimate};
use llm_admission_core::delegation::{JobOutcome, Usage};
use llm_admission_core::ids::{JobId, ModelId};
use llm_admission_core::{Callbacks, LlmAdmissionError, RateLimiter};

fn estimate() -> ResourceEstimate {
    ResourceEstimate {
        estimated_number_of_requests: 1,
        estimated_used_tokens: 0,
        estimated_used_memory_kb: None,
        ratio: RatioConfig { initial_value: Some(1.0), flexible: false },
        max_wait_ms_per_model: HashMap::new(),
    }
}

/// S1 — single model, single job type, resource release: while a job is in
/// flight the model's lone concurrency slot is exhausted; once it resolves,
/// capacity is fully restored.
#[actix::test]
async fn single_model_slot_is_released_after_job_completes() {
    let mut models = HashMap::new();
    models.insert(ModelId::new("A"), ModelConfig { max_concurrent_requests: Some(1), ..Default::default() });
    let mut estimates = HashMap::new();
    estimates.insert("default".to_string(), estimate());

    let config = Configuration {
        models,
        escalation_order: vec![ModelId::new("A")],
        resource_estimations_per_job: estimates,
        memory: None,
        releases_per_adjustment: None,
        adjustment_interval_ms: None,
    };

    let limiter = Arc::new(RateLimiter::new(config, None, Callbacks::default()).unwrap());
    limiter.start().await;

    let model_a = ModelId::new("A");
    assert!(limiter.has_capacity_for_model(&model_a, "default").await);

    let limiter_clone = limiter.clone();
    let handle = tokio::spawn(async move {
        limiter_clone
            .queue_job(JobId::new("s1-job"), "default".to_string(), |_ctx| async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                JobOutcome::Resolved { usage: Usage::default(), value: () }
            })
            .await
    });

    // give the spawned job time to pass admission and start its sleep.
    tokio::time::sleep(Duration::from_millis(40)).await;
    assert!(!limiter.has_capacity_for_model(&model_a, "default").await);

    handle.await.unwrap().unwrap();
    assert!(limiter.has_capacity_for_model(&model_a, "default").await);

    let stats = limiter.get_model_stats(&model_a).await.unwrap();
    assert_eq!(stats.concurrency_available, Some(1));
}

/// S3 — fallback-and-retry cycle: two models, the job function delegates
/// twice before resolving; escalation must wrap back around to A.
#[actix::test]
async fn delegation_wraps_around_escalation_order() {
    let mut models = HashMap::new();
    models.insert(ModelId::new("A"), ModelConfig { max_concurrent_requests: Some(5), requests_per_minute: Some(100), ..Default::default() });
    models.insert(ModelId::new("B"), ModelConfig { max_concurrent_requests: Some(5), requests_per_minute: Some(100), ..Default::default() });
    let mut estimates = HashMap::new();
    estimates.insert("default".to_string(), estimate());

    let config = Configuration {
        models,
        escalation_order: vec![ModelId::new("A"), ModelId::new("B")],
        resource_estimations_per_job: estimates,
        memory: None,
        releases_per_adjustment: None,
        adjustment_interval_ms: None,
    };

    let limiter = RateLimiter::new(config, None, Callbacks::default()).unwrap();
    limiter.start().await;

    let attempts = Arc::new(std::sync::Mutex::new(Vec::new()));
    let calls = AtomicU32::new(0);
    let attempts_clone = attempts.clone();

    let result = limiter
        .queue_job(JobId::new("s3-job"), "default".to_string(), move |job_ctx| {
            let attempts = attempts_clone.clone();
            async move {
                attempts.lock().unwrap().push(job_ctx.model_id.clone());
                let attempt = calls.fetch_add(1, Ordering::SeqCst);
                if attempt < 2 {
                    JobOutcome::Delegate { usage: Usage::default() }
                } else {
                    JobOutcome::Resolved { usage: Usage::default(), value: "done" }
                }
            }
        })
        .await
        .unwrap();

    assert_eq!(result.model_used, ModelId::new("A"));
    let seen: Vec<ModelId> = attempts.lock().unwrap().clone();
    assert_eq!(seen, vec![ModelId::new("A"), ModelId::new("B"), ModelId::new("A")]);
}

/// Every model exhausting its `max_wait_ms` without admission surfaces
/// `AllModelsExhausted` rather than hanging forever.
#[actix::test]
async fn all_models_exhausted_surfaces_when_capacity_never_frees() {
    let mut models = HashMap::new();
    models.insert(ModelId::new("A"), ModelConfig { max_concurrent_requests: Some(1), ..Default::default() });
    let mut estimates = HashMap::new();
    let mut estimate = estimate();
    estimate.max_wait_ms_per_model.insert(ModelId::new("A"), 30);
    estimates.insert("default".to_string(), estimate);

    let config = Configuration {
        models,
        escalation_order: vec![ModelId::new("A")],
        resource_estimations_per_job: estimates,
        memory: None,
        releases_per_adjustment: None,
        adjustment_interval_ms: None,
    };

    let limiter = Arc::new(RateLimiter::new(config, None, Callbacks::default()).unwrap());
    limiter.start().await;

    let blocker = limiter.clone();
    let blocker_handle = tokio::spawn(async move {
        blocker
            .queue_job(JobId::new("blocker"), "default".to_string(), |_ctx| async move {
                tokio::time::sleep(Duration::from_millis(500)).await;
                JobOutcome::Resolved { usage: Usage::default(), value: () }
            })
            .await
    });
    tokio::time::sleep(Duration::from_millis(20)).await;

    let err = limiter
        .queue_job(JobId::new("starved"), "default".to_string(), |_ctx| async move {
            JobOutcome::Resolved { usage: Usage::default(), value: () }
        })
        .await
        .unwrap_err();

    assert!(matches!(err, LlmAdmissionError::AllModelsExhausted { .. }));
    blocker_handle.await.unwrap().unwrap();
}

/// `stop()` causes pending admissions to surface `Stopped`, and is itself
/// idempotent (spec §8 round-trip property).
#[actix::test]
async fn stop_is_idempotent_and_rejects_subsequent_jobs() {
    let mut models = HashMap::new();
    models.insert(ModelId::new("A"), ModelConfig { max_concurrent_requests: Some(1), ..Default::default() });
    let mut estimates = HashMap::new();
    estimates.insert("default".to_string(), estimate());

    let config = Configuration {
        models,
        escalation_order: vec![ModelId::new("A")],
        resource_estimations_per_job: estimates,
        memory: None,
        releases_per_adjustment: None,
        adjustment_interval_ms: None,
    };

    let limiter = RateLimiter::new(config, None, Callbacks::default()).unwrap();
    limiter.start().await;
    limiter.stop().await;
    limiter.stop().await;

    let err = limiter
        .queue_job(JobId::new("after-stop"), "default".to_string(), |_ctx| async move {
            JobOutcome::Resolved { usage: Usage::default(), value: () }
        })
        .await
        .unwrap_err();
    assert!(matches!(err, LlmAdmissionError::Stopped { .. }));
}
