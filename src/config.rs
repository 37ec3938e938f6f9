//! Immutable configuration surface (spec §3, §6).
//!
//! `Configuration` is validated once, at construction, and never mutated
//! afterwards — per-instance dynamic limits arrive later through
//! `ModelLimiter::set_rate_limits`/`set_concurrency_limit`, driven by the
//! distributed backend or `set_distributed_availability`, not by editing
//! this struct.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::ids::ModelId;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingConfig {
    pub input: f64,
    pub cached: f64,
    pub output: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelConfig {
    pub requests_per_minute: Option<u64>,
    pub requests_per_day: Option<u64>,
    pub tokens_per_minute: Option<u64>,
    pub tokens_per_day: Option<u64>,
    pub max_concurrent_requests: Option<u64>,
    pub min_capacity: Option<u64>,
    pub max_capacity: Option<u64>,
    pub pricing: Option<PricingConfig>,
}

impl ModelConfig {
    /// spec §3: "At least one dimension must bound capacity".
    pub fn has_capacity_bound(&self) -> bool {
        self.requests_per_minute.is_some()
            || self.requests_per_day.is_some()
            || self.tokens_per_minute.is_some()
            || self.tokens_per_day.is_some()
            || self.max_concurrent_requests.is_some()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RatioConfig {
    pub initial_value: Option<f64>,
    pub flexible: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceEstimate {
    pub estimated_number_of_requests: u64,
    pub estimated_used_tokens: u64,
    pub estimated_used_memory_kb: Option<u64>,
    #[serde(default)]
    pub ratio: RatioConfig,
    #[serde(default)]
    pub max_wait_ms_per_model: HashMap<ModelId, u64>,
}

impl ResourceEstimate {
    pub fn max_wait_ms_for(&self, model: &ModelId) -> Option<u64> {
        self.max_wait_ms_per_model.get(model).copied()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Fraction of `available_memory_kb()` the memory semaphore may claim.
    pub free_memory_ratio: f64,
    pub recalculation_interval_ms: u64,
    pub min_capacity: u64,
    pub max_capacity: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        MemoryConfig {
            free_memory_ratio: 0.5,
            recalculation_interval_ms: 1000,
            min_capacity: 1,
            max_capacity: u64::MAX,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Configuration {
    pub models: HashMap<ModelId, ModelConfig>,
    pub escalation_order: Vec<ModelId>,
    pub resource_estimations_per_job: HashMap<String, ResourceEstimate>,
    #[serde(default)]
    pub memory: Option<MemoryConfig>,
    #[serde(default)]
    pub releases_per_adjustment: Option<u32>,
    #[serde(default)]
    pub adjustment_interval_ms: Option<u64>,
}

impl Configuration {
    /// Runs every invariant listed in spec §3 row 1 / row 2. Never panics.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.models.is_empty() {
            return Err(ConfigError::NoModelsConfigured);
        }

        // A single-model configuration may omit escalation_order; the engine
        // treats the lone model as the whole order. More than one model
        // requires it explicitly.
        if self.models.len() > 1 && self.escalation_order.is_empty() {
            return Err(ConfigError::EscalationOrderRequired);
        }

        for model_id in &self.escalation_order {
            if !self.models.contains_key(model_id) {
                return Err(ConfigError::EscalationOrderUnknownModel(model_id.clone()));
            }
        }

        for (model_id, model) in &self.models {
            if !model.has_capacity_bound() {
                return Err(ConfigError::ModelHasNoCapacityBound(model_id.clone()));
            }
        }

        if self.memory.is_some() {
            let any_memory_estimate = self
                .resource_estimations_per_job
                .values()
                .any(|e| e.estimated_used_memory_kb.is_some());
            if !any_memory_estimate {
                return Err(ConfigError::MemoryConfiguredWithoutEstimate);
            }
        }

        Ok(())
    }

    /// The effective escalation order: explicit if given, else the single
    /// configured model.
    pub fn effective_escalation_order(&self) -> Vec<ModelId> {
        if !self.escalation_order.is_empty() {
            return self.escalation_order.clone();
        }
        self.models.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model(rpm: u64) -> ModelConfig {
        ModelConfig { requests_per_minute: Some(rpm), ..Default::default() }
    }

    #[test]
    fn rejects_empty_models() {
        let cfg = Configuration {
            models: HashMap::new(),
            escalation_order: vec![],
            resource_estimations_per_job: HashMap::new(),
            memory: None,
            releases_per_adjustment: None,
            adjustment_interval_ms: None,
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::NoModelsConfigured)));
    }

    #[test]
    fn requires_escalation_order_for_multiple_models() {
        let mut models = HashMap::new();
        models.insert(ModelId::new("a"), model(10));
        models.insert(ModelId::new("b"), model(10));
        let cfg = Configuration {
            models,
            escalation_order: vec![],
            resource_estimations_per_job: HashMap::new(),
            memory: None,
            releases_per_adjustment: None,
            adjustment_interval_ms: None,
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::EscalationOrderRequired)));
    }

    #[test]
    fn single_model_without_escalation_order_is_valid() {
        let mut models = HashMap::new();
        models.insert(ModelId::new("solo"), model(10));
        let cfg = Configuration {
            models,
            escalation_order: vec![],
            resource_estimations_per_job: HashMap::new(),
            memory: None,
            releases_per_adjustment: None,
            adjustment_interval_ms: None,
        };
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.effective_escalation_order(), vec![ModelId::new("solo")]);
    }

    #[test]
    fn model_with_no_dimension_is_rejected() {
        let mut models = HashMap::new();
        models.insert(ModelId::new("solo"), ModelConfig::default());
        let cfg = Configuration {
            models,
            escalation_order: vec![],
            resource_estimations_per_job: HashMap::new(),
            memory: None,
            releases_per_adjustment: None,
            adjustment_interval_ms: None,
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::ModelHasNoCapacityBound(_))));
    }
}
