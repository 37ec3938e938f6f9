//! Per-model job-type ratio engine (spec §4.6).

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::{debug, instrument};

use crate::config::ResourceEstimate;
use crate::ids::JobTypeId;
use crate::model_limiter::ModelLimiter;

#[derive(Debug, Clone, Copy)]
pub struct JobTypeKnobs {
    pub min_ratio: f64,
    pub high_threshold: f64,
    pub low_threshold: f64,
    pub max_adjustment: f64,
    pub releases_per_adjustment: u32,
    pub adjustment_interval: Duration,
}

impl Default for JobTypeKnobs {
    fn default() -> Self {
        JobTypeKnobs {
            min_ratio: 0.05,
            high_threshold: 0.8,
            low_threshold: 0.3,
            max_adjustment: 0.1,
            releases_per_adjustment: 10,
            adjustment_interval: Duration::from_millis(5000),
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobTypeState {
    pub current_ratio: f64,
    pub initial_ratio: f64,
    pub flexible: bool,
    pub in_flight: u64,
    pub allocated_slots: u64,
    pub resources: ResourceEstimate,
}

pub struct JobTypeManager {
    states: HashMap<JobTypeId, JobTypeState>,
    knobs: JobTypeKnobs,
    releases_since_adjustment: u32,
    last_adjustment: Instant,
}

impl JobTypeManager {
    /// Normalizes ratios per spec §4.6: explicit `initial_value`s sum to
    /// `S`; the remaining `(1 - S)` is split evenly across job types that
    /// didn't specify one. Then clamps into `[min_ratio, 1]`.
    pub fn new(estimates: &HashMap<String, ResourceEstimate>, knobs: JobTypeKnobs) -> Self {
        let explicit_sum: f64 = estimates.values().filter_map(|e| e.ratio.initial_value).sum();
        let unspecified_count = estimates.values().filter(|e| e.ratio.initial_value.is_none()).count();
        let remainder_share = if unspecified_count > 0 {
            (1.0 - explicit_sum).max(0.0) / unspecified_count as f64
        } else {
            0.0
        };

        let mut states = HashMap::new();
        for (name, estimate) in estimates {
            let raw_ratio = estimate.ratio.initial_value.unwrap_or(remainder_share);
            let ratio = raw_ratio.clamp(knobs.min_ratio, 1.0);
            states.insert(
                JobTypeId::new(name.clone()),
                JobTypeState {
                    current_ratio: ratio,
                    initial_ratio: ratio,
                    flexible: estimate.ratio.flexible,
                    in_flight: 0,
                    allocated_slots: 0,
                    resources: estimate.clone(),
                },
            );
        }

        let mut jtm = JobTypeManager { states, knobs, releases_since_adjustment: 0, last_adjustment: Instant::now() };
        jtm.renormalize();
        jtm
    }

    fn renormalize(&mut self) {
        let sum: f64 = self.states.values().map(|s| s.current_ratio).sum();
        if sum > 0.0 {
            for state in self.states.values_mut() {
                state.current_ratio /= sum;
            }
        }
    }

    pub fn ratio_sum(&self) -> f64 {
        self.states.values().map(|s| s.current_ratio).sum()
    }

    pub fn state(&self, job_type: &JobTypeId) -> Option<&JobTypeState> {
        self.states.get(job_type)
    }

    /// Recomputes `allocated_slots` for every job type from the model's
    /// current per-dimension pool. Each dimension yields a candidate slot
    /// count `floor(pool_dim * ratio / estimate_dim)`; the binding
    /// dimension is the minimum across all configured dimensions (spec
    /// §4.6). This is deliberately an upper-bound estimate, not a
    /// utilization-aware hard capacity (spec §9 Open Question).
    #[instrument(level = "debug", skip(self, limiter))]
    pub fn recompute_allocated_slots(&mut self, limiter: &mut ModelLimiter) {
        let rpm_limit = limiter.rpm_limit();
        let rpd_limit = limiter.rpd_limit();
        let tpm_limit = limiter.tpm_limit();
        let tpd_limit = limiter.tpd_limit();
        let concurrency_max = limiter.concurrency_max();

        for state in self.states.values_mut() {
            let mut candidates = Vec::with_capacity(5);
            let reqs = state.resources.estimated_number_of_requests.max(1);
            let toks = state.resources.estimated_used_tokens;

            if let Some(limit) = rpm_limit {
                candidates.push(dimension_slots(limit, state.current_ratio, reqs));
            }
            if let Some(limit) = rpd_limit {
                candidates.push(dimension_slots(limit, state.current_ratio, reqs));
            }
            if toks > 0 {
                if let Some(limit) = tpm_limit {
                    candidates.push(dimension_slots(limit, state.current_ratio, toks));
                }
                if let Some(limit) = tpd_limit {
                    candidates.push(dimension_slots(limit, state.current_ratio, toks));
                }
            }
            if let Some(max) = concurrency_max {
                candidates.push(((max as f64) * state.current_ratio).floor() as u64);
            }

            state.allocated_slots = candidates.into_iter().min().unwrap_or(0);
            debug!(job_type = %"recomputed", allocated_slots = state.allocated_slots, ratio = state.current_ratio);
        }
    }

    pub fn has_capacity_for_model(&self, job_type: &JobTypeId) -> bool {
        match self.states.get(job_type) {
            Some(state) => state.in_flight < state.allocated_slots,
            None => false,
        }
    }

    pub fn acquire_for_model(&mut self, job_type: &JobTypeId) {
        if let Some(state) = self.states.get_mut(job_type) {
            state.in_flight += 1;
        }
    }

    /// Returns `true` if this release should trigger a rebalance (either
    /// the release-count threshold or the time interval has elapsed).
    pub fn release_for_model(&mut self, job_type: &JobTypeId) -> bool {
        if let Some(state) = self.states.get_mut(job_type) {
            state.in_flight = state.in_flight.saturating_sub(1);
        }
        self.releases_since_adjustment += 1;
        let due_by_count = self.releases_since_adjustment >= self.knobs.releases_per_adjustment;
        let due_by_time = self.last_adjustment.elapsed() >= self.knobs.adjustment_interval;
        due_by_count || due_by_time
    }

    /// Donor/receiver rebalance (spec §4.6 steps 1-5). Ratios are local to
    /// this instance by design.
    #[instrument(level = "debug", skip(self))]
    pub fn adjust_ratios(&mut self) {
        self.releases_since_adjustment = 0;
        self.last_adjustment = Instant::now();

        let load: HashMap<JobTypeId, f64> = self
            .states
            .iter()
            .map(|(id, s)| {
                let l = if s.allocated_slots == 0 { 0.0 } else { s.in_flight as f64 / s.allocated_slots as f64 };
                (id.clone(), l)
            })
            .collect();

        let receivers: Vec<JobTypeId> = self
            .states
            .iter()
            .filter(|(id, s)| s.flexible && load[*id] > self.knobs.high_threshold)
            .map(|(id, _)| id.clone())
            .collect();
        let donors: Vec<JobTypeId> = self
            .states
            .iter()
            .filter(|(id, s)| s.flexible && load[*id] < self.knobs.low_threshold)
            .map(|(id, _)| id.clone())
            .collect();

        if receivers.is_empty() || donors.is_empty() {
            return;
        }

        let total_demand: f64 = receivers.iter().map(|id| load[id]).sum();
        let total_surplus: f64 = donors
            .iter()
            .map(|id| (self.knobs.low_threshold - load[id]).max(0.0))
            .sum();
        if total_demand <= 0.0 || total_surplus <= 0.0 {
            return;
        }

        let mut moved_total = 0.0;
        for donor_id in &donors {
            let surplus = (self.knobs.low_threshold - load[donor_id]).max(0.0);
            let donor_share = surplus / total_surplus;
            let donor_move = (self.knobs.max_adjustment * donor_share).min(
                self.states[donor_id].current_ratio - self.knobs.min_ratio,
            );
            let donor_move = donor_move.max(0.0);
            if donor_move <= 0.0 {
                continue;
            }
            self.states.get_mut(donor_id).unwrap().current_ratio -= donor_move;
            moved_total += donor_move;
        }

        for receiver_id in receivers {
            let demand = load[&receiver_id];
            let receiver_share = demand / total_demand;
            let receiver_gain = moved_total * receiver_share;
            self.states.get_mut(&receiver_id).unwrap().current_ratio += receiver_gain;
        }

        self.renormalize();
    }
}

fn dimension_slots(limit: u64, ratio: f64, estimate_amount: u64) -> u64 {
    if estimate_amount == 0 {
        return u64::MAX;
    }
    ((limit as f64) * ratio / (estimate_amount as f64)).floor() as u64
}
