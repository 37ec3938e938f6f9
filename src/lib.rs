//! Multi-dimensional, multi-tenant rate-limiting and job-admission engine
//! for LLM workloads (see `SPEC_FULL.md`).
//!
//! The public entry point is [`rate_limiter::RateLimiter`]: construct it
//! from a [`config::Configuration`], call `start()`, then drive work
//! through `queue_job`/`queue_job_for_model`.

pub mod availability;
pub mod backend;
pub mod config;
pub mod delegation;
pub mod error;
pub mod ids;
pub mod job_type;
pub mod logger;
pub mod memory;
pub mod model_limiter;
pub mod rate_limiter;
pub mod scheduler_actor;
pub mod semaphore;
#[cfg(feature = "csv-export")]
pub mod stats;
pub mod time_window;

pub use config::Configuration;
pub use error::{LlmAdmissionError, Result};
pub use rate_limiter::{Callbacks, RateLimiter};
