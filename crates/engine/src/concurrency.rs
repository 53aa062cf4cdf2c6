//! Concurrency planning module for scrubline
//!
//! Derives how many conversions may run at once from the CPU core count and
//! configuration. Each conversion is one encoder process that already spreads
//! across cores, so the derived limit stays small.

use crate::config::Config;

/// Upper bound for the derived (not explicit) job limit.
const MAX_DERIVED_JOBS: u32 = 4;

/// Concurrency plan derived from configuration and system resources
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConcurrencyPlan {
    /// Total logical CPU cores available
    pub total_cores: u32,
    /// Maximum number of concurrent conversions
    pub max_concurrent_jobs: u32,
}

impl ConcurrencyPlan {
    /// Derive a concurrency plan from configuration, detecting cores via num_cpus.
    pub fn derive(cfg: &Config) -> Self {
        Self::derive_with_cores(cfg, num_cpus::get() as u32)
    }

    /// Derive a plan for a known core count.
    ///
    /// An explicit non-zero `max_concurrent_jobs` wins; otherwise one job per
    /// eight cores, clamped to 1..=4.
    pub fn derive_with_cores(cfg: &Config, total_cores: u32) -> Self {
        let total_cores = total_cores.max(1);
        let max_concurrent_jobs = if cfg.conversion.max_concurrent_jobs > 0 {
            cfg.conversion.max_concurrent_jobs
        } else {
            derive_max_jobs(total_cores)
        };

        Self {
            total_cores,
            max_concurrent_jobs,
        }
    }
}

fn derive_max_jobs(cores: u32) -> u32 {
    (cores / 8).clamp(1, MAX_DERIVED_JOBS)
}
