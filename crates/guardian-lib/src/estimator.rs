//! Energy estimation
//!
//! Converts a utilization sample into watts and kWh with a fixed linear
//! model. All constants come from [`EstimatorConfig`] so each hardware class
//! can be calibrated without code changes.

use crate::config::EstimatorConfig;
use crate::models::{EnergyEstimate, UtilizationSample};
use std::time::Duration;

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Linear power model over CPU cores and resident memory
#[derive(Debug, Clone)]
pub struct EnergyEstimator {
    config: EstimatorConfig,
}

impl EnergyEstimator {
    pub fn new(config: EstimatorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EstimatorConfig {
        &self.config
    }

    /// Estimated power draw in watts, never negative
    pub fn power_watts(&self, cpu_cores_used: f64, memory_bytes_used: u64) -> f64 {
        let memory_gb = memory_bytes_used as f64 / BYTES_PER_GB;
        let watts = cpu_cores_used
            * self.config.cpu_tdp_per_core_watts
            * self.config.cpu_efficiency_factor
            + memory_gb * self.config.memory_watts_per_gb;

        if watts.is_finite() {
            watts.max(0.0)
        } else {
            0.0
        }
    }

    /// Energy for a sampling interval at the given power
    pub fn kwh_for_interval(watts: f64, interval: Duration) -> f64 {
        let hours = interval.as_secs_f64() / 3600.0;
        (watts * hours / 1000.0).max(0.0)
    }

    /// Derive the estimate for a sample taken over `interval`
    pub fn estimate(&self, sample: &UtilizationSample, interval: Duration) -> EnergyEstimate {
        let watts = self.power_watts(sample.cpu_cores_used, sample.memory_bytes_used);
        EnergyEstimate {
            workload: sample.workload.clone(),
            timestamp: sample.timestamp,
            estimated_watts: watts,
            estimated_kwh: Self::kwh_for_interval(watts, interval),
        }
    }
}

impl Default for EnergyEstimator {
    fn default() -> Self {
        Self::new(EstimatorConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::WorkloadIdentity;
    use chrono::Utc;

    const GIB: u64 = 1024 * 1024 * 1024;

    fn sample(cpu: f64, mem: u64) -> UtilizationSample {
        UtilizationSample {
            workload: WorkloadIdentity::new("default", "api", "node-1"),
            timestamp: Utc::now(),
            cpu_cores_used: cpu,
            cpu_cores_allocated: 2.0,
            memory_bytes_used: mem,
            memory_bytes_allocated: 4 * GIB,
        }
    }

    #[test]
    fn test_reference_workload_estimate() {
        let estimator = EnergyEstimator::new(EstimatorConfig {
            cpu_tdp_per_core_watts: 15.0,
            cpu_efficiency_factor: 1.0,
            memory_watts_per_gb: 0.3725,
        });

        let estimate = estimator.estimate(&sample(1.0, 2 * GIB), Duration::from_secs(300));

        assert!((estimate.estimated_watts - 15.745).abs() < 1e-9);
        assert!((estimate.estimated_kwh - 0.001_312_083).abs() < 1e-8);
    }

    #[test]
    fn test_idle_workload_is_zero_not_missing() {
        let estimator = EnergyEstimator::default();
        let estimate = estimator.estimate(&sample(0.0, 0), Duration::from_secs(30));
        assert_eq!(estimate.estimated_watts, 0.0);
        assert_eq!(estimate.estimated_kwh, 0.0);
    }

    #[test]
    fn test_negative_result_clamped() {
        let estimator = EnergyEstimator::default();
        assert_eq!(estimator.power_watts(-3.0, 0), 0.0);
    }

    #[test]
    fn test_monotonic_in_cpu_and_memory() {
        let estimator = EnergyEstimator::default();
        let mut previous = 0.0;
        for step in 0..50 {
            let watts = estimator.power_watts(step as f64 * 0.1, 2 * GIB);
            assert!(watts >= previous);
            previous = watts;
        }

        let mut previous = 0.0;
        for step in 0..50 {
            let watts = estimator.power_watts(0.5, step * 128 * 1024 * 1024);
            assert!(watts >= previous);
            previous = watts;
        }
    }

    #[test]
    fn test_efficiency_factor_scales_cpu_term() {
        let estimator = EnergyEstimator::new(EstimatorConfig {
            cpu_tdp_per_core_watts: 95.0,
            cpu_efficiency_factor: 0.7,
            memory_watts_per_gb: 3.0,
        });
        let watts = estimator.power_watts(2.0, GIB);
        assert!((watts - (2.0 * 95.0 * 0.7 + 3.0)).abs() < 1e-9);
    }
}
