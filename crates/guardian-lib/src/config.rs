//! Agent configuration
//!
//! Loaded once at startup from defaults, an optional file and `GUARDIAN_`
//! environment variables. Invalid constants are fatal.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default location of the configuration file
pub const DEFAULT_CONFIG_PATH: &str = "/etc/green-guardian/config.yaml";

/// Carbon intensity used when no region table is configured (kg CO2/kWh)
pub const GLOBAL_AVERAGE_INTENSITY: f64 = 0.475;

/// Top-level agent configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardianConfig {
    /// Node name from Kubernetes downward API
    pub node_name: String,
    /// API server port for health/metrics
    pub api_port: u16,
    /// Region used to look up carbon intensity
    pub region: String,
    pub sampler: SamplerConfig,
    pub estimator: EstimatorConfig,
    pub evaluator: EvaluatorConfig,
    pub oracle: OracleConfig,
    pub policy: PolicyConfig,
    pub ledger: LedgerConfig,
}

impl Default for GuardianConfig {
    fn default() -> Self {
        Self {
            node_name: default_node_name(),
            api_port: 8080,
            region: "global".to_string(),
            sampler: SamplerConfig::default(),
            estimator: EstimatorConfig::default(),
            evaluator: EvaluatorConfig::default(),
            oracle: OracleConfig::default(),
            policy: PolicyConfig::default(),
            ledger: LedgerConfig::default(),
        }
    }
}

fn default_node_name() -> String {
    std::env::var("NODE_NAME").unwrap_or_else(|_| "unknown".to_string())
}

/// Which workloads the sampler observes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleScope {
    /// Pods scheduled on this agent's node
    Node,
    /// Every pod in the cluster (central deployment)
    Cluster,
}

impl SampleScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            SampleScope::Node => "node",
            SampleScope::Cluster => "cluster",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    pub sample_interval_secs: u64,
    pub source_timeout_ms: u64,
    /// Usage above this multiple of the allocation is treated as missing
    pub usage_ceiling_factor: f64,
    /// Workloads unseen for this long are garbage-collected
    pub gc_grace_secs: u64,
    pub scope: SampleScope,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            sample_interval_secs: 30,
            source_timeout_ms: 5_000,
            usage_ceiling_factor: 10.0,
            gc_grace_secs: 600,
            scope: SampleScope::Node,
        }
    }
}

impl SamplerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.sample_interval_secs)
    }

    pub fn source_timeout(&self) -> Duration {
        Duration::from_millis(self.source_timeout_ms)
    }
}

/// Hardware constants for the linear power model
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EstimatorConfig {
    pub cpu_tdp_per_core_watts: f64,
    pub cpu_efficiency_factor: f64,
    pub memory_watts_per_gb: f64,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            cpu_tdp_per_core_watts: 15.0,
            cpu_efficiency_factor: 1.0,
            memory_watts_per_gb: 0.3725,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluatorConfig {
    /// Ring buffer length per workload
    pub window_size: usize,
    /// Samples required before leaving warming-up
    pub min_window_samples: usize,
    pub spike_std_dev_threshold: f64,
    pub underutilization_floor: f64,
    pub underutilization_consecutive_count: u32,
    pub flag_expiry_secs: u64,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            window_size: 30,
            min_window_samples: 10,
            spike_std_dev_threshold: 3.0,
            underutilization_floor: 0.1,
            underutilization_consecutive_count: 10,
            flag_expiry_secs: 1_800,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OracleConfig {
    pub endpoint: String,
    /// Bearer token sent with each request
    pub api_key: Option<String>,
    pub timeout_ms: u64,
    pub concurrency_cap: usize,
    pub max_estimates_per_request: usize,
    pub recommendation_ttl_secs: u64,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://recommendation-oracle:9090".to_string(),
            api_key: None,
            timeout_ms: 5_000,
            concurrency_cap: 4,
            max_estimates_per_request: 20,
            recommendation_ttl_secs: 300,
        }
    }
}

impl OracleConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Safety policy enforced by the action controller
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub acceptance_confidence_threshold: f64,
    pub cooldown_secs: u64,
    pub consecutive_failure_limit: u32,
    pub replica_floor: u32,
    pub replica_ceiling: Option<u32>,
    pub min_cpu_millicores: u32,
    pub min_memory_bytes: u64,
    pub hibernation_enabled: bool,
    pub cluster_timeout_ms: u64,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            acceptance_confidence_threshold: 0.7,
            cooldown_secs: 900,
            consecutive_failure_limit: 3,
            replica_floor: 1,
            replica_ceiling: None,
            min_cpu_millicores: 10,
            min_memory_bytes: 16 * 1024 * 1024,
            hibernation_enabled: false,
            cluster_timeout_ms: 10_000,
        }
    }
}

impl PolicyConfig {
    pub fn cooldown(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.cooldown_secs as i64)
    }

    pub fn cluster_timeout(&self) -> Duration {
        Duration::from_millis(self.cluster_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// kg CO2 per kWh keyed by region
    pub region_carbon_intensity: HashMap<String, f64>,
    pub price_per_kwh: f64,
    pub currency: String,
    /// Horizon over which an action's watt delta is projected
    pub savings_projection_hours: f64,
    /// Append-only JSON lines file for action records
    pub audit_log_path: Option<PathBuf>,
    pub audit_log_capacity: usize,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        let region_carbon_intensity = [
            ("global", GLOBAL_AVERAGE_INTENSITY),
            ("us-east", 0.386),
            ("us-west", 0.214),
            ("eu-west", 0.279),
            ("eu-north", 0.045),
            ("ap-south", 0.708),
        ]
        .into_iter()
        .map(|(region, intensity)| (region.to_string(), intensity))
        .collect();

        Self {
            region_carbon_intensity,
            price_per_kwh: 0.12,
            currency: "USD".to_string(),
            savings_projection_hours: 24.0,
            audit_log_path: None,
            audit_log_capacity: 10_000,
        }
    }
}

impl GuardianConfig {
    /// Load configuration from the file named by `GUARDIAN_CONFIG` and environment
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var("GUARDIAN_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));
        Self::load_from(Some(&path))
    }

    /// Load configuration from an optional file plus `GUARDIAN_` environment
    pub fn load_from(path: Option<&Path>) -> Result<Self, ConfigError> {
        let defaults = config::Config::try_from(&GuardianConfig::default())?;

        let mut builder = config::Config::builder().add_source(defaults);
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix("GUARDIAN")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: GuardianConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject constants the agent cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let est = &self.estimator;
        non_negative("estimator.cpu_tdp_per_core_watts", est.cpu_tdp_per_core_watts)?;
        non_negative("estimator.cpu_efficiency_factor", est.cpu_efficiency_factor)?;
        non_negative("estimator.memory_watts_per_gb", est.memory_watts_per_gb)?;

        if self.sampler.sample_interval_secs == 0 {
            return Err(ConfigError::invalid("sampler.sample_interval_secs", "must be > 0"));
        }
        if self.sampler.source_timeout_ms == 0 {
            return Err(ConfigError::invalid("sampler.source_timeout_ms", "must be > 0"));
        }
        if !(self.sampler.usage_ceiling_factor.is_finite() && self.sampler.usage_ceiling_factor >= 1.0)
        {
            return Err(ConfigError::invalid("sampler.usage_ceiling_factor", "must be >= 1"));
        }

        let ev = &self.evaluator;
        if ev.window_size < 2 {
            return Err(ConfigError::invalid("evaluator.window_size", "must be >= 2"));
        }
        if ev.min_window_samples < 2 || ev.min_window_samples > ev.window_size {
            return Err(ConfigError::invalid(
                "evaluator.min_window_samples",
                format!("must be between 2 and window_size ({})", ev.window_size),
            ));
        }
        if !(ev.spike_std_dev_threshold.is_finite() && ev.spike_std_dev_threshold > 0.0) {
            return Err(ConfigError::invalid("evaluator.spike_std_dev_threshold", "must be > 0"));
        }
        unit_interval("evaluator.underutilization_floor", ev.underutilization_floor)?;
        if ev.underutilization_consecutive_count == 0 {
            return Err(ConfigError::invalid(
                "evaluator.underutilization_consecutive_count",
                "must be > 0",
            ));
        }
        if ev.flag_expiry_secs == 0 {
            return Err(ConfigError::invalid("evaluator.flag_expiry_secs", "must be > 0"));
        }

        let oracle = &self.oracle;
        url::Url::parse(&oracle.endpoint)
            .map_err(|e| ConfigError::invalid("oracle.endpoint", e.to_string()))?;
        if oracle.timeout_ms == 0 {
            return Err(ConfigError::invalid("oracle.timeout_ms", "must be > 0"));
        }
        if oracle.concurrency_cap == 0 {
            return Err(ConfigError::invalid("oracle.concurrency_cap", "must be > 0"));
        }
        if oracle.max_estimates_per_request == 0 {
            return Err(ConfigError::invalid("oracle.max_estimates_per_request", "must be > 0"));
        }

        let policy = &self.policy;
        unit_interval(
            "policy.acceptance_confidence_threshold",
            policy.acceptance_confidence_threshold,
        )?;
        if policy.consecutive_failure_limit == 0 {
            return Err(ConfigError::invalid("policy.consecutive_failure_limit", "must be > 0"));
        }
        if let Some(ceiling) = policy.replica_ceiling {
            if ceiling < policy.replica_floor {
                return Err(ConfigError::invalid(
                    "policy.replica_ceiling",
                    format!("must be >= replica_floor ({})", policy.replica_floor),
                ));
            }
        }
        if policy.cluster_timeout_ms == 0 {
            return Err(ConfigError::invalid("policy.cluster_timeout_ms", "must be > 0"));
        }

        let ledger = &self.ledger;
        if !(ledger.price_per_kwh.is_finite() && ledger.price_per_kwh > 0.0) {
            return Err(ConfigError::invalid("ledger.price_per_kwh", "must be > 0"));
        }
        non_negative("ledger.savings_projection_hours", ledger.savings_projection_hours)?;
        for (region, intensity) in &ledger.region_carbon_intensity {
            if !(intensity.is_finite() && *intensity >= 0.0) {
                return Err(ConfigError::invalid(
                    "ledger.region_carbon_intensity",
                    format!("intensity for '{}' must be >= 0", region),
                ));
            }
        }
        if !ledger.region_carbon_intensity.contains_key(&self.region) {
            return Err(ConfigError::invalid(
                "region",
                format!("'{}' has no entry in ledger.region_carbon_intensity", self.region),
            ));
        }
        if ledger.audit_log_capacity == 0 {
            return Err(ConfigError::invalid("ledger.audit_log_capacity", "must be > 0"));
        }

        Ok(())
    }
}

fn non_negative(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(ConfigError::invalid(field, format!("must be a finite value >= 0, got {}", value)))
    }
}

fn unit_interval(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::invalid(field, format!("must be within [0, 1], got {}", value)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = GuardianConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.sampler.interval(), Duration::from_secs(30));
        assert_eq!(config.policy.acceptance_confidence_threshold, 0.7);
    }

    #[test]
    fn test_negative_tdp_rejected() {
        let mut config = GuardianConfig::default();
        config.estimator.cpu_tdp_per_core_watts = -5.0;

        let err = config.validate().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "estimator.cpu_tdp_per_core_watts",
                ..
            }
        ));
    }

    #[test]
    fn test_min_window_larger_than_window_rejected() {
        let mut config = GuardianConfig::default();
        config.evaluator.window_size = 5;
        config.evaluator.min_window_samples = 10;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_region_rejected() {
        let mut config = GuardianConfig::default();
        config.region = "mars-1".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_ceiling_below_floor_rejected() {
        let mut config = GuardianConfig::default();
        config.policy.replica_floor = 3;
        config.policy.replica_ceiling = Some(2);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_yaml_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "node_name: node-a\nregion: eu-north\nestimator:\n  cpu_tdp_per_core_watts: 20.0\npolicy:\n  replica_floor: 2\n  cooldown_secs: 60"
        )
        .unwrap();

        let config = GuardianConfig::load_from(Some(&path)).unwrap();
        assert_eq!(config.node_name, "node-a");
        assert_eq!(config.region, "eu-north");
        assert_eq!(config.estimator.cpu_tdp_per_core_watts, 20.0);
        assert_eq!(config.policy.replica_floor, 2);
        assert_eq!(config.policy.cooldown_secs, 60);
        // Untouched options keep their defaults
        assert_eq!(config.evaluator.window_size, 30);
    }

    #[test]
    fn test_load_from_invalid_file_is_fatal() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "estimator:\n  memory_watts_per_gb: -1.0\n").unwrap();

        assert!(GuardianConfig::load_from(Some(&path)).is_err());
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("absent.yaml");
        let config = GuardianConfig::load_from(Some(&path)).unwrap();
        assert_eq!(config.oracle.concurrency_cap, 4);
    }
}
