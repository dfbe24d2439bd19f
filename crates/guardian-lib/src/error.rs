//! Error types shared across the agent components

use thiserror::Error;

/// Failure to read from the metrics source as a whole
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("metrics source unavailable: {0}")]
    Unavailable(String),

    #[error("metrics source timed out after {0} ms")]
    Timeout(u64),

    #[error("failed to decode metrics payload: {0}")]
    Decode(String),
}

/// Per-workload reading rejected by the sampler
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SampleError {
    #[error("{resource} reading is not a finite number")]
    NonFinite { resource: &'static str },

    #[error("{resource} usage {used} exceeds {factor}x allocation {allocated}")]
    OutOfRange {
        resource: &'static str,
        used: f64,
        allocated: f64,
        factor: f64,
    },

    #[error("reading rejected by source: {0}")]
    Source(String),
}

/// Kubernetes quantity string that could not be parsed
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid quantity '{0}'")]
pub struct QuantityError(pub String);

/// Failure talking to the recommendation oracle
#[derive(Debug, Error)]
pub enum OracleError {
    #[error("oracle call timed out after {0} ms")]
    Timeout(u64),

    #[error("oracle transport error: {0}")]
    Transport(String),

    #[error("oracle returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("malformed oracle response: {0}")]
    Malformed(String),
}

impl OracleError {
    /// Label used for the exported error counter
    pub fn metric_kind(&self) -> &'static str {
        match self {
            OracleError::Timeout(_) => "oracle_timeout",
            OracleError::Transport(_) | OracleError::Status { .. } => "oracle_transport",
            OracleError::Malformed(_) => "oracle_malformed",
        }
    }
}

/// Failure of a cluster orchestration call
#[derive(Debug, Error)]
pub enum ClusterApiError {
    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("workload {0} not found")]
    NotFound(String),

    #[error("invalid resource state: {0}")]
    InvalidResource(String),

    #[error("cluster API call timed out after {0} ms")]
    Timeout(u64),

    #[error("{0}")]
    Other(String),
}

/// Invalid or unloadable configuration; fatal at startup
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration for '{field}': {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
}

impl ConfigError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oracle_error_metric_kind() {
        assert_eq!(OracleError::Timeout(100).metric_kind(), "oracle_timeout");
        assert_eq!(
            OracleError::Status {
                status: 502,
                body: String::new()
            }
            .metric_kind(),
            "oracle_transport"
        );
        assert_eq!(
            OracleError::Malformed("x".into()).metric_kind(),
            "oracle_malformed"
        );
    }

    #[test]
    fn test_config_error_display_names_field() {
        let err = ConfigError::invalid("estimator.cpu_tdp_per_core_watts", "must be >= 0");
        assert!(err.to_string().contains("cpu_tdp_per_core_watts"));
    }
}
