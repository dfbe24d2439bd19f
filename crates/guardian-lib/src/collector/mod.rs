//! Utilization sampling from the cluster's resource-metrics API
//!
//! A [`MetricsSource`] returns raw per-workload readings; the [`Sampler`]
//! bounds the call with a timeout and clamps every reading before it reaches
//! the estimator. Readings beyond the configured multiple of the allocation
//! are treated as missing, never propagated.

mod metrics_server;
mod quantity;


pub use metrics_server::{workload_name_for_pod, KubeMetricsSource};
pub use quantity::{parse_cpu_cores, parse_memory_bytes};

use crate::config::SamplerConfig;
use crate::error::{SampleError, SourceError};
use crate::models::{UtilizationSample, WorkloadIdentity};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

/// Raw reading as reported by the source, before clamping
#[derive(Debug, Clone, PartialEq)]
pub struct RawUsage {
    pub workload: WorkloadIdentity,
    pub timestamp: DateTime<Utc>,
    pub cpu_cores_used: f64,
    pub cpu_cores_allocated: f64,
    pub memory_bytes_used: f64,
    pub memory_bytes_allocated: f64,
}

/// Everything a source returned for one query
#[derive(Debug, Clone, Default)]
pub struct SourceBatch {
    pub readings: Vec<RawUsage>,
    /// Workloads the source saw but could not read
    pub errors: Vec<(WorkloadIdentity, String)>,
}

/// Workload set and time range for a query
#[derive(Debug, Clone)]
pub struct SampleQuery {
    /// `None` selects every workload in the sampler's scope
    pub workloads: Option<HashSet<WorkloadIdentity>>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl SampleQuery {
    pub fn all(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            workloads: None,
            start,
            end,
        }
    }

    pub fn includes(&self, workload: &WorkloadIdentity) -> bool {
        self.workloads
            .as_ref()
            .map(|set| set.contains(workload))
            .unwrap_or(true)
    }

    pub fn in_range(&self, timestamp: DateTime<Utc>) -> bool {
        timestamp >= self.start && timestamp <= self.end
    }
}

/// Trait for utilization sources
#[async_trait]
pub trait MetricsSource: Send + Sync {
    /// Read current utilization for the workloads selected by `query`
    async fn query(&self, query: &SampleQuery) -> Result<SourceBatch, SourceError>;
}

/// Clamped samples plus the workloads whose readings were rejected
#[derive(Debug, Clone, Default)]
pub struct SampleSet {
    pub samples: Vec<UtilizationSample>,
    pub errors: Vec<(WorkloadIdentity, SampleError)>,
}

/// Reads the source once per tick and sanitizes the readings
pub struct Sampler {
    source: Arc<dyn MetricsSource>,
    config: SamplerConfig,
}

impl Sampler {
    pub fn new(source: Arc<dyn MetricsSource>, config: SamplerConfig) -> Self {
        Self { source, config }
    }

    pub fn config(&self) -> &SamplerConfig {
        &self.config
    }

    /// Sample every workload for the interval ending at `now`
    pub async fn sample(&self, now: DateTime<Utc>) -> Result<SampleSet, SourceError> {
        let interval = chrono::Duration::seconds(self.config.sample_interval_secs as i64);
        self.sample_query(&SampleQuery::all(now - interval, now)).await
    }

    /// Run `query` against the source with the configured timeout
    pub async fn sample_query(&self, query: &SampleQuery) -> Result<SampleSet, SourceError> {
        let timeout = self.config.source_timeout();
        let batch = tokio::time::timeout(timeout, self.source.query(query))
            .await
            .map_err(|_| SourceError::Timeout(self.config.source_timeout_ms))??;

        let mut set = SampleSet::default();
        for (workload, reason) in batch.errors {
            set.errors.push((workload, SampleError::Source(reason)));
        }

        for raw in batch.readings {
            if !query.includes(&raw.workload) {
                continue;
            }
            match clamp_reading(&raw, self.config.usage_ceiling_factor) {
                Ok(sample) => set.samples.push(sample),
                Err(e) => {
                    debug!(workload = %raw.workload, error = %e, "Dropping utilization reading");
                    set.errors.push((raw.workload, e));
                }
            }
        }

        Ok(set)
    }
}

/// Clamp a raw reading into a sample.
///
/// Used values are floored at zero. A used value above `factor` times a
/// positive allocation is rejected as a source glitch. Resources without an
/// allocation are only floored.
pub fn clamp_reading(raw: &RawUsage, factor: f64) -> Result<UtilizationSample, SampleError> {
    let cpu_used = clamp_resource("cpu", raw.cpu_cores_used, raw.cpu_cores_allocated, factor)?;
    let cpu_allocated = sanitize_allocation("cpu", raw.cpu_cores_allocated)?;
    let memory_used = clamp_resource(
        "memory",
        raw.memory_bytes_used,
        raw.memory_bytes_allocated,
        factor,
    )?;
    let memory_allocated = sanitize_allocation("memory", raw.memory_bytes_allocated)?;

    Ok(UtilizationSample {
        workload: raw.workload.clone(),
        timestamp: raw.timestamp,
        cpu_cores_used: cpu_used,
        cpu_cores_allocated: cpu_allocated,
        memory_bytes_used: memory_used.round() as u64,
        memory_bytes_allocated: memory_allocated.round() as u64,
    })
}

fn clamp_resource(
    resource: &'static str,
    used: f64,
    allocated: f64,
    factor: f64,
) -> Result<f64, SampleError> {
    if !used.is_finite() {
        return Err(SampleError::NonFinite { resource });
    }
    let used = used.max(0.0);
    if allocated.is_finite() && allocated > 0.0 && used > allocated * factor {
        return Err(SampleError::OutOfRange {
            resource,
            used,
            allocated,
            factor,
        });
    }
    Ok(used)
}

fn sanitize_allocation(resource: &'static str, allocated: f64) -> Result<f64, SampleError> {
    if !allocated.is_finite() {
        return Err(SampleError::NonFinite { resource });
    }
    Ok(allocated.max(0.0))
}
