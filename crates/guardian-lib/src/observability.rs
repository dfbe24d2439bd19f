//! Observability infrastructure for the green guardian agent
//!
//! Provides:
//! - Prometheus metrics (per-workload power, flag/recommendation/action counts, error counts)
//! - Structured JSON logging with tracing

use crate::models::{
    ActionKind, ActionRecord, Decision, EfficiencyFlag, EnergyEstimate, FlagKind,
    Recommendation, Severity, WorkloadIdentity,
};
use prometheus::{
    Encoder, Gauge, GaugeVec, Histogram, HistogramOpts, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use tracing::{debug, info, warn};

const NAMESPACE: &str = "green_guardian";

/// Histogram buckets for tick and oracle latency (in seconds)
const LATENCY_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
];

const WORKLOAD_LABELS: &[&str] = &["namespace", "workload", "node"];

/// Values of the `kind` label on `errors_total`
pub mod error_kinds {
    pub const SOURCE: &str = "source";
    pub const SAMPLE_REJECTED: &str = "sample_rejected";
    pub const ORACLE_TIMEOUT: &str = "oracle_timeout";
    pub const ORACLE_TRANSPORT: &str = "oracle_transport";
    pub const ORACLE_MALFORMED: &str = "oracle_malformed";
    pub const CLUSTER_APPLY: &str = "cluster_apply";
}

/// Agent metrics for Prometheus exposition
///
/// Each handle owns its registry; clones share the same underlying metrics.
#[derive(Clone)]
pub struct AgentMetrics {
    registry: Registry,
    workload_power_watts: GaugeVec,
    workload_energy_kwh: GaugeVec,
    workloads_monitored: IntGauge,
    flags_total: IntCounterVec,
    recommendations_total: IntCounterVec,
    actions_total: IntCounterVec,
    errors_total: IntCounterVec,
    tick_duration_seconds: Histogram,
    oracle_latency_seconds: Histogram,
    energy_saved_kwh: Gauge,
    carbon_saved_kg: Gauge,
}

impl AgentMetrics {
    /// Create and register every metric in a fresh registry
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let workload_power_watts = GaugeVec::new(
            Opts::new("workload_power_watts", "Estimated power draw per workload")
                .namespace(NAMESPACE),
            WORKLOAD_LABELS,
        )?;
        let workload_energy_kwh = GaugeVec::new(
            Opts::new(
                "workload_energy_kwh",
                "Estimated energy per workload for the last sampling interval",
            )
            .namespace(NAMESPACE),
            WORKLOAD_LABELS,
        )?;
        let workloads_monitored = IntGauge::with_opts(
            Opts::new("workloads_monitored", "Number of workloads currently tracked")
                .namespace(NAMESPACE),
        )?;
        let flags_total = IntCounterVec::new(
            Opts::new("flags_total", "Efficiency flags raised by the evaluator")
                .namespace(NAMESPACE),
            &["kind"],
        )?;
        let recommendations_total = IntCounterVec::new(
            Opts::new("recommendations_total", "Recommendations received from the oracle")
                .namespace(NAMESPACE),
            &["action"],
        )?;
        let actions_total = IntCounterVec::new(
            Opts::new("actions_total", "Action records by decision").namespace(NAMESPACE),
            &["decision"],
        )?;
        let errors_total = IntCounterVec::new(
            Opts::new("errors_total", "Failures by kind").namespace(NAMESPACE),
            &["kind"],
        )?;
        let tick_duration_seconds = Histogram::with_opts(
            HistogramOpts::new("tick_duration_seconds", "Time spent in one control loop tick")
                .namespace(NAMESPACE)
                .buckets(LATENCY_BUCKETS.to_vec()),
        )?;
        let oracle_latency_seconds = Histogram::with_opts(
            HistogramOpts::new("oracle_latency_seconds", "Latency of recommendation oracle calls")
                .namespace(NAMESPACE)
                .buckets(LATENCY_BUCKETS.to_vec()),
        )?;
        let energy_saved_kwh = Gauge::with_opts(
            Opts::new("energy_saved_kwh", "Projected energy saved by accepted actions")
                .namespace(NAMESPACE),
        )?;
        let carbon_saved_kg = Gauge::with_opts(
            Opts::new("carbon_saved_kg", "Projected CO2-equivalent saved by accepted actions")
                .namespace(NAMESPACE),
        )?;

        registry.register(Box::new(workload_power_watts.clone()))?;
        registry.register(Box::new(workload_energy_kwh.clone()))?;
        registry.register(Box::new(workloads_monitored.clone()))?;
        registry.register(Box::new(flags_total.clone()))?;
        registry.register(Box::new(recommendations_total.clone()))?;
        registry.register(Box::new(actions_total.clone()))?;
        registry.register(Box::new(errors_total.clone()))?;
        registry.register(Box::new(tick_duration_seconds.clone()))?;
        registry.register(Box::new(oracle_latency_seconds.clone()))?;
        registry.register(Box::new(energy_saved_kwh.clone()))?;
        registry.register(Box::new(carbon_saved_kg.clone()))?;

        Ok(Self {
            registry,
            workload_power_watts,
            workload_energy_kwh,
            workloads_monitored,
            flags_total,
            recommendations_total,
            actions_total,
            errors_total,
            tick_duration_seconds,
            oracle_latency_seconds,
            energy_saved_kwh,
            carbon_saved_kg,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render the registry in the Prometheus text format
    pub fn encode(&self) -> prometheus::Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }

    pub fn set_workload_estimate(&self, estimate: &EnergyEstimate) {
        let labels = workload_labels(&estimate.workload);
        self.workload_power_watts
            .with_label_values(&labels)
            .set(estimate.estimated_watts);
        self.workload_energy_kwh
            .with_label_values(&labels)
            .set(estimate.estimated_kwh);
    }

    /// Drop the per-workload series of a garbage-collected workload
    pub fn remove_workload(&self, workload: &WorkloadIdentity) {
        let labels = workload_labels(workload);
        let _ = self.workload_power_watts.remove_label_values(&labels);
        let _ = self.workload_energy_kwh.remove_label_values(&labels);
    }

    pub fn set_workloads_monitored(&self, count: usize) {
        self.workloads_monitored.set(count as i64);
    }

    pub fn inc_flag(&self, kind: FlagKind) {
        self.flags_total.with_label_values(&[kind.as_str()]).inc();
    }

    pub fn flag_count(&self, kind: FlagKind) -> u64 {
        self.flags_total.with_label_values(&[kind.as_str()]).get()
    }

    pub fn inc_recommendation(&self, action: ActionKind) {
        self.recommendations_total
            .with_label_values(&[action.as_str()])
            .inc();
    }

    pub fn recommendation_count(&self, action: ActionKind) -> u64 {
        self.recommendations_total
            .with_label_values(&[action.as_str()])
            .get()
    }

    pub fn inc_action(&self, decision: Decision) {
        self.actions_total
            .with_label_values(&[decision.as_str()])
            .inc();
    }

    pub fn action_count(&self, decision: Decision) -> u64 {
        self.actions_total
            .with_label_values(&[decision.as_str()])
            .get()
    }

    /// Increment `errors_total` for one of [`error_kinds`]
    pub fn inc_error(&self, kind: &str) {
        self.errors_total.with_label_values(&[kind]).inc();
    }

    pub fn error_count(&self, kind: &str) -> u64 {
        self.errors_total.with_label_values(&[kind]).get()
    }

    pub fn observe_tick_duration(&self, duration_secs: f64) {
        self.tick_duration_seconds.observe(duration_secs);
    }

    pub fn observe_oracle_latency(&self, duration_secs: f64) {
        self.oracle_latency_seconds.observe(duration_secs);
    }

    pub fn set_savings(&self, energy_kwh: f64, carbon_kg: f64) {
        self.energy_saved_kwh.set(energy_kwh);
        self.carbon_saved_kg.set(carbon_kg);
    }
}

fn workload_labels(workload: &WorkloadIdentity) -> [&str; 3] {
    [
        workload.namespace.as_str(),
        workload.name.as_str(),
        workload.node.as_str(),
    ]
}

/// Structured logger for agent events
///
/// Every line carries a stable `event` field so log pipelines can filter
/// on it without parsing messages.
#[derive(Clone)]
pub struct StructuredLogger {
    node_name: String,
}

impl StructuredLogger {
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
        }
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    /// Log agent startup
    pub fn log_startup(&self, version: &str, workloads_scope: &str) {
        info!(
            event = "agent_started",
            node = %self.node_name,
            agent_version = %version,
            scope = %workloads_scope,
            "Green guardian agent started"
        );
    }

    /// Log agent shutdown
    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "agent_shutdown",
            node = %self.node_name,
            reason = %reason,
            "Green guardian agent shutting down"
        );
    }

    pub fn log_flag(&self, flag: &EfficiencyFlag) {
        let w = &flag.workload;
        match flag.severity {
            Severity::Critical | Severity::High => {
                warn!(
                    event = "efficiency_flag",
                    node = %self.node_name,
                    namespace = %w.namespace,
                    workload = %w.name,
                    kind = %flag.kind,
                    severity = %flag.severity,
                    observed = flag.evidence.observed,
                    expected = flag.evidence.expected,
                    score = flag.evidence.score,
                    samples = flag.evidence.samples,
                    "Efficiency flag raised"
                );
            }
            _ => {
                info!(
                    event = "efficiency_flag",
                    node = %self.node_name,
                    namespace = %w.namespace,
                    workload = %w.name,
                    kind = %flag.kind,
                    severity = %flag.severity,
                    observed = flag.evidence.observed,
                    expected = flag.evidence.expected,
                    score = flag.evidence.score,
                    samples = flag.evidence.samples,
                    "Efficiency flag raised"
                );
            }
        }
    }

    pub fn log_recommendation(&self, recommendation: &Recommendation) {
        let w = &recommendation.workload;
        info!(
            event = "recommendation_received",
            node = %self.node_name,
            namespace = %w.namespace,
            workload = %w.name,
            action = %recommendation.action,
            confidence = recommendation.confidence,
            replicas = ?recommendation.parameters.replicas,
            cpu_millicores = ?recommendation.parameters.cpu_millicores,
            memory_bytes = ?recommendation.parameters.memory_bytes,
            rationale = %recommendation.rationale,
            "Recommendation received"
        );
    }

    pub fn log_action(&self, record: &ActionRecord) {
        let w = record.workload();
        let reason = record.reason.as_deref().unwrap_or("");
        match record.decision {
            Decision::FailedOnApply => {
                warn!(
                    event = "action_recorded",
                    node = %self.node_name,
                    namespace = %w.namespace,
                    workload = %w.name,
                    action = %record.recommendation.action,
                    decision = %record.decision,
                    reason = %reason,
                    "Action failed on apply"
                );
            }
            _ => {
                info!(
                    event = "action_recorded",
                    node = %self.node_name,
                    namespace = %w.namespace,
                    workload = %w.name,
                    action = %record.recommendation.action,
                    decision = %record.decision,
                    reason = %reason,
                    pre_replicas = ?record.pre.replicas,
                    post_replicas = ?record.post.replicas,
                    "Action recorded"
                );
            }
        }
    }

    pub fn log_failure_limit_reached(&self, workload: &WorkloadIdentity, failures: u32) {
        warn!(
            event = "failure_limit_reached",
            node = %self.node_name,
            namespace = %workload.namespace,
            workload = %workload.name,
            consecutive_failures = failures,
            "Consecutive failure limit reached; actions halted until manual reset"
        );
    }

    pub fn log_failure_counter_reset(&self, workload: &WorkloadIdentity, previous: u32) {
        info!(
            event = "failure_counter_reset",
            node = %self.node_name,
            namespace = %workload.namespace,
            workload = %workload.name,
            previous_failures = previous,
            "Failure counter reset"
        );
    }

    pub fn log_tick_failed(&self, stage: &str, error: &str) {
        warn!(
            event = "tick_failed",
            node = %self.node_name,
            stage = %stage,
            error = %error,
            "Control loop tick degraded"
        );
    }

    pub fn log_tick(&self, samples: usize, flags: usize, recommendations: usize, actions: usize) {
        debug!(
            node = %self.node_name,
            samples,
            flags,
            recommendations,
            actions,
            "Tick completed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_agent_metrics_are_isolated_per_handle() {
        let first = AgentMetrics::new().unwrap();
        let second = AgentMetrics::new().unwrap();

        first.inc_error(error_kinds::ORACLE_TIMEOUT);
        assert_eq!(first.error_count(error_kinds::ORACLE_TIMEOUT), 1);
        assert_eq!(second.error_count(error_kinds::ORACLE_TIMEOUT), 0);
    }

    #[test]
    fn test_clones_share_metrics() {
        let metrics = AgentMetrics::new().unwrap();
        let clone = metrics.clone();
        clone.inc_action(Decision::Accepted);
        assert_eq!(metrics.action_count(Decision::Accepted), 1);
    }

    #[test]
    fn test_encode_contains_workload_series() {
        let metrics = AgentMetrics::new().unwrap();
        let workload = WorkloadIdentity::new("shop", "checkout", "node-1");
        metrics.set_workload_estimate(&EnergyEstimate {
            workload: workload.clone(),
            timestamp: Utc::now(),
            estimated_watts: 15.745,
            estimated_kwh: 0.0013,
        });
        metrics.inc_flag(FlagKind::AnomalySpike);

        let text = metrics.encode().unwrap();
        assert!(text.contains("green_guardian_workload_power_watts"));
        assert!(text.contains("workload=\"checkout\""));
        assert!(text.contains("green_guardian_flags_total{kind=\"anomaly_spike\"} 1"));

        metrics.remove_workload(&workload);
        let text = metrics.encode().unwrap();
        assert!(!text.contains("workload=\"checkout\""));
    }

    #[test]
    fn test_structured_logger_creation() {
        let logger = StructuredLogger::new("test-node");
        assert_eq!(logger.node_name(), "test-node");
    }
}
