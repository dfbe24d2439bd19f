//! Core data models for the energy agent

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable key for all per-workload state
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkloadIdentity {
    pub namespace: String,
    pub name: String,
    pub node: String,
}

impl WorkloadIdentity {
    pub fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
        node: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            node: node.into(),
        }
    }

    /// True if this identity names the given namespace/workload on any node
    pub fn matches(&self, namespace: &str, name: &str) -> bool {
        self.namespace == namespace && self.name == name
    }
}

impl fmt::Display for WorkloadIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.namespace, self.name, self.node)
    }
}

/// One utilization reading for a workload, already clamped by the sampler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UtilizationSample {
    pub workload: WorkloadIdentity,
    pub timestamp: DateTime<Utc>,
    pub cpu_cores_used: f64,
    pub cpu_cores_allocated: f64,
    pub memory_bytes_used: u64,
    pub memory_bytes_allocated: u64,
}

impl UtilizationSample {
    /// Utilization-to-allocation ratio, the larger of CPU and memory.
    ///
    /// Resources without an allocation are ignored; `None` when neither
    /// resource has one.
    pub fn utilization_ratio(&self) -> Option<f64> {
        let cpu = (self.cpu_cores_allocated > 0.0)
            .then(|| self.cpu_cores_used / self.cpu_cores_allocated);
        let memory = (self.memory_bytes_allocated > 0)
            .then(|| self.memory_bytes_used as f64 / self.memory_bytes_allocated as f64);

        match (cpu, memory) {
            (Some(c), Some(m)) => Some(c.max(m)),
            (Some(c), None) => Some(c),
            (None, Some(m)) => Some(m),
            (None, None) => None,
        }
    }
}

/// Estimated power draw derived 1:1 from a utilization sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnergyEstimate {
    pub workload: WorkloadIdentity,
    pub timestamp: DateTime<Utc>,
    pub estimated_watts: f64,
    pub estimated_kwh: f64,
}

/// Kind of efficiency flag raised by the evaluator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlagKind {
    AnomalySpike,
    SustainedUnderutilization,
    EfficiencyImproved,
}

impl FlagKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlagKind::AnomalySpike => "anomaly_spike",
            FlagKind::SustainedUnderutilization => "sustained_underutilization",
            FlagKind::EfficiencyImproved => "efficiency_improved",
        }
    }
}

impl fmt::Display for FlagKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity of a flag
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    High,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Info => write!(f, "info"),
            Severity::Warning => write!(f, "warning"),
            Severity::High => write!(f, "high"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

/// Samples that justified a flag
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub samples: usize,
    /// Value that triggered the flag (watts for spikes, ratio for utilization)
    pub observed: f64,
    /// Reference value (window mean for spikes, floor for utilization)
    pub expected: f64,
    /// Z-score for spikes, consecutive count for utilization
    pub score: f64,
}

/// Flag produced by the evaluator and consumed once by the recommendation client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EfficiencyFlag {
    pub workload: WorkloadIdentity,
    pub kind: FlagKind,
    pub severity: Severity,
    pub evidence: EvidenceWindow,
}

/// Action suggested by the oracle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    ScaleDown,
    ScaleUp,
    ResizeRequest,
    Hibernate,
    NoAction,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::ScaleDown => "scale_down",
            ActionKind::ScaleUp => "scale_up",
            ActionKind::ResizeRequest => "resize_request",
            ActionKind::Hibernate => "hibernate",
            ActionKind::NoAction => "no_action",
        }
    }

    /// Parse an oracle action name; unknown names yield `None`
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "scale_down" => Some(ActionKind::ScaleDown),
            "scale_up" => Some(ActionKind::ScaleUp),
            "resize_request" | "adjust_resources" => Some(ActionKind::ResizeRequest),
            "hibernate" => Some(ActionKind::Hibernate),
            "no_action" | "none" => Some(ActionKind::NoAction),
            _ => None,
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Target values attached to a recommendation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TargetParameters {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replicas: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_millicores: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_bytes: Option<u64>,
}

/// Typed recommendation parsed from an oracle reply
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub workload: WorkloadIdentity,
    pub action: ActionKind,
    pub parameters: TargetParameters,
    pub confidence: f64,
    pub rationale: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_savings_kwh: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Recommendation {
    /// Recommendation used for replies that cannot be trusted
    pub fn no_action(
        workload: WorkloadIdentity,
        rationale: impl Into<String>,
        created_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            workload,
            action: ActionKind::NoAction,
            parameters: TargetParameters::default(),
            confidence: 0.0,
            rationale: rationale.into(),
            estimated_savings_kwh: None,
            created_at,
            expires_at,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Replica and resource values observed around an action
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionValues {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replicas: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_millicores: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_bytes: Option<u64>,
}

/// Outcome of an action attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Accepted,
    RejectedByPolicy,
    FailedOnApply,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Accepted => "accepted",
            Decision::RejectedByPolicy => "rejected_by_policy",
            Decision::FailedOnApply => "failed_on_apply",
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Audit log entry for one recommendation handled by the controller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRecord {
    pub recommendation: Recommendation,
    pub decision: Decision,
    /// Rejection or failure reason, empty for accepted actions
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub applied_at: DateTime<Utc>,
    pub pre: ActionValues,
    pub post: ActionValues,
}

impl ActionRecord {
    pub fn workload(&self) -> &WorkloadIdentity {
        &self.recommendation.workload
    }
}

/// Per-workload policy bookkeeping owned by the action controller
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicyState {
    pub last_action_at: Option<DateTime<Utc>>,
    pub cooldown_until: Option<DateTime<Utc>>,
    /// Consecutive failed applies; reset by a successful apply or an operator
    pub consecutive_failures: u32,
}

impl PolicyState {
    pub fn in_cooldown(&self, now: DateTime<Utc>) -> bool {
        self.cooldown_until.map(|until| now < until).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(cpu_used: f64, cpu_alloc: f64, mem_used: u64, mem_alloc: u64) -> UtilizationSample {
        UtilizationSample {
            workload: WorkloadIdentity::new("default", "web", "node-1"),
            timestamp: Utc::now(),
            cpu_cores_used: cpu_used,
            cpu_cores_allocated: cpu_alloc,
            memory_bytes_used: mem_used,
            memory_bytes_allocated: mem_alloc,
        }
    }

    #[test]
    fn test_utilization_ratio_takes_larger_resource() {
        let s = sample(0.1, 1.0, 512, 1024);
        assert!((s.utilization_ratio().unwrap() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_utilization_ratio_without_allocation() {
        assert!(sample(0.5, 0.0, 100, 0).utilization_ratio().is_none());
        assert!((sample(0.5, 0.0, 100, 400).utilization_ratio().unwrap() - 0.25).abs() < 1e-9);
    }

    #[test]
    fn test_action_kind_parse() {
        assert_eq!(ActionKind::parse("scale_down"), Some(ActionKind::ScaleDown));
        assert_eq!(ActionKind::parse("Scale-Up"), Some(ActionKind::ScaleUp));
        assert_eq!(
            ActionKind::parse("adjust_resources"),
            Some(ActionKind::ResizeRequest)
        );
        assert_eq!(ActionKind::parse("migrate"), None);
    }

    #[test]
    fn test_policy_state_cooldown() {
        let now = Utc::now();
        let state = PolicyState {
            cooldown_until: Some(now + chrono::Duration::seconds(60)),
            ..Default::default()
        };
        assert!(state.in_cooldown(now));
        assert!(!state.in_cooldown(now + chrono::Duration::seconds(60)));
        assert!(!PolicyState::default().in_cooldown(now));
    }
}
