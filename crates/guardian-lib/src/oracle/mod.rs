//! Recommendation oracle integration
//!
//! The oracle is an external service treated as a black box: it receives a
//! bounded summary of a flagged workload and replies with a suggested
//! action. Every field of the reply is validated before it becomes a
//! [`Recommendation`](crate::models::Recommendation).

mod client;
mod http;
mod schema;

pub use client::{OracleJob, RecommendationClient};
pub use http::HttpOracle;
pub use schema::parse_reply;

use crate::error::OracleError;
use crate::models::{
    EfficiencyFlag, EnergyEstimate, EvidenceWindow, FlagKind, Severity, WorkloadIdentity,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Transport to the recommendation oracle
#[async_trait]
pub trait Oracle: Send + Sync {
    /// Send a request and return the raw JSON reply
    async fn query(&self, request: &OracleRequest) -> Result<serde_json::Value, OracleError>;
}

/// One estimate as sent to the oracle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EstimatePoint {
    pub timestamp: DateTime<Utc>,
    pub watts: f64,
    pub kwh: f64,
}

impl From<&EnergyEstimate> for EstimatePoint {
    fn from(estimate: &EnergyEstimate) -> Self {
        Self {
            timestamp: estimate.timestamp,
            watts: estimate.estimated_watts,
            kwh: estimate.estimated_kwh,
        }
    }
}

/// Flag evidence as sent to the oracle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlagEvidence {
    pub kind: FlagKind,
    pub severity: Severity,
    pub evidence: EvidenceWindow,
}

impl From<&EfficiencyFlag> for FlagEvidence {
    fn from(flag: &EfficiencyFlag) -> Self {
        Self {
            kind: flag.kind,
            severity: flag.severity,
            evidence: flag.evidence.clone(),
        }
    }
}

/// Aggregates over the whole retained history
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistorySummary {
    pub samples: usize,
    pub average_watts: f64,
    pub average_kwh: f64,
    pub peak_watts: f64,
}

impl HistorySummary {
    pub fn from_history(history: &[EnergyEstimate]) -> Self {
        if history.is_empty() {
            return Self::default();
        }
        let n = history.len() as f64;
        Self {
            samples: history.len(),
            average_watts: history.iter().map(|e| e.estimated_watts).sum::<f64>() / n,
            average_kwh: history.iter().map(|e| e.estimated_kwh).sum::<f64>() / n,
            peak_watts: history
                .iter()
                .map(|e| e.estimated_watts)
                .fold(0.0, f64::max),
        }
    }
}

/// Bounded request for one flagged workload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OracleRequest {
    pub workload: WorkloadIdentity,
    /// Most recent estimates, oldest first
    pub estimates: Vec<EstimatePoint>,
    pub flags: Vec<FlagEvidence>,
    pub history: HistorySummary,
}

impl OracleRequest {
    /// Build a request keeping at most `max_estimates` of the newest estimates
    pub fn new(
        workload: WorkloadIdentity,
        flags: &[EfficiencyFlag],
        history: &[EnergyEstimate],
        max_estimates: usize,
    ) -> Self {
        let skip = history.len().saturating_sub(max_estimates);
        Self {
            workload,
            estimates: history[skip..].iter().map(EstimatePoint::from).collect(),
            flags: flags.iter().map(FlagEvidence::from).collect(),
            history: HistorySummary::from_history(history),
        }
    }
}
