//! Carbon and savings ledger
//!
//! Pure aggregation over the estimate and action record streams. Totals
//! live in a `DashMap` sharded by workload so summary reads never wait on
//! the control loop.

use crate::config::{LedgerConfig, GLOBAL_AVERAGE_INTENSITY};
use crate::models::{ActionKind, ActionRecord, Decision, EnergyEstimate, WorkloadIdentity};
use crate::observability::AgentMetrics;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

/// Energy with its carbon and cost equivalents
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Totals {
    pub energy_kwh: f64,
    pub carbon_kg: f64,
    pub cost: f64,
}

impl Totals {
    fn add(&mut self, other: Totals) {
        self.energy_kwh += other.energy_kwh;
        self.carbon_kg += other.carbon_kg;
        self.cost += other.cost;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkloadLedger {
    pub workload: WorkloadIdentity,
    pub consumed: Totals,
    pub saved: Totals,
    pub actions_accepted: u64,
    pub latest_estimate: Option<EnergyEstimate>,
    pub last_updated: Option<DateTime<Utc>>,
}

impl WorkloadLedger {
    fn new(workload: WorkloadIdentity) -> Self {
        Self {
            workload,
            consumed: Totals::default(),
            saved: Totals::default(),
            actions_accepted: 0,
            latest_estimate: None,
            last_updated: None,
        }
    }
}

/// Cluster-wide view served to operators
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerSummary {
    pub region: String,
    pub carbon_intensity_kg_per_kwh: f64,
    pub price_per_kwh: f64,
    pub currency: String,
    pub consumed: Totals,
    pub saved: Totals,
    pub actions_accepted: u64,
    pub workloads: Vec<WorkloadLedger>,
}

#[derive(Clone)]
pub struct Ledger {
    region: String,
    intensity: f64,
    fallback_intensity: bool,
    price_per_kwh: f64,
    currency: String,
    projection_hours: f64,
    entries: Arc<DashMap<WorkloadIdentity, WorkloadLedger>>,
    metrics: AgentMetrics,
}

impl Ledger {
    pub fn new(config: &LedgerConfig, region: &str, metrics: AgentMetrics) -> Self {
        let (intensity, fallback_intensity) = match config.region_carbon_intensity.get(region) {
            Some(intensity) => (*intensity, false),
            None => {
                warn!(region, "No carbon intensity for region; using global average");
                (GLOBAL_AVERAGE_INTENSITY, true)
            }
        };

        Self {
            region: region.to_string(),
            intensity,
            fallback_intensity,
            price_per_kwh: config.price_per_kwh,
            currency: config.currency.clone(),
            projection_hours: config.savings_projection_hours,
            entries: Arc::new(DashMap::new()),
            metrics,
        }
    }

    pub fn carbon_intensity(&self) -> f64 {
        self.intensity
    }

    /// Whether CO2 is converted with the global average instead of the region's figure
    pub fn uses_fallback_intensity(&self) -> bool {
        self.fallback_intensity
    }

    /// Carbon and cost equivalents of an amount of energy
    pub fn convert(&self, energy_kwh: f64) -> Totals {
        Totals {
            energy_kwh,
            carbon_kg: energy_kwh * self.intensity,
            cost: energy_kwh * self.price_per_kwh,
        }
    }

    /// Add one interval's consumption and remember it as the latest estimate
    pub fn record_estimate(&self, estimate: &EnergyEstimate) {
        let totals = self.convert(estimate.estimated_kwh);
        let mut entry = self
            .entries
            .entry(estimate.workload.clone())
            .or_insert_with(|| WorkloadLedger::new(estimate.workload.clone()));
        entry.consumed.add(totals);
        entry.latest_estimate = Some(estimate.clone());
        entry.last_updated = Some(estimate.timestamp);
    }

    /// Credit the projected savings of an accepted action.
    ///
    /// Returns the kWh credited, `None` when the record is not accepted or
    /// no estimate is known for the workload yet.
    pub fn record_action(&self, record: &ActionRecord) -> Option<f64> {
        if record.decision != Decision::Accepted {
            return None;
        }

        let saved_kwh = {
            let mut entry = self.entries.get_mut(record.workload())?;
            let latest_watts = entry.latest_estimate.as_ref()?.estimated_watts;
            let saved_kwh = projected_savings_kwh(record, latest_watts, self.projection_hours)?;
            entry.saved.add(self.convert(saved_kwh));
            entry.actions_accepted += 1;
            entry.last_updated = Some(record.applied_at);
            saved_kwh
        };

        let saved = self.saved_totals();
        self.metrics.set_savings(saved.energy_kwh, saved.carbon_kg);
        debug!(
            workload = %record.workload(),
            saved_kwh,
            total_saved_kwh = saved.energy_kwh,
            "Credited action savings"
        );
        Some(saved_kwh)
    }

    fn saved_totals(&self) -> Totals {
        let mut saved = Totals::default();
        for entry in self.entries.iter() {
            saved.add(entry.saved);
        }
        saved
    }

    /// Latest estimate per workload, optionally for one namespace
    pub fn latest_estimates(&self, namespace: Option<&str>) -> Vec<EnergyEstimate> {
        let mut estimates: Vec<EnergyEstimate> = self
            .entries
            .iter()
            .filter(|e| namespace.map_or(true, |ns| e.key().namespace == ns))
            .filter_map(|e| e.latest_estimate.clone())
            .collect();
        estimates.sort_by(|a, b| a.workload.cmp(&b.workload));
        estimates
    }

    pub fn workload(&self, workload: &WorkloadIdentity) -> Option<WorkloadLedger> {
        self.entries.get(workload).map(|e| e.value().clone())
    }

    /// Forget the latest estimate of a vanished workload; totals are kept
    pub fn forget_estimate(&self, workload: &WorkloadIdentity) {
        if let Some(mut entry) = self.entries.get_mut(workload) {
            entry.latest_estimate = None;
        }
    }

    pub fn summary(&self) -> LedgerSummary {
        let mut workloads: Vec<WorkloadLedger> =
            self.entries.iter().map(|e| e.value().clone()).collect();
        workloads.sort_by(|a, b| a.workload.cmp(&b.workload));

        let mut consumed = Totals::default();
        let mut saved = Totals::default();
        let mut actions_accepted = 0;
        for entry in &workloads {
            consumed.add(entry.consumed);
            saved.add(entry.saved);
            actions_accepted += entry.actions_accepted;
        }

        LedgerSummary {
            region: self.region.clone(),
            carbon_intensity_kg_per_kwh: self.intensity,
            price_per_kwh: self.price_per_kwh,
            currency: self.currency.clone(),
            consumed,
            saved,
            actions_accepted,
            workloads,
        }
    }
}

/// Projected kWh saved by an accepted action over `projection_hours`.
///
/// The post/pre ratio uses replicas for scale and hibernate actions and
/// CPU millicores for resizes. Scale-ups come out negative.
pub fn projected_savings_kwh(
    record: &ActionRecord,
    latest_watts: f64,
    projection_hours: f64,
) -> Option<f64> {
    let (pre, post) = match record.recommendation.action {
        ActionKind::ScaleDown | ActionKind::ScaleUp | ActionKind::Hibernate => (
            f64::from(record.pre.replicas?),
            f64::from(record.post.replicas?),
        ),
        ActionKind::ResizeRequest => (
            f64::from(record.pre.cpu_millicores?),
            f64::from(record.post.cpu_millicores?),
        ),
        ActionKind::NoAction => return None,
    };
    if pre <= 0.0 {
        return None;
    }

    let delta_watts = latest_watts * (1.0 - post / pre);
    Some(delta_watts * projection_hours / 1000.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ActionValues, Recommendation, TargetParameters};
    use chrono::Duration;

    fn workload() -> WorkloadIdentity {
        WorkloadIdentity::new("shop", "checkout", "node-1")
    }

    fn estimate(watts: f64, kwh: f64) -> EnergyEstimate {
        EnergyEstimate {
            workload: workload(),
            timestamp: Utc::now(),
            estimated_watts: watts,
            estimated_kwh: kwh,
        }
    }

    fn accepted(action: ActionKind, pre: ActionValues, post: ActionValues) -> ActionRecord {
        let now = Utc::now();
        ActionRecord {
            recommendation: Recommendation {
                workload: workload(),
                action,
                parameters: TargetParameters::default(),
                confidence: 0.9,
                rationale: String::new(),
                estimated_savings_kwh: None,
                created_at: now,
                expires_at: now + Duration::seconds(300),
            },
            decision: Decision::Accepted,
            reason: None,
            applied_at: now,
            pre,
            post,
        }
    }

    fn replicas(n: u32) -> ActionValues {
        ActionValues {
            replicas: Some(n),
            ..Default::default()
        }
    }

    fn ledger() -> (Ledger, AgentMetrics) {
        let metrics = AgentMetrics::new().unwrap();
        let config = LedgerConfig {
            price_per_kwh: 0.2,
            ..Default::default()
        };
        (Ledger::new(&config, "global", metrics.clone()), metrics)
    }

    #[test]
    fn test_consumption_accumulates() {
        let (ledger, _) = ledger();
        ledger.record_estimate(&estimate(40.0, 0.5));
        ledger.record_estimate(&estimate(60.0, 1.5));

        let summary = ledger.summary();
        assert!((summary.consumed.energy_kwh - 2.0).abs() < 1e-9);
        assert!((summary.consumed.carbon_kg - 2.0 * GLOBAL_AVERAGE_INTENSITY).abs() < 1e-9);
        assert!((summary.consumed.cost - 0.4).abs() < 1e-9);
        assert_eq!(ledger.latest_estimates(None)[0].estimated_watts, 60.0);
    }

    #[test]
    fn test_scale_down_savings() {
        let (ledger, _) = ledger();
        ledger.record_estimate(&estimate(100.0, 0.1));

        // 4 -> 2 replicas halves 100 W, 50 W for 24 h
        let saved = ledger
            .record_action(&accepted(ActionKind::ScaleDown, replicas(4), replicas(2)))
            .unwrap();
        assert!((saved - 1.2).abs() < 1e-9);

        let summary = ledger.summary();
        assert_eq!(summary.actions_accepted, 1);
        assert!((summary.saved.energy_kwh - 1.2).abs() < 1e-9);
    }

    #[test]
    fn test_scale_up_is_negative() {
        let record = accepted(ActionKind::ScaleUp, replicas(2), replicas(3));
        let saved = projected_savings_kwh(&record, 100.0, 10.0).unwrap();
        assert!((saved - (-0.5)).abs() < 1e-9);
    }

    #[test]
    fn test_resize_uses_cpu_ratio() {
        let cpu = |m| ActionValues {
            cpu_millicores: Some(m),
            ..Default::default()
        };
        let record = accepted(ActionKind::ResizeRequest, cpu(1000), cpu(250));
        let saved = projected_savings_kwh(&record, 80.0, 1.0).unwrap();
        assert!((saved - 0.06).abs() < 1e-9);
    }

    #[test]
    fn test_hibernate_saves_everything() {
        let record = accepted(ActionKind::Hibernate, replicas(3), replicas(0));
        let saved = projected_savings_kwh(&record, 50.0, 2.0).unwrap();
        assert!((saved - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_rejected_and_unknown_are_not_credited() {
        let (ledger, _) = ledger();
        let mut record = accepted(ActionKind::ScaleDown, replicas(4), replicas(2));
        // No estimate yet
        assert_eq!(ledger.record_action(&record), None);

        ledger.record_estimate(&estimate(100.0, 0.1));
        record.decision = Decision::RejectedByPolicy;
        assert_eq!(ledger.record_action(&record), None);
        assert_eq!(ledger.summary().actions_accepted, 0);
    }

    #[test]
    fn test_namespace_filter_and_forget() {
        let (ledger, _) = ledger();
        ledger.record_estimate(&estimate(10.0, 0.01));
        ledger.record_estimate(&EnergyEstimate {
            workload: WorkloadIdentity::new("billing", "worker", "node-1"),
            ..estimate(20.0, 0.02)
        });

        assert_eq!(ledger.latest_estimates(Some("billing")).len(), 1);
        assert_eq!(ledger.latest_estimates(None).len(), 2);

        ledger.forget_estimate(&workload());
        assert_eq!(ledger.latest_estimates(Some("shop")).len(), 0);
        assert!(ledger.summary().consumed.energy_kwh > 0.0);
    }

    #[test]
    fn test_unknown_region_falls_back_to_global() {
        let metrics = AgentMetrics::new().unwrap();
        let ledger = Ledger::new(&LedgerConfig::default(), "mars-1", metrics);
        assert_eq!(ledger.carbon_intensity(), GLOBAL_AVERAGE_INTENSITY);
        assert!(ledger.uses_fallback_intensity());
    }
}
