//! Per-workload efficiency state machine
//!
//! Each workload moves through `WarmingUp -> Stable -> Flagged` with the
//! state stored explicitly next to its estimate history. Flags raised while
//! entering `Flagged` stay pending until the recommendation client consumes
//! them, the workload recovers, or the flag expires.

use super::spike_detector::{RollingStats, SpikeAnomaly, SpikeDetector};
use super::underutilization::{
    UnderutilizationAnomaly, UnderutilizationDetector, UnderutilizationStreak,
};
use crate::config::EvaluatorConfig;
use crate::models::{
    EfficiencyFlag, EnergyEstimate, EvidenceWindow, FlagKind, Severity, UtilizationSample,
    WorkloadIdentity,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::VecDeque;
use tracing::debug;

/// Evaluator state for one workload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum EvaluatorState {
    /// Fewer than the minimum window of samples collected
    WarmingUp,
    Stable,
    Flagged { since: DateTime<Utc> },
}

impl EvaluatorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvaluatorState::WarmingUp => "warming_up",
            EvaluatorState::Stable => "stable",
            EvaluatorState::Flagged { .. } => "flagged",
        }
    }

    pub fn is_flagged(&self) -> bool {
        matches!(self, EvaluatorState::Flagged { .. })
    }
}

/// Bounded estimate history plus the evaluator state of one workload
#[derive(Debug, Clone)]
struct WorkloadHistory {
    estimates: VecDeque<EnergyEstimate>,
    stats: RollingStats,
    streak: UnderutilizationStreak,
    state: EvaluatorState,
    pending: Vec<EfficiencyFlag>,
    last_timestamp: Option<DateTime<Utc>>,
}

impl WorkloadHistory {
    fn new(capacity: usize) -> Self {
        Self {
            estimates: VecDeque::with_capacity(capacity),
            stats: RollingStats::new(capacity),
            streak: UnderutilizationStreak::default(),
            state: EvaluatorState::WarmingUp,
            pending: Vec::new(),
            last_timestamp: None,
        }
    }

    fn push(&mut self, estimate: EnergyEstimate) {
        if self.estimates.len() == self.stats.capacity() {
            self.estimates.pop_front();
        }
        self.stats.push(estimate.estimated_watts);
        self.last_timestamp = Some(estimate.timestamp);
        self.estimates.push_back(estimate);
    }

    fn window_start(&self) -> Option<DateTime<Utc>> {
        self.estimates.front().map(|e| e.timestamp)
    }

    fn clear_flag(&mut self) {
        self.state = EvaluatorState::Stable;
        self.pending.clear();
        self.streak.reset();
    }
}

/// Anomaly and efficiency evaluator, sharded by workload identity
pub struct Evaluator {
    config: EvaluatorConfig,
    spike: SpikeDetector,
    underutilization: UnderutilizationDetector,
    workloads: DashMap<WorkloadIdentity, WorkloadHistory>,
}

impl Evaluator {
    pub fn new(config: EvaluatorConfig) -> Self {
        let spike = SpikeDetector::new(config.spike_std_dev_threshold, config.min_window_samples);
        let underutilization = UnderutilizationDetector::new(
            config.underutilization_floor,
            config.underutilization_consecutive_count,
        );
        Self {
            config,
            spike,
            underutilization,
            workloads: DashMap::new(),
        }
    }

    pub fn config(&self) -> &EvaluatorConfig {
        &self.config
    }

    fn flag_expiry(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.config.flag_expiry_secs as i64)
    }

    /// Fold one sample and its estimate into the workload's history.
    ///
    /// Returns the flags raised by this sample, spike before
    /// underutilization. A sample whose timestamp is not newer than the
    /// last one applied is ignored and yields `None`.
    pub fn observe(
        &self,
        sample: &UtilizationSample,
        estimate: &EnergyEstimate,
    ) -> Option<Vec<EfficiencyFlag>> {
        let mut entry = self
            .workloads
            .entry(sample.workload.clone())
            .or_insert_with(|| WorkloadHistory::new(self.config.window_size));
        let history = entry.value_mut();
        let timestamp = estimate.timestamp;

        if history.last_timestamp.is_some_and(|last| timestamp <= last) {
            debug!(workload = %sample.workload, "Ignoring already evaluated sample");
            return None;
        }

        if let EvaluatorState::Flagged { since } = history.state {
            if timestamp - since >= self.flag_expiry() {
                debug!(workload = %sample.workload, "Efficiency flag expired");
                history.clear_flag();
            }
        }

        let spike = match history.state {
            EvaluatorState::WarmingUp => None,
            _ => self.spike.detect(estimate.estimated_watts, &history.stats),
        };
        let window_start = history.window_start().unwrap_or(timestamp);
        let window_samples = history.stats.count;

        let ratio = sample.utilization_ratio();
        self.underutilization
            .update(&mut history.streak, ratio, timestamp);
        history.push(estimate.clone());

        if history.state == EvaluatorState::WarmingUp
            && history.stats.has_sufficient_data(self.config.min_window_samples)
        {
            debug!(workload = %sample.workload, samples = history.stats.count, "Workload left warm-up");
            history.state = EvaluatorState::Stable;
        }

        let mut flags = Vec::new();
        match history.state {
            EvaluatorState::WarmingUp => {}
            EvaluatorState::Stable => {
                if let Some(anomaly) = spike {
                    flags.push(spike_flag(
                        &sample.workload,
                        &anomaly,
                        window_start,
                        timestamp,
                        window_samples,
                    ));
                }
                if let Some(anomaly) = self.underutilization.detect(&history.streak, timestamp) {
                    flags.push(underutilization_flag(&sample.workload, &anomaly, timestamp));
                }
                if !flags.is_empty() {
                    history.state = EvaluatorState::Flagged { since: timestamp };
                    history.pending.extend(flags.iter().cloned());
                }
            }
            EvaluatorState::Flagged { .. } => {
                let underutilized = ratio
                    .map(|r| self.underutilization.is_below_floor(r))
                    .unwrap_or(false);
                if spike.is_none() && !underutilized {
                    history.state = EvaluatorState::Stable;
                    history.pending.clear();
                    flags.push(EfficiencyFlag {
                        workload: sample.workload.clone(),
                        kind: FlagKind::EfficiencyImproved,
                        severity: Severity::Info,
                        evidence: EvidenceWindow {
                            start: window_start,
                            end: timestamp,
                            samples: history.stats.count,
                            observed: estimate.estimated_watts,
                            expected: history.stats.mean,
                            score: 0.0,
                        },
                    });
                }
            }
        }

        Some(flags)
    }

    /// Current state of a workload, if it has been observed
    pub fn state(&self, workload: &WorkloadIdentity) -> Option<EvaluatorState> {
        self.workloads.get(workload).map(|h| h.state)
    }

    /// Copy of the workload's estimate history, oldest first
    pub fn history(&self, workload: &WorkloadIdentity) -> Vec<EnergyEstimate> {
        self.workloads
            .get(workload)
            .map(|h| h.estimates.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Flags waiting for a recommendation, without consuming them
    pub fn pending_flags(&self, workload: &WorkloadIdentity) -> Vec<EfficiencyFlag> {
        self.workloads
            .get(workload)
            .map(|h| h.pending.clone())
            .unwrap_or_default()
    }

    /// Workloads that currently have pending flags
    pub fn workloads_with_pending_flags(&self) -> Vec<WorkloadIdentity> {
        let mut workloads: Vec<_> = self
            .workloads
            .iter()
            .filter(|h| !h.pending.is_empty())
            .map(|h| h.key().clone())
            .collect();
        workloads.sort();
        workloads
    }

    /// Take the pending flags; each flag is handed out once
    pub fn consume_flags(&self, workload: &WorkloadIdentity) -> Vec<EfficiencyFlag> {
        self.workloads
            .get_mut(workload)
            .map(|mut h| std::mem::take(&mut h.pending))
            .unwrap_or_default()
    }

    /// Return expired flagged workloads to `Stable`, dropping their pending flags
    pub fn expire_flags(&self, now: DateTime<Utc>) -> usize {
        let expiry = self.flag_expiry();
        let mut expired = 0;
        for mut history in self.workloads.iter_mut() {
            if let EvaluatorState::Flagged { since } = history.state {
                if now - since >= expiry {
                    debug!(workload = %history.key(), "Efficiency flag expired");
                    history.clear_flag();
                    expired += 1;
                }
            }
        }
        expired
    }

    /// Forget a workload entirely
    pub fn remove(&self, workload: &WorkloadIdentity) -> bool {
        self.workloads.remove(workload).is_some()
    }

    pub fn workloads(&self) -> Vec<WorkloadIdentity> {
        self.workloads.iter().map(|h| h.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.workloads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workloads.is_empty()
    }
}

fn spike_flag(
    workload: &WorkloadIdentity,
    anomaly: &SpikeAnomaly,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    samples: usize,
) -> EfficiencyFlag {
    EfficiencyFlag {
        workload: workload.clone(),
        kind: FlagKind::AnomalySpike,
        severity: anomaly.severity(),
        evidence: EvidenceWindow {
            start,
            end,
            samples,
            observed: anomaly.current_watts,
            expected: anomaly.expected_watts,
            score: anomaly.z_score,
        },
    }
}

fn underutilization_flag(
    workload: &WorkloadIdentity,
    anomaly: &UnderutilizationAnomaly,
    end: DateTime<Utc>,
) -> EfficiencyFlag {
    EfficiencyFlag {
        workload: workload.clone(),
        kind: FlagKind::SustainedUnderutilization,
        severity: anomaly.severity(),
        evidence: EvidenceWindow {
            start: anomaly.since,
            end,
            samples: anomaly.consecutive_samples as usize,
            observed: anomaly.ratio,
            expected: anomaly.floor,
            score: anomaly.consecutive_samples as f64,
        },
    }
}
