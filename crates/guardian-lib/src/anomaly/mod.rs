//! Anomaly and efficiency evaluation
//!
//! This module provides detection for:
//! - Power spikes (estimated watts exceeding standard deviation thresholds)
//! - Sustained underutilization (usage-to-allocation ratio below a floor)
//! - The per-workload state machine that turns both into efficiency flags

mod evaluator;
mod spike_detector;
mod underutilization;

pub use evaluator::{Evaluator, EvaluatorState};
pub use spike_detector::{RollingStats, SpikeAnomaly, SpikeDetector};
pub use underutilization::{
    UnderutilizationAnomaly, UnderutilizationDetector, UnderutilizationStreak,
};
