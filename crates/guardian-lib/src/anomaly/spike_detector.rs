//! Power spike detection
//!
//! Keeps count-bounded rolling statistics over a workload's estimated watts
//! and flags values exceeding a configurable standard deviation threshold.

use crate::models::Severity;
use std::collections::VecDeque;

/// Detects power spikes exceeding standard deviation threshold
#[derive(Debug, Clone)]
pub struct SpikeDetector {
    /// Number of standard deviations to consider a spike
    pub std_dev_threshold: f64,
    /// Samples required before any spike is reported
    pub min_samples: usize,
}

impl SpikeDetector {
    pub fn new(std_dev_threshold: f64, min_samples: usize) -> Self {
        Self {
            std_dev_threshold,
            min_samples,
        }
    }

    /// Detect a spike of `current` against the window in `history`
    ///
    /// Only upward deviations count. A flat window (zero variance) never
    /// reports a spike.
    pub fn detect(&self, current: f64, history: &RollingStats) -> Option<SpikeAnomaly> {
        if !history.has_sufficient_data(self.min_samples) {
            return None;
        }

        // Avoid division by zero
        if history.std_dev < f64::EPSILON {
            return None;
        }

        let z_score = (current - history.mean) / history.std_dev;

        if z_score > self.std_dev_threshold {
            Some(SpikeAnomaly {
                current_watts: current,
                expected_watts: history.mean,
                z_score,
                std_dev: history.std_dev,
                threshold: self.std_dev_threshold,
            })
        } else {
            None
        }
    }
}

impl Default for SpikeDetector {
    fn default() -> Self {
        Self::new(3.0, 10)
    }
}

/// Rolling mean and standard deviation over the last `capacity` values
#[derive(Debug, Clone)]
pub struct RollingStats {
    pub mean: f64,
    pub std_dev: f64,
    pub count: usize,
    values: VecDeque<f64>,
    capacity: usize,
}

impl RollingStats {
    pub fn new(capacity: usize) -> Self {
        Self {
            mean: 0.0,
            std_dev: 0.0,
            count: 0,
            values: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Add a value, evicting the oldest once the window is full
    pub fn push(&mut self, value: f64) {
        if self.values.len() == self.capacity {
            self.values.pop_front();
        }
        self.values.push_back(value);
        self.recalculate_stats();
    }

    fn recalculate_stats(&mut self) {
        self.count = self.values.len();

        if self.count == 0 {
            self.mean = 0.0;
            self.std_dev = 0.0;
            return;
        }

        let sum: f64 = self.values.iter().sum();
        self.mean = sum / self.count as f64;

        // Two-pass sample variance (Bessel's correction)
        if self.count > 1 {
            let variance: f64 = self
                .values
                .iter()
                .map(|v| (v - self.mean).powi(2))
                .sum::<f64>()
                / (self.count - 1) as f64;
            self.std_dev = variance.sqrt();
        } else {
            self.std_dev = 0.0;
        }
    }

    pub fn min(&self) -> Option<f64> {
        self.values
            .iter()
            .copied()
            .min_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
    }

    pub fn max(&self) -> Option<f64> {
        self.values
            .iter()
            .copied()
            .max_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
    }

    pub fn has_sufficient_data(&self, min_samples: usize) -> bool {
        self.count >= min_samples
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Power spike details
#[derive(Debug, Clone)]
pub struct SpikeAnomaly {
    pub current_watts: f64,
    /// Window mean the spike was measured against
    pub expected_watts: f64,
    /// Number of standard deviations above the mean
    pub z_score: f64,
    pub std_dev: f64,
    pub threshold: f64,
}

impl SpikeAnomaly {
    pub fn percentage_above_expected(&self) -> f64 {
        if self.expected_watts < f64::EPSILON {
            return 0.0;
        }
        ((self.current_watts - self.expected_watts) / self.expected_watts) * 100.0
    }

    /// Severity level based on z-score
    pub fn severity(&self) -> Severity {
        if self.z_score >= 5.0 {
            Severity::Critical
        } else if self.z_score >= 4.0 {
            Severity::High
        } else {
            Severity::Warning
        }
    }
}
