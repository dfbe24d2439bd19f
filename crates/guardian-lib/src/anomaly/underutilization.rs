//! Sustained underutilization detection
//!
//! Counts consecutive samples whose utilization-to-allocation ratio sits
//! below a floor. Any sample at or above the floor breaks the streak.

use crate::models::Severity;
use chrono::{DateTime, Utc};

/// Run of consecutive low-utilization samples for one workload
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UnderutilizationStreak {
    pub count: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub last_ratio: Option<f64>,
}

impl UnderutilizationStreak {
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Detects workloads that stay below the utilization floor
#[derive(Debug, Clone)]
pub struct UnderutilizationDetector {
    pub floor: f64,
    pub consecutive_count: u32,
}

impl UnderutilizationDetector {
    pub fn new(floor: f64, consecutive_count: u32) -> Self {
        Self {
            floor,
            consecutive_count,
        }
    }

    pub fn is_below_floor(&self, ratio: f64) -> bool {
        ratio < self.floor
    }

    /// Fold one sample's ratio into the streak.
    ///
    /// Samples without any allocation carry no ratio and leave the streak
    /// untouched.
    pub fn update(
        &self,
        streak: &mut UnderutilizationStreak,
        ratio: Option<f64>,
        timestamp: DateTime<Utc>,
    ) {
        let Some(ratio) = ratio else {
            return;
        };

        if self.is_below_floor(ratio) {
            if streak.count == 0 {
                streak.started_at = Some(timestamp);
            }
            streak.count = streak.count.saturating_add(1);
            streak.last_ratio = Some(ratio);
        } else {
            streak.reset();
        }
    }

    /// Report the streak once it reaches the configured length
    pub fn detect(
        &self,
        streak: &UnderutilizationStreak,
        now: DateTime<Utc>,
    ) -> Option<UnderutilizationAnomaly> {
        if streak.count < self.consecutive_count {
            return None;
        }

        let ratio = streak.last_ratio?;
        Some(UnderutilizationAnomaly {
            ratio,
            floor: self.floor,
            consecutive_samples: streak.count,
            since: streak.started_at.unwrap_or(now),
        })
    }
}

impl Default for UnderutilizationDetector {
    fn default() -> Self {
        Self::new(0.1, 10)
    }
}

/// Underutilization details
#[derive(Debug, Clone)]
pub struct UnderutilizationAnomaly {
    /// Ratio of the sample that completed the streak
    pub ratio: f64,
    pub floor: f64,
    pub consecutive_samples: u32,
    pub since: DateTime<Utc>,
}

impl UnderutilizationAnomaly {
    /// High when the workload uses less than a quarter of the floor
    pub fn severity(&self) -> Severity {
        if self.ratio < self.floor * 0.25 {
            Severity::High
        } else {
            Severity::Warning
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_streak_reaches_threshold() {
        let detector = UnderutilizationDetector::new(0.1, 3);
        let mut streak = UnderutilizationStreak::default();
        let t0 = Utc::now();

        for i in 0..2 {
            detector.update(&mut streak, Some(0.02), t0 + Duration::seconds(i * 30));
            assert!(detector.detect(&streak, t0).is_none());
        }
        detector.update(&mut streak, Some(0.02), t0 + Duration::seconds(60));

        let anomaly = detector.detect(&streak, t0).unwrap();
        assert_eq!(anomaly.consecutive_samples, 3);
        assert_eq!(anomaly.since, t0);
        assert_eq!(anomaly.severity(), Severity::High);
    }

    #[test]
    fn test_sample_above_floor_breaks_streak() {
        let detector = UnderutilizationDetector::new(0.1, 3);
        let mut streak = UnderutilizationStreak::default();
        let t0 = Utc::now();

        detector.update(&mut streak, Some(0.05), t0);
        detector.update(&mut streak, Some(0.05), t0);
        detector.update(&mut streak, Some(0.5), t0);
        assert_eq!(streak.count, 0);

        detector.update(&mut streak, Some(0.05), t0);
        assert_eq!(streak.count, 1);
    }

    #[test]
    fn test_missing_ratio_leaves_streak() {
        let detector = UnderutilizationDetector::new(0.1, 3);
        let mut streak = UnderutilizationStreak::default();
        let t0 = Utc::now();

        detector.update(&mut streak, Some(0.05), t0);
        detector.update(&mut streak, None, t0);
        assert_eq!(streak.count, 1);
    }

    #[test]
    fn test_ratio_at_floor_is_not_low() {
        let detector = UnderutilizationDetector::new(0.1, 1);
        let mut streak = UnderutilizationStreak::default();
        detector.update(&mut streak, Some(0.1), Utc::now());
        assert_eq!(streak.count, 0);
    }
}
