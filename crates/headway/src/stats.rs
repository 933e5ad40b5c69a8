// Window throughput statistics and the consumer-facing status snapshot.
//
// Aggregates are recomputed from scratch whenever any transfer reports
// progress; the windowed set is small, so there is nothing to amortize.

use std::fmt;
use std::time::Duration;

use serde::Serialize;

use crate::policy::{Health, bytes_per_sec_to_mbit};

/// Aggregate throughput over the windowed transfers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct WindowStats {
    /// Sum of all nonzero transfer speeds, bytes/sec
    pub total_speed: f64,
    /// Mean of all nonzero transfer speeds; `None` until a transfer has
    /// recorded a speed, so just-created entries never skew the average
    pub average_speed: Option<f64>,
    /// Number of transfers contributing to the aggregates
    pub measured_transfers: usize,
}

impl WindowStats {
    /// Compute aggregates from per-transfer speeds, excluding any transfer
    /// with no recorded speed yet.
    pub fn from_speeds(speeds: impl IntoIterator<Item = f64>) -> Self {
        let mut total = 0.0;
        let mut count = 0usize;
        for speed in speeds {
            if speed > 0.0 {
                total += speed;
                count += 1;
            }
        }

        Self {
            total_speed: total,
            average_speed: (count > 0).then(|| total / count as f64),
            measured_transfers: count,
        }
    }

    /// A transfer's speed relative to the window average, undefined while
    /// the average is.
    pub fn speed_ratio(&self, speed: f64) -> Option<f64> {
        self.average_speed
            .filter(|avg| *avg > 0.0)
            .map(|avg| speed / avg)
    }
}

// --- Snapshot ---

/// One row of the status report, describing a single windowed transfer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SegmentRow {
    pub index: u64,
    /// bytes/sec
    pub speed: f64,
    pub speed_ratio: Option<f64>,
    pub health: Health,
    pub requested: bool,
    pub loaded: bool,
    /// Completed fraction, `None` while the payload length is unknown
    pub progress: Option<f64>,
    pub retries: u32,
}

/// Point-in-time view of the whole window, published on every state change.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WindowSnapshot {
    pub rows: Vec<SegmentRow>,
    pub stats: WindowStats,
    /// Index the consumer is currently blocked on, if any
    pub requested_index: Option<u64>,
    /// Elapsed session time, carried for display only
    pub elapsed: Duration,
}

impl fmt::Display for WindowSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{:>7}  {:>8}  {:>6}  {:>6}  {:>4}  {:>4}  {:>8}  {:>7}",
            "segment", "mbit/s", "ratio", "health", "req", "done", "progress", "retries"
        )?;

        for row in &self.rows {
            let ratio = row
                .speed_ratio
                .map(|r| format!("{r:.2}"))
                .unwrap_or_else(|| "-".to_string());
            let progress = row
                .progress
                .map(|p| format!("{:.0}%", p * 100.0))
                .unwrap_or_else(|| "-".to_string());

            writeln!(
                f,
                "{:>7}  {:>8.2}  {:>6}  {:>6}  {:>4}  {:>4}  {:>8}  {:>7}",
                row.index,
                bytes_per_sec_to_mbit(row.speed),
                ratio,
                row.health,
                if row.requested { "yes" } else { "no" },
                if row.loaded { "yes" } else { "no" },
                progress,
                row.retries,
            )?;
        }

        let average = self
            .stats
            .average_speed
            .map(|s| format!("{:.2} mbit/s", bytes_per_sec_to_mbit(s)))
            .unwrap_or_else(|| "-".to_string());
        writeln!(
            f,
            "total: {:.2} mbit/s  average: {average}",
            bytes_per_sec_to_mbit(self.stats.total_speed),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    // --- Unit Tests ---

    #[test]
    fn test_stats_empty() {
        let stats = WindowStats::from_speeds([]);
        assert_eq!(stats.total_speed, 0.0);
        assert_eq!(stats.average_speed, None);
        assert_eq!(stats.measured_transfers, 0);
    }

    #[test]
    fn test_stats_excludes_zero_speeds() {
        // Two measured transfers, two just created
        let stats = WindowStats::from_speeds([4000.0, 0.0, 2000.0, 0.0]);
        assert_eq!(stats.total_speed, 6000.0);
        assert_eq!(stats.average_speed, Some(3000.0));
        assert_eq!(stats.measured_transfers, 2);
    }

    #[test]
    fn test_stats_all_zero_speeds() {
        let stats = WindowStats::from_speeds([0.0, 0.0, 0.0]);
        assert_eq!(stats.average_speed, None);
        assert_eq!(stats.measured_transfers, 0);
    }

    #[test]
    fn test_speed_ratio() {
        let stats = WindowStats::from_speeds([1000.0, 3000.0]);
        assert_eq!(stats.average_speed, Some(2000.0));
        assert_eq!(stats.speed_ratio(1000.0), Some(0.5));
        assert_eq!(stats.speed_ratio(0.0), Some(0.0));

        let empty = WindowStats::from_speeds([]);
        assert_eq!(empty.speed_ratio(1000.0), None);
    }

    #[test]
    fn test_snapshot_display_layout() {
        let snapshot = WindowSnapshot {
            rows: vec![
                SegmentRow {
                    index: 10,
                    speed: 262144.0,
                    speed_ratio: Some(1.0),
                    health: Health::Good,
                    requested: true,
                    loaded: false,
                    progress: Some(0.5),
                    retries: 0,
                },
                SegmentRow {
                    index: 11,
                    speed: 0.0,
                    speed_ratio: None,
                    health: Health::Wait,
                    requested: false,
                    loaded: false,
                    progress: None,
                    retries: 1,
                },
            ],
            stats: WindowStats::from_speeds([262144.0]),
            requested_index: Some(10),
            elapsed: Duration::from_secs(3),
        };

        let rendered = snapshot.to_string();
        assert!(rendered.contains("segment"));
        assert!(rendered.contains("2.00"), "speed column should be in mbit: {rendered}");
        assert!(rendered.contains("50%"));
        assert!(rendered.contains("wait"));
        assert!(rendered.contains("total: 2.00 mbit/s"));
        assert_eq!(rendered.lines().count(), 4);
    }

    // Property-based tests

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// For any mix of measured and unmeasured transfers, the total is the
        /// sum of the nonzero speeds and the average times the contributing
        /// count equals the total.
        #[test]
        fn prop_stats_consistency(
            speeds in prop::collection::vec(prop_oneof![Just(0.0f64), 1.0f64..10_000_000.0], 0..40)
        ) {
            let stats = WindowStats::from_speeds(speeds.iter().copied());

            let expected_total: f64 = speeds.iter().filter(|s| **s > 0.0).sum();
            let expected_count = speeds.iter().filter(|s| **s > 0.0).count();

            prop_assert!((stats.total_speed - expected_total).abs() < 1e-6);
            prop_assert_eq!(stats.measured_transfers, expected_count);

            match stats.average_speed {
                None => prop_assert_eq!(expected_count, 0),
                Some(avg) => {
                    prop_assert!(expected_count > 0);
                    prop_assert!(
                        (avg * expected_count as f64 - expected_total).abs() < 1e-6,
                        "average * count should equal total: {} * {} vs {}",
                        avg,
                        expected_count,
                        expected_total
                    );
                }
            }
        }
    }
}
