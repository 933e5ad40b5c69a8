// Transfer health policy: decides when a running transfer counts as too slow.
//
// Health is judged per progress event, never before the grace period has
// elapsed on the transfer's own clock. A transfer judged `Bad` is a retry
// candidate; the window manager owns the actual retry decision.

use std::fmt;
use std::time::Duration;

use serde::Serialize;

/// bytes/sec to megabit/sec (1024 * 1024 / 8).
const MBIT_DIVISOR: f64 = 131072.0;

/// Relative policy: unhealthy below this fraction of the window average.
pub const SLOW_RATIO_THRESHOLD: f64 = 0.5;

/// Fixed policy: slack subtracted from the per-connection fair share.
pub const FIXED_SHARE_MARGIN_MBIT: f64 = 0.1;

pub fn bytes_per_sec_to_mbit(speed: f64) -> f64 {
    speed / MBIT_DIVISOR
}

// --- Retry Policy ---

/// Slow-connection retry policy, selectable per session.
///
/// `Relative` adapts to whatever the window's own average throughput is,
/// self-correcting under varying network conditions. `Fixed` assumes a known
/// total bandwidth budget and flags a connection underperforming its fair
/// share, which fits links with an external cap.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum RetryPolicy {
    /// Never retry on slowness; hard transport errors still retry
    #[default]
    Off,
    /// Unhealthy when speed falls below half the window average
    Relative,
    /// Unhealthy when speed falls below `(budget / window_size) - margin`
    Fixed { budget_mbit: f64 },
}

impl RetryPolicy {
    pub fn fixed() -> Self {
        Self::Fixed { budget_mbit: 12.0 }
    }

    pub fn is_active(&self) -> bool {
        !matches!(self, Self::Off)
    }
}

// --- Health ---

/// A transfer's classification relative to the policy's throughput
/// expectations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Health {
    /// Grace period still running, average undefined, or policy off
    Wait,
    Good,
    Bad,
}

impl fmt::Display for Health {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Health::Wait => write!(f, "wait"),
            Health::Good => write!(f, "good"),
            Health::Bad => write!(f, "bad"),
        }
    }
}

/// Judge a transfer's health from its observed speed.
///
/// # Arguments
/// * `elapsed` - time since the transfer's first byte, `None` before it
/// * `speed` - instantaneous throughput in bytes/sec
/// * `average_speed` - window average in bytes/sec, `None` while undefined
/// * `window_size` - concurrent transfer count the fixed budget is split over
pub fn evaluate_health(
    policy: &RetryPolicy,
    elapsed: Option<Duration>,
    grace_period: Duration,
    speed: f64,
    average_speed: Option<f64>,
    window_size: usize,
) -> Health {
    let Some(elapsed) = elapsed else {
        return Health::Wait;
    };
    if elapsed < grace_period {
        return Health::Wait;
    }

    match policy {
        RetryPolicy::Off => Health::Wait,
        RetryPolicy::Relative => {
            let Some(average) = average_speed.filter(|avg| *avg > 0.0) else {
                return Health::Wait;
            };
            if speed / average < SLOW_RATIO_THRESHOLD {
                Health::Bad
            } else {
                Health::Good
            }
        }
        RetryPolicy::Fixed { budget_mbit } => {
            let fair_share = budget_mbit / window_size.max(1) as f64 - FIXED_SHARE_MARGIN_MBIT;
            if bytes_per_sec_to_mbit(speed) < fair_share {
                Health::Bad
            } else {
                Health::Good
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GRACE: Duration = Duration::from_secs(8);

    fn past_grace() -> Option<Duration> {
        Some(Duration::from_secs(9))
    }

    fn mbit(speed: f64) -> f64 {
        speed * MBIT_DIVISOR
    }

    // --- Unit Tests ---

    #[test]
    fn test_wait_before_first_byte() {
        let health = evaluate_health(&RetryPolicy::Relative, None, GRACE, 0.0, Some(1000.0), 6);
        assert_eq!(health, Health::Wait);
    }

    #[test]
    fn test_wait_during_grace_period() {
        let slow = 10.0;
        let health = evaluate_health(
            &RetryPolicy::Relative,
            Some(Duration::from_secs(7)),
            GRACE,
            slow,
            Some(100_000.0),
            6,
        );
        assert_eq!(health, Health::Wait);
    }

    #[test]
    fn test_policy_off_never_judges() {
        let health = evaluate_health(&RetryPolicy::Off, past_grace(), GRACE, 1.0, Some(1e9), 6);
        assert_eq!(health, Health::Wait);
        assert!(!RetryPolicy::Off.is_active());
    }

    #[test]
    fn test_relative_wait_while_average_undefined() {
        let health = evaluate_health(&RetryPolicy::Relative, past_grace(), GRACE, 500.0, None, 6);
        assert_eq!(health, Health::Wait);

        // A zero average is treated the same as an undefined one
        let health = evaluate_health(
            &RetryPolicy::Relative,
            past_grace(),
            GRACE,
            500.0,
            Some(0.0),
            6,
        );
        assert_eq!(health, Health::Wait);
    }

    #[test]
    fn test_relative_threshold_boundary() {
        let average = Some(10_000.0);

        // Exactly half the average is still good; the comparison is strict
        let health = evaluate_health(
            &RetryPolicy::Relative,
            past_grace(),
            GRACE,
            5_000.0,
            average,
            6,
        );
        assert_eq!(health, Health::Good);

        let health = evaluate_health(
            &RetryPolicy::Relative,
            past_grace(),
            GRACE,
            4_999.0,
            average,
            6,
        );
        assert_eq!(health, Health::Bad);
    }

    #[test]
    fn test_fixed_default_budget_threshold() {
        // budget 12, window 6: fair share is 2.0 - 0.1 = 1.9 mbit/s
        let policy = RetryPolicy::fixed();

        let health = evaluate_health(&policy, past_grace(), GRACE, mbit(1.5), None, 6);
        assert_eq!(health, Health::Bad);

        let health = evaluate_health(&policy, past_grace(), GRACE, mbit(2.0), None, 6);
        assert_eq!(health, Health::Good);

        // Just under the threshold
        let health = evaluate_health(&policy, past_grace(), GRACE, mbit(1.89), None, 6);
        assert_eq!(health, Health::Bad);
    }

    #[test]
    fn test_fixed_custom_budget() {
        // budget 24, window 6: fair share is 4.0 - 0.1 = 3.9 mbit/s
        let policy = RetryPolicy::Fixed { budget_mbit: 24.0 };

        let health = evaluate_health(&policy, past_grace(), GRACE, mbit(3.8), None, 6);
        assert_eq!(health, Health::Bad);

        let health = evaluate_health(&policy, past_grace(), GRACE, mbit(4.0), None, 6);
        assert_eq!(health, Health::Good);
    }

    #[test]
    fn test_fixed_ignores_window_average() {
        // The fixed budget judges against its own threshold, not the window
        let policy = RetryPolicy::fixed();
        let health = evaluate_health(&policy, past_grace(), GRACE, mbit(1.0), Some(1.0), 6);
        assert_eq!(health, Health::Bad);
    }

    #[test]
    fn test_mbit_conversion() {
        assert_eq!(bytes_per_sec_to_mbit(131072.0), 1.0);
        assert_eq!(bytes_per_sec_to_mbit(0.0), 0.0);
        assert!((bytes_per_sec_to_mbit(262144.0) - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_health_display() {
        assert_eq!(Health::Wait.to_string(), "wait");
        assert_eq!(Health::Good.to_string(), "good");
        assert_eq!(Health::Bad.to_string(), "bad");
    }
}
