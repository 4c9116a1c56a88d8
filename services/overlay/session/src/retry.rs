//! Auto-retry configuration and backoff computation.

use std::collections::BTreeMap;
use std::time::Duration;
use tracing::warn;

/// Contact point attribute: initial retry delay in seconds
pub const ATTRIBUTE_INITIAL_DELAY: &str = "autoRetryInitialDelay";
/// Contact point attribute: delay multiplier per consecutive failure
pub const ATTRIBUTE_DELAY_MULTIPLIER: &str = "autoRetryDelayMultiplier";
/// Contact point attribute: maximum delay in seconds, 0 for none
pub const ATTRIBUTE_MAXIMUM_DELAY: &str = "autoRetryMaximumDelay";

/// Smallest accepted initial delay; lower values disable auto-retry
pub const MIN_INITIAL_DELAY: Duration = Duration::from_secs(5);

/// Exponential backoff parameters for automatic reconnects
#[derive(Debug, Clone, PartialEq)]
pub struct AutoRetryPolicy {
    initial_delay: Duration,
    multiplier: f64,
    max_delay: Option<Duration>,
}

impl AutoRetryPolicy {
    /// Create a policy, applying the same rules as attribute parsing:
    /// an initial delay below [`MIN_INITIAL_DELAY`] yields `None`, a
    /// multiplier below 1 is raised to 1, and a maximum below the initial
    /// delay is dropped.
    pub fn new(initial_delay: Duration, multiplier: f64, max_delay: Option<Duration>) -> Option<Self> {
        if initial_delay < MIN_INITIAL_DELAY {
            warn!(
                "Auto-retry initial delay {:?} is below the minimum of {:?}; disabling auto-retry",
                initial_delay, MIN_INITIAL_DELAY
            );
            return None;
        }
        let multiplier = if multiplier.is_nan() || multiplier < 1.0 {
            warn!(
                "Auto-retry delay multiplier {} is below 1; using 1 instead",
                multiplier
            );
            1.0
        } else {
            multiplier
        };
        let max_delay = match max_delay {
            Some(max) if max.is_zero() => None,
            Some(max) if max < initial_delay => {
                warn!(
                    "Auto-retry maximum delay {:?} is lower than the initial delay {:?}; ignoring the maximum",
                    max, initial_delay
                );
                None
            }
            other => other,
        };
        Some(Self {
            initial_delay,
            multiplier,
            max_delay,
        })
    }

    /// Parse the policy from contact point attributes. Absent, malformed,
    /// or too small initial delays disable auto-retry.
    pub fn from_attributes(attributes: &BTreeMap<String, String>) -> Option<Self> {
        let initial = attributes.get(ATTRIBUTE_INITIAL_DELAY)?.trim();
        if initial.is_empty() {
            return None;
        }
        let initial_secs: u64 = match initial.parse() {
            Ok(v) => v,
            Err(_) => {
                warn!(
                    "Invalid value '{}' for {}; auto-retry disabled",
                    initial, ATTRIBUTE_INITIAL_DELAY
                );
                return None;
            }
        };

        let multiplier = match attributes.get(ATTRIBUTE_DELAY_MULTIPLIER).map(|v| v.trim()) {
            None | Some("") => 1.0,
            Some(v) => match v.parse::<f64>() {
                Ok(m) => m,
                Err(_) => {
                    warn!(
                        "Invalid value '{}' for {}; auto-retry disabled",
                        v, ATTRIBUTE_DELAY_MULTIPLIER
                    );
                    return None;
                }
            },
        };

        let max_delay = match attributes.get(ATTRIBUTE_MAXIMUM_DELAY).map(|v| v.trim()) {
            None | Some("") => None,
            Some(v) => match v.parse::<u64>() {
                Ok(secs) => Some(Duration::from_secs(secs)),
                Err(_) => {
                    warn!(
                        "Invalid value '{}' for {}; auto-retry disabled",
                        v, ATTRIBUTE_MAXIMUM_DELAY
                    );
                    return None;
                }
            },
        };

        Self::new(Duration::from_secs(initial_secs), multiplier, max_delay)
    }

    /// Initial delay
    pub fn initial_delay(&self) -> Duration {
        self.initial_delay
    }

    /// Multiplier per consecutive failure
    pub fn multiplier(&self) -> f64 {
        self.multiplier
    }

    /// Upper bound of the delay, if any
    pub fn max_delay(&self) -> Option<Duration> {
        self.max_delay
    }

    /// Delay before the next attempt after `consecutive_failures` failures
    pub fn delay_for(&self, consecutive_failures: u32) -> Duration {
        let exponent = consecutive_failures.saturating_sub(1).min(i32::MAX as u32) as i32;
        let millis = self.initial_delay.as_millis() as f64 * self.multiplier.powi(exponent);
        let millis = if millis.is_finite() && millis < u64::MAX as f64 {
            millis.round() as u64
        } else {
            u64::MAX
        };
        let delay = Duration::from_millis(millis);
        match self.max_delay {
            Some(max) => delay.min(max),
            None => delay,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attrs(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_backoff_sequence() {
        let policy = AutoRetryPolicy::new(
            Duration::from_secs(5),
            2.0,
            Some(Duration::from_secs(30)),
        )
        .unwrap();

        let delays: Vec<u64> = (1..=6).map(|k| policy.delay_for(k).as_secs()).collect();
        assert_eq!(delays, vec![5, 10, 20, 30, 30, 30]);
    }

    #[test]
    fn test_backoff_is_monotonic_and_bounded() {
        let policy = AutoRetryPolicy::new(
            Duration::from_secs(7),
            1.7,
            Some(Duration::from_secs(600)),
        )
        .unwrap();
        let mut previous = Duration::ZERO;
        for k in 1..200 {
            let delay = policy.delay_for(k);
            assert!(delay >= previous);
            assert!(delay <= Duration::from_secs(600));
            previous = delay;
        }
    }

    #[test]
    fn test_unbounded_does_not_overflow() {
        let policy = AutoRetryPolicy::new(Duration::from_secs(5), 10.0, None).unwrap();
        assert_eq!(policy.delay_for(1000), Duration::from_millis(u64::MAX));
    }

    #[test]
    fn test_from_attributes() {
        let policy = AutoRetryPolicy::from_attributes(&attrs(&[
            (ATTRIBUTE_INITIAL_DELAY, "10"),
            (ATTRIBUTE_DELAY_MULTIPLIER, "1.5"),
            (ATTRIBUTE_MAXIMUM_DELAY, "60"),
        ]))
        .unwrap();
        assert_eq!(policy.initial_delay(), Duration::from_secs(10));
        assert_eq!(policy.multiplier(), 1.5);
        assert_eq!(policy.max_delay(), Some(Duration::from_secs(60)));
        assert_eq!(policy.delay_for(2), Duration::from_secs(15));
    }

    #[test]
    fn test_defaults_and_corrections() {
        let policy =
            AutoRetryPolicy::from_attributes(&attrs(&[(ATTRIBUTE_INITIAL_DELAY, "5")])).unwrap();
        assert_eq!(policy.multiplier(), 1.0);
        assert_eq!(policy.max_delay(), None);

        let policy = AutoRetryPolicy::from_attributes(&attrs(&[
            (ATTRIBUTE_INITIAL_DELAY, "20"),
            (ATTRIBUTE_DELAY_MULTIPLIER, "0.5"),
            (ATTRIBUTE_MAXIMUM_DELAY, "10"),
        ]))
        .unwrap();
        assert_eq!(policy.multiplier(), 1.0);
        assert_eq!(policy.max_delay(), None);

        let policy = AutoRetryPolicy::from_attributes(&attrs(&[
            (ATTRIBUTE_INITIAL_DELAY, "20"),
            (ATTRIBUTE_MAXIMUM_DELAY, "0"),
        ]))
        .unwrap();
        assert_eq!(policy.max_delay(), None);
    }

    #[test]
    fn test_disabled() {
        assert!(AutoRetryPolicy::from_attributes(&attrs(&[])).is_none());
        assert!(AutoRetryPolicy::from_attributes(&attrs(&[(ATTRIBUTE_INITIAL_DELAY, "4")])).is_none());
        assert!(AutoRetryPolicy::from_attributes(&attrs(&[(ATTRIBUTE_INITIAL_DELAY, "abc")])).is_none());
        assert!(AutoRetryPolicy::from_attributes(&attrs(&[
            (ATTRIBUTE_INITIAL_DELAY, "10"),
            (ATTRIBUTE_DELAY_MULTIPLIER, "fast"),
        ]))
        .is_none());
    }
}
