use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Exponential backoff schedule for activity and workflow attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
    pub initial_interval: Duration,
    pub backoff_coefficient: f64,
    pub max_interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::unbounded()
    }
}

impl RetryPolicy {
    /// Retry until the step succeeds: 1s doubling up to 100s.
    pub fn unbounded() -> Self {
        Self {
            max_attempts: None,
            initial_interval: Duration::from_secs(1),
            backoff_coefficient: 2.0,
            max_interval: Duration::from_secs(100),
        }
    }

    pub fn bounded(max_attempts: u32, initial_interval: Duration, max_interval: Duration) -> Self {
        Self {
            max_attempts: Some(max_attempts.max(1)),
            initial_interval,
            backoff_coefficient: 2.0,
            max_interval,
        }
    }

    pub fn no_retry() -> Self {
        Self::bounded(1, Duration::ZERO, Duration::ZERO)
    }

    /// For steps that create something outside the system, like a pull
    /// request: three attempts, 10s apart at first, at most 60s.
    pub fn side_effecting() -> Self {
        Self::bounded(3, Duration::from_secs(10), Duration::from_secs(60))
    }

    /// Whether attempt number `attempt` (1-based) may run.
    pub fn allows_attempt(&self, attempt: u32) -> bool {
        self.max_attempts.is_none_or(|max| attempt <= max)
    }

    /// Delay before the attempt following attempt number `attempt`.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(64) as i32;
        let factor = self.backoff_coefficient.max(1.0).powi(exponent);
        let secs = self.initial_interval.as_secs_f64() * factor;
        let capped = secs.min(self.max_interval.as_secs_f64());
        if capped.is_finite() && capped > 0.0 {
            Duration::from_secs_f64(capped)
        } else {
            self.max_interval
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_unbounded_exponential() {
        let policy = RetryPolicy::default();
        assert!(policy.allows_attempt(1_000));
        assert_eq!(policy.delay_after(1), Duration::from_secs(1));
        assert_eq!(policy.delay_after(2), Duration::from_secs(2));
        assert_eq!(policy.delay_after(4), Duration::from_secs(8));
        assert_eq!(policy.delay_after(30), Duration::from_secs(100));
    }

    #[test]
    fn test_side_effecting_policy() {
        let policy = RetryPolicy::side_effecting();
        assert!(policy.allows_attempt(3));
        assert!(!policy.allows_attempt(4));
        assert_eq!(policy.delay_after(1), Duration::from_secs(10));
        assert_eq!(policy.delay_after(2), Duration::from_secs(20));
        assert_eq!(policy.delay_after(3), Duration::from_secs(40));
        assert_eq!(policy.delay_after(4), Duration::from_secs(60));
    }

    #[test]
    fn test_no_retry_allows_exactly_one_attempt() {
        let policy = RetryPolicy::no_retry();
        assert!(policy.allows_attempt(1));
        assert!(!policy.allows_attempt(2));
    }

    #[test]
    fn test_bounded_never_below_one_attempt() {
        let policy = RetryPolicy::bounded(0, Duration::from_millis(5), Duration::from_millis(5));
        assert_eq!(policy.max_attempts, Some(1));
    }
}
