//! Retry policy: how many attempts a cycle may make and how long to wait
//! between them.

use std::time::Duration;

use crate::config::{RetryType, TaskSpec};

/// Bound on retries within one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryLimit {
    /// Exactly one attempt per cycle.
    Never,
    /// Retry until success or cancellation.
    Infinite,
    /// Up to N retries after the first attempt.
    Limited(u32),
}

impl From<i64> for RetryLimit {
    fn from(value: i64) -> Self {
        match value {
            0 => Self::Never,
            v if v < 0 => Self::Infinite,
            v => Self::Limited(u32::try_from(v).unwrap_or(u32::MAX)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub limit: RetryLimit,
    /// Base wait, never zero.
    pub wait: Duration,
    pub retry_type: RetryType,
}

impl RetryPolicy {
    pub fn from_spec(spec: &TaskSpec) -> Self {
        let retry_type = match spec.retry_type {
            RetryType::Unrecognized => {
                tracing::warn!(
                    task = %spec.name,
                    "Unrecognized retry type, falling back to fixed wait"
                );
                RetryType::Fixed
            }
            other => other,
        };
        Self {
            limit: RetryLimit::from(spec.retry_limit),
            wait: Duration::from_secs(spec.retry_wait.max(1)),
            retry_type,
        }
    }

    /// Whether another attempt may follow failed attempt `attempt`.
    pub fn should_retry(&self, attempt: u32) -> bool {
        match self.limit {
            RetryLimit::Never => false,
            RetryLimit::Infinite => true,
            RetryLimit::Limited(n) => attempt < n,
        }
    }

    /// Wait after failed attempt `attempt` (0-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        match self.retry_type {
            RetryType::Exponential => {
                let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
                self.wait.saturating_mul(factor)
            }
            RetryType::Fixed | RetryType::Unrecognized => self.wait,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(limit: i64, wait: u64, retry_type: RetryType) -> RetryPolicy {
        RetryPolicy::from_spec(&TaskSpec::new("t", "true", "@hourly").with_retry(
            limit, wait, retry_type,
        ))
    }

    #[test]
    fn limit_semantics() {
        assert_eq!(RetryLimit::from(0), RetryLimit::Never);
        assert_eq!(RetryLimit::from(-1), RetryLimit::Infinite);
        assert_eq!(RetryLimit::from(3), RetryLimit::Limited(3));
    }

    #[test]
    fn never_retries() {
        let p = policy(0, 1, RetryType::Fixed);
        assert!(!p.should_retry(0));
    }

    #[test]
    fn limited_retries() {
        let p = policy(2, 1, RetryType::Fixed);
        assert!(p.should_retry(0));
        assert!(p.should_retry(1));
        assert!(!p.should_retry(2));
    }

    #[test]
    fn infinite_retries() {
        let p = policy(-1, 1, RetryType::Fixed);
        assert!(p.should_retry(0));
        assert!(p.should_retry(10_000));
    }

    #[test]
    fn fixed_backoff_is_constant() {
        let p = policy(5, 3, RetryType::Fixed);
        for i in 0..5 {
            assert_eq!(p.backoff(i), Duration::from_secs(3));
        }
    }

    #[test]
    fn exponential_backoff_doubles() {
        let p = policy(5, 3, RetryType::Exponential);
        assert_eq!(p.backoff(0), Duration::from_secs(3));
        assert_eq!(p.backoff(1), Duration::from_secs(6));
        assert_eq!(p.backoff(2), Duration::from_secs(12));
        assert_eq!(p.backoff(4), Duration::from_secs(48));
    }

    #[test]
    fn exponential_backoff_saturates() {
        let p = policy(-1, 3, RetryType::Exponential);
        assert!(p.backoff(64) >= p.backoff(31));
    }

    #[test]
    fn unrecognized_type_waits_like_fixed() {
        let p = policy(2, 4, RetryType::Unrecognized);
        assert_eq!(p.retry_type, RetryType::Fixed);
        assert_eq!(p.backoff(3), Duration::from_secs(4));
    }
}
