//! Retry policy for the flaky connect step.
//!
//! Delays grow linearly, not exponentially: bounded total wait matters more
//! than backing off hard. The policy is plain data and holds no counters, so
//! every user-initiated connect starts from attempt 1.

use crate::{RadioError, SessionError, ids};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Timing and attempt budget for one connect-and-fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Wait before the first attempt so the radio settles after a scan stops.
    pub settle_delay_ms: u64,
    /// Attempt `n > 1` waits `n * base_backoff_ms`.
    pub base_backoff_ms: u64,
    /// Hard bound on a single attempt (connect through final read).
    pub attempt_timeout_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            settle_delay_ms: 200,
            base_backoff_ms: 500,
            attempt_timeout_ms: 10_000,
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempt` (1-based).
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            Duration::from_millis(self.settle_delay_ms)
        } else {
            Duration::from_millis(self.base_backoff_ms.saturating_mul(u64::from(attempt)))
        }
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    /// Decide what follows a failed attempt.
    pub fn after_failure(&self, failed: RetryAttempt) -> RetryDecision {
        if !failed.last_error.is_retryable() {
            return RetryDecision::GiveUp(failed.last_error);
        }
        if failed.attempt_number >= self.max_attempts {
            return RetryDecision::GiveUp(SessionError::ConnectExhausted {
                attempts: failed.attempt_number,
                last: Box::new(failed.last_error),
            });
        }
        let next = failed.attempt_number + 1;
        RetryDecision::Retry {
            attempt: next,
            after: self.delay_before(next),
        }
    }

    /// Worst case wall clock for a whole connect-and-fetch.
    pub fn worst_case(&self) -> Duration {
        (1..=self.max_attempts)
            .map(|n| self.delay_before(n) + self.attempt_timeout())
            .sum()
    }
}

/// One failed attempt, as seen by the retry loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryAttempt {
    pub attempt_number: u32,
    pub last_error: SessionError,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { attempt: u32, after: Duration },
    GiveUp(SessionError),
}

/// Maps platform radio errors onto the session taxonomy.
///
/// Which status codes count as transient is configuration: the well-known
/// intermittent connect failure is just the default entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classifier {
    transient_status_codes: Vec<u16>,
}

impl Default for Classifier {
    fn default() -> Self {
        Self::new(vec![ids::GATT_ERROR])
    }
}

impl Classifier {
    pub fn new(transient_status_codes: Vec<u16>) -> Self {
        Self {
            transient_status_codes,
        }
    }

    pub fn is_transient_status(&self, code: u16) -> bool {
        self.transient_status_codes.contains(&code)
    }

    pub fn classify(&self, err: &RadioError) -> SessionError {
        match err {
            RadioError::Unavailable(msg) => SessionError::TransportUnavailable(msg.clone()),
            RadioError::LinkLost => SessionError::Transient(err.to_string()),
            RadioError::Status(code) if self.is_transient_status(*code) => {
                SessionError::Transient(err.to_string())
            }
            RadioError::Status(code) => {
                SessionError::Permanent(format!("{} ({})", err, ids::status_name(*code)))
            }
            RadioError::NotFound(_) => SessionError::Permanent(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failed(n: u32, err: SessionError) -> RetryAttempt {
        RetryAttempt {
            attempt_number: n,
            last_error: err,
        }
    }

    #[test]
    fn first_attempt_waits_settle_delay() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_before(1), Duration::from_millis(200));
    }

    #[test]
    fn backoff_is_linear() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_before(2), Duration::from_millis(1000));
        assert_eq!(policy.delay_before(3), Duration::from_millis(1500));
        assert_eq!(policy.delay_before(5), Duration::from_millis(2500));
    }

    #[test]
    fn transient_retried_until_budget_spent() {
        let policy = RetryPolicy::default();
        let busy = SessionError::Transient("radio status 133".into());
        assert_eq!(
            policy.after_failure(failed(1, busy.clone())),
            RetryDecision::Retry {
                attempt: 2,
                after: Duration::from_millis(1000)
            }
        );
        match policy.after_failure(failed(5, busy)) {
            RetryDecision::GiveUp(SessionError::ConnectExhausted { attempts, .. }) => {
                assert_eq!(attempts, 5)
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }
    }

    #[test]
    fn permanent_short_circuits() {
        let policy = RetryPolicy::default();
        let err = SessionError::Permanent("characteristic missing".into());
        assert_eq!(
            policy.after_failure(failed(1, err.clone())),
            RetryDecision::GiveUp(err)
        );
    }

    #[test]
    fn worst_case_is_bounded() {
        let policy = RetryPolicy::default();
        // 200 + 1000 + 1500 + 2000 + 2500 of delays, plus five 10s attempts.
        assert_eq!(policy.worst_case(), Duration::from_millis(57_200));
    }

    #[test]
    fn classifier_uses_configured_codes() {
        let default = Classifier::default();
        assert!(default.classify(&RadioError::Status(133)).is_retryable());
        assert!(!default.classify(&RadioError::Status(8)).is_retryable());

        let custom = Classifier::new(vec![8, 62]);
        assert!(custom.classify(&RadioError::Status(8)).is_retryable());
        assert!(!custom.classify(&RadioError::Status(133)).is_retryable());
    }

    #[test]
    fn classifier_maps_fixed_classes() {
        let c = Classifier::default();
        assert!(matches!(
            c.classify(&RadioError::Unavailable("adapter off".into())),
            SessionError::TransportUnavailable(_)
        ));
        assert!(c.classify(&RadioError::LinkLost).is_retryable());
        assert!(matches!(
            c.classify(&RadioError::NotFound("AA".into())),
            SessionError::Permanent(_)
        ));
    }
}
