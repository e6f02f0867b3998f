//! Retry policy for webhook delivery sequences.
//!
//! A sequence is one initial attempt followed by up to `max_retries`
//! retries. The default backoff is quadratic: retry `k` waits `base * k²`
//! (1s, 4s, 9s, ...). A deadline bounds the whole sequence; a retry whose
//! backoff would end past it is not scheduled.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::DeliveryError;

/// Retry policy for webhook delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the initial attempt.
    pub max_retries: u32,

    /// Base delay the backoff strategy scales.
    pub base_delay: Duration,

    /// Upper bound of a single backoff.
    pub max_delay: Duration,

    /// Jitter percentage (0.0 to 1.0). Zero keeps delays exact.
    pub jitter_factor: f64,

    /// Strategy for calculating backoff delays.
    pub backoff_strategy: BackoffStrategy,

    /// Bound on the whole sequence, measured from the first attempt.
    pub deadline: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            jitter_factor: 0.0,
            backoff_strategy: BackoffStrategy::Quadratic,
            deadline: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    /// Total attempts allowed, initial one included.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Copy of this policy with a different retry count.
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Backoff before retry number `retry` (1-based), without jitter.
    pub fn backoff(&self, retry: u32) -> Duration {
        let retry = retry.max(1);
        let delay = match self.backoff_strategy {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Linear => self.base_delay.saturating_mul(retry),
            BackoffStrategy::Quadratic => self.base_delay.saturating_mul(retry.saturating_mul(retry)),
            BackoffStrategy::Exponential => {
                let exponent = (retry - 1).min(20);
                self.base_delay.saturating_mul(2_u32.saturating_pow(exponent))
            },
        };
        delay.min(self.max_delay)
    }
}

/// Strategy for calculating retry delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Same delay before every retry.
    Fixed,
    /// Delay grows by the base amount per retry.
    Linear,
    /// Delay is `base * retry²`.
    #[default]
    Quadratic,
    /// Delay doubles per retry.
    Exponential,
}

/// Context of one failed attempt.
#[derive(Debug, Clone)]
pub struct RetryContext<'a> {
    /// Attempt that just failed (1-based).
    pub attempt_number: u32,
    /// Why it failed.
    pub error: &'a DeliveryError,
    /// Time since the first attempt started.
    pub elapsed: Duration,
    /// Policy to apply.
    pub policy: &'a RetryPolicy,
}

/// Outcome of a retry decision.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Wait `delay`, then try again.
    Retry {
        /// Backoff before the next attempt
        delay: Duration,
    },
    /// Stop the sequence.
    GiveUp {
        /// Terminal error for the sequence
        error: DeliveryError,
    },
}

impl<'a> RetryContext<'a> {
    /// Creates a context for a failed attempt.
    pub fn new(
        attempt_number: u32,
        error: &'a DeliveryError,
        elapsed: Duration,
        policy: &'a RetryPolicy,
    ) -> Self {
        Self { attempt_number, error, elapsed, policy }
    }

    /// Decides whether and when to try again.
    pub fn decide_retry(&self) -> RetryDecision {
        if !self.error.is_retryable() {
            return RetryDecision::GiveUp { error: self.error.clone() };
        }

        if self.attempt_number >= self.policy.max_attempts() {
            return RetryDecision::GiveUp {
                error: DeliveryError::retries_exhausted(self.attempt_number),
            };
        }

        let delay = apply_jitter(self.policy.backoff(self.attempt_number), self.policy.jitter_factor)
            .min(self.policy.max_delay);

        if self.elapsed.saturating_add(delay) > self.policy.deadline {
            return RetryDecision::GiveUp {
                error: DeliveryError::DeadlineExceeded {
                    attempts: self.attempt_number,
                    deadline_seconds: self.policy.deadline.as_secs(),
                },
            };
        }

        RetryDecision::Retry { delay }
    }
}

/// Randomizes `duration` by ±`jitter_factor`.
fn apply_jitter(duration: Duration, jitter_factor: f64) -> Duration {
    if jitter_factor <= 0.0 {
        return duration;
    }

    let clamped_jitter = jitter_factor.clamp(0.0, 1.0);

    let mut rng = rand::rng();
    let jitter_range = duration.as_secs_f64() * clamped_jitter;
    let jitter_offset = rng.random_range(-jitter_range..=jitter_range);
    let jittered_secs = duration.as_secs_f64() + jitter_offset;

    Duration::from_secs_f64(jittered_secs.max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decide(attempt: u32, elapsed: Duration, policy: &RetryPolicy) -> RetryDecision {
        let error = DeliveryError::server_error(500, "boom");
        RetryContext::new(attempt, &error, elapsed, policy).decide_retry()
    }

    #[test]
    fn quadratic_backoff_grows_with_square_of_retry() {
        let policy = RetryPolicy::default();

        let delays: Vec<_> = (1..=4).map(|retry| policy.backoff(retry)).collect();

        assert_eq!(
            delays,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(4),
                Duration::from_secs(9),
                Duration::from_secs(16)
            ]
        );
    }

    #[test]
    fn other_strategies_follow_their_shape() {
        let base = RetryPolicy { base_delay: Duration::from_secs(2), ..RetryPolicy::default() };
        let fixed = RetryPolicy { backoff_strategy: BackoffStrategy::Fixed, ..base.clone() };
        let linear = RetryPolicy { backoff_strategy: BackoffStrategy::Linear, ..base.clone() };
        let exponential = RetryPolicy { backoff_strategy: BackoffStrategy::Exponential, ..base };

        assert_eq!(fixed.backoff(3), Duration::from_secs(2));
        assert_eq!(linear.backoff(3), Duration::from_secs(6));
        assert_eq!(exponential.backoff(3), Duration::from_secs(8));
    }

    #[test]
    fn backoff_is_capped_by_max_delay() {
        let policy = RetryPolicy { max_delay: Duration::from_secs(10), ..RetryPolicy::default() };
        assert_eq!(policy.backoff(5), Duration::from_secs(10));
    }

    #[test]
    fn retries_until_budget_is_used() {
        let policy = RetryPolicy::default();

        assert_eq!(
            decide(1, Duration::ZERO, &policy),
            RetryDecision::Retry { delay: Duration::from_secs(1) }
        );
        assert_eq!(
            decide(3, Duration::from_secs(5), &policy),
            RetryDecision::Retry { delay: Duration::from_secs(9) }
        );
        assert!(matches!(
            decide(4, Duration::from_secs(14), &policy),
            RetryDecision::GiveUp { error: DeliveryError::RetriesExhausted { attempts: 4 } }
        ));
    }

    #[test]
    fn zero_retries_means_single_attempt() {
        let policy = RetryPolicy::default().with_max_retries(0);
        assert_eq!(policy.max_attempts(), 1);
        assert!(matches!(decide(1, Duration::ZERO, &policy), RetryDecision::GiveUp { .. }));
    }

    #[test]
    fn deadline_stops_sequence_early() {
        let policy = RetryPolicy {
            max_retries: 10,
            deadline: Duration::from_secs(10),
            ..RetryPolicy::default()
        };

        // 1s + 4s fit, the 9s backoff after the third attempt does not.
        assert!(matches!(decide(2, Duration::from_secs(1), &policy), RetryDecision::Retry { .. }));
        assert!(matches!(
            decide(3, Duration::from_secs(5), &policy),
            RetryDecision::GiveUp { error: DeliveryError::DeadlineExceeded { attempts: 3, .. } }
        ));
    }

    #[test]
    fn non_retryable_error_gives_up_immediately() {
        let policy = RetryPolicy::default();
        let error = DeliveryError::configuration("no url");

        let decision = RetryContext::new(1, &error, Duration::ZERO, &policy).decide_retry();

        assert!(matches!(decision, RetryDecision::GiveUp { error: DeliveryError::Configuration { .. } }));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let base = Duration::from_secs(10);
        for _ in 0..100 {
            let jittered = apply_jitter(base, 0.25);
            assert!(jittered >= Duration::from_millis(7_500));
            assert!(jittered <= Duration::from_millis(12_500));
        }
    }
}
