//! Delivery policy owned by the consumer runtime.

use std::time::Duration;

use rand::Rng;

/// What the consumer does when a handler fails.
#[derive(Debug, Clone)]
pub enum FailurePolicy {
    /// Log the failure and commit the offset anyway. The message is lost for
    /// this group.
    CommitAndContinue,
    /// Retry with backoff. See `RetryPolicy` for what happens after the last
    /// attempt.
    Retry(RetryPolicy),
}

impl Default for FailurePolicy {
    fn default() -> Self {
        FailurePolicy::Retry(RetryPolicy::default())
    }
}

/// Bounded exponential backoff.
///
/// After `max_attempts` failures the message goes to `dead_letter_topic` and
/// its offset is committed. Without a dead-letter topic the consumer stops
/// with the offset uncommitted, so the message is delivered again on restart.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Upper bound of the random delay added to each backoff.
    pub jitter: Duration,
    pub dead_letter_topic: Option<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(10),
            jitter: Duration::from_millis(100),
            dead_letter_topic: None,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based): initial * 2^(attempt-1),
    /// capped at `max_backoff`, plus jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        let base = self
            .initial_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff);

        let jitter_ms = self.jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return base;
        }
        base + Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
    }

    pub fn with_dead_letter_topic(mut self, topic: impl Into<String>) -> Self {
        self.dead_letter_topic = Some(topic.into());
        self
    }
}

/// Where a group with no committed offset starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StartFrom {
    #[default]
    Earliest,
    Latest,
}

/// Everything the delivery loop needs besides the handler.
#[derive(Debug, Clone)]
pub struct DeliveryPolicy {
    pub failure: FailurePolicy,
    pub start_from: StartFrom,
    /// Sleep between empty polls.
    pub poll_interval: Duration,
    /// Records fetched per partition per poll.
    pub batch_size: usize,
}

impl Default for DeliveryPolicy {
    fn default() -> Self {
        Self {
            failure: FailurePolicy::default(),
            start_from: StartFrom::Earliest,
            poll_interval: Duration::from_millis(100),
            batch_size: 100,
        }
    }
}

impl DeliveryPolicy {
    /// Dead-letter topic for poison messages and exhausted retries, if any.
    pub fn dead_letter_topic(&self) -> Option<&str> {
        match &self.failure {
            FailurePolicy::Retry(retry) => retry.dead_letter_topic.as_deref(),
            FailurePolicy::CommitAndContinue => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 10,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(1_000),
            jitter: Duration::ZERO,
            dead_letter_topic: None,
        }
    }

    #[test]
    fn backoff_doubles_until_cap() {
        let policy = no_jitter();
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(400));
        assert_eq!(policy.backoff(4), Duration::from_millis(800));
        assert_eq!(policy.backoff(5), Duration::from_millis(1_000));
        assert_eq!(policy.backoff(40), Duration::from_millis(1_000));
    }

    #[test]
    fn jitter_stays_within_bound() {
        let policy = RetryPolicy {
            jitter: Duration::from_millis(50),
            ..no_jitter()
        };
        for _ in 0..50 {
            let delay = policy.backoff(1);
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(150));
        }
    }

    #[test]
    fn default_policy_retries_without_dead_letter() {
        let policy = DeliveryPolicy::default();
        assert!(matches!(policy.failure, FailurePolicy::Retry(_)));
        assert!(policy.dead_letter_topic().is_none());
    }
}
