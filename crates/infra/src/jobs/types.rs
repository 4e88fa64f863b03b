//! Retry policy and consumer bookkeeping types.

use serde::Serialize;

/// Bounded retry policy for processor failures.
///
/// A delivery carrying `retry_count < max_retries` is retried once more;
/// at or beyond the ceiling it is dead-lettered. With the default of 3 a job
/// gets at most 4 processor attempts (retry counts 0, 1, 2, 3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_retries: 3 }
    }
}

/// What to do with a delivery whose processing failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Publish a successor with `retry_count + 1`, then ack the original.
    Retry,
    /// `nack` without requeue; the main queue dead-letters to the failed queue.
    DeadLetter,
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self { max_retries }
    }

    /// No retries: the first failure dead-letters.
    pub fn no_retry() -> Self {
        Self { max_retries: 0 }
    }

    pub fn should_retry(&self, retry_count: u32) -> bool {
        retry_count < self.max_retries
    }

    pub fn decide(&self, retry_count: u32) -> RetryDecision {
        if self.should_retry(retry_count) {
            RetryDecision::Retry
        } else {
            RetryDecision::DeadLetter
        }
    }
}

/// Terminal resolution of one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Processor accepted the job; delivery acked.
    Acked,
    /// Successor published with this retry count; original acked.
    Retried { retry_count: u32 },
    /// `nack(requeue=false)`: malformed or out of retries.
    DeadLettered,
    /// Retry publish failed; original handed back to the broker unchanged.
    Requeued,
}

/// Consumer runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConsumerStats {
    pub received: u64,
    pub succeeded: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub malformed: u64,
    pub requeued: u64,
    pub uptime_secs: u64,
}

impl ConsumerStats {
    pub(crate) fn record(&mut self, outcome: DeliveryOutcome) {
        match outcome {
            DeliveryOutcome::Acked => self.succeeded += 1,
            DeliveryOutcome::Retried { .. } => self.retried += 1,
            DeliveryOutcome::DeadLettered => self.dead_lettered += 1,
            DeliveryOutcome::Requeued => self.requeued += 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn should_retry_respects_max_retries() {
        let policy = RetryPolicy::default();

        assert!(policy.should_retry(0));
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
        assert!(!policy.should_retry(4));
    }

    #[test]
    fn no_retry_dead_letters_first_failure() {
        assert_eq!(RetryPolicy::no_retry().decide(0), RetryDecision::DeadLetter);
    }

    proptest! {
        #[test]
        fn retries_granted_equal_max_retries(max in 0u32..20) {
            let policy = RetryPolicy::new(max);
            let granted = (0..=max + 5).filter(|c| policy.decide(*c) == RetryDecision::Retry).count();
            prop_assert_eq!(granted as u32, max);
        }
    }
}
