//! What happens to a key after a failed sync.

use ingressor_core::{Error, ResourceKey};
use ingressor_queue::WorkQueue;
use metrics::counter;
use tracing::error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Scheduled again after the queue's backoff.
    Requeued,
    /// Given up on: the error is permanent or retries are exhausted.
    Dropped,
}

impl RetryDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetryDecision::Requeued => "requeued",
            RetryDecision::Dropped => "dropped",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// A key is requeued while its requeue count is at or below this.
    pub max_retries: u32,
    /// Reset the backoff right after scheduling a retry. Every retry then
    /// waits the base delay and the key is never dropped.
    pub forget_on_retry: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self { Self { max_retries: 10, forget_on_retry: false } }
}

impl RetryPolicy {
    /// Requeue or drop `key` after `err`. The error is always reported.
    pub fn handle_error(&self, queue: &WorkQueue<ResourceKey>, key: &ResourceKey, err: &Error) -> RetryDecision {
        let requeues = queue.num_requeues(key);
        let decision = if err.is_retryable() && requeues <= self.max_retries {
            queue.add_rate_limited(key.clone());
            RetryDecision::Requeued
        } else {
            RetryDecision::Dropped
        };

        let exhausted = err.is_retryable() && decision == RetryDecision::Dropped;
        error!(%key, error = %err, requeues, exhausted, decision = decision.as_str(), "reconcile failed");
        counter!("reconcile_errors_total", 1u64, "decision" => decision.as_str());

        if decision == RetryDecision::Dropped || self.forget_on_retry {
            queue.forget(key);
        }
        decision
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ingressor_queue::ItemExponentialFailureRateLimiter;
    use std::time::Duration;

    fn queue() -> WorkQueue<ResourceKey> {
        WorkQueue::new("retry-test", ItemExponentialFailureRateLimiter::new(Duration::from_millis(5), Duration::from_secs(1)))
    }

    fn key() -> ResourceKey { "default/web".parse().unwrap() }

    fn transient() -> Error { Error::Store("connection refused".into()) }

    #[tokio::test(start_paused = true)]
    async fn requeues_up_to_bound_then_drops() {
        let q = queue();
        let policy = RetryPolicy { max_retries: 2, forget_on_retry: false };

        let decisions: Vec<_> = (0..4).map(|_| policy.handle_error(&q, &key(), &transient())).collect();
        assert_eq!(
            decisions,
            vec![RetryDecision::Requeued, RetryDecision::Requeued, RetryDecision::Requeued, RetryDecision::Dropped]
        );
        assert_eq!(q.num_requeues(&key()), 0, "dropped key is forgotten");
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_key_is_never_retried() {
        let q = queue();
        let d = RetryPolicy::default().handle_error(&q, &key(), &Error::MalformedKey("a/b/c".into()));
        assert_eq!(d, RetryDecision::Dropped);
        assert_eq!(q.num_requeues(&key()), 0);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(q.is_empty());
    }

    // forget_on_retry resets the counter after every retry, so backoff never
    // escalates and the bound is never reached.
    #[tokio::test(start_paused = true)]
    async fn forget_on_retry_never_escalates() {
        let q = queue();
        let policy = RetryPolicy { max_retries: 2, forget_on_retry: true };
        for _ in 0..20 {
            assert_eq!(policy.handle_error(&q, &key(), &transient()), RetryDecision::Requeued);
            assert_eq!(q.num_requeues(&key()), 0);
        }
    }
}
