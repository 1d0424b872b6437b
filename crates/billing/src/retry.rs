//! Bounded retry with cancellation
//!
//! Wraps `tokio-retry` so every caller gets the same three things: a fixed
//! attempt budget, a backoff schedule, and a cancellation token that ends the
//! wait early. A cancelled loop reports [`RetryOutcome::Cancelled`] instead of
//! an error so callers can treat it as "no data yet".

use std::future::Future;
use std::time::Duration;

use tokio_retry::strategy::{ExponentialBackoff, FixedInterval};
use tokio_retry::RetryIf;
use tokio_util::sync::CancellationToken;

/// Delay schedule between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    Fixed(Duration),
    Exponential { base: Duration, max: Duration },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: usize,
    pub backoff: Backoff,
}

/// How a retried operation ended
#[derive(Debug)]
pub enum RetryOutcome<T, E> {
    Succeeded(T),
    /// Every attempt failed with a retryable error; carries the last one
    Exhausted(E),
    /// An attempt failed with an error the condition refused to retry
    Aborted(E),
    Cancelled,
}

impl RetryPolicy {
    pub fn new(max_attempts: usize, backoff: Backoff) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    /// Single attempt, no waiting
    pub fn none() -> Self {
        Self::new(1, Backoff::Fixed(Duration::ZERO))
    }

    /// Delays slept between attempts; one fewer than `max_attempts`
    pub fn delays(&self) -> Box<dyn Iterator<Item = Duration> + Send> {
        let gaps = self.max_attempts.saturating_sub(1);
        match self.backoff {
            Backoff::Fixed(delay) => Box::new(FixedInterval::new(delay).take(gaps)),
            Backoff::Exponential { base, max } => {
                let base_ms = u64::try_from(base.as_millis()).unwrap_or(u64::MAX).max(1);
                Box::new(
                    ExponentialBackoff::from_millis(2)
                        .factor(base_ms / 2 + 1)
                        .max_delay(max)
                        .take(gaps),
                )
            }
        }
    }

    /// Run `action` until it succeeds, the budget is spent, `should_retry`
    /// rejects an error, or `cancel` fires.
    pub async fn run<T, E, A, Fut, C>(
        &self,
        cancel: &CancellationToken,
        mut action: A,
        should_retry: C,
    ) -> RetryOutcome<T, E>
    where
        A: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Fn(&E) -> bool,
    {
        if cancel.is_cancelled() {
            return RetryOutcome::Cancelled;
        }

        let retry = RetryIf::spawn(self.delays(), || action(), |e: &E| should_retry(e));

        tokio::select! {
            biased;
            _ = cancel.cancelled() => RetryOutcome::Cancelled,
            result = retry => match result {
                Ok(value) => RetryOutcome::Succeeded(value),
                Err(e) if should_retry(&e) => RetryOutcome::Exhausted(e),
                Err(e) => RetryOutcome::Aborted(e),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_fixed_policy_sleeps_between_attempts_only() {
        let policy = RetryPolicy::new(5, Backoff::Fixed(Duration::from_secs(2)));
        let delays: Vec<_> = policy.delays().collect();
        assert_eq!(delays, vec![Duration::from_secs(2); 4]);
    }

    #[test]
    fn test_zero_attempts_is_clamped_to_one() {
        let policy = RetryPolicy::new(0, Backoff::Fixed(Duration::from_secs(1)));
        assert_eq!(policy.max_attempts, 1);
        assert_eq!(policy.delays().count(), 0);
    }

    #[test]
    fn test_exponential_policy_is_capped() {
        let policy = RetryPolicy::new(
            6,
            Backoff::Exponential {
                base: Duration::from_millis(200),
                max: Duration::from_secs(1),
            },
        );
        let delays: Vec<_> = policy.delays().collect();
        assert_eq!(delays.len(), 5);
        assert!(delays.iter().all(|d| *d <= Duration::from_secs(1)));
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausts_budget_with_fixed_spacing() {
        let policy = RetryPolicy::new(5, Backoff::Fixed(Duration::from_secs(2)));
        let calls = AtomicUsize::new(0);
        let started = tokio::time::Instant::now();

        let outcome: RetryOutcome<(), &str> = policy
            .run(
                &CancellationToken::new(),
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err("not yet") }
                },
                |_| true,
            )
            .await;

        assert!(matches!(outcome, RetryOutcome::Exhausted("not yet")));
        assert_eq!(calls.load(Ordering::SeqCst), 5);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(8) && elapsed < Duration::from_millis(8_100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_error_aborts_immediately() {
        let policy = RetryPolicy::new(5, Backoff::Fixed(Duration::from_secs(2)));
        let calls = AtomicUsize::new(0);

        let outcome: RetryOutcome<(), &str> = policy
            .run(
                &CancellationToken::new(),
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err("declined") }
                },
                |e| *e != "declined",
            )
            .await;

        assert!(matches!(outcome, RetryOutcome::Aborted("declined")));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_on_later_attempt() {
        let policy = RetryPolicy::new(5, Backoff::Fixed(Duration::from_secs(2)));
        let calls = AtomicUsize::new(0);

        let outcome: RetryOutcome<usize, &str> = policy
            .run(
                &CancellationToken::new(),
                || {
                    let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    async move {
                        if n < 3 {
                            Err("not yet")
                        } else {
                            Ok(n)
                        }
                    }
                },
                |_| true,
            )
            .await;

        assert!(matches!(outcome, RetryOutcome::Succeeded(3)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_ends_wait_without_error() {
        let policy = RetryPolicy::new(5, Backoff::Fixed(Duration::from_secs(2)));
        let cancel = CancellationToken::new();
        let calls = AtomicUsize::new(0);

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(3)).await;
            trigger.cancel();
        });

        let outcome: RetryOutcome<(), &str> = policy
            .run(
                &cancel,
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err("not yet") }
                },
                |_| true,
            )
            .await;

        assert!(matches!(outcome, RetryOutcome::Cancelled));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_already_cancelled_token_skips_action() {
        let policy = RetryPolicy::none();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome: RetryOutcome<(), &str> =
            policy.run(&cancel, || async { Ok(()) }, |_| true).await;
        assert!(matches!(outcome, RetryOutcome::Cancelled));
    }
}
