//! Capped exponential backoff

use crate::config::RetryConfig;
use crate::error::{Error, Result};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Delay before retry number `attempt` (0-based): `min(base * 2^attempt, cap)`
pub fn backoff_delay(policy: &RetryConfig, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt);
    policy
        .base_delay
        .checked_mul(factor)
        .unwrap_or(policy.max_delay)
        .min(policy.max_delay)
}

/// Attempt bookkeeping for one logical store operation.
///
/// Thrown retryable errors and partial progress (unprocessed keys) both consume
/// attempts from the same budget.
pub struct Backoff<'a> {
    policy: &'a RetryConfig,
    op_name: &'static str,
    attempt: u32,
}

impl<'a> Backoff<'a> {
    pub fn new(policy: &'a RetryConfig, op_name: &'static str) -> Self {
        Self {
            policy,
            op_name,
            attempt: 0,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempt + 1
    }

    /// Sleep before the next attempt. Returns `false` once the budget is spent.
    pub async fn wait(&mut self, reason: &(dyn std::fmt::Display + Sync)) -> bool {
        if self.attempt >= self.policy.max_retries {
            return false;
        }
        let delay = backoff_delay(self.policy, self.attempt);
        warn!(
            operation = self.op_name,
            attempt = self.attempt + 1,
            max_retries = self.policy.max_retries,
            delay_ms = delay.as_millis() as u64,
            reason = %reason,
            "Store operation incomplete, retrying"
        );
        metrics::counter!("store_retries_total", "operation" => self.op_name).increment(1);
        tokio::time::sleep(delay).await;
        self.attempt += 1;
        true
    }

    /// The error to surface when the budget is spent on `last`
    pub fn exhausted(&self, last: &dyn std::fmt::Display) -> Error {
        Error::unavailable(
            self.op_name,
            format!("gave up after {} attempts: {}", self.attempts(), last),
        )
    }
}

/// Run `operation`, retrying failures accepted by `should_retry` with capped
/// exponential backoff. Other errors are returned on first occurrence; when the
/// budget runs out the last failure is reported as `Unavailable`.
pub async fn retry_when<T, F, Fut, P>(
    policy: &RetryConfig,
    op_name: &'static str,
    should_retry: P,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    P: Fn(&Error) -> bool,
{
    let mut backoff = Backoff::new(policy, op_name);
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if !should_retry(&e) => return Err(e),
            Err(e) => {
                if matches!(e, Error::Throttled { .. }) {
                    metrics::counter!("store_throttled_total", "operation" => op_name)
                        .increment(1);
                }
                if !backoff.wait(&e).await {
                    return Err(backoff.exhausted(&e));
                }
            }
        }
    }
}

/// [`retry_when`] with the standard classification: only `Throttled` and
/// `Unavailable` are retried.
pub async fn retry_with_backoff<T, F, Fut>(
    policy: &RetryConfig,
    op_name: &'static str,
    operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    retry_when(policy, op_name, Error::is_retryable, operation).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
        }
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryConfig::default();
        assert_eq!(backoff_delay(&policy, 0), Duration::from_millis(1000));
        assert_eq!(backoff_delay(&policy, 1), Duration::from_millis(2000));
        assert_eq!(backoff_delay(&policy, 2), Duration::from_millis(4000));
        assert_eq!(backoff_delay(&policy, 3), Duration::from_millis(5000));
        assert_eq!(backoff_delay(&policy, 40), Duration::from_millis(5000));
    }

    #[tokio::test]
    async fn test_recovers_from_transient_failures() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result = retry_with_backoff(&fast_policy(3), "get_item", move || async move {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(Error::throttled("get_item", "slow down"))
            } else {
                Ok(7)
            }
        })
        .await;
        assert_eq!(tokio_test::assert_ok!(result), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhaustion_reports_unavailable() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<()> = retry_with_backoff(&fast_policy(2), "query", move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(Error::throttled("query", "slow down"))
        })
        .await;
        assert!(matches!(result, Err(Error::Unavailable { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_conflict_is_not_retried() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<()> = retry_with_backoff(&fast_policy(3), "transact_write", move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(Error::conflict("condition failed"))
        })
        .await;
        assert!(matches!(result, Err(Error::Conflict { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_custom_predicate_retries_conflicts() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result = retry_when(
            &fast_policy(3),
            "strict_popularity",
            |e| e.is_conflict(),
            move || async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(Error::conflict("counters moved"))
                } else {
                    Ok(())
                }
            },
        )
        .await;
        tokio_test::assert_ok!(result);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
