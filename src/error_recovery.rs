//! Bounded retry policy used when injecting cancellation.
//
// The executor does not get a hard guarantee that a running macro observes an
// abort on the first attempt: the body may be inside uninterruptible cleanup or
// parked on a pause. Aborts are therefore re-injected a bounded number of times.

use crate::config::ExecutorSettings;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

/// Defines a policy for retrying an operation.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// The maximum number of retry attempts.
    pub max_attempts: u32,
    /// The delay between retry attempts.
    pub backoff_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_delay: Duration::from_millis(200),
        }
    }
}

impl RetryPolicy {
    /// Policy used by the executor to abort the running macro.
    pub fn for_abort(settings: &ExecutorSettings) -> Self {
        Self {
            max_attempts: settings.abort_retries.max(1),
            backoff_delay: settings.abort_backoff(),
        }
    }
}

/// Runs `attempt` until it reports success or the policy is exhausted.
///
/// `attempt` receives the zero-based attempt number and returns `true` once the
/// operation took effect. Returns whether any attempt succeeded.
pub async fn retry_until<F, Fut>(policy: &RetryPolicy, mut attempt: F) -> bool
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = bool>,
{
    for n in 0..policy.max_attempts {
        if attempt(n).await {
            return true;
        }
        sleep(policy.backoff_delay).await;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_retry_logic_succeeds() {
        let attempts = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy {
            max_attempts: 3,
            backoff_delay: Duration::from_millis(10),
        };
        let counter = attempts.clone();
        let ok = retry_until(&policy, move |_| {
            let counter = counter.clone();
            async move { counter.fetch_add(1, Ordering::SeqCst) + 1 >= 2 }
        })
        .await;
        assert!(ok);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_retry_logic_fails() {
        let attempts = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy {
            max_attempts: 3,
            backoff_delay: Duration::from_millis(10),
        };
        let counter = attempts.clone();
        let ok = retry_until(&policy, move |_| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                false
            }
        })
        .await;
        assert!(!ok);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }
}
