use std::future::Future;
use std::time::Duration;

use log::warn;
use rand::Rng;

use crate::error::MessagingResult;

/// Bounded exponential backoff for retryable messaging errors.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: u32,
    /// Spread each delay by up to 30% either way.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            multiplier: 2,
            jitter: true,
        }
    }
}

/// Runs `op` until it succeeds, fails permanently, or attempts run out.
/// The last error is returned unchanged.
pub async fn with_backoff<F, Fut, T>(policy: &RetryPolicy, mut op: F) -> MessagingResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = MessagingResult<T>>,
{
    let mut attempt = 1;
    let mut backoff = policy.initial_backoff;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < policy.max_attempts => {
                let delay = jittered(backoff, policy.jitter);
                warn!(
                    "attempt {}/{} failed: {}; retrying in {:?}",
                    attempt, policy.max_attempts, e, delay
                );
                tokio::time::sleep(delay).await;
                backoff = (backoff * policy.multiplier).min(policy.max_backoff);
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

fn jittered(base: Duration, jitter: bool) -> Duration {
    if jitter {
        base.mul_f64(rand::thread_rng().gen_range(0.7..1.3))
    } else {
        base
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MessagingError;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn quick() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
            multiplier: 2,
            jitter: false,
        }
    }

    #[test]
    fn test_jitter_stays_within_thirty_percent() {
        let base = Duration::from_millis(1000);
        for _ in 0..500 {
            let delay = jittered(base, true);
            assert!(delay >= Duration::from_millis(699), "{delay:?}");
            assert!(delay <= Duration::from_millis(1300), "{delay:?}");
        }
        assert_eq!(jittered(base, false), base);
    }

    #[tokio::test]
    async fn test_jittered_policy_still_retries() {
        let policy = RetryPolicy {
            jitter: true,
            ..quick()
        };
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result = with_backoff(&policy, move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(MessagingError::Conflict("busy".into()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result, Ok(1));
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result = with_backoff(&quick(), move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(MessagingError::TransientIo("flaky".into()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_attempts_are_bounded() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: MessagingResult<()> = with_backoff(&quick(), move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(MessagingError::TransientIo("down".into())) }
        })
        .await;
        assert_eq!(result, Err(MessagingError::TransientIo("down".into())));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_validation_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: MessagingResult<()> = with_backoff(&quick(), move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(MessagingError::Validation("empty".into())) }
        })
        .await;
        assert!(matches!(result, Err(MessagingError::Validation(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
