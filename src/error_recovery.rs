//! Bounded retry for operations against flaky devices.
//
// Liveness probes, tester pairing, and the tester handshake are all bounded by
// an attempt count rather than a wall-clock timeout. The attempt counts and
// delays are operator-tunable through configuration.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::warn;

/// Defines a policy for retrying an operation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// The maximum number of attempts (at least one is always made).
    pub max_attempts: u32,
    /// The delay between attempts.
    #[serde(with = "humantime_serde")]
    pub backoff_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_delay: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    /// Policy allowing `max_attempts` tries `backoff_delay` apart.
    pub fn new(max_attempts: u32, backoff_delay: Duration) -> Self {
        Self {
            max_attempts,
            backoff_delay,
        }
    }
}

/// Run `operation` until it succeeds or the policy's attempts are exhausted,
/// returning the last error in that case.
pub async fn with_retry<T, E, F, Fut>(policy: &RetryPolicy, what: &str, mut operation: F) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < attempts => {
                warn!("{} failed (attempt {}/{}): {}", what, attempt, attempts, err);
                sleep(policy.backoff_delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_retry_logic_succeeds() {
        let attempts = AtomicU32::new(0);
        let policy = RetryPolicy::new(3, Duration::from_millis(10));
        let result: Result<u32, String> = with_retry(&policy, "op", |n| {
            attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n >= 2 {
                    Ok(n)
                } else {
                    Err("Failed to recover".to_string())
                }
            }
        })
        .await;
        assert_eq!(result, Ok(2));
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_retry_logic_fails() {
        let attempts = AtomicU32::new(0);
        let policy = RetryPolicy::new(3, Duration::from_millis(10));
        let result: Result<(), String> = with_retry(&policy, "op", |_| {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err("Failed to recover".to_string()) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_zero_attempts_still_tries_once() {
        let attempts = AtomicU32::new(0);
        let policy = RetryPolicy::new(0, Duration::from_millis(1));
        let _: Result<(), String> = with_retry(&policy, "op", |_| {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err("nope".to_string()) }
        })
        .await;
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
