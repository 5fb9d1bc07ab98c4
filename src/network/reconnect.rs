//! Client-side reconnection with a fixed delay and a bounded attempt count.
//!
//! [`RetryPolicy`] hands out the delay before each attempt until the budget
//! is spent; [`retry`] drives an async connect closure against it.

use std::future::Future;
use std::time::Duration;

use tracing::{info, warn};

use crate::config::SyncConfig;

/// Fixed-delay retry budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Pause between attempts.
    pub delay: Duration,
    /// Total attempts, including the first one. At least one attempt is
    /// always made.
    pub max_attempts: u32,
}

impl RetryPolicy {
    /// Policy from configuration.
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            delay: config.reconnect_delay(),
            max_attempts: config.max_reconnect_attempts,
        }
    }

    /// Attempts that will actually run.
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Delay before attempt `attempt` (1-based), or `None` once exhausted.
    /// The first attempt runs immediately.
    pub fn delay_before(&self, attempt: u32) -> Option<Duration> {
        match attempt {
            0 => None,
            1 => Some(Duration::ZERO),
            n if n <= self.attempts() => Some(self.delay),
            _ => None,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&SyncConfig::default())
    }
}

/// Errors produced by the reconnection loop.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReconnectError {
    /// Every attempt failed.
    #[error("gave up after {attempts} attempts: {last_error}")]
    Exhausted {
        /// Attempts made.
        attempts: u32,
        /// Message of the final failure.
        last_error: String,
    },
}

/// Run `attempt` until it succeeds or the policy is spent.
pub async fn retry<T, E, F, Fut>(policy: RetryPolicy, mut attempt: F) -> Result<T, ReconnectError>
where
    E: std::fmt::Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut n = 1;
    let mut last_error = String::new();

    while let Some(delay) = policy.delay_before(n) {
        if !delay.is_zero() {
            info!("Reconnection attempt {} in {:?}", n, delay);
            tokio::time::sleep(delay).await;
        }

        match attempt(n).await {
            Ok(value) => {
                if n > 1 {
                    info!("Connected after {} attempts", n);
                }
                return Ok(value);
            }
            Err(e) => {
                warn!("Connection attempt {} failed: {}", n, e);
                last_error = e.to_string();
            }
        }
        n += 1;
    }

    Err(ReconnectError::Exhausted {
        attempts: n - 1,
        last_error,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            delay: Duration::from_millis(1),
            max_attempts,
        }
    }

    #[test]
    fn test_delay_schedule() {
        let p = RetryPolicy {
            delay: Duration::from_millis(500),
            max_attempts: 3,
        };
        assert_eq!(p.delay_before(1), Some(Duration::ZERO));
        assert_eq!(p.delay_before(2), Some(Duration::from_millis(500)));
        assert_eq!(p.delay_before(3), Some(Duration::from_millis(500)));
        assert_eq!(p.delay_before(4), None);
    }

    #[test]
    fn test_zero_attempts_still_tries_once() {
        let p = policy(0);
        assert_eq!(p.attempts(), 1);
        assert_eq!(p.delay_before(1), Some(Duration::ZERO));
        assert_eq!(p.delay_before(2), None);
    }

    #[tokio::test]
    async fn test_succeeds_after_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result = retry(policy(5), move |n| {
            c.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 3 {
                    Err("refused")
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_bounded_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result: Result<(), _> = retry(policy(4), move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            async { Err("refused") }
        })
        .await;

        assert_eq!(
            result,
            Err(ReconnectError::Exhausted {
                attempts: 4,
                last_error: "refused".into()
            })
        );
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }
}
