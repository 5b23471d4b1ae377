//! Retry with backoff for transient failures.
//!
//! Used by the task executor when establishing node connections: a
//! connection attempt that fails with a retryable error is repeated up to
//! [`RetryPolicy::max_retries`] times with a growing delay in between.
//!
//! # Example
//!
//! ```rust,ignore
//! use homestead::retry::{BackoffStrategy, RetryPolicy};
//! use std::time::Duration;
//!
//! let policy = RetryPolicy::exponential(3, Duration::from_millis(200), Duration::from_secs(5));
//! let conn = policy
//!     .retry_if(|| connector.connect(&node), |e: &ConnectionError| e.is_retryable())
//!     .await?;
//! ```

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Backoff strategy for calculating delay between retries.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum BackoffStrategy {
    /// Constant delay between retries.
    Constant,

    /// Linear backoff: delay = initial_delay * (attempt + 1)
    Linear,

    /// Exponential backoff: delay = initial_delay * multiplier^attempt
    Exponential {
        /// Multiplier for exponential growth (default: 2.0)
        multiplier: f64,
    },
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self::Exponential { multiplier: 2.0 }
    }
}

impl BackoffStrategy {
    /// Calculate the delay for a given attempt number (0-indexed).
    pub fn calculate_delay(&self, attempt: u32, initial_delay: Duration) -> Duration {
        let base_millis = initial_delay.as_millis() as f64;

        let delay_millis = match self {
            Self::Constant => base_millis,
            Self::Linear => base_millis * (f64::from(attempt) + 1.0),
            Self::Exponential { multiplier } => base_millis * multiplier.powf(f64::from(attempt)),
        };

        Duration::from_millis(delay_millis.min(u64::MAX as f64) as u64)
    }
}

/// Jitter strategy for adding randomness to delays.
///
/// Nodes that lost connectivity together (a rebooted switch, say) would
/// otherwise all reconnect at the same instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JitterStrategy {
    /// Use the exact calculated delay.
    None,

    /// Random value between 0 and the calculated delay.
    Full,

    /// Half the delay plus a random value up to the other half.
    #[default]
    Equal,
}

impl JitterStrategy {
    /// Apply jitter to a calculated delay.
    pub fn apply(&self, delay: Duration) -> Duration {
        let millis = delay.as_millis() as u64;
        if millis == 0 {
            return delay;
        }

        let mut rng = rand::thread_rng();
        let jittered = match self {
            Self::None => millis,
            Self::Full => rng.gen_range(0..=millis),
            Self::Equal => {
                let half = millis / 2;
                half + rng.gen_range(0..=millis - half)
            }
        };

        Duration::from_millis(jittered)
    }
}

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts (0 means only the initial attempt).
    pub max_retries: u32,

    /// Delay before the first retry.
    #[serde(with = "humantime_serde")]
    pub initial_delay: Duration,

    /// Upper bound for any single delay.
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,

    /// Backoff strategy for calculating delays.
    pub backoff: BackoffStrategy,

    /// Jitter strategy for adding randomness.
    pub jitter: JitterStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            backoff: BackoffStrategy::default(),
            jitter: JitterStrategy::default(),
        }
    }
}

impl RetryPolicy {
    /// Create a policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Create a policy with simple constant delay retries.
    pub fn constant(max_retries: u32, delay: Duration) -> Self {
        Self {
            max_retries,
            initial_delay: delay,
            max_delay: delay,
            backoff: BackoffStrategy::Constant,
            jitter: JitterStrategy::None,
        }
    }

    /// Create a policy with exponential backoff.
    pub fn exponential(max_retries: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            initial_delay,
            max_delay,
            backoff: BackoffStrategy::Exponential { multiplier: 2.0 },
            jitter: JitterStrategy::Equal,
        }
    }

    /// Calculate the delay before retry number `attempt` (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.backoff.calculate_delay(attempt, self.initial_delay);
        self.jitter.apply(base.min(self.max_delay))
    }

    /// Run `operation` until it succeeds, `should_retry` rejects the error,
    /// or the retry budget is spent. Returns the last error on failure.
    pub async fn retry_if<F, Fut, T, E, P>(&self, mut operation: F, should_retry: P) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
        P: Fn(&E) -> bool,
    {
        let mut attempt = 0;

        loop {
            match operation().await {
                Ok(value) => {
                    if attempt > 0 {
                        debug!("Operation succeeded after {} retries", attempt);
                    }
                    return Ok(value);
                }
                Err(e) => {
                    if attempt >= self.max_retries || !should_retry(&e) {
                        return Err(e);
                    }

                    let delay = self.delay_for_attempt(attempt);
                    warn!(
                        "Attempt {} of {} failed: {}; retrying in {:?}",
                        attempt + 1,
                        self.max_retries + 1,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_backoff_delays() {
        let initial = Duration::from_millis(100);
        assert_eq!(
            BackoffStrategy::Constant.calculate_delay(3, initial),
            Duration::from_millis(100)
        );
        assert_eq!(
            BackoffStrategy::Linear.calculate_delay(2, initial),
            Duration::from_millis(300)
        );
        assert_eq!(
            BackoffStrategy::Exponential { multiplier: 2.0 }.calculate_delay(3, initial),
            Duration::from_millis(800)
        );
    }

    #[test]
    fn test_delay_is_capped() {
        let policy = RetryPolicy {
            jitter: JitterStrategy::None,
            ..RetryPolicy::exponential(10, Duration::from_secs(1), Duration::from_secs(5))
        };
        assert_eq!(policy.delay_for_attempt(8), Duration::from_secs(5));
    }

    #[test]
    fn test_equal_jitter_bounds() {
        let delay = Duration::from_millis(1000);
        for _ in 0..50 {
            let jittered = JitterStrategy::Equal.apply(delay);
            assert!(jittered >= Duration::from_millis(500));
            assert!(jittered <= delay);
        }
    }

    #[tokio::test]
    async fn test_retry_until_success() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let policy = RetryPolicy::constant(3, Duration::from_millis(1));

        let result: Result<u32, String> = policy
            .retry_if(
                || async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    if n < 2 {
                        Err(format!("attempt {} failed", n))
                    } else {
                        Ok(n)
                    }
                },
                |_| true,
            )
            .await;

        assert_eq!(result, Ok(2));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_gives_up_on_non_retryable() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let policy = RetryPolicy::constant(5, Duration::from_millis(1));

        let result: Result<(), String> = policy
            .retry_if(
                || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err("auth".to_string())
                },
                |e| e != "auth",
            )
            .await;

        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_budget_exhausted() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let policy = RetryPolicy::constant(2, Duration::from_millis(1));

        let result: Result<(), String> = policy
            .retry_if(
                || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err("timeout".to_string())
                },
                |_| true,
            )
            .await;

        assert_eq!(result, Err("timeout".to_string()));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }
}
