//! Bounded retry with backoff.
//!
//! Shared by the outbox relay (redelivery scheduling) and by the tenancy
//! components that talk to the storage engine.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Delay schedule between attempts.
#[derive(Debug, Clone, PartialEq)]
pub enum Backoff {
    /// No delay between retries.
    None,
    Constant(Duration),
    Linear {
        initial: Duration,
        increment: Duration,
        max: Duration,
    },
    Exponential {
        initial: Duration,
        multiplier: f64,
        max: Duration,
        /// Add up to 50% random jitter on top of the computed delay.
        jitter: bool,
    },
}

impl Backoff {
    pub fn constant(delay: Duration) -> Self {
        Self::Constant(delay)
    }

    pub fn linear(initial: Duration, increment: Duration) -> Self {
        Self::Linear {
            initial,
            increment,
            max: Duration::from_secs(60),
        }
    }

    pub fn exponential(initial: Duration) -> Self {
        Self::Exponential {
            initial,
            multiplier: 2.0,
            max: Duration::from_secs(60),
            jitter: false,
        }
    }

    pub fn exponential_with_jitter(initial: Duration) -> Self {
        Self::Exponential {
            initial,
            multiplier: 2.0,
            max: Duration::from_secs(60),
            jitter: true,
        }
    }

    pub fn with_max(self, max: Duration) -> Self {
        match self {
            Self::Linear {
                initial, increment, ..
            } => Self::Linear {
                initial,
                increment,
                max,
            },
            Self::Exponential {
                initial,
                multiplier,
                jitter,
                ..
            } => Self::Exponential {
                initial,
                multiplier,
                max,
                jitter,
            },
            other => other,
        }
    }

    /// Delay before retry number `attempt` (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match self {
            Self::None => Duration::ZERO,
            Self::Constant(d) => *d,
            Self::Linear {
                initial,
                increment,
                max,
            } => (*initial + increment.saturating_mul(attempt)).min(*max),
            Self::Exponential {
                initial,
                multiplier,
                max,
                jitter,
            } => {
                let factor = multiplier.powi(attempt.min(63) as i32);
                let base = (initial.as_millis() as f64 * factor).min(max.as_millis() as f64) as u64;
                let extra = if *jitter && base > 0 {
                    rand::rng().random_range(0..=base / 2)
                } else {
                    0
                };
                Duration::from_millis(base.saturating_add(extra)).min(*max)
            }
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::exponential_with_jitter(Duration::from_millis(200)).with_max(Duration::from_secs(5))
    }
}

/// How many times to try, and how long to wait in between.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff: Backoff::default(),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    /// No waiting between attempts; used by tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self::new(max_attempts, Backoff::None)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempt budget is spent. The last error is returned.
    ///
    /// ```
    /// use std::sync::atomic::{AtomicU32, Ordering};
    /// use tenantry_events::RetryPolicy;
    ///
    /// # tokio_test::block_on(async {
    /// let calls = AtomicU32::new(0);
    /// let calls = &calls;
    /// let result: Result<u32, String> = RetryPolicy::immediate(3)
    ///     .run("flaky", |_| true, move || async move {
    ///         match calls.fetch_add(1, Ordering::SeqCst) {
    ///             0 => Err("timeout".to_string()),
    ///             n => Ok(n),
    ///         }
    ///     })
    ///     .await;
    /// assert_eq!(result, Ok(1));
    /// # });
    /// ```
    pub async fn run<T, E, F, Fut, P>(&self, operation: &str, is_retryable: P, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
        E: std::fmt::Display,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(operation, attempt, "Succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) if attempt < self.max_attempts && is_retryable(&err) => {
                    let delay = self.backoff.delay_for_attempt(attempt - 1);
                    warn!(
                        operation,
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_exponential_doubles_until_cap() {
        let backoff = Backoff::exponential(Duration::from_millis(100)).with_max(Duration::from_millis(500));
        assert_eq!(backoff.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(backoff.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(backoff.delay_for_attempt(2), Duration::from_millis(400));
        assert_eq!(backoff.delay_for_attempt(3), Duration::from_millis(500));
        assert_eq!(backoff.delay_for_attempt(200), Duration::from_millis(500));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let backoff = Backoff::exponential_with_jitter(Duration::from_millis(100));
        for _ in 0..50 {
            let delay = backoff.delay_for_attempt(1);
            assert!(delay >= Duration::from_millis(200));
            assert!(delay <= Duration::from_millis(300));
        }
    }

    #[test]
    fn test_linear() {
        let backoff = Backoff::linear(Duration::from_secs(3), Duration::from_secs(3));
        assert_eq!(backoff.delay_for_attempt(0), Duration::from_secs(3));
        assert_eq!(backoff.delay_for_attempt(2), Duration::from_secs(9));
    }

    #[tokio::test]
    async fn test_retries_transient_until_success() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let policy = RetryPolicy::immediate(5);

        let result: Result<u32, String> = policy
            .run("flaky", |_| true, move || async move {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 { Err(format!("attempt {}", n)) } else { Ok(n) }
            })
            .await;

        assert_eq!(result, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_budget_is_bounded() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let policy = RetryPolicy::immediate(5);

        let result: Result<(), String> = policy
            .run("down", |_| true, move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err("unreachable".to_string())
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let policy = RetryPolicy::immediate(5);

        let result: Result<(), String> = policy
            .run("quota", |e: &String| !e.contains("quota"), move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err("quota exceeded".to_string())
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
