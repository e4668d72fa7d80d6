// src/retry.rs
//! Bounded exponential backoff with jitter, shared by page fetches,
//! document downloads and inference calls.

use rand::Rng;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one (>= 1).
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Upper bound of the random component added to each delay.
    pub jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(2_000),
            max_delay: Duration::from_secs(30),
            jitter: Duration::from_millis(1_000),
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no waiting. Handy for tests.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: Duration::ZERO,
        }
    }

    /// Immediate retries, useful when the clock should not matter.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::none()
        }
    }

    /// Deterministic part of the wait after the `attempt`-th failure (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let factor = 1u32 << exp;
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Backoff plus random jitter in `[0, jitter)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.backoff(attempt);
        let jitter_ms = self.jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return base;
        }
        base + Duration::from_millis(rand::rng().random_range(0..jitter_ms))
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// attempt budget is spent. Returns the last error together with the
/// number of attempts made.
pub async fn retry_async<T, E, F, Fut>(
    policy: &RetryPolicy,
    what: &str,
    mut op: F,
    retryable: impl Fn(&E) -> bool,
) -> Result<T, (E, u32)>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let max = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op(attempt).await {
            Ok(v) => return Ok(v),
            Err(e) if attempt < max && retryable(&e) => {
                let delay = policy.delay_for(attempt);
                tracing::warn!(
                    what,
                    attempt,
                    max_attempts = max,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "attempt failed, backing off"
                );
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }
            Err(e) => return Err((e, attempt)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn backoff_doubles_and_caps() {
        let p = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
            jitter: Duration::ZERO,
        };
        assert_eq!(p.backoff(1), Duration::from_millis(100));
        assert_eq!(p.backoff(2), Duration::from_millis(200));
        assert_eq!(p.backoff(3), Duration::from_millis(350));
        assert_eq!(p.delay_for(9), Duration::from_millis(350));
    }

    #[test]
    fn jitter_stays_in_bounds() {
        let p = RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(10),
            jitter: Duration::from_millis(5),
        };
        for _ in 0..50 {
            let d = p.delay_for(1);
            assert!(d >= Duration::from_millis(10) && d < Duration::from_millis(15));
        }
    }

    #[tokio::test]
    async fn stops_on_non_retryable_error() {
        let calls = AtomicU32::new(0);
        let out: Result<(), (String, u32)> = retry_async(
            &RetryPolicy::immediate(5),
            "test",
            |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("fatal".to_string()) }
            },
            |e: &String| e != "fatal",
        )
        .await;
        assert_eq!(out.unwrap_err().1, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_until_budget_spent() {
        let out: Result<(), (String, u32)> = retry_async(
            &RetryPolicy::immediate(3),
            "test",
            |_| async { Err("flaky".to_string()) },
            |_| true,
        )
        .await;
        assert_eq!(out.unwrap_err().1, 3);
    }
}
