//! Exponential backoff with jitter.
//!
//! One policy is shared by market-metadata loading, pre-send RPC calls and
//! anything else that retries transient infrastructure errors.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Retry policy: `delay(n) = min(base * 2^n, max)`, then a random jitter
/// fraction is subtracted.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Backoff {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Attempts including the first one
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Fraction of the delay that may be randomized away (0.0 - 1.0)
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

fn default_base_delay_ms() -> u64 {
    200
}
fn default_max_delay_ms() -> u64 {
    5_000
}
fn default_max_attempts() -> u32 {
    4
}
fn default_jitter() -> f64 {
    0.2
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_attempts: default_max_attempts(),
            jitter: default_jitter(),
        }
    }
}

impl Backoff {
    /// Delay before retry number `attempt` (0-based), without jitter.
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.min(63)).unwrap_or(u64::MAX);
        let ms = self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        Duration::from_millis(ms)
    }

    /// Delay before retry number `attempt`, with jitter applied.
    pub fn delay(&self, attempt: u32) -> Duration {
        let ceiling = self.ceiling(attempt);
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return ceiling;
        }
        let cut = rand::rng().random_range(0.0..=jitter);
        ceiling.mul_f64(1.0 - cut)
    }

    /// Run `op` until it succeeds, returns a non-retryable error, or the
    /// attempt budget is spent. The last error is returned.
    pub async fn retry<T, E, F, Fut>(
        &self,
        label: &str,
        mut op: F,
        retryable: impl Fn(&E) -> bool,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt + 1 < attempts && retryable(&e) => {
                    let delay = self.delay(attempt);
                    debug!(
                        op = label,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis(),
                        error = %e,
                        "Retrying after transient error"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_ceiling_doubles_and_caps() {
        let backoff = Backoff {
            base_delay_ms: 100,
            max_delay_ms: 1_000,
            max_attempts: 10,
            jitter: 0.0,
        };
        assert_eq!(backoff.ceiling(0), Duration::from_millis(100));
        assert_eq!(backoff.ceiling(1), Duration::from_millis(200));
        assert_eq!(backoff.ceiling(3), Duration::from_millis(800));
        assert_eq!(backoff.ceiling(4), Duration::from_millis(1_000));
        assert_eq!(backoff.ceiling(200), Duration::from_millis(1_000));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let backoff = Backoff {
            base_delay_ms: 1_000,
            max_delay_ms: 10_000,
            max_attempts: 5,
            jitter: 0.5,
        };
        for attempt in 0..5 {
            let ceiling = backoff.ceiling(attempt);
            for _ in 0..50 {
                let d = backoff.delay(attempt);
                assert!(d <= ceiling);
                assert!(d >= ceiling.mul_f64(0.5));
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_until_success() {
        let calls = AtomicU32::new(0);
        let backoff = Backoff {
            jitter: 0.0,
            ..Default::default()
        };

        let result: Result<u32, String> = backoff
            .retry(
                "flaky",
                || async {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    if n < 2 {
                        Err("timeout".to_string())
                    } else {
                        Ok(n)
                    }
                },
                |_| true,
            )
            .await;

        assert_eq!(result, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_stops_on_terminal_error() {
        let calls = AtomicU32::new(0);
        let backoff = Backoff::default();

        let result: Result<(), String> = backoff
            .retry(
                "reverting",
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err("execution reverted".to_string())
                },
                |e| !e.contains("revert"),
            )
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhausts_budget() {
        let calls = AtomicU32::new(0);
        let backoff = Backoff {
            max_attempts: 3,
            ..Default::default()
        };

        let result: Result<(), String> = backoff
            .retry(
                "down",
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err("connection refused".to_string())
                },
                |_| true,
            )
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
