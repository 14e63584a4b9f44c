//! Async retry with bounded exponential backoff and jitter.
//!
//! Used by the notification dispatcher for webhook delivery; any fallible
//! async operation can be driven through [`retry_async`].

use parley_types::notification::RetryPolicy;
use rand::Rng;
use std::time::Duration;
use tracing::{debug, warn};

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts (including the first try).
    pub max_attempts: u32,
    /// Delay before the first retry in milliseconds.
    pub min_delay_ms: u64,
    /// Upper bound for any single delay in milliseconds.
    pub max_delay_ms: u64,
    /// Jitter factor in `[0, 1]`; the sleep is `delay * (1 + r * jitter)`.
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::from(&RetryPolicy::default())
    }
}

impl From<&RetryPolicy> for RetryConfig {
    fn from(policy: &RetryPolicy) -> Self {
        Self {
            max_attempts: policy.max_attempts,
            min_delay_ms: policy.initial_backoff_ms,
            max_delay_ms: policy.max_backoff_ms,
            jitter: 0.2,
        }
    }
}

/// Result of a retry operation.
#[derive(Debug)]
pub enum RetryOutcome<T, E> {
    Success {
        result: T,
        /// 1 means the first try succeeded.
        attempts: u32,
    },
    Exhausted {
        last_error: E,
        attempts: u32,
    },
    /// `should_retry` refused; no further attempts were made.
    Aborted { last_error: E, attempts: u32 },
}

/// Delay before retry number `attempt + 1` (0-indexed), in milliseconds.
///
/// `min(min_delay * 2^attempt, max_delay) * (1 + r * jitter)`, clamped to
/// `max_delay`.
pub fn compute_backoff(config: &RetryConfig, attempt: u32) -> u64 {
    let base = config
        .min_delay_ms
        .saturating_mul(1u64.checked_shl(attempt).unwrap_or(u64::MAX));
    let capped = base.min(config.max_delay_ms);
    if config.jitter <= 0.0 || capped == 0 {
        return capped;
    }
    let frac: f64 = rand::thread_rng().gen_range(0.0..1.0);
    let with_jitter = capped as f64 * (1.0 + frac * config.jitter.min(1.0));
    (with_jitter as u64).min(config.max_delay_ms)
}

/// Run `operation` until it succeeds, `should_retry` rejects its error, or
/// `max_attempts` is reached.
pub async fn retry_async<F, Fut, T, E, P>(
    config: &RetryConfig,
    mut operation: F,
    should_retry: P,
) -> RetryOutcome<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let max = config.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        let err = match operation(attempt).await {
            Ok(result) => {
                if attempt > 1 {
                    debug!(attempt, "Retry succeeded");
                }
                return RetryOutcome::Success {
                    result,
                    attempts: attempt,
                };
            }
            Err(err) => err,
        };

        if !should_retry(&err) {
            debug!(attempt, error = %err, "Error is not retryable, giving up");
            return RetryOutcome::Aborted {
                last_error: err,
                attempts: attempt,
            };
        }
        if attempt >= max {
            warn!(attempt, max_attempts = max, error = %err, "All retry attempts exhausted");
            return RetryOutcome::Exhausted {
                last_error: err,
                attempts: attempt,
            };
        }

        let delay_ms = compute_backoff(config, attempt - 1);
        debug!(attempt, delay_ms, error = %err, "Retrying after error");
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
    }
}
