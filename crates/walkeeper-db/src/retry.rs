//! Exponential backoff for retryable database operations.
//!
//! The checkpoint controller makes exactly one attempt per call; callers that
//! want persistence (the health monitor's auto-checkpoint) wrap it in
//! [`retry_sync`].

use crate::error::{DbError, DbResult};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Configuration for the exponential backoff retry loop.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first (default: 3).
    pub max_attempts: u32,
    /// Delay before the second attempt (default: 500ms).
    pub base_delay: Duration,
    /// Maximum delay cap (default: 5s).
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// A policy that never sleeps; for tests.
    #[must_use]
    pub const fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay after the given failed attempt (0-indexed).
    ///
    /// Formula: `min(base_delay * 2^attempt, max_delay)` + ±25% jitter,
    /// never above `max_delay`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;
        #[allow(clippy::cast_possible_wrap)]
        let exponent = attempt.min(30) as i32;
        let raw = (base_ms * 2.0_f64.powi(exponent)).min(max_ms);

        let jittered = raw.mul_add(0.25 * jitter_factor(), raw);
        let clamped = jittered.clamp(0.0, max_ms);

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let ms = clamped as u64;
        Duration::from_millis(ms)
    }
}

/// Jitter in `[-1.0, 1.0]` from a shared LCG; only needs to desynchronize.
fn jitter_factor() -> f64 {
    static SEED: AtomicU64 = AtomicU64::new(0);

    if SEED.load(Ordering::Relaxed) == 0 {
        let init = u64::try_from(walkeeper_core::now_micros()).unwrap_or(12_345) | 1;
        let _ = SEED.compare_exchange(0, init, Ordering::Relaxed, Ordering::Relaxed);
    }

    let a: u64 = 6_364_136_223_846_793_005;
    let c: u64 = 1_442_695_040_888_963_407;
    let old = SEED
        .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |x| {
            Some(x.wrapping_mul(a).wrapping_add(c))
        })
        .unwrap_or(42);

    #[allow(clippy::cast_precision_loss)]
    let mapped = (old as f64 / u64::MAX as f64).mul_add(2.0, -1.0);
    mapped
}

/// Execute `op`, retrying with backoff while it fails with a retryable
/// (lock/busy/timeout) error.
///
/// # Errors
///
/// Returns the first non-retryable error, or the last error once all
/// attempts are exhausted.
pub fn retry_sync<T, F>(policy: &RetryPolicy, mut op: F) -> DbResult<T>
where
    F: FnMut() -> DbResult<T>,
{
    let attempts = policy.max_attempts.max(1);
    let mut last_err: Option<DbError> = None;

    for attempt in 0..attempts {
        match op() {
            Ok(value) => {
                if attempt > 0 {
                    tracing::debug!(attempt = attempt + 1, "operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) if !e.is_retryable() || attempt + 1 == attempts => return Err(e),
            Err(e) => {
                let delay = policy.delay_for_attempt(attempt);
                tracing::warn!(
                    attempt = attempt + 1,
                    max_attempts = attempts,
                    delay_ms = walkeeper_core::duration_ms(delay),
                    error = %e,
                    "retryable database error, backing off"
                );
                last_err = Some(e);
                std::thread::sleep(delay);
            }
        }
    }

    Err(last_err.unwrap_or_else(|| DbError::Unavailable("retry loop exhausted".to_string())))
}
