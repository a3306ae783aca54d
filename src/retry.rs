//! Bounded retry with exponential backoff.
//!
//! One primitive instead of nested self-scheduling timers, so exhaustion is
//! observable as a value and tests can drive it with tokio's paused clock.

use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Bounds for [`retry_with_backoff`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
  /// Total attempts (not retries after the first). Clamped to at least 1.
  pub max_attempts: u32,
  /// Base delay; doubled after each failed attempt.
  pub base_delay: Duration,
  /// Upper bound on any single delay.
  pub cap: Duration,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self { max_attempts: 3, base_delay: Duration::from_millis(1000), cap: Duration::from_secs(30) }
  }
}

impl RetryPolicy {
  /// Delay before the retry following the given zero-based attempt:
  /// `min(base * 2^attempt, cap)`.
  pub fn delay_for(&self, attempt: u32) -> Duration {
    self
      .base_delay
      .checked_mul(2u32.saturating_pow(attempt.min(16)))
      .unwrap_or(self.cap)
      .min(self.cap)
  }
}

/// Terminal outcome of a retried operation.
#[derive(Debug)]
pub enum RetryOutcome<T, E> {
  Success(T),
  /// All attempts failed, or an attempt failed with a non-retryable error.
  /// `attempts` is the number actually made.
  Exhausted { attempts: u32, error: E },
}

impl<T, E> RetryOutcome<T, E> {
  pub fn into_result(self) -> Result<T, E> {
    match self {
      RetryOutcome::Success(v) => Ok(v),
      RetryOutcome::Exhausted { error, .. } => Err(error),
    }
  }
}

/// Run `op` up to `policy.max_attempts` times, sleeping
/// `min(base * 2^attempt, cap)` between attempts.
///
/// `should_retry` inspects each error; a non-retryable error short-circuits
/// to `Exhausted` without further attempts. The operation receives the
/// zero-based attempt number.
pub async fn retry_with_backoff<T, E, F, Fut, P>(
  policy: RetryPolicy,
  should_retry: P,
  mut op: F,
) -> RetryOutcome<T, E>
where
  F: FnMut(u32) -> Fut,
  Fut: Future<Output = Result<T, E>>,
  P: Fn(&E) -> bool,
{
  let max_attempts = policy.max_attempts.max(1);
  let mut attempt = 0;

  loop {
    match op(attempt).await {
      Ok(value) => return RetryOutcome::Success(value),
      Err(error) => {
        let attempts = attempt + 1;
        if attempts >= max_attempts || !should_retry(&error) {
          return RetryOutcome::Exhausted { attempts, error };
        }
        let delay = policy.delay_for(attempt);
        debug!(attempt = attempts, ?delay, "retrying after backoff");
        tokio::time::sleep(delay).await;
        attempt = attempts;
      }
    }
  }
}
