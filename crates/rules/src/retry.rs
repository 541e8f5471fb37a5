//! Exponential backoff for evaluation attempts.
//!
//! [`Backoff`] hands out delays that double after every failed attempt,
//! clamped to `max_delay` and optionally randomized. [`retry_with_backoff`]
//! drives an attempt closure through it, stopping early on non-retryable
//! errors or cancellation.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use cadence_core::RetryConfig;
use rand::Rng;

use crate::cancel::{CauseToken, StopReason};
use crate::clock::Clock;
use crate::error::EvalError;

#[derive(Debug, Clone)]
pub struct Backoff {
    config: RetryConfig,
    /// Attempts handed out so far, counting the first one.
    attempts: u32,
    current: Duration,
}

impl Backoff {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            config: config.clone(),
            attempts: 1,
            current: config.initial_delay,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Delay before the next attempt, or `None` once attempts are exhausted.
    pub fn next_attempt_in(&mut self) -> Option<Duration> {
        if self.attempts >= self.config.max_attempts {
            return None;
        }
        self.attempts += 1;

        let delay = randomize(self.current, self.config.randomization_factor).min(self.config.max_delay);
        self.current = next_delay(self.current, self.config.max_delay);
        Some(delay)
    }
}

/// Double `current`, clamped to `max`.
pub fn next_delay(current: Duration, max: Duration) -> Duration {
    current.saturating_mul(2).min(max)
}

/// Pick a delay uniformly from `[d - f*d, d + f*d]`.
fn randomize(d: Duration, factor: f64) -> Duration {
    if factor <= 0.0 || d.is_zero() {
        return d;
    }
    let base = d.as_secs_f64();
    let spread = base * factor;
    let picked = rand::rng().random_range((base - spread)..=(base + spread));
    Duration::from_secs_f64(picked.max(0.0))
}

/// Result of a retried operation plus how many attempts it took.
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: Result<T, EvalError>,
    pub attempts: u32,
}

impl<T> RetryOutcome<T> {
    /// Attempts that ended in an error. An attempt cut short by a stop is
    /// not counted, one cut short by a timeout is.
    pub fn failed_attempts(&self) -> u32 {
        match &self.result {
            Ok(_) => self.attempts.saturating_sub(1),
            Err(e) if e.is_stop() => self.attempts.saturating_sub(1),
            Err(_) => self.attempts,
        }
    }
}

fn cancelled(cancel: &CauseToken) -> EvalError {
    EvalError::Cancelled(cancel.reason().unwrap_or(StopReason::Shutdown))
}

/// Run `op` until it succeeds, fails permanently, runs out of attempts or
/// `cancel` fires. Waits between attempts go through `clock`.
pub async fn retry_with_backoff<T, F, Fut>(
    config: &RetryConfig,
    clock: &Arc<dyn Clock>,
    cancel: &CauseToken,
    mut op: F,
) -> RetryOutcome<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, EvalError>>,
{
    let mut backoff = Backoff::new(config);

    loop {
        let attempt = backoff.attempts();
        if cancel.is_cancelled() {
            return RetryOutcome {
                result: Err(cancelled(cancel)),
                attempts: attempt - 1,
            };
        }

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(cancelled(cancel)),
            r = op(attempt) => r,
        };

        let err = match result {
            Ok(v) => return RetryOutcome { result: Ok(v), attempts: attempt },
            Err(e @ EvalError::Cancelled(_)) => {
                return RetryOutcome { result: Err(e), attempts: attempt };
            }
            Err(e) if !e.is_retryable() => {
                return RetryOutcome { result: Err(e), attempts: attempt };
            }
            Err(e) => e,
        };

        let Some(delay) = backoff.next_attempt_in() else {
            return RetryOutcome { result: Err(err), attempts: attempt };
        };

        tracing::debug!(
            attempt,
            max_attempts = config.max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Evaluation attempt failed, retrying",
        );

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return RetryOutcome { result: Err(cancelled(cancel)), attempts: attempt };
            }
            _ = clock.sleep(delay) => {}
        }
    }
}
