// Copyright 2025 Cowboy AI, LLC.

//! Retry policy for broker operations
//!
//! A failed operation is retried up to [`RetryPolicy::retry_count`] times.
//! Before retry `n` (1-based) the policy waits `base_delay × 2^n`, capped at
//! `max_delay`. Only failures classified as transient are retried; anything
//! else is returned to the caller immediately.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Failures that can tell whether retrying might help
pub trait Transient {
    /// True when the failure is worth another attempt
    fn is_transient(&self) -> bool;
}

/// Bounded exponential retry policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the initial attempt
    pub retry_count: u32,

    /// Base delay in milliseconds, doubled per attempt
    pub base_delay_ms: u64,

    /// Upper bound for a single delay in milliseconds
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retry_count: 5,
            base_delay_ms: 1000,
            max_delay_ms: 60_000,
        }
    }
}

/// Outcome of an operation that never succeeded
#[derive(Debug)]
pub struct RetryFailure<E> {
    /// Attempts made, including the first one
    pub attempts: u32,
    /// Error returned by the last attempt
    pub error: E,
    /// True when the policy ran out of retries, false for a non-transient error
    pub exhausted: bool,
}

impl RetryPolicy {
    /// Create a policy with the given retry count and base delay
    pub fn new(retry_count: u32, base_delay: Duration) -> Self {
        Self {
            retry_count,
            base_delay_ms: base_delay.as_millis().min(u64::MAX as u128) as u64,
            ..Default::default()
        }
    }

    /// Total attempts including the initial one
    pub fn max_attempts(&self) -> u32 {
        self.retry_count.saturating_add(1)
    }

    /// Delay before retry `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt);
        let millis = self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        Duration::from_millis(millis)
    }

    /// Run `action` until it succeeds, fails permanently, or retries run out
    ///
    /// The closure receives the 1-based attempt number. Each transient failure
    /// that is followed by a retry is logged at warning level.
    pub async fn execute<T, E, F, Fut>(
        &self,
        operation: &str,
        mut action: F,
    ) -> Result<T, RetryFailure<E>>
    where
        E: Transient + Display,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match action(attempt).await {
                Ok(value) => return Ok(value),
                Err(error) if !error.is_transient() => {
                    return Err(RetryFailure {
                        attempts: attempt,
                        error,
                        exhausted: false,
                    });
                }
                Err(error) if attempt > self.retry_count => {
                    return Err(RetryFailure {
                        attempts: attempt,
                        error,
                        exhausted: true,
                    });
                }
                Err(error) => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        operation,
                        attempt,
                        retry_count = self.retry_count,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "{} failed, retrying",
                        operation
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
