//! Exponential backoff for transient failures.

use crate::clock::Sleeper;
use crate::config::{DEFAULT_RETRY_ATTEMPTS, DEFAULT_RETRY_BASE_DELAY_MS, DEFAULT_RETRY_MULTIPLIER};
use crate::error::DbResult;
use chrono::Utc;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_RETRY_ATTEMPTS,
            base_delay: Duration::from_millis(DEFAULT_RETRY_BASE_DELAY_MS),
            multiplier: DEFAULT_RETRY_MULTIPLIER,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, multiplier: f64) -> Self {
        Self {
            max_attempts,
            base_delay,
            multiplier,
        }
    }

    /// Single attempt, no waiting.
    pub fn none() -> Self {
        Self::new(1, Duration::ZERO, 1.0)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("max_attempts must be at least 1".to_string());
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(format!(
                "multiplier must be a finite number >= 1.0, got {}",
                self.multiplier
            ));
        }
        Ok(())
    }

    /// Delay after the failed `attempt` (1-based) before the next one.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16) as i32;
        self.base_delay.mul_f64(self.multiplier.powi(exponent))
    }
}

/// Run `operation` until it succeeds, fails with a non-transient error, or the
/// attempt budget is spent. Every failed attempt is logged.
pub async fn retry_with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    sleeper: &dyn Sleeper,
    operation: &str,
    mut f: F,
) -> DbResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = DbResult<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                warn!(
                    operation = %operation,
                    attempt,
                    max_attempts,
                    at = %Utc::now().to_rfc3339(),
                    error = %e,
                    "Attempt failed"
                );
                if !e.is_transient() || attempt >= max_attempts {
                    return Err(e);
                }
                sleeper.sleep(policy.delay_for(attempt)).await;
                attempt += 1;
            }
        }
    }
}
