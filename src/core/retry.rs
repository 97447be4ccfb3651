//! Transport-level retry with exponential backoff.
//!
//! This only decides how long to wait between attempts of one request. How
//! many times a *step* may be retried is owned by the contract enforcer.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub multiplier: f64,
    pub max_backoff_ms: u64,
    /// Add up to 25% random delay on top of the computed backoff.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 500,
            multiplier: 2.0,
            max_backoff_ms: 8_000,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Delay before attempt `attempt + 1`, where `attempt` counts from 1.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(30) as i32;
        let base = (self.initial_backoff_ms as f64) * self.multiplier.max(1.0).powi(exp);
        let capped = base.min(self.max_backoff_ms as f64).max(0.0) as u64;
        let extra = if self.jitter && capped > 0 {
            rand::random::<u64>() % (capped / 4 + 1)
        } else {
            0
        };
        Duration::from_millis(capped + extra)
    }
}

/// Run `op` until it succeeds, the error is not retryable, or the policy's
/// attempts are used up. `op` receives the 1-based attempt number.
pub async fn retry_with_backoff<T, E, F, Fut, R>(
    policy: &RetryPolicy,
    label: &str,
    mut op: F,
    is_retryable: R,
) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < max_attempts && is_retryable(&e) => {
                let delay = policy.backoff_for(attempt);
                warn!(
                    "{} attempt {}/{} failed: {} (retrying in {:?})",
                    label, attempt, max_attempts, e, delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
