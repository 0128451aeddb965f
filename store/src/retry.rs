//! Persistence retry policy with exponential backoff.
//!
//! - Attempts: `max_retries + 1` in total
//! - Delay before retry `n` (0-based): `initial_delay * 2^n`, capped at `max_delay`
//! - Jitter: down-jitter up to `jitter_factor` (multiplier in `[1 - jitter, 1.0]`)
//!
//! Retries run to exhaustion or success; there is no cancellation.

use std::future::Future;
use std::time::Duration;

use quill_config::PersistenceConfig;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of retries (not counting the initial attempt).
    pub max_retries: u32,
    /// Backoff delay before the first retry.
    pub initial_delay: Duration,
    /// Maximum backoff delay.
    pub max_delay: Duration,
    /// Jitter factor for down-jitter (0.25 = up to 25% reduction).
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&PersistenceConfig::in_memory())
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn from_config(config: &PersistenceConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_delay: config.initial_retry_delay(),
            max_delay: config.max_retry_delay(),
            jitter_factor: config.jitter_factor,
        }
    }

    /// A policy that never sleeps, for tests.
    #[must_use]
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter_factor: 0.0,
        }
    }
}

/// Delay before a retry. `backoff_step` is 0 before the first retry.
#[must_use]
pub fn calculate_retry_delay(backoff_step: u32, policy: &RetryPolicy) -> Duration {
    let factor = 1u128 << backoff_step.min(30);
    let base = policy.initial_delay.as_nanos().saturating_mul(factor);
    let capped = base.min(policy.max_delay.as_nanos());

    let jitter = 1.0 - rand::random::<f64>() * policy.jitter_factor;
    Duration::from_nanos((capped as f64 * jitter).max(0.0) as u64)
}

/// Run `op` until it succeeds or the policy is exhausted. The last error is
/// returned with the attempt count attached.
pub async fn retry_with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    label: &str,
    mut op: F,
) -> anyhow::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let attempts = policy.max_retries.saturating_add(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => {
                if attempt > 1 {
                    tracing::info!(label, attempt, "Succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) if attempt < attempts => {
                let delay = calculate_retry_delay(attempt - 1, policy);
                tracing::warn!(
                    label,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Attempt failed; retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => {
                tracing::error!(label, attempts, error = %err, "Retries exhausted");
                return Err(err.context(format!("{label} failed after {attempts} attempt(s)")));
            }
        }
    }
}
