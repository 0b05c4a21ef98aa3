// Exponential backoff for retried quota reads
//
// Check and Stats are pure reads, so a transient storage failure can be
// retried freely:
// - Exponential backoff (50ms, 100ms, 200ms)
// - Maximum 3 retry attempts
// - Jitter to prevent thundering herd
//
// Consume is not retried here; see QuotaGuard::consume_with_retry.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use super::error::QuotaResult;

/// Retry strategy configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Base delay in milliseconds (default 50ms)
    pub base_delay_ms: u64,
    /// Maximum number of retries (default 3)
    pub max_retries: u32,
    /// Cap on a single delay in milliseconds (default 2000ms)
    pub max_delay_ms: u64,
    /// Use exponential backoff (default true)
    pub use_exponential_backoff: bool,
    /// Add jitter to delay (default true)
    pub use_jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 50,
            max_retries: 3,
            max_delay_ms: 2000,
            use_exponential_backoff: true,
            use_jitter: true,
        }
    }
}

impl RetryConfig {
    /// No retries at all
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }
}

/// Retry decision for a failed read
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Retry after this delay in milliseconds
    Retry(u64),
    /// Give up and return the last error
    GiveUp,
}

/// Calculate retry delay based on attempt number
///
/// delay = min(base * 2^attempt, max_delay) ± 20% jitter
///
/// # Arguments
/// * `attempt` - Zero-indexed attempt number (0 = first retry)
/// * `config` - Retry configuration
pub fn calculate_retry_delay(attempt: u32, config: &RetryConfig) -> RetryDecision {
    if attempt >= config.max_retries {
        debug!("Max retries ({}) exceeded, giving up", config.max_retries);
        return RetryDecision::GiveUp;
    }

    let delay_ms = if config.use_exponential_backoff {
        config
            .base_delay_ms
            .saturating_mul(2_u64.saturating_pow(attempt))
    } else {
        config.base_delay_ms
    };
    let delay_ms = delay_ms.min(config.max_delay_ms);

    let delay_ms = if config.use_jitter && delay_ms > 0 {
        let jitter = (delay_ms as f64 * 0.2) as u64;
        let mut rng = rand::rng();
        let random_jitter = rng.random_range(0..=jitter);
        if rng.random_bool(0.5) {
            delay_ms.saturating_add(random_jitter)
        } else {
            delay_ms.saturating_sub(random_jitter)
        }
    } else {
        delay_ms
    };

    RetryDecision::Retry(delay_ms)
}

/// Run a read operation, retrying retryable failures with backoff
///
/// Non-retryable errors (unknown user, configuration, deadline) are returned
/// immediately.
pub async fn retry_read<F, Fut, T>(config: &RetryConfig, operation: &str, mut op: F) -> QuotaResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = QuotaResult<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() => match calculate_retry_delay(attempt, config) {
                RetryDecision::Retry(delay_ms) => {
                    warn!(
                        operation,
                        attempt,
                        delay_ms,
                        error = %err,
                        "Quota read failed, retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    attempt += 1;
                }
                RetryDecision::GiveUp => return Err(err),
            },
            Err(err) => return Err(err),
        }
    }
}
