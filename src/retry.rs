use crate::error::StoreError;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

type Result<T> = std::result::Result<T, StoreError>;

/// Exponential backoff: `base_delay_ms * 2^(attempt-1)`, capped
#[derive(Debug, Clone)]
pub struct Backoff {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Backoff {
    fn delay_ms(&self, attempt: u32) -> u64 {
        self.base_delay_ms
            .saturating_mul(1u64 << attempt.saturating_sub(1).min(16))
            .min(self.max_delay_ms)
    }
}

/// Retry executor for reaching the store at startup.
///
/// Only errors that report `is_recoverable()` are retried; anything else
/// is returned on the first attempt.
pub struct RetryExecutor {
    backoff: Backoff,
}

impl RetryExecutor {
    pub fn new(backoff: Backoff) -> Self {
        Self { backoff }
    }

    /// Execute an operation with retry logic
    pub async fn execute<F, Fut, T>(&self, operation: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let max_attempts = self.backoff.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            debug!("Attempt {} of {}", attempt, max_attempts);

            match operation().await {
                Ok(result) => return Ok(result),
                Err(err) => {
                    if !err.is_recoverable() || attempt >= max_attempts {
                        return Err(err);
                    }

                    let delay_ms = self.backoff.delay_ms(attempt);
                    warn!("Attempt {} failed: {}, retrying in {}ms", attempt, err, delay_ms);
                    sleep(Duration::from_millis(delay_ms)).await;
                    attempt += 1;
                }
            }
        }
    }
}
