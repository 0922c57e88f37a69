//! Retry store operations with exponential backoff

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use crate::error::{BillingError, StoreError};

#[derive(Debug, Clone, Copy)]
pub struct RetryOptions {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
        }
    }
}

impl RetryOptions {
    /// Settings used for invoice reads
    pub fn reads() -> Self {
        Self {
            initial_delay: Duration::from_millis(200),
            ..Self::default()
        }
    }

    /// Delay before retrying after failed attempt `attempt` (0-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Errors that can tell whether another attempt may succeed
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for StoreError {
    fn is_retryable(&self) -> bool {
        self.is_transient()
    }
}

impl Retryable for BillingError {
    fn is_retryable(&self) -> bool {
        matches!(self, BillingError::Store(e) if e.is_transient())
    }
}

pub async fn retry_db_operation<T, E, F, Fut>(mut operation: F, options: RetryOptions) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + Display,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(error) => {
                if attempt >= options.max_retries || !error.is_retryable() {
                    return Err(error);
                }
                let delay = options.delay_for(attempt);
                tracing::warn!(
                    attempt = attempt + 1,
                    attempts = options.max_retries + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "store operation failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
