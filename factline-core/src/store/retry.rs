use std::future::Future;
use std::time::Duration;

use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

use crate::config::StorageConfig;
use crate::error::{FactlineError, Result};

/// Backoff budget for transient storage failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: usize,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&StorageConfig::default())
    }
}

impl From<&StorageConfig> for RetryPolicy {
    fn from(config: &StorageConfig) -> Self {
        Self {
            max_retries: config.retry_attempts,
            base_delay_ms: config.retry_base_delay_ms,
            max_delay_ms: config.retry_max_delay_ms,
        }
    }
}

impl RetryPolicy {
    /// Run `op`, retrying while it fails with a transient error. Once the
    /// budget is spent the last transient error becomes
    /// `StorageUnavailable`; every other error is returned untouched.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let strategy = ExponentialBackoff::from_millis(self.base_delay_ms.max(1))
            .max_delay(Duration::from_millis(self.max_delay_ms))
            .map(jitter)
            .take(self.max_retries);

        let mut attempts = 0usize;
        let result = RetryIf::spawn(
            strategy,
            || {
                attempts += 1;
                if attempts > 1 {
                    tracing::warn!(operation, attempt = attempts, "retrying storage operation");
                }
                op()
            },
            FactlineError::is_transient,
        )
        .await;

        match result {
            Err(e) if e.is_transient() => {
                tracing::error!(operation, attempts, error = %e, "storage unavailable");
                Err(FactlineError::StorageUnavailable {
                    attempts,
                    reason: e.to_string(),
                })
            }
            other => other,
        }
    }
}
