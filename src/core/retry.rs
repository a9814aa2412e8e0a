//! Retry with deterministic exponential backoff for transient errors.

use crate::core::{Result, ShutdownSignal, TallyError};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

/// Retry configuration
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total number of attempts, including the first one
    pub max_attempts: u32,
    /// Wait before the second attempt
    pub initial_backoff: Duration,
    /// Backoff multiplier applied after every failed attempt
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(1),
            multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// One initial attempt followed by up to `retries` retries.
    pub fn with_retries(retries: u32) -> Self {
        Self {
            max_attempts: retries.saturating_add(1),
            ..Self::default()
        }
    }

    /// Override the base backoff
    pub fn initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = backoff;
        self
    }

    /// Wait after the given failed attempt (1-based): 1s, 2s, 4s, ...
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exp = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        self.initial_backoff.mul_f64(self.multiplier.powi(exp))
    }
}

/// Execute an operation with retry logic.
///
/// The operation receives the 1-based attempt number. Attempts run
/// sequentially. Non-recoverable errors are returned immediately, and once
/// the budget is spent the last error is wrapped in
/// [`TallyError::RetriesExhausted`]. Triggering `shutdown` aborts the
/// in-flight attempt or the pending backoff with [`TallyError::Cancelled`].
pub async fn retry_with_config<F, Fut, T>(
    config: &RetryConfig,
    shutdown: &ShutdownSignal,
    mut operation: F,
) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut shutdown = shutdown.clone();
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        if shutdown.is_triggered() {
            return Err(TallyError::Cancelled);
        }
        attempt += 1;

        let outcome = tokio::select! {
            res = operation(attempt) => res,
            () = shutdown.wait() => return Err(TallyError::Cancelled),
        };

        match outcome {
            Ok(result) => return Ok(result),
            Err(error) if !error.is_recoverable() => return Err(error),
            Err(error) if attempt >= max_attempts => {
                tracing::error!(attempt, error = %error, "Operation failed, retry budget exhausted");
                return Err(TallyError::RetriesExhausted {
                    attempts: attempt,
                    source: Box::new(error),
                });
            },
            Err(error) => {
                let backoff = config.backoff_for(attempt);
                tracing::warn!(
                    "Attempt {} failed: {}. Retrying in {:?}...",
                    attempt,
                    error,
                    backoff
                );
                tokio::select! {
                    () = sleep(backoff) => {},
                    () = shutdown.wait() => return Err(TallyError::Cancelled),
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast(retries: u32) -> RetryConfig {
        RetryConfig::with_retries(retries).initial_backoff(Duration::from_millis(5))
    }

    #[test]
    fn test_backoff_doubles() {
        let config = RetryConfig::default();
        assert_eq!(config.backoff_for(1), Duration::from_secs(1));
        assert_eq!(config.backoff_for(2), Duration::from_secs(2));
        assert_eq!(config.backoff_for(3), Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_retry_success() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();

        let result = retry_with_config(&fast(3), &ShutdownSignal::never(), move |_| {
            let attempts = counter.clone();
            async move {
                let count = attempts.fetch_add(1, Ordering::Relaxed) + 1;
                if count < 3 {
                    Err(TallyError::network("temporary failure"))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn test_retry_non_recoverable() {
        let attempts = AtomicU32::new(0);
        let result: Result<i32> = retry_with_config(&fast(3), &ShutdownSignal::never(), |_| {
            attempts.fetch_add(1, Ordering::Relaxed);
            async { Err(TallyError::Rejected { status: 400, body: String::new() }) }
        })
        .await;

        assert!(matches!(result, Err(TallyError::Rejected { status: 400, .. })));
        assert_eq!(attempts.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_attempts_bounded_by_budget() {
        let attempts = AtomicU32::new(0);
        let result: Result<i32> = retry_with_config(&fast(2), &ShutdownSignal::never(), |_| {
            attempts.fetch_add(1, Ordering::Relaxed);
            async { Err(TallyError::ServerError { status: 502, body: String::new() }) }
        })
        .await;

        assert!(matches!(result, Err(TallyError::RetriesExhausted { attempts: 3, .. })));
        assert_eq!(attempts.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_backoff() {
        let (trigger, signal) = ShutdownSignal::new();
        let config = RetryConfig::with_retries(5).initial_backoff(Duration::from_secs(30));

        let handle = tokio::spawn(async move {
            retry_with_config(&config, &signal, |_| async {
                Err::<(), _>(TallyError::network("down"))
            })
            .await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.trigger();

        let result = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("cancellation should end the backoff")
            .unwrap();
        assert!(matches!(result, Err(TallyError::Cancelled)));
    }
}
