//! Timeout and bounded-retry policies for wallet daemon calls
//!
//! Every outbound call to the daemon is wrapped in a hard timeout and a
//! bounded exponential-backoff-with-jitter retry loop. Only transient
//! failures (network errors, timeouts) are retried; validation and
//! business-rule failures are returned immediately.

use crate::{config::WalletConfig, PaywallError, PaywallResult};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// A timeout + bounded-retry policy
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts (first try included)
    pub max_attempts: u32,
    /// Base backoff delay; doubled per attempt
    pub base_delay: Duration,
    /// Cap on the backoff delay
    pub max_delay: Duration,
    /// Hard timeout per attempt
    pub timeout: Duration,
}

impl RetryPolicy {
    /// Policy for the initial daemon connection.
    ///
    /// More attempts and a longer timeout than per-request calls, since
    /// connection loss is rarer and costlier than a single request hiccup.
    pub fn connect(config: &WalletConfig) -> Self {
        Self {
            max_attempts: config.connect_retries.max(1),
            base_delay: Duration::from_millis(config.retry_base_delay_ms),
            max_delay: Duration::from_secs(10),
            timeout: Duration::from_secs(config.connect_timeout_seconds),
        }
    }

    /// Policy for latency-sensitive payment-preparation calls
    pub fn request(config: &WalletConfig) -> Self {
        Self {
            max_attempts: config.request_retries.max(1),
            base_delay: Duration::from_millis(config.retry_base_delay_ms),
            max_delay: Duration::from_secs(5),
            timeout: Duration::from_secs(config.request_timeout_seconds),
        }
    }

    /// Run `op` under this policy.
    ///
    /// Each attempt is bounded by `self.timeout`; transient failures are
    /// retried with exponential backoff and jitter until `max_attempts` is
    /// exhausted, at which point the last error is returned.
    pub async fn run<T, F, Fut>(&self, op_name: &str, mut op: F) -> PaywallResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = PaywallResult<T>>,
    {
        let mut attempt = 1u32;
        loop {
            let result = match tokio::time::timeout(self.timeout, op()).await {
                Ok(result) => result,
                Err(_) => Err(PaywallError::Unavailable(format!(
                    "{} timed out after {:?}",
                    op_name, self.timeout
                ))),
            };

            match result {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    let delay = self.backoff_delay(attempt);
                    warn!(
                        "{} failed (attempt {}/{}): {}. Retrying in {:?}",
                        op_name, attempt, self.max_attempts, e, delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    if e.is_transient() {
                        warn!("{} failed after {} attempts: {}", op_name, attempt, e);
                    } else {
                        debug!("{} failed without retry: {}", op_name, e);
                    }
                    return Err(e);
                }
            }
        }
    }

    /// Exponential backoff with jitter for the given attempt number (1-based)
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
            .min(self.max_delay);
        // Jitter of up to half the delay avoids retry stampedes.
        let jitter_ms = rand::thread_rng().gen_range(0..=exp.as_millis().max(1) as u64 / 2);
        exp + Duration::from_millis(jitter_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            timeout: Duration::from_secs(1),
        }
    }

    #[tokio::test]
    async fn test_retries_transient_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in = calls.clone();

        let result = policy(5)
            .run("op", move || {
                let calls = calls_in.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(PaywallError::Unavailable("connection refused".into()))
                    } else {
                        Ok(42u32)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_does_not_retry_validation_errors() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in = calls.clone();

        let result: PaywallResult<()> = policy(5)
            .run("op", move || {
                let calls = calls_in.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(PaywallError::InvalidRequest("amount is zero".into()))
                }
            })
            .await;

        assert!(matches!(result, Err(PaywallError::InvalidRequest(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhausts_attempts_and_returns_unavailable() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in = calls.clone();

        let result: PaywallResult<()> = policy(3)
            .run("op", move || {
                let calls = calls_in.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(PaywallError::Unavailable("still down".into()))
                }
            })
            .await;

        assert!(matches!(result, Err(PaywallError::Unavailable(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_timeout_counts_as_transient() {
        let slow = RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            timeout: Duration::from_millis(10),
        };

        let result: PaywallResult<()> = slow
            .run("op", || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(PaywallError::Unavailable(_))));
    }
}
